//! # drawbatch
//!
//! A resumable batch driver for local image generation servers that speak the
//! Automatic1111-style HTTP API (Draw Things, stable-diffusion-webui).
//! Feed it a template table or a directory of images; it sends one request
//! per work item, saves every returned image, logs per-image metrics, and
//! records completed items so an interrupted run picks up where it stopped.
//!
//! # Architecture: Queue → Driver → Artifacts
//!
//! ```text
//! 1. Queue    templates / input dir  →  Vec<WorkItem>   (what to do, in order)
//! 2. Driver   WorkItem               →  request → client → images
//! 3. Persist  images                 →  PNG files, metrics.csv, processed.log
//! ```
//!
//! The queue is built up front and never mutated. The driver walks it
//! sequentially, holding every collaborator behind a narrow seam: the
//! [`client::GenerationClient`] trait for the network and the
//! [`metrics::ResourceSampler`] trait for host sampling. Tests swap both for
//! deterministic stand-ins.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | `drawbatch.toml` loading, stock defaults, merging, validation |
//! | [`queue`] | Template matching and directory scanning into [`queue::WorkItem`]s |
//! | [`request`] | Request payload merging and source image encoding |
//! | [`client`] | HTTP client for the generation server, base64 payload decoding |
//! | [`writer`] | Output path layout, PNG writing, read-back verification |
//! | [`metrics`] | Per-image CSV metrics log and CPU / RAM sampling |
//! | [`checkpoint`] | Append-only log of completed item ids |
//! | [`batch`] | The per-item state machine and run report |
//! | [`output`] | CLI output formatting for progress, dry runs, and summaries |
//!
//! # Design Decisions
//!
//! ## The Checkpoint Is the Only Resume State
//!
//! An item is recorded as done only after all of its images and metrics rows
//! are on disk. Nothing else is consulted on restart: output files that exist
//! without a checkpoint entry are simply overwritten. This makes a crash at
//! any point safe, at the cost of redoing at most one item.
//!
//! ## Failures Are Values
//!
//! A dead server, a malformed response, or an unreadable source image fails
//! that one item and the batch moves on. Only configuration problems stop a
//! run before it starts. Re-running is the retry mechanism.
//!
//! ## Sequential by Construction
//!
//! Local generation servers process one job at a time; the driver makes one
//! blocking request at a time. Append ordering of the checkpoint and metrics
//! logs follows queue order without any locking.

pub mod batch;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod metrics;
pub mod output;
pub mod queue;
pub mod request;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_helpers;
