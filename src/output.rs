//! CLI output formatting for batch runs.
//!
//! # Item-First Display
//!
//! Every line group leads with the item's queue position and id; written
//! files and problems follow as indented context lines. Detailed diagnostics
//! go to the tracing log on stderr, so stdout stays a readable record of
//! what the batch did.
//!
//! # Output Format
//!
//! ## Run
//!
//! ```text
//! 001/003 Italy_family_1
//!     generations/Italy/family/Italy_family_1_1.png
//!     Done in 41.3s
//! 002/003 Italy_family_2
//!     Skipped: already processed
//! 003/003 Italy_family_3
//!     Failed: generation failed: server returned 503 Service Unavailable: ...
//!
//! 1 completed, 1 skipped, 1 failed (3 total); 1 images written
//! ```
//!
//! ## Dry run
//!
//! ```text
//! Pending (2)
//!     001 Italy_family_1
//!     002 Italy_family_3
//! Already processed (1)
//!     001 Italy_family_2
//! ```
//!
//! # Architecture
//!
//! Each view has a `format_*` function (returns `Vec<String>`) for testability
//! and a `print_*` wrapper that writes to stdout. Format functions are pure.

use crate::batch::{BatchEvent, BatchReport};
use crate::queue::WorkItem;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

// ============================================================================
// Run progress
// ============================================================================

/// Format a single batch event as display lines.
pub fn format_event(event: &BatchEvent) -> Vec<String> {
    match event {
        BatchEvent::Started {
            position,
            total,
            id,
        } => vec![format!(
            "{}/{} {}",
            format_index(*position),
            format_index(*total),
            id
        )],
        BatchEvent::Skipped { .. } => {
            vec![format!("{}Skipped: already processed", indent(1))]
        }
        BatchEvent::Completed {
            outputs, elapsed, ..
        } => {
            let mut lines: Vec<String> = outputs
                .iter()
                .map(|o| {
                    let marker = if o.verified { "" } else { " (unverified)" };
                    format!("{}{}{}", indent(1), o.path.display(), marker)
                })
                .collect();
            lines.push(format!("{}Done in {:.1}s", indent(1), elapsed.as_secs_f64()));
            lines
        }
        BatchEvent::Failed { reason, .. } => vec![format!("{}Failed: {}", indent(1), reason)],
        BatchEvent::PersistenceError { reason, .. } => {
            vec![format!("{}Warning: {}", indent(1), reason)]
        }
    }
}

/// Format the end-of-run summary.
pub fn format_summary(report: &BatchReport) -> Vec<String> {
    vec![String::new(), report.to_string()]
}

/// Print end-of-run summary to stdout.
pub fn print_summary(report: &BatchReport) {
    for line in format_summary(report) {
        println!("{}", line);
    }
}

// ============================================================================
// Dry run
// ============================================================================

/// Format the dry-run view: what would be sent, and what would be skipped.
pub fn format_plan(pending: &[&WorkItem], done: &[&WorkItem]) -> Vec<String> {
    let mut lines = Vec::new();

    lines.push(format!("Pending ({})", pending.len()));
    for (i, item) in pending.iter().enumerate() {
        lines.push(format!("{}{} {}", indent(1), format_index(i + 1), item.id));
    }

    if !done.is_empty() {
        lines.push(format!("Already processed ({})", done.len()));
        for (i, item) in done.iter().enumerate() {
            lines.push(format!("{}{} {}", indent(1), format_index(i + 1), item.id));
        }
    }

    lines
}

/// Print dry-run view to stdout.
pub fn print_plan(pending: &[&WorkItem], done: &[&WorkItem]) {
    for line in format_plan(pending, done) {
        println!("{}", line);
    }
}

// ============================================================================
// Nations
// ============================================================================

/// Format the nations available in the template table.
pub fn format_nations(nations: &[String]) -> Vec<String> {
    if nations.is_empty() {
        return vec!["No templates configured".to_string()];
    }
    let mut lines = vec![format!("Nations ({})", nations.len())];
    lines.extend(
        nations
            .iter()
            .enumerate()
            .map(|(i, n)| format!("{}{} {}", indent(1), format_index(i + 1), n)),
    );
    lines
}

/// Print available nations to stdout.
pub fn print_nations(nations: &[String]) {
    for line in format_nations(nations) {
        println!("{}", line);
    }
}

// ============================================================================
// Tests
// ============================================================================
