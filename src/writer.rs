//! Output file placement, encoding, and verification.
//!
//! Every generated image is written as PNG to a deterministic path:
//!
//! ```text
//! <output root>/<item subdir>/<item base name>_<image index>.png
//! ```
//!
//! Image indices are 1-based and follow response order. Payloads that are
//! already PNG are written byte-for-byte; other decodable formats are
//! re-encoded. After writing, the file is opened and fully decoded again. A
//! file that fails this check is still a written output, reported with
//! `verified = false`, because a corrupt image on disk is something to flag
//! rather than a reason to stop the batch.

use crate::queue::WorkItem;
use image::ImageFormat;
use std::borrow::Cow;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Why a written file failed to read back as an image.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] image::ImageError),
}

/// A saved image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub path: PathBuf,
    /// 1-based position in the generation response.
    pub image_index: usize,
    pub bytes_written: u64,
    /// Whether the file decoded cleanly when read back.
    pub verified: bool,
}

impl Output {
    /// File name component of [`path`](Self::path).
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Writes generated images below a fixed output root.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    root: PathBuf,
}

impl OutputWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where image `image_index` (1-based) of `item` is written.
    pub fn output_path(&self, item: &WorkItem, image_index: usize) -> PathBuf {
        self.root
            .join(&item.subdir)
            .join(format!("{}_{}.png", item.base_name, image_index))
    }

    /// Write one image of `item`, creating directories as needed, then verify it.
    pub fn write(
        &self,
        item: &WorkItem,
        image_index: usize,
        bytes: &[u8],
    ) -> Result<Output, WriteError> {
        let path = self.output_path(item, image_index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| WriteError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let png = to_png(bytes);
        fs::write(&path, &png).map_err(|source| WriteError::Io {
            path: path.clone(),
            source,
        })?;

        let verified = match verify_image(&path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    item = %item.id,
                    path = %path.display(),
                    error = %e,
                    "image saved but might be corrupted"
                );
                false
            }
        };

        Ok(Output {
            path,
            image_index,
            bytes_written: png.len() as u64,
            verified,
        })
    }
}

/// PNG bytes for `bytes`.
///
/// PNG input and anything that cannot be identified or decoded is returned
/// unchanged; verification will catch the latter.
pub fn to_png(bytes: &[u8]) -> Cow<'_, [u8]> {
    let format = match image::guess_format(bytes) {
        Ok(ImageFormat::Png) | Err(_) => return Cow::Borrowed(bytes),
        Ok(format) => format,
    };

    let reencoded = image::load_from_memory_with_format(bytes, format).and_then(|img| {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    });

    match reencoded {
        Ok(png) => Cow::Owned(png),
        Err(e) => {
            tracing::debug!(error = %e, ?format, "could not re-encode payload, writing as-is");
            Cow::Borrowed(bytes)
        }
    }
}

/// Open and fully decode an image file.
pub fn verify_image(path: &Path) -> Result<(), VerifyError> {
    image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;
    Ok(())
}
