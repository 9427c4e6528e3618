//! Work queue construction.
//!
//! Produces the ordered list of [`WorkItem`]s the batch driver consumes.
//! There are two ways to build one:
//!
//! ## Template mode
//!
//! A [`Selection`] (`nation`, `category`, `count`) is matched against the
//! template table. Each matching template becomes `count` work items. Ids are
//! `{nation}_{category}_{seq}` with `seq` running from 1 across every match of
//! that selection, and outputs are grouped by nation and category:
//!
//! ```text
//! generations/
//! └── Italy/
//!     └── family/
//!         ├── Italy_family_1_1.png
//!         └── Italy_family_2_1.png
//! ```
//!
//! ## Directory-scan mode
//!
//! The input root is walked depth-first in file-name order. Every file with a
//! recognized extension becomes one item whose id is its path relative to the
//! root. The relative directory is reproduced under the output root:
//!
//! ```text
//! generations/Italy/family/Italy_family_1_1.png
//!     → upscaled/Italy/family/Italy_family_1_1_upscaled_1.png
//! ```

use crate::request::{self, Params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Input directory not found: {0}")]
    InputNotFound(PathBuf),
    #[error("Invalid selection '{0}': expected NATION:CATEGORY:COUNT")]
    InvalidSelection(String),
    #[error("Invalid selection: {0}")]
    InvalidSelectionValue(String),
}

/// One entry of the template table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Template {
    pub nation: String,
    /// Prompt text; the configured suffix is appended when the request is built.
    pub prompt: String,
    /// Explicit category. Without one, the category is matched against the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Extra request keys for items built from this template.
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub overrides: Params,
}

impl Template {
    /// Whether this template belongs to the given nation and category.
    pub fn matches(&self, nation: &str, category: &str) -> bool {
        if !self.nation.eq_ignore_ascii_case(nation) {
            return false;
        }
        match &self.category {
            Some(c) => c.eq_ignore_ascii_case(category),
            None => self
                .prompt
                .to_lowercase()
                .contains(&category.to_lowercase()),
        }
    }
}

/// A request for `count` images of every template matching `nation` + `category`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Selection {
    pub nation: String,
    pub category: String,
    pub count: u32,
}

impl Selection {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.nation.trim().is_empty() || self.category.trim().is_empty() {
            return Err(QueueError::InvalidSelectionValue(format!(
                "{self}: nation and category must not be empty"
            )));
        }
        if self.count == 0 {
            return Err(QueueError::InvalidSelectionValue(format!(
                "{self}: count must be at least 1"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.nation, self.category, self.count)
    }
}

/// Parses `NATION:CATEGORY:COUNT`, as given to `--select`.
impl FromStr for Selection {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        let [nation, category, count] = parts.as_slice() else {
            return Err(QueueError::InvalidSelection(s.to_string()));
        };
        let count = count
            .parse::<u32>()
            .map_err(|_| QueueError::InvalidSelection(s.to_string()))?;
        let selection = Selection {
            nation: nation.to_string(),
            category: category.to_string(),
            count,
        };
        selection.validate()?;
        Ok(selection)
    }
}

/// Where an item's request payload comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Built from a template; the prompt is already in the item's overrides.
    Template { nation: String, category: String },
    /// A source image, base64-encoded into `init_images` when the request is built.
    Image(PathBuf),
}

/// One unit of generation work. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Stable identifier, recorded in the checkpoint log once completed.
    pub id: String,
    pub source: Source,
    /// Merged on top of the mode's base template.
    pub overrides: Params,
    /// Directory below the output root that receives this item's images.
    pub subdir: PathBuf,
    /// Output file stem; `_<image_index>.png` is appended per image.
    pub base_name: String,
}

impl WorkItem {
    /// Build this item's request: a fresh copy of `base` with the item's
    /// overrides (and, for image sources, `init_images`) merged on top.
    pub fn request(&self, base: &Params) -> std::io::Result<Params> {
        let mut overrides = self.overrides.clone();
        if let Source::Image(path) = &self.source {
            let encoded = request::encode_image_file(path)?;
            overrides.insert(
                "init_images".to_string(),
                Value::Array(vec![Value::String(encoded)]),
            );
        }
        Ok(request::merge_params(base, &overrides))
    }
}

// ============================================================================
// Template mode
// ============================================================================

/// Distinct nations in the template table, sorted.
pub fn available_nations(templates: &[Template]) -> Vec<String> {
    templates
        .iter()
        .map(|t| t.nation.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Build the queue for a list of selections, in selection order.
///
/// A selection that matches no template is reported and contributes no items;
/// it does not fail the queue.
pub fn build_template_queue(
    templates: &[Template],
    selections: &[Selection],
    prompt_suffix: &str,
) -> Vec<WorkItem> {
    let mut items = Vec::new();

    for selection in selections {
        let matching: Vec<&Template> = templates
            .iter()
            .filter(|t| t.matches(&selection.nation, &selection.category))
            .collect();

        if matching.is_empty() {
            tracing::warn!(
                nation = %selection.nation,
                category = %selection.category,
                "no matching templates"
            );
            continue;
        }

        let mut seq = 0u32;
        for template in matching {
            let prompt = format!("{}{}", template.prompt, prompt_suffix);
            for _ in 0..selection.count {
                seq += 1;
                let id = format!("{}_{}_{}", selection.nation, selection.category, seq);
                let mut overrides = template.overrides.clone();
                overrides.insert("prompt".to_string(), Value::String(prompt.clone()));
                items.push(WorkItem {
                    id: id.clone(),
                    source: Source::Template {
                        nation: selection.nation.clone(),
                        category: selection.category.clone(),
                    },
                    overrides,
                    subdir: Path::new(&selection.nation).join(&selection.category),
                    base_name: id,
                });
            }
        }
    }

    items
}

// ============================================================================
// Directory-scan mode
// ============================================================================

/// Walk `root` and build one item per image file.
///
/// `extensions` are compared case-insensitively without the leading dot.
/// Anything under `exclude` (typically the output root, when it is nested
/// inside the input root) is skipped. `output_suffix` is inserted between
/// the source stem and the image index when non-empty.
///
/// Files sharing a directory and a stem (`a.png`, `a.jpg`) would write to
/// the same outputs, so every file in such a group keeps its extension in
/// the base name: `a_jpg`, `a_png`.
pub fn scan_directory(
    root: &Path,
    extensions: &[String],
    exclude: Option<&Path>,
    output_suffix: &str,
) -> Result<Vec<WorkItem>, QueueError> {
    if !root.is_dir() {
        return Err(QueueError::InputNotFound(root.to_path_buf()));
    }

    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| exclude.is_none_or(|ex| e.path() != ex));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !has_extension(path, extensions) {
            tracing::debug!(path = %path.display(), "skipping unsupported file");
            continue;
        }
        let Ok(rel_path) = path.strip_prefix(root) else {
            continue;
        };
        found.push(ScannedFile {
            path: path.to_path_buf(),
            id: relative_id(rel_path),
            subdir: rel_path.parent().map(Path::to_path_buf).unwrap_or_default(),
            stem: lossy(path.file_stem()),
            extension: lossy(path.extension()),
        });
    }

    let mut stems: HashMap<(PathBuf, String), usize> = HashMap::new();
    for file in &found {
        *stems.entry(file.stem_key()).or_default() += 1;
    }

    let items = found
        .into_iter()
        .map(|file| {
            let stem = if stems[&file.stem_key()] > 1 {
                tracing::warn!(
                    path = %file.path.display(),
                    "another file shares this stem, keeping the extension in output names"
                );
                format!("{}_{}", file.stem, file.extension)
            } else {
                file.stem
            };
            let base_name = if output_suffix.is_empty() {
                stem
            } else {
                format!("{stem}_{output_suffix}")
            };
            WorkItem {
                id: file.id,
                source: Source::Image(file.path),
                overrides: Params::new(),
                subdir: file.subdir,
                base_name,
            }
        })
        .collect();

    Ok(items)
}

struct ScannedFile {
    path: PathBuf,
    id: String,
    subdir: PathBuf,
    stem: String,
    extension: String,
}

impl ScannedFile {
    /// Outputs collide on case-insensitive filesystems too.
    fn stem_key(&self) -> (PathBuf, String) {
        (self.subdir.clone(), self.stem.to_lowercase())
    }
}

fn lossy(part: Option<&std::ffi::OsStr>) -> String {
    part.map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    extensions
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext))
}

/// Relative path joined with `/` regardless of platform, so ids are portable.
fn relative_id(rel_path: &Path) -> String {
    rel_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn template(nation: &str, prompt: &str) -> Template {
        Template {
            nation: nation.into(),
            prompt: prompt.into(),
            category: None,
            overrides: Params::new(),
        }
    }

    fn exts() -> Vec<String> {
        vec!["png".into(), "jpg".into()]
    }

    // =========================================================================
    // Selection parsing
    // =========================================================================

    #[test]
    fn selection_parses_three_parts() {
        let s: Selection = "Italy:family:3".parse().unwrap();
        assert_eq!(s.nation, "Italy");
        assert_eq!(s.category, "family");
        assert_eq!(s.count, 3);
    }

    #[test]
    fn selection_rejects_missing_count() {
        let result = "Italy:family".parse::<Selection>();
        assert!(matches!(result, Err(QueueError::InvalidSelection(_))));
    }

    #[test]
    fn selection_rejects_non_numeric_count() {
        let result = "Italy:family:many".parse::<Selection>();
        assert!(matches!(result, Err(QueueError::InvalidSelection(_))));
    }

    #[test]
    fn selection_rejects_zero_count() {
        let result = "Italy:family:0".parse::<Selection>();
        assert!(matches!(result, Err(QueueError::InvalidSelectionValue(_))));
    }

    #[test]
    fn selection_display_roundtrips() {
        let s: Selection = "Japan:working:2".parse().unwrap();
        assert_eq!(s.to_string(), "Japan:working:2");
    }

    // =========================================================================
    // Template matching
    // =========================================================================

    #[test]
    fn template_matches_category_in_prompt_case_insensitively() {
        let t = template("Italy", "An Italian FAMILY at dinner");
        assert!(t.matches("italy", "family"));
        assert!(!t.matches("Italy", "working"));
        assert!(!t.matches("France", "family"));
    }

    #[test]
    fn template_explicit_category_wins_over_prompt() {
        let mut t = template("Italy", "a family business");
        t.category = Some("working".into());
        assert!(t.matches("Italy", "working"));
        assert!(!t.matches("Italy", "family"));
    }

    #[test]
    fn available_nations_sorted_and_deduplicated() {
        let templates = vec![
            template("Japan", "a"),
            template("Italy", "b"),
            template("Japan", "c"),
        ];
        assert_eq!(available_nations(&templates), vec!["Italy", "Japan"]);
    }

    // =========================================================================
    // Template queue
    // =========================================================================

    #[test]
    fn template_queue_repeats_each_match() {
        let templates = vec![template("Italy", "a family at the beach")];
        let selections = vec![Selection {
            nation: "Italy".into(),
            category: "family".into(),
            count: 3,
        }];

        let items = build_template_queue(&templates, &selections, ", sharp");
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["Italy_family_1", "Italy_family_2", "Italy_family_3"]);
        assert_eq!(
            items[0].overrides.get("prompt"),
            Some(&json!("a family at the beach, sharp"))
        );
        assert_eq!(items[0].subdir, Path::new("Italy").join("family"));
        assert_eq!(items[0].base_name, "Italy_family_1");
    }

    #[test]
    fn template_queue_numbers_across_matching_templates() {
        let templates = vec![
            template("Italy", "a family at the beach"),
            template("Italy", "a family at dinner"),
        ];
        let selections = vec![Selection {
            nation: "Italy".into(),
            category: "family".into(),
            count: 2,
        }];

        let items = build_template_queue(&templates, &selections, "");
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "Italy_family_1",
                "Italy_family_2",
                "Italy_family_3",
                "Italy_family_4"
            ]
        );
        assert_eq!(items[2].overrides.get("prompt"), Some(&json!("a family at dinner")));
    }

    #[test]
    fn template_queue_skips_selection_without_matches() {
        let templates = vec![template("Italy", "a family at the beach")];
        let selections = vec![
            Selection {
                nation: "France".into(),
                category: "family".into(),
                count: 2,
            },
            Selection {
                nation: "Italy".into(),
                category: "family".into(),
                count: 1,
            },
        ];

        let items = build_template_queue(&templates, &selections, "");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "Italy_family_1");
    }

    #[test]
    fn template_overrides_are_carried_and_prompt_wins() {
        let mut t = template("Italy", "a family");
        t.overrides.insert("steps".into(), json!(40));
        t.overrides.insert("prompt".into(), json!("ignored"));
        let selections = vec![Selection {
            nation: "Italy".into(),
            category: "family".into(),
            count: 1,
        }];

        let items = build_template_queue(&[t], &selections, "");
        assert_eq!(items[0].overrides.get("steps"), Some(&json!(40)));
        assert_eq!(items[0].overrides.get("prompt"), Some(&json!("a family")));
    }

    // =========================================================================
    // Directory scan
    // =========================================================================

    #[test]
    fn scan_missing_root_is_error() {
        let tmp = TempDir::new().unwrap();
        let result = scan_directory(&tmp.path().join("missing"), &exts(), None, "");
        assert!(matches!(result, Err(QueueError::InputNotFound(_))));
    }

    #[test]
    fn scan_uses_relative_paths_as_ids_in_walk_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("Italy/family")).unwrap();
        fs::create_dir_all(root.join("Japan")).unwrap();
        fs::write(root.join("Italy/family/b.png"), "").unwrap();
        fs::write(root.join("Italy/family/a.jpg"), "").unwrap();
        fs::write(root.join("Japan/c.png"), "").unwrap();
        fs::write(root.join("top.png"), "").unwrap();

        let items = scan_directory(root, &exts(), None, "").unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["Italy/family/a.jpg", "Italy/family/b.png", "Japan/c.png", "top.png"]
        );
        assert_eq!(items[0].subdir, Path::new("Italy").join("family"));
        assert_eq!(items[3].subdir, PathBuf::new());
    }

    #[test]
    fn scan_filters_extensions_case_insensitively() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.PNG"), "").unwrap();
        fs::write(tmp.path().join("b.txt"), "").unwrap();
        fs::write(tmp.path().join("c.webp"), "").unwrap();

        let items = scan_directory(tmp.path(), &exts(), None, "").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "a.PNG");
    }

    #[test]
    fn scan_applies_output_suffix_to_base_name() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("photo.png"), "").unwrap();

        let items = scan_directory(tmp.path(), &exts(), None, "upscaled").unwrap();
        assert_eq!(items[0].base_name, "photo_upscaled");

        let items = scan_directory(tmp.path(), &exts(), None, "").unwrap();
        assert_eq!(items[0].base_name, "photo");
    }

    #[test]
    fn scan_skips_excluded_directory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("out")).unwrap();
        fs::write(root.join("in.png"), "").unwrap();
        fs::write(root.join("out/in_1.png"), "").unwrap();

        let out = root.join("out");
        let items = scan_directory(root, &exts(), Some(&out), "").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "in.png");
    }

    #[test]
    fn scan_disambiguates_files_sharing_a_stem() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.png"), "").unwrap();
        fs::write(root.join("a.jpg"), "").unwrap();
        fs::write(root.join("b.png"), "").unwrap();
        // Same stem in another directory does not collide
        fs::write(root.join("sub/a.png"), "").unwrap();

        let items = scan_directory(root, &exts(), None, "").unwrap();
        let names: Vec<(&str, &str)> = items
            .iter()
            .map(|i| (i.id.as_str(), i.base_name.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a.jpg", "a_jpg"),
                ("a.png", "a_png"),
                ("b.png", "b"),
                ("sub/a.png", "a"),
            ]
        );

        let items = scan_directory(root, &exts(), None, "upscaled").unwrap();
        assert_eq!(items[0].base_name, "a_jpg_upscaled");
        assert_eq!(items[1].base_name, "a_png_upscaled");
    }

    // =========================================================================
    // Request building
    // =========================================================================

    #[test]
    fn image_item_request_carries_init_images() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("photo.png"), b"hello").unwrap();
        let items = scan_directory(tmp.path(), &exts(), None, "").unwrap();

        let mut base = Params::new();
        base.insert("denoising_strength".into(), json!(0.3));
        let request = items[0].request(&base).unwrap();

        assert_eq!(request.get("init_images"), Some(&json!(["aGVsbG8="])));
        assert_eq!(request.get("denoising_strength"), Some(&json!(0.3)));
        assert!(base.get("init_images").is_none());
    }

    #[test]
    fn image_item_request_fails_when_source_vanished() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("photo.png");
        fs::write(&path, b"x").unwrap();
        let items = scan_directory(tmp.path(), &exts(), None, "").unwrap();
        fs::remove_file(&path).unwrap();

        assert!(items[0].request(&Params::new()).is_err());
    }
}
