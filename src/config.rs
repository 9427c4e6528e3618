//! Batch configuration module.
//!
//! Handles loading, validating, and merging `drawbatch.toml`. Stock defaults
//! are serialized to a TOML value and the user's file is merged on top of
//! them key-by-key, so a config file only needs the keys it wants to change.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [api]
//! base_url = "http://127.0.0.1:7860"   # Generation server
//! timeout_secs = 600                   # Per-request timeout
//!
//! [txt2img]
//! endpoint = "/sdapi/v1/txt2img"
//! output = "generations"               # <output>/<nation>/<category>/...
//! checkpoint = "generations/processed.log"
//! metrics = "generations/metrics.csv"
//! prompt_suffix = ", (35mm lens photography), ..."
//!
//! [txt2img.params]                     # Base request template
//! steps = 20
//!
//! [[txt2img.templates]]
//! nation = "Italy"
//! prompt = "an italian family having dinner"
//!
//! [[txt2img.queue]]
//! nation = "Italy"
//! category = "family"
//! count = 4
//!
//! [img2img]
//! endpoint = "/sdapi/v1/img2img"
//! input = "generations"                # Scanned recursively
//! output = "upscaled"                  # Mirrors the input tree
//! checkpoint = "upscaled/processed.log"
//! metrics = "upscaled/metrics.csv"
//! extensions = ["png", "jpg"]
//! output_suffix = "upscaled"           # photo.png -> photo_upscaled_1.png
//!
//! [img2img.params]
//! denoising_strength = 0.3
//! ```
//!
//! Unknown keys are rejected to catch typos early. `params` tables are
//! free-form: their keys are passed to the server untouched.

use crate::queue::{Selection, Template};
use crate::request::Params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "drawbatch.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Config file not found: {0}")]
    NotFound(std::path::PathBuf),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Top-level configuration loaded from `drawbatch.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Generation server connection settings.
    pub api: ApiConfig,
    /// Template mode: prompts built from the template table.
    pub txt2img: Txt2ImgConfig,
    /// Directory-scan mode: every image under `input` is sent through the server.
    pub img2img: Img2ImgConfig,
}

impl BatchConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("api.base_url must not be empty".into()));
        }
        if self.api.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "api.timeout_secs must be greater than zero".into(),
            ));
        }
        if self.txt2img.endpoint.trim().is_empty() || self.img2img.endpoint.trim().is_empty() {
            return Err(ConfigError::Validation("endpoint must not be empty".into()));
        }
        if self.img2img.extensions.is_empty() {
            return Err(ConfigError::Validation(
                "img2img.extensions must not be empty".into(),
            ));
        }
        for template in &self.txt2img.templates {
            if template.nation.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "template with prompt '{}' has an empty nation",
                    template.prompt
                )));
            }
        }
        for selection in &self.txt2img.queue {
            selection
                .validate()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }
        Ok(())
    }
}

/// Generation server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    /// Scheme, host and port of the server, e.g. `http://127.0.0.1:7860`.
    pub base_url: String,
    /// Timeout for a single generation request.
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7860".to_string(),
            timeout_secs: 600,
        }
    }
}

/// Template-mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Txt2ImgConfig {
    /// Endpoint path appended to `api.base_url`.
    pub endpoint: String,
    /// Output root; images land in `<output>/<nation>/<category>/`.
    pub output: String,
    /// Checkpoint log of completed item ids.
    pub checkpoint: String,
    /// Metrics CSV.
    pub metrics: String,
    /// Appended verbatim to every template prompt.
    pub prompt_suffix: String,
    /// Base request template.
    pub params: Params,
    /// The template table.
    pub templates: Vec<Template>,
    /// Default selections, used when none are given on the command line.
    pub queue: Vec<Selection>,
}

impl Default for Txt2ImgConfig {
    fn default() -> Self {
        Self {
            endpoint: "/sdapi/v1/txt2img".to_string(),
            output: "generations".to_string(),
            checkpoint: "generations/processed.log".to_string(),
            metrics: "generations/metrics.csv".to_string(),
            prompt_suffix: ", (35mm lens photography), extremely detailed, 4k, shot on dslr, \
                            photorealistic, photographic, sharp"
                .to_string(),
            params: object(json!({
                "steps": 20,
                "width": 512,
                "height": 512,
                "cfg_scale": 7.0,
                "batch_size": 1,
                "seed": -1,
            })),
            templates: Vec::new(),
            queue: Vec::new(),
        }
    }
}

/// Directory-scan mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Img2ImgConfig {
    /// Endpoint path appended to `api.base_url`.
    pub endpoint: String,
    /// Root directory scanned recursively for source images.
    pub input: String,
    /// Output root; the input directory structure is mirrored below it.
    pub output: String,
    /// Checkpoint log of completed item ids.
    pub checkpoint: String,
    /// Metrics CSV.
    pub metrics: String,
    /// File extensions (case-insensitive, without the dot) treated as images.
    pub extensions: Vec<String>,
    /// Inserted between the source stem and the image index. Empty to omit.
    pub output_suffix: String,
    /// Base request template.
    pub params: Params,
}

impl Default for Img2ImgConfig {
    fn default() -> Self {
        Self {
            endpoint: "/sdapi/v1/img2img".to_string(),
            input: "generations".to_string(),
            output: "upscaled".to_string(),
            checkpoint: "upscaled/processed.log".to_string(),
            metrics: "upscaled/metrics.csv".to_string(),
            extensions: vec!["png".to_string(), "jpg".to_string()],
            output_suffix: "upscaled".to_string(),
            params: object(json!({
                "denoising_strength": 0.3,
                "steps": 20,
                "seed": -1,
            })),
        }
    }
}

fn object(value: serde_json::Value) -> Params {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Params::new(),
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the canonical representation of all default values, used as the
/// base layer for merging user overrides on top.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(BatchConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
/// Returns `Err` if the file exists but contains invalid TOML.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<BatchConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: BatchConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a TOML file.
///
/// Merges user values on top of stock defaults, rejects unknown keys,
/// and validates the result. A missing file yields the stock defaults.
pub fn load_config(path: &Path) -> Result<BatchConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_config(path)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `drawbatch.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# drawbatch Configuration
# =======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Generation server
# ---------------------------------------------------------------------------
[api]
# Scheme, host and port of the local generation server.
base_url = "http://127.0.0.1:7860"

# Timeout for a single generation request, in seconds.
timeout_secs = 600

# ---------------------------------------------------------------------------
# Template mode (drawbatch txt2img)
# ---------------------------------------------------------------------------
[txt2img]
endpoint = "/sdapi/v1/txt2img"

# Images are written to <output>/<nation>/<category>/<nation>_<category>_<n>_<i>.png
output = "generations"

# One completed item id per line. Delete it to regenerate everything.
checkpoint = "generations/processed.log"

# One CSV row per written image.
metrics = "generations/metrics.csv"

# Appended to every template prompt.
prompt_suffix = ", (35mm lens photography), extremely detailed, 4k, shot on dslr, photorealistic, photographic, sharp"

# Base request template. Keys are passed to the server as-is; each item's
# prompt is merged on top of a fresh copy.
[txt2img.params]
steps = 20
width = 512
height = 512
cfg_scale = 7.0
batch_size = 1
seed = -1

# Template table. A template matches a selection when its nation equals the
# selected nation (case-insensitive) and either its category equals the
# selected category, or, without a category, its prompt contains it.
#
# [[txt2img.templates]]
# nation = "Italy"
# prompt = "an italian family having dinner at home"
#
# [[txt2img.templates]]
# nation = "Italy"
# category = "working"
# prompt = "an italian mechanic in a workshop"
# overrides = { steps = 30 }

# Default selections, used when no --select is given.
#
# [[txt2img.queue]]
# nation = "Italy"
# category = "family"
# count = 4

# ---------------------------------------------------------------------------
# Directory-scan mode (drawbatch img2img)
# ---------------------------------------------------------------------------
[img2img]
endpoint = "/sdapi/v1/img2img"

# Scanned recursively for source images.
input = "generations"

# The input directory structure is mirrored below this root.
output = "upscaled"

checkpoint = "upscaled/processed.log"
metrics = "upscaled/metrics.csv"

# Extensions treated as images (case-insensitive).
extensions = ["png", "jpg"]

# photo.png -> photo_upscaled_1.png. Set to "" for photo_1.png.
output_suffix = "upscaled"

# Base request template. init_images is filled in per item.
[img2img.params]
denoising_strength = 0.3
steps = 20
seed = -1
"##
}
