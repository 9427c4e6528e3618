//! Request payload construction.
//!
//! Every request sent to the generation server is built fresh from an
//! immutable base template (the `params` table of the active mode in
//! `drawbatch.toml`) with per-item overrides merged on top. Nothing is ever
//! written back into the base, so an override applied to one item (a prompt,
//! an `init_images` payload) can never leak into the next request.
//!
//! ```text
//! base      { "steps": 20, "prompt": "" }
//! overrides { "prompt": "a family dinner", "seed": 7 }
//! request   { "steps": 20, "prompt": "a family dinner", "seed": 7 }
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use std::path::Path;

/// A JSON object of generation options, keyed by the server's option names.
pub type Params = serde_json::Map<String, Value>;

/// Recursively merge `overlay` on top of `base`.
///
/// - Objects are merged key-by-key (overlay keys override base keys).
/// - Non-object values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_json(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_val) => merge_json(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Build a new request object: `base` with `overrides` merged on top.
///
/// Both inputs are borrowed; the result is a fresh map.
pub fn merge_params(base: &Params, overrides: &Params) -> Params {
    match merge_json(
        Value::Object(base.clone()),
        Value::Object(overrides.clone()),
    ) {
        Value::Object(map) => map,
        // Merging two objects always yields an object
        _ => Params::new(),
    }
}

/// Read an image file and return its contents as standard base64.
pub fn encode_image_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(STANDARD.encode(bytes))
}
