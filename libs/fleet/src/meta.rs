//! Image-label meta key decoding.
//!
//! Installation media can bake labels into the node through a meta key. The
//! value is a JSON blob; the current shape nests the labels under
//! `machineLabels`, the legacy shape is a bare string map.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Id of the meta key carrying image labels.
pub const LABELS_META_KEY: &str = "0x0a";

#[derive(Debug, Default, Deserialize)]
struct ImageLabelsBlob {
    #[serde(default, rename = "machineLabels")]
    machine_labels: Option<BTreeMap<String, String>>,

    #[serde(flatten)]
    legacy: BTreeMap<String, String>,
}

/// Decode an image-labels blob.
///
/// Returns `None` when the blob carries no labels in either shape.
pub fn parse_image_labels(
    raw: &str,
) -> Result<Option<BTreeMap<String, String>>, serde_json::Error> {
    let blob: ImageLabelsBlob = serde_json::from_str(raw)?;

    Ok(match blob.machine_labels {
        Some(labels) => Some(labels),
        None if !blob.legacy.is_empty() => Some(blob.legacy),
        None => None,
    })
}

/// Remove image labels that the user has overridden; user labels win.
pub fn mask_user_labels(
    image_labels: &mut BTreeMap<String, String>,
    user_labels: &BTreeMap<String, String>,
) {
    for key in user_labels.keys() {
        image_labels.remove(key);
    }
}
