/* ------------------------------------------------------------------ */
/* Output writer: feature dumps and best-effort model saves           */
/* ------------------------------------------------------------------ */

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::flush_checkpoint;
use crate::error::Result;

#[derive(Serialize)]
struct FeatureDump<'a> {
    feat: BTreeMap<String, &'a [f32]>,
}

/// Write `{"feat": {"<index>": [..], ...}}`.
pub fn write_feature_dump(path: &Path, features: &[(usize, Vec<f32>)]) -> Result<()> {
    let feat = features.iter().map(|(i, v)| (i.to_string(), v.as_slice())).collect();
    let buf = serde_json::to_vec(&FeatureDump { feat })?;
    flush_checkpoint(path, &buf)?;
    info!(samples = features.len(), path = %path.display(), "features written");
    Ok(())
}

/// Report a failed save as a warning; returns whether it succeeded.
pub fn save_or_warn(what: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("An error occurred while saving the {what}: {e}");
            false
        }
    }
}
