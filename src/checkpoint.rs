/* ------------------------------------------------------------------ */
/* Checkpoint save / load (safetensors)                               */
/* ------------------------------------------------------------------ */
//
// Every file is a safetensors archive of all model variables, keyed by
// their variable-builder path. String metadata:
//   descriptor   JSON ModelDescriptor        (model dumps and snapshots)
//   epoch        completed epochs            (snapshots)
//   schedule     JSON LrSchedule state       (snapshots)
//   iterations   optimizer step counter      (snapshots)
// A weights-only dump carries no metadata.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use safetensors::SafeTensors;

use crate::error::{Error, Result};
use crate::model::ModelDescriptor;
use crate::schedule::LrSchedule;

const KEY_DESCRIPTOR: &str = "descriptor";
const KEY_EPOCH: &str = "epoch";
const KEY_SCHEDULE: &str = "schedule";
const KEY_ITERATIONS: &str = "iterations";

// ── In-memory helpers ──────────────────────────────────────────────

/// Variables of `varmap` on the CPU, sorted by name.
fn cpu_tensors(varmap: &VarMap) -> Result<Vec<(String, Tensor)>> {
    let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
    let mut tensors = data
        .iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().to_device(&Device::Cpu)?)))
        .collect::<Result<Vec<_>>>()?;
    tensors.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(tensors)
}

/// Serialize every variable plus optional metadata. No disk I/O.
pub fn serialize_checkpoint(
    varmap: &VarMap,
    metadata: Option<HashMap<String, String>>,
) -> Result<Vec<u8>> {
    let tensors = cpu_tensors(varmap)?;
    safetensors::tensor::serialize(tensors.iter().map(|(n, t)| (n.as_str(), t)), &metadata)
        .map_err(|e| Error::Checkpoint(format!("serialization failed: {e}")))
}

// ── Public API ─────────────────────────────────────────────────────

/// Atomically flush a buffer to disk (write to .tmp then rename).
pub fn flush_checkpoint(path: &Path, buf: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(buf)?;
        f.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn save_weights(varmap: &VarMap, path: &Path) -> Result<()> {
    let buf = serialize_checkpoint(varmap, None)?;
    Ok(flush_checkpoint(path, &buf)?)
}

pub fn save_model(varmap: &VarMap, descriptor: &ModelDescriptor, path: &Path) -> Result<()> {
    let meta = HashMap::from([(KEY_DESCRIPTOR.to_string(), serde_json::to_string(descriptor)?)]);
    let buf = serialize_checkpoint(varmap, Some(meta))?;
    Ok(flush_checkpoint(path, &buf)?)
}

pub struct SnapshotState<'a> {
    pub epoch: usize,
    pub iterations: usize,
    pub schedule: &'a LrSchedule,
}

pub fn save_snapshot(
    varmap: &VarMap,
    descriptor: &ModelDescriptor,
    state: SnapshotState<'_>,
    path: &Path,
) -> Result<()> {
    let meta = HashMap::from([
        (KEY_DESCRIPTOR.to_string(), serde_json::to_string(descriptor)?),
        (KEY_EPOCH.to_string(), state.epoch.to_string()),
        (KEY_ITERATIONS.to_string(), state.iterations.to_string()),
        (KEY_SCHEDULE.to_string(), serde_json::to_string(state.schedule)?),
    ]);
    let buf = serialize_checkpoint(varmap, Some(meta))?;
    Ok(flush_checkpoint(path, &buf)?)
}

/// Contents of a model dump or snapshot.
pub struct Snapshot {
    pub descriptor: ModelDescriptor,
    pub tensors: HashMap<String, Tensor>,
    /// Completed epochs; 0 for plain model dumps.
    pub epoch: usize,
    pub iterations: usize,
    pub schedule: Option<LrSchedule>,
}

/// Load a model dump or snapshot onto `device`.
pub fn load_snapshot(path: &Path, device: &Device) -> Result<Snapshot> {
    let buf = std::fs::read(path)
        .map_err(|e| Error::Checkpoint(format!("cannot read {}: {e}", path.display())))?;
    let (_, header) = SafeTensors::read_metadata(&buf).map_err(|e| {
        Error::Checkpoint(format!("{} is not a safetensors file: {e}", path.display()))
    })?;
    let meta = header.metadata().clone().unwrap_or_default();

    let descriptor = meta.get(KEY_DESCRIPTOR).ok_or_else(|| {
        Error::Checkpoint(format!(
            "{} has no model descriptor (weights-only dump?)",
            path.display()
        ))
    })?;
    let descriptor: ModelDescriptor = serde_json::from_str(descriptor).map_err(|source| {
        Error::Deserialize { path: path.to_path_buf(), source }
    })?;

    let number = |key: &str| -> Result<usize> {
        meta.get(key)
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| Error::Checkpoint(format!("bad {key} value {v:?}")))
            })
            .transpose()
            .map(|v| v.unwrap_or(0))
    };
    let epoch = number(KEY_EPOCH)?;
    let iterations = number(KEY_ITERATIONS)?;
    let schedule = meta
        .get(KEY_SCHEDULE)
        .map(|s| serde_json::from_str::<LrSchedule>(s))
        .transpose()
        .map_err(|source| Error::Deserialize { path: path.to_path_buf(), source })?;

    let tensors = candle_core::safetensors::load_buffer(&buf, device)?;
    Ok(Snapshot { descriptor, tensors, epoch, iterations, schedule })
}

/// Copy `tensors` into the variables of `varmap`. Every variable must be
/// present with a matching shape.
pub fn restore_vars(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> Result<()> {
    let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
    for (name, var) in data.iter() {
        let saved = tensors
            .get(name)
            .ok_or_else(|| Error::Checkpoint(format!("variable {name} missing from checkpoint")))?;
        if saved.dims() != var.dims() {
            return Err(Error::Checkpoint(format!(
                "variable {name}: checkpoint shape {:?}, model shape {:?}",
                saved.dims(),
                var.dims()
            )));
        }
        var.set(&saved.to_device(var.device())?.to_dtype(DType::F32)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::network::Architecture;
    use crate::schedule::SchedulePolicy;
    use candle_nn::VarBuilder;

    fn model(varmap: &VarMap) -> ModelDescriptor {
        let desc = ModelDescriptor::Embedding {
            architecture: Architecture::ResNet { depth: 8 },
            embedding_dim: 4,
            l2_normalize: false,
            classifier: None,
        };
        desc.build(VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)).unwrap();
        desc
    }

    fn var_values(varmap: &VarMap) -> Vec<(String, Vec<f32>)> {
        cpu_tensors(varmap)
            .unwrap()
            .into_iter()
            .map(|(n, t)| (n, t.flatten_all().unwrap().to_vec1().unwrap()))
            .collect()
    }

    #[test]
    fn snapshot_round_trip_restores_weights_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.safetensors");

        let src = VarMap::new();
        let desc = model(&src);
        let mut schedule =
            LrSchedule::from_config(&ScheduleConfig::new(SchedulePolicy::Plateau)).unwrap();
        schedule.on_epoch_end(0.7);
        let state = SnapshotState { epoch: 3, iterations: 120, schedule: &schedule };
        save_snapshot(&src, &desc, state, &path).unwrap();
        assert!(!dir.path().join("snap.safetensors.tmp").exists());

        let snap = load_snapshot(&path, &Device::Cpu).unwrap();
        assert_eq!(snap.descriptor, desc);
        assert_eq!(snap.epoch, 3);
        assert_eq!(snap.iterations, 120);
        assert_eq!(snap.schedule, Some(schedule));

        let dst = VarMap::new();
        model(&dst);
        restore_vars(&dst, &snap.tensors).unwrap();
        assert_eq!(var_values(&src), var_values(&dst));
    }

    #[test]
    fn weights_only_dump_has_no_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let varmap = VarMap::new();
        model(&varmap);
        save_weights(&varmap, &path).unwrap();
        assert!(matches!(load_snapshot(&path, &Device::Cpu), Err(Error::Checkpoint(_))));
    }

    #[test]
    fn model_dump_loads_with_epoch_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let varmap = VarMap::new();
        let desc = model(&varmap);
        save_model(&varmap, &desc, &path).unwrap();
        let snap = load_snapshot(&path, &Device::Cpu).unwrap();
        assert_eq!(snap.epoch, 0);
        assert!(snap.schedule.is_none());
    }

    #[test]
    fn missing_variables_are_reported() {
        let varmap = VarMap::new();
        model(&varmap);
        let err = restore_vars(&varmap, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    #[test]
    fn save_into_missing_directory_fails() {
        let varmap = VarMap::new();
        model(&varmap);
        assert!(save_weights(&varmap, Path::new("/nonexistent/dir/w.safetensors")).is_err());
    }
}
