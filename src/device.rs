/* ------------------------------------------------------------------ */
/* Compute devices: CUDA > Metal > CPU                                */
/* ------------------------------------------------------------------ */

use candle_core::Device;
use tracing::{info, warn};

#[cfg_attr(not(any(feature = "cuda", feature = "metal")), allow(unused_variables))]
fn accelerator(ordinal: usize) -> Option<Device> {
    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(ordinal) {
            Ok(dev) => return Some(dev),
            Err(e) => warn!("CUDA device {ordinal} unavailable: {e}"),
        }
    }

    #[cfg(feature = "metal")]
    {
        // Metal initialization can panic on machines without a GPU.
        let attempt = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            Device::new_metal(ordinal)
        }));
        match attempt {
            Ok(Ok(dev)) => return Some(dev),
            Ok(Err(e)) => warn!("Metal device {ordinal} unavailable: {e}"),
            Err(_) => warn!("Metal device {ordinal} unavailable (initialization panicked)"),
        }
    }

    None
}

/// `count` devices for data-parallel training. Missing accelerators are
/// replaced by the CPU with a warning.
pub fn select_devices(count: usize) -> Vec<Device> {
    let count = count.max(1);
    let devices: Vec<Device> = (0..count)
        .map(|i| {
            accelerator(i).unwrap_or_else(|| {
                if cfg!(any(feature = "cuda", feature = "metal")) {
                    warn!("falling back to CPU for replica {i}");
                }
                Device::Cpu
            })
        })
        .collect();

    let gpus = devices.iter().filter(|d| !d.is_cpu()).count();
    info!(devices = count, accelerators = gpus, "compute devices selected");
    devices
}

/// Device for the canonical copy of the weights: the only device when
/// training on one, else the CPU.
pub fn canonical_device(devices: &[Device]) -> Device {
    match devices {
        [single] => single.clone(),
        _ => Device::Cpu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_count_is_honoured() {
        assert_eq!(select_devices(3).len(), 3);
        assert_eq!(select_devices(0).len(), 1);
    }

    #[test]
    fn canonical_device_is_cpu_for_replicas() {
        assert!(canonical_device(&[Device::Cpu, Device::Cpu]).is_cpu());
        assert!(canonical_device(&[Device::Cpu]).is_cpu());
    }
}
