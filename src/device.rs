/* ------------------------------------------------------------------ */
/* Accelerator probe and device selection                             */
/* ------------------------------------------------------------------ */

use std::panic::{self, AssertUnwindSafe};

use candle_core::Device;

lazy_static::lazy_static! {
    /// First available accelerator, probed once. `None` when candle was built
    /// without the `cuda`/`metal` features or no device is present.
    pub static ref ACCELERATOR: Option<Device> = {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            Device::new_cuda(0).or_else(|_| Device::new_metal(0))
        }));

        match result {
            Ok(Ok(dev)) => {
                log::info!("accelerator enabled: {:?}", dev);
                Some(dev)
            }
            Ok(Err(e)) => {
                log::debug!("no accelerator: {}", e);
                None
            }
            Err(_) => {
                log::warn!("accelerator initialization panicked, using CPU");
                None
            }
        }
    };
}

/// Device for a run. Falls back to CPU when no accelerator is available, so
/// the same config works on a laptop and on a GPU box.
pub fn select_device(use_accelerator: bool) -> Device {
    if use_accelerator {
        if let Some(dev) = ACCELERATOR.as_ref() {
            return dev.clone();
        }
        log::warn!("accelerator requested but unavailable, training on CPU");
    }
    Device::Cpu
}
