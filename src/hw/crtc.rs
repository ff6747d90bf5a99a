//! Crtc handles

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::{debug, instrument};

use super::{CrtcInfo, DisplayDevice, DisplayMode};
use crate::{
    error::{Error, Result},
    utils::{Monotonic, Time},
};

#[derive(Debug, Default)]
struct CrtcState {
    mode: Option<DisplayMode>,
    connector: Option<u32>,
}

/// Timing engine driving one scanout pipeline
#[derive(Debug)]
pub struct HwDisplayCrtc {
    id: u32,
    pipe: u32,
    device: Arc<dyn DisplayDevice>,
    state: Mutex<CrtcState>,
}

impl HwDisplayCrtc {
    pub(crate) fn new(device: Arc<dyn DisplayDevice>, info: CrtcInfo) -> HwDisplayCrtc {
        HwDisplayCrtc {
            id: info.id,
            pipe: info.pipe,
            device,
            state: Mutex::new(CrtcState::default()),
        }
    }

    /// Object id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Pipeline index
    pub fn pipe(&self) -> u32 {
        self.pipe
    }

    /// Bit of this crtc in a possible-crtcs mask
    pub fn mask(&self) -> u32 {
        1u32.checked_shl(self.pipe).unwrap_or(0)
    }

    /// Blocks until the next vblank or until `timeout` expired
    ///
    /// Returns the vblank timestamp, or `None` on timeout.
    pub fn wait_vblank(&self, timeout: Duration) -> Result<Option<Time<Monotonic>>> {
        self.device
            .wait_vblank(self.id, timeout)
            .map_err(|source| Error::Access {
                errmsg: "Error waiting for vblank",
                source,
            })
    }

    /// Programs `mode` and remembers it as the current mode
    #[instrument(level = "debug", skip(self, mode), fields(crtc = self.id, mode = %mode.name))]
    pub fn set_mode(&self, mode: &DisplayMode) -> Result<()> {
        self.device
            .set_crtc_mode(self.id, mode)
            .map_err(|source| Error::Access {
                errmsg: "Error setting crtc mode",
                source,
            })?;
        self.state.lock().unwrap().mode = Some(mode.clone());
        Ok(())
    }

    /// Mode last programmed successfully
    pub fn current_mode(&self) -> Option<DisplayMode> {
        self.state.lock().unwrap().mode.clone()
    }

    /// Re-programs the current mode, after the pipeline was reset by a hotplug
    pub fn update(&self) -> Result<()> {
        let mode = self.current_mode();
        match mode {
            Some(mode) => self.set_mode(&mode),
            None => {
                debug!(crtc = self.id, "No mode to restore");
                Ok(())
            }
        }
    }

    /// Connector currently driven by this crtc
    pub fn connector(&self) -> Option<u32> {
        self.state.lock().unwrap().connector
    }

    // Returns `false` if the crtc already drives a connector
    pub(crate) fn bind(&self, connector: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.connector {
            Some(_) => false,
            None => {
                state.connector = Some(connector);
                true
            }
        }
    }

    pub(crate) fn unbind(&self) {
        let mut state = self.state.lock().unwrap();
        state.connector = None;
        state.mode = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::HwDisplayCrtc;
    use crate::{backend::virtual_device::VirtualDevice, hw::CrtcInfo};

    fn crtc(pipe: u32) -> HwDisplayCrtc {
        HwDisplayCrtc::new(Arc::new(VirtualDevice::new()), CrtcInfo { id: 1, pipe })
    }

    #[test]
    fn mask_of_high_pipes() {
        assert_eq!(crtc(0).mask(), 0b1);
        assert_eq!(crtc(3).mask(), 0b1000);
        assert_eq!(crtc(31).mask(), 1 << 31);
        assert_eq!(crtc(32).mask(), 0);
        assert_eq!(crtc(40).mask(), 0);
    }

    #[test]
    fn drives_one_connector() {
        let crtc = crtc(0);
        assert!(crtc.bind(10));
        assert!(!crtc.bind(10));
        assert!(!crtc.bind(11));
        assert_eq!(crtc.connector(), Some(10));
        crtc.unbind();
        assert!(crtc.bind(11));
    }
}
