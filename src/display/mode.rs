//! Active mode selection
//!
//! The mode of a connector is chosen in this order:
//!
//! 1. the mode the user stored in the boot environment, unless the boot environment asks for
//!    the best mode
//! 2. the first mode of [`MODES_SINK`] the connector offers
//! 3. the connector's preferred mode
//! 4. the connector's first mode

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::{
    error::{Error, Result},
    hw::{ConnectorType, DisplayMode, HwDisplayConnector, HwDisplayCrtc},
    system_control::{SystemControl, ENV_BEST_MODE, ENV_CVBS_MODE, ENV_HDMI_MODE},
};

/// Modes picked when the user did not select one, best first
pub const MODES_SINK: [&str; 14] = [
    "2160p60hz",
    "2160p50hz",
    "2160p30hz",
    "2160p25hz",
    "2160p24hz",
    "1080p60hz",
    "1080p50hz",
    "1080p30hz",
    "1080p25hz",
    "1080p24hz",
    "720p60hz",
    "720p50hz",
    "480p60hz",
    "576p50hz",
];

/// Keeps the mode of one connector and its crtc
#[derive(Debug)]
pub struct ModeManager {
    system_control: Arc<dyn SystemControl>,
    active: Option<DisplayMode>,
}

impl ModeManager {
    /// A manager without active mode
    pub fn new(system_control: Arc<dyn SystemControl>) -> ModeManager {
        ModeManager {
            system_control,
            active: None,
        }
    }

    /// Replaces the system control used to persist the mode
    pub fn set_system_control(&mut self, system_control: Arc<dyn SystemControl>) {
        self.system_control = system_control;
    }

    /// Mode currently driven
    pub fn active_mode(&self) -> Option<&DisplayMode> {
        self.active.as_ref()
    }

    /// Forgets the active mode, e.g. after the sink was unplugged
    pub fn reset(&mut self) {
        self.active = None;
    }

    fn user_mode_key(connector_type: ConnectorType) -> Option<&'static str> {
        match connector_type {
            ConnectorType::Hdmi => Some(ENV_HDMI_MODE),
            ConnectorType::Cvbs => Some(ENV_CVBS_MODE),
            ConnectorType::Panel => None,
        }
    }

    // Reads a boot environment variable, failures read as unset
    fn boot_env(&self, key: &str) -> Option<String> {
        match self.system_control.boot_env(key) {
            Ok(value) => value,
            Err(err) => {
                debug!(key, "Reading boot environment failed: {}", err);
                None
            }
        }
    }

    /// Picks the mode to drive on `connector` without applying it
    pub fn select_mode(&self, connector: &dyn HwDisplayConnector) -> Result<DisplayMode> {
        let modes = connector.modes()?;
        let find = |name: &str| modes.values().find(|mode| mode.name == name).cloned();

        let best_mode = self.boot_env(ENV_BEST_MODE).map_or(false, |value| value == "true");
        if !best_mode {
            let user_mode = Self::user_mode_key(connector.connector_type())
                .and_then(|key| self.boot_env(key))
                .and_then(|name| find(&name));
            if let Some(mode) = user_mode {
                return Ok(mode);
            }
        }

        if let Some(mode) = MODES_SINK.iter().find_map(|name| find(name)) {
            return Ok(mode);
        }

        modes
            .values()
            .find(|mode| mode.preferred)
            .or_else(|| modes.values().next())
            .cloned()
            .ok_or_else(|| Error::UnknownMode(String::new()))
    }

    /// Selects and applies the mode of `connector` on `crtc`
    #[instrument(level = "debug", skip_all, fields(connector = connector.id(), crtc = crtc.id()))]
    pub fn update(&mut self, connector: &dyn HwDisplayConnector, crtc: &HwDisplayCrtc) -> Result<DisplayMode> {
        let mode = self.select_mode(connector)?;
        self.apply(crtc, mode)
    }

    /// Applies the mode called `name` if `connector` offers it
    pub fn set_active_mode(
        &mut self,
        connector: &dyn HwDisplayConnector,
        crtc: &HwDisplayCrtc,
        name: &str,
    ) -> Result<DisplayMode> {
        let mode = connector
            .modes()?
            .into_values()
            .find(|mode| mode.name == name)
            .ok_or_else(|| Error::UnknownMode(name.to_owned()))?;
        let mode = self.apply(crtc, mode)?;

        // remembered as the user choice for the next boot
        if let Some(key) = Self::user_mode_key(connector.connector_type()) {
            if let Err(err) = self.system_control.set_boot_env(key, name) {
                warn!(key, "Storing user mode failed: {}", err);
            }
        }
        Ok(mode)
    }

    fn apply(&mut self, crtc: &HwDisplayCrtc, mode: DisplayMode) -> Result<DisplayMode> {
        if self.active.as_ref() == Some(&mode) && crtc.current_mode().as_ref() == Some(&mode) {
            return Ok(mode);
        }

        crtc.set_mode(&mode)?;
        if let Err(err) = self.system_control.set_active_mode(&mode.name) {
            warn!(mode = %mode.name, "Recording active mode failed, no change: {}", err);
        }
        info!(mode = %mode.name, "Active mode changed");
        self.active = Some(mode.clone());
        Ok(mode)
    }
}
