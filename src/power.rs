//! Power and connection state
//!
//! Decides whether a display has to be blanked. Until the screen is un-blanked for the first
//! time the display is in [`PowerState::Boot`] and only shows content once a sink is attached
//! and something is queued. Afterwards it follows the connector: content is always shown while
//! a sink is attached and never while none is.

use tracing::debug;

/// State of [`HwcPowerMode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    /// The screen was never un-blanked
    Boot,
    /// A sink is attached
    ConnectorIn,
    /// No sink is attached
    ConnectorOut,
}

/// Blanking state machine of one display
#[derive(Debug, Clone)]
pub struct HwcPowerMode {
    state: PowerState,
    screen_blanked: bool,
    connector_present: bool,
}

impl Default for HwcPowerMode {
    fn default() -> Self {
        HwcPowerMode::new()
    }
}

impl HwcPowerMode {
    /// Starts in [`PowerState::Boot`] with a blanked screen and no sink
    pub fn new() -> HwcPowerMode {
        HwcPowerMode {
            state: PowerState::Boot,
            screen_blanked: true,
            connector_present: false,
        }
    }

    /// Records whether the screen is blanked
    ///
    /// Un-blanking leaves [`PowerState::Boot`].
    pub fn set_screen_status(&mut self, blanked: bool) {
        self.screen_blanked = blanked;
        if self.state == PowerState::Boot && !blanked {
            self.transition(self.connector_state());
        }
    }

    /// Records whether a sink is attached
    pub fn set_connector_status(&mut self, present: bool) {
        self.connector_present = present;
        if self.state != PowerState::Boot {
            self.transition(self.connector_state());
        }
    }

    /// Returns whether nothing may be shown, given whether any layer is queued
    pub fn need_blank_screen(&self, layer_present: bool) -> bool {
        match self.state {
            PowerState::Boot => !(self.connector_present && layer_present),
            PowerState::ConnectorIn => false,
            PowerState::ConnectorOut => true,
        }
    }

    /// Current state
    pub fn state(&self) -> PowerState {
        self.state
    }

    /// Last screen status
    pub fn is_screen_blanked(&self) -> bool {
        self.screen_blanked
    }

    /// Last connector status
    pub fn is_connector_present(&self) -> bool {
        self.connector_present
    }

    fn connector_state(&self) -> PowerState {
        if self.connector_present {
            PowerState::ConnectorIn
        } else {
            PowerState::ConnectorOut
        }
    }

    fn transition(&mut self, state: PowerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Power state changed");
            self.state = state;
        }
    }
}
