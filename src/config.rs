//! Runtime configuration
//!
//! A [`Config`] is passed to every [`HwcDisplay`](crate::display::HwcDisplay). The defaults fit
//! a 60Hz display with hardware vsync; [`Config::from_env`] allows overriding them for
//! bring-up and debugging:
//!
//! - `HWC_FORCE_SOFTWARE_VSYNC` - synthesize vsync in software even if the crtc delivers vblanks
//! - `HWC_DISABLE_GE2D` - never use the GE2D composer
//! - `HWC_FENCE_TIMEOUT_MS` - bound for acquire fence waits on the present path
//! - `HWC_VSYNC_PERIOD_US` - vsync period used until a display mode is known

use std::time::Duration;

use tracing::{info, warn};

/// Vsync period of a 60Hz display
pub const DEFAULT_VSYNC_PERIOD: Duration = Duration::from_nanos(16_666_667);

/// Configuration of the composition core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Use the software vsync thread even if hardware vblanks are available
    pub software_vsync: bool,
    /// Never create the GE2D composer
    pub disable_ge2d: bool,
    /// Upper bound for acquire fence waits on the present path
    pub fence_timeout: Duration,
    /// Vsync period used until a display mode is active
    pub default_vsync_period: Duration,
    /// Maximum number of framebuffers the GE2D composer blends in one pass
    pub ge2d_max_inputs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            software_vsync: false,
            disable_ge2d: false,
            fence_timeout: Duration::from_millis(100),
            default_vsync_period: DEFAULT_VSYNC_PERIOD,
            ge2d_max_inputs: 3,
        }
    }
}

impl Config {
    /// Default configuration with overrides taken from the process environment
    pub fn from_env() -> Config {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Default configuration with overrides taken from `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Config {
        let mut config = Config::default();

        if lookup("HWC_FORCE_SOFTWARE_VSYNC").map_or(false, |x| is_truthy(&x)) {
            info!("HWC_FORCE_SOFTWARE_VSYNC is set. Forcing software vsync.");
            config.software_vsync = true;
        }

        if lookup("HWC_DISABLE_GE2D").map_or(false, |x| is_truthy(&x)) {
            info!("HWC_DISABLE_GE2D is set. GE2D composition disabled.");
            config.disable_ge2d = true;
        }

        if let Some(value) = lookup("HWC_FENCE_TIMEOUT_MS") {
            match value.trim().parse::<u64>() {
                Ok(ms) => config.fence_timeout = Duration::from_millis(ms),
                Err(err) => warn!(value, "Ignoring invalid HWC_FENCE_TIMEOUT_MS: {}", err),
            }
        }

        if let Some(value) = lookup("HWC_VSYNC_PERIOD_US") {
            match value.trim().parse::<u64>() {
                Ok(us) if us > 0 => config.default_vsync_period = Duration::from_micros(us),
                Ok(_) => warn!("Ignoring zero HWC_VSYNC_PERIOD_US"),
                Err(err) => warn!(value, "Ignoring invalid HWC_VSYNC_PERIOD_US: {}", err),
            }
        }

        config
    }
}

fn is_truthy(x: &str) -> bool {
    let x = x.to_lowercase();
    x == "1" || x == "true" || x == "yes" || x == "y"
}
