use std::io;

use crate::{composer::ComposerType, display::LayerId, hw::ConnectorType};

/// Errors returned by the display resources, composers and displays
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Hardware resources have not been (successfully) loaded yet
    #[error("Display resources have not been loaded")]
    NotLoaded,
    /// No connector of the requested type was discovered
    #[error("No connector of type `{0:?}` found")]
    ConnectorNotFound(ConnectorType),
    /// The connector is already driven by a display
    #[error("Connector `{0}` is already in use")]
    ConnectorBusy(u32),
    /// Every crtc the connector could be routed to is already in use
    #[error("No free crtc available for connector `{0}`")]
    NoFreeCrtc(u32),
    /// The framebuffer can not be scanned out by the plane
    #[error("Framebuffer is not supported by plane `{plane}`")]
    UnsupportedFramebuffer {
        /// Plane the framebuffer was committed to
        plane: u32,
    },
    /// The requested composer has no backing implementation on this device
    #[error("Composer `{0:?}` is not available on this device")]
    ComposerUnavailable(ComposerType),
    /// The connector offers no mode of that name, or no mode at all
    #[error("Mode `{0}` is not offered by the connector")]
    UnknownMode(String),
    /// A composer was started without an output framebuffer
    #[error("Composer `{0:?}` has no output framebuffer")]
    NoOutput(ComposerType),
    /// A fence did not signal within the given timeout
    #[error("Timed out waiting for fence")]
    FenceTimeout,
    /// The layer id is unknown to the display
    #[error("Unknown layer `{0:?}`")]
    InvalidLayer(LayerId),
    /// Every layer slot of the display is taken
    #[error("Out of layer ids")]
    OutOfLayers,
    /// The device or driver rejected an operation
    #[error("Display access error: {errmsg} ({source})")]
    Access {
        /// Error message associated to the access error
        errmsg: &'static str,
        /// Underlying device error
        source: io::Error,
    },
}

/// Result type used throughout this crate
pub type Result<T, E = Error> = std::result::Result<T, E>;
