//! Display hardware resources
//!
//! The hardware is reached through a [`DisplayDevice`], the boundary to the kernel driver.
//! On top of it this module provides typed handles for the three kinds of resources a display
//! is built from:
//!
//! - [`HwDisplayCrtc`](crtc::HwDisplayCrtc), the timing engine driving one scanout pipeline
//! - [`HwDisplayConnector`](connector::HwDisplayConnector), the output the pipeline is routed to
//! - [`HwDisplayPlane`](plane::HwDisplayPlane), an overlay scanning out one framebuffer
//!
//! All of them are discovered and owned by the [`HwDisplayManager`](manager::HwDisplayManager).
//!
//! ## Implementing a device
//!
//! A device only has to enumerate its resources and forward commits. Enumeration failures are
//! reported as errors, the manager then keeps empty collections and the display stays unusable
//! until the next successful load.

use std::{fmt, io, time::Duration};

use drm_fourcc::DrmFourcc as Fourcc;

use crate::{
    sync::DrmFence,
    utils::{Buffer, Monotonic, Physical, Raw, Rectangle, Size, Time, Transform},
};

pub mod connector;
pub mod crtc;
pub mod manager;
pub mod plane;

pub use self::connector::{CvbsConnector, HdmiConnector, HwDisplayConnector, PanelConnector};
pub use self::crtc::HwDisplayCrtc;
pub use self::manager::HwDisplayManager;
pub use self::plane::{CursorPlane, HwDisplayPlane, OsdPlane, VideoPlane};

/// Kind of physical output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorType {
    /// HDMI transmitter
    Hdmi,
    /// Composite video output
    Cvbs,
    /// Built-in panel
    Panel,
}

/// Kind of hardware plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Graphics overlay
    Osd,
    /// Cursor overlay
    Cursor,
    /// Legacy video path, also carrying sideband streams
    Video,
    /// Video overlay fed with framebuffers
    HwcVideo,
}

bitflags::bitflags! {
    /// Capabilities of a hardware plane
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PlaneCapabilities: u32 {
        /// The driver waits for the acquire fence itself
        const IN_FENCE = 1 << 0;
        /// Source and destination size may differ
        const SCALE = 1 << 1;
        /// 90 and 270 degree rotations
        const ROTATE = 1 << 2;
        /// Per plane alpha
        const ALPHA = 1 << 3;
        /// Protected content
        const SECURE = 1 << 4;
        /// Arm framebuffer compression
        const AFBC = 1 << 5;
    }
}

/// Whether a plane commit shows or hides the plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlankOp {
    /// Show the committed framebuffer
    Unblank,
    /// Hide the plane
    Blank,
}

/// A display timing the connector supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMode {
    /// Name as used by the system control, e.g. `1080p60hz`
    pub name: String,
    /// Active area in pixels
    pub size: Size<i32, Physical>,
    /// Refresh rate in millihertz
    pub refresh: u32,
    /// Whether the sink prefers this mode
    pub preferred: bool,
    /// Horizontal and vertical dots per inch, zero if unknown
    pub dpi: (u32, u32),
}

impl DisplayMode {
    /// A mode that is neither preferred nor carries dpi information
    pub fn new(name: impl Into<String>, size: impl Into<Size<i32, Physical>>, refresh: u32) -> Self {
        DisplayMode {
            name: name.into(),
            size: size.into(),
            refresh,
            preferred: false,
            dpi: (0, 0),
        }
    }

    /// Marks the mode as preferred
    pub fn preferred(mut self) -> Self {
        self.preferred = true;
        self
    }

    /// Time between two vblanks, `None` for a zero refresh rate
    pub fn vsync_period(&self) -> Option<Duration> {
        if self.refresh == 0 {
            return None;
        }
        Some(Duration::from_nanos(1_000_000_000_000 / self.refresh as u64))
    }
}

/// HDR formats a sink accepts
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct HdrCapabilities {
    /// HDR10 (SMPTE ST 2084)
    pub hdr10: bool,
    /// Hybrid log gamma
    pub hlg: bool,
    /// Dolby vision
    pub dolby_vision: bool,
    /// Peak luminance in nits, zero if unknown
    pub max_luminance: u32,
}

/// A crtc as enumerated by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcInfo {
    /// Object id
    pub id: u32,
    /// Index of the pipeline, used by the possible-crtcs masks
    pub pipe: u32,
}

/// A connector as enumerated by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Object id
    pub id: u32,
    /// Kind of output
    pub connector_type: ConnectorType,
    /// Mask of crtc pipes the connector can be routed to
    pub possible_crtcs: u32,
}

/// A plane as enumerated by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Object id
    pub id: u32,
    /// Kind of plane
    pub plane_type: PlaneType,
    /// Capabilities
    pub capabilities: PlaneCapabilities,
    /// Mask of crtc pipes the plane can be routed to
    pub possible_crtcs: u32,
    /// Position the plane is hard-wired to, `None` if the plane can be stacked freely
    pub fixed_zorder: Option<u32>,
    /// Pixel formats the plane scans out
    pub formats: Vec<Fourcc>,
    /// Largest framebuffer the plane accepts
    pub max_size: Size<i32, Buffer>,
}

/// Connection state of a connector as reported by the device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectorState {
    /// Whether a sink is attached
    pub connected: bool,
    /// Modes the sink supports
    pub modes: Vec<DisplayMode>,
    /// Physical size in millimeters
    pub physical_size: Size<i32, Raw>,
    /// HDR capabilities of the sink
    pub hdr: HdrCapabilities,
}

/// Everything the device needs to scan out one framebuffer
#[derive(Debug)]
pub struct PlaneCommit {
    /// Buffer to scan out
    pub buffer: u64,
    /// Pixel format of the buffer
    pub format: Fourcc,
    /// Region of the buffer to show
    pub src: Rectangle<f64, Buffer>,
    /// Placement on the crtc
    pub dst: Rectangle<i32, Physical>,
    /// Stacking position
    pub zorder: u32,
    /// Plane alpha
    pub alpha: f32,
    /// Transform applied while scanning out
    pub transform: Transform,
    /// Fence the driver waits on before scanning out
    pub in_fence: DrmFence,
}

/// Boundary to the display driver
///
/// Object ids are stable for the lifetime of the device.
pub trait DisplayDevice: fmt::Debug + Send + Sync {
    /// Enumerates the crtcs
    fn crtcs(&self) -> io::Result<Vec<CrtcInfo>>;
    /// Enumerates the connectors
    fn connectors(&self) -> io::Result<Vec<ConnectorInfo>>;
    /// Enumerates the planes
    fn planes(&self) -> io::Result<Vec<PlaneInfo>>;
    /// Reads the current state of a connector
    fn connector_state(&self, connector: u32) -> io::Result<ConnectorState>;
    /// Shows a framebuffer on the plane, or hides the plane for `None`
    ///
    /// Returns the release fence of the committed buffer, signaled once the hardware stopped
    /// reading from it.
    fn commit_plane(&self, plane: u32, commit: Option<PlaneCommit>) -> io::Result<DrmFence>;
    /// Programs the timing of a crtc
    fn set_crtc_mode(&self, crtc: u32, mode: &DisplayMode) -> io::Result<()>;
    /// Blocks until the next vblank of the crtc
    ///
    /// Returns `None` if no vblank arrived within `timeout`.
    fn wait_vblank(&self, crtc: u32, timeout: Duration) -> io::Result<Option<Time<Monotonic>>>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::DisplayMode;

    #[test]
    fn vsync_period_from_refresh() {
        let mode = DisplayMode::new("1080p60hz", (1920, 1080), 60_000);
        assert_eq!(mode.vsync_period(), Some(Duration::from_nanos(16_666_666)));
        assert_eq!(DisplayMode::new("broken", (0, 0), 0).vsync_period(), None);
    }
}
