//! In-memory display hardware
//!
//! [`VirtualDevice`] implements [`DisplayDevice`] without any kernel driver. Commits are
//! recorded, release fences are eventfds signaled by the next commit on the same plane and
//! vblanks are paced by the monotonic clock. [`VirtualBlitter`] does the same for the GE2D
//! [`Blitter`].
//!
//! Both are meant for headless operation, bring-up and tests. Failures can be injected to
//! exercise the error paths of the display.

use std::{
    collections::{HashMap, HashSet},
    io,
    os::unix::io::OwnedFd,
    sync::Mutex,
    thread,
    time::Duration,
};

use drm_fourcc::DrmFourcc as Fourcc;
use rustix::event::{eventfd, EventfdFlags};
use tracing::trace;

use crate::{
    composer::Blitter,
    framebuffer::{BufferHandle, DrmFramebuffer},
    hw::{
        ConnectorInfo, ConnectorState, ConnectorType, CrtcInfo, DisplayDevice, DisplayMode, HdrCapabilities,
        PlaneCapabilities, PlaneCommit, PlaneInfo, PlaneType,
    },
    sync::DrmFence,
    utils::{Clock, Monotonic, Physical, Rectangle, Size, Time, Transform},
};

const FALLBACK_PERIOD: Duration = Duration::from_nanos(16_666_667);

/// One recorded plane commit
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    /// Plane committed to
    pub plane: u32,
    /// Buffer shown, `None` for a blank
    pub buffer: Option<u64>,
    /// Stacking position
    pub zorder: u32,
    /// Whether an acquire fence was handed to the driver
    pub in_fence: bool,
    /// Placement on the crtc
    pub dst: Option<Rectangle<i32, Physical>>,
    /// Transform applied while scanning out
    pub transform: Transform,
}

#[derive(Debug, Default)]
struct Inner {
    crtcs: Vec<CrtcInfo>,
    connectors: Vec<(ConnectorInfo, ConnectorState)>,
    planes: Vec<PlaneInfo>,
    crtc_modes: HashMap<u32, DisplayMode>,
    // plane id -> eventfd signaled by the next commit
    pending_release: HashMap<u32, OwnedFd>,
    commits: Vec<CommitRecord>,
    failing_planes: HashSet<u32>,
    fail_enumeration: bool,
    vblank_disabled: bool,
}

/// Display hardware simulated in memory
#[derive(Debug, Default)]
pub struct VirtualDevice {
    inner: Mutex<Inner>,
}

impl VirtualDevice {
    /// A device without any resource
    pub fn new() -> VirtualDevice {
        VirtualDevice::default()
    }

    /// A typical set-top box layout
    ///
    /// - crtc `1` on pipe 0
    /// - a connected HDMI connector `10` offering `1080p60hz` (preferred), `720p60hz` and `2160p60hz`
    /// - two free osd planes `30` and `31` taking fences, scaling and alpha
    /// - a cursor plane `32` fixed on top
    /// - a legacy video plane `33` fixed at the bottom
    pub fn default_layout() -> VirtualDevice {
        let osd = |id| PlaneInfo {
            id,
            plane_type: PlaneType::Osd,
            capabilities: PlaneCapabilities::IN_FENCE | PlaneCapabilities::SCALE | PlaneCapabilities::ALPHA,
            possible_crtcs: 0b1,
            fixed_zorder: None,
            formats: vec![
                Fourcc::Argb8888,
                Fourcc::Xrgb8888,
                Fourcc::Abgr8888,
                Fourcc::Xbgr8888,
                Fourcc::Rgb565,
            ],
            max_size: (4096, 2160).into(),
        };

        VirtualDevice::new()
            .with_crtc(1, 0)
            .with_connector(
                ConnectorInfo {
                    id: 10,
                    connector_type: ConnectorType::Hdmi,
                    possible_crtcs: 0b1,
                },
                ConnectorState {
                    connected: true,
                    modes: vec![
                        DisplayMode::new("1080p60hz", (1920, 1080), 60_000).preferred(),
                        DisplayMode::new("720p60hz", (1280, 720), 60_000),
                        DisplayMode::new("2160p60hz", (3840, 2160), 60_000),
                    ],
                    physical_size: (600, 340).into(),
                    hdr: HdrCapabilities {
                        hdr10: true,
                        hlg: true,
                        dolby_vision: false,
                        max_luminance: 1000,
                    },
                },
            )
            .with_plane(osd(30))
            .with_plane(osd(31))
            .with_plane(PlaneInfo {
                id: 32,
                plane_type: PlaneType::Cursor,
                capabilities: PlaneCapabilities::empty(),
                possible_crtcs: 0b1,
                fixed_zorder: Some(64),
                formats: vec![Fourcc::Argb8888],
                max_size: (256, 256).into(),
            })
            .with_plane(PlaneInfo {
                id: 33,
                plane_type: PlaneType::Video,
                capabilities: PlaneCapabilities::SCALE,
                possible_crtcs: 0b1,
                fixed_zorder: Some(0),
                formats: vec![Fourcc::Nv12, Fourcc::Nv21],
                max_size: (4096, 2160).into(),
            })
    }

    /// Adds a crtc
    pub fn with_crtc(self, id: u32, pipe: u32) -> Self {
        self.inner.lock().unwrap().crtcs.push(CrtcInfo { id, pipe });
        self
    }

    /// Adds a connector in the given state
    pub fn with_connector(self, info: ConnectorInfo, state: ConnectorState) -> Self {
        self.add_connector(info, state);
        self
    }

    /// Adds a plane
    pub fn with_plane(self, info: PlaneInfo) -> Self {
        self.inner.lock().unwrap().planes.push(info);
        self
    }

    /// Adds a connector to a running device, like a hot-pluggable output
    pub fn add_connector(&self, info: ConnectorInfo, state: ConnectorState) {
        self.inner.lock().unwrap().connectors.push((info, state));
    }

    /// Enumeration info of a connector
    pub fn connector_info(&self, id: u32) -> Option<ConnectorInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .connectors
            .iter()
            .find(|(info, _)| info.id == id)
            .map(|(info, _)| *info)
    }

    /// Plugs or unplugs the sink of a connector
    pub fn set_connected(&self, connector: u32, connected: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, state)) = inner.connectors.iter_mut().find(|(info, _)| info.id == connector) {
            state.connected = connected;
        }
    }

    /// Makes every enumeration fail
    pub fn fail_enumeration(&self, fail: bool) {
        self.inner.lock().unwrap().fail_enumeration = fail;
    }

    /// Makes every commit to `plane` fail
    pub fn fail_commits(&self, plane: u32, fail: bool) {
        let mut inner = self.inner.lock().unwrap();
        if fail {
            inner.failing_planes.insert(plane);
        } else {
            inner.failing_planes.remove(&plane);
        }
    }

    /// Stops or resumes vblank delivery
    pub fn set_vblank_enabled(&self, enabled: bool) {
        self.inner.lock().unwrap().vblank_disabled = !enabled;
    }

    /// Drains the recorded commits
    pub fn take_commits(&self) -> Vec<CommitRecord> {
        std::mem::take(&mut self.inner.lock().unwrap().commits)
    }

    /// Mode last programmed on a crtc
    pub fn crtc_mode(&self, crtc: u32) -> Option<DisplayMode> {
        self.inner.lock().unwrap().crtc_modes.get(&crtc).cloned()
    }

    fn check_enumeration(inner: &Inner) -> io::Result<()> {
        if inner.fail_enumeration {
            return Err(io::Error::new(io::ErrorKind::Other, "enumeration failed"));
        }
        Ok(())
    }
}

impl DisplayDevice for VirtualDevice {
    fn crtcs(&self) -> io::Result<Vec<CrtcInfo>> {
        let inner = self.inner.lock().unwrap();
        Self::check_enumeration(&inner)?;
        Ok(inner.crtcs.clone())
    }

    fn connectors(&self) -> io::Result<Vec<ConnectorInfo>> {
        let inner = self.inner.lock().unwrap();
        Self::check_enumeration(&inner)?;
        Ok(inner.connectors.iter().map(|(info, _)| *info).collect())
    }

    fn planes(&self) -> io::Result<Vec<PlaneInfo>> {
        let inner = self.inner.lock().unwrap();
        Self::check_enumeration(&inner)?;
        Ok(inner.planes.clone())
    }

    fn connector_state(&self, connector: u32) -> io::Result<ConnectorState> {
        let inner = self.inner.lock().unwrap();
        inner
            .connectors
            .iter()
            .find(|(info, _)| info.id == connector)
            .map(|(_, state)| state.clone())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn commit_plane(&self, plane: u32, commit: Option<PlaneCommit>) -> io::Result<DrmFence> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_planes.contains(&plane) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        if let Some(previous) = inner.pending_release.remove(&plane) {
            rustix::io::write(&previous, &1u64.to_ne_bytes())?;
        }

        let record = CommitRecord {
            plane,
            buffer: commit.as_ref().map(|c| c.buffer),
            zorder: commit.as_ref().map_or(0, |c| c.zorder),
            in_fence: commit.as_ref().map_or(false, |c| c.in_fence.is_valid()),
            dst: commit.as_ref().map(|c| c.dst),
            transform: commit.as_ref().map_or(Transform::Normal, |c| c.transform),
        };
        trace!(?record, "Virtual commit");
        inner.commits.push(record);

        if commit.is_none() {
            return Ok(DrmFence::no_fence());
        }
        let release = eventfd(0, EventfdFlags::CLOEXEC)?;
        inner.pending_release.insert(plane, release.try_clone()?);
        Ok(DrmFence::from(release))
    }

    fn set_crtc_mode(&self, crtc: u32, mode: &DisplayMode) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.crtcs.iter().any(|info| info.id == crtc) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        inner.crtc_modes.insert(crtc, mode.clone());
        Ok(())
    }

    fn wait_vblank(&self, crtc: u32, timeout: Duration) -> io::Result<Option<Time<Monotonic>>> {
        let (disabled, period) = {
            let inner = self.inner.lock().unwrap();
            let period = inner
                .crtc_modes
                .get(&crtc)
                .and_then(DisplayMode::vsync_period)
                .unwrap_or(FALLBACK_PERIOD);
            (inner.vblank_disabled, period)
        };
        if disabled {
            thread::sleep(timeout);
            return Ok(None);
        }

        let now = Clock::<Monotonic>::new().now();
        let period_ns = period.as_nanos();
        let next_ns = (now.as_nanos() / period_ns + 1) * period_ns;
        let next = Time::from(Duration::from_nanos(next_ns as u64));
        let wait = now.duration_since(next);
        if wait > timeout {
            thread::sleep(timeout);
            return Ok(None);
        }
        thread::sleep(wait);
        Ok(Some(next))
    }
}

/// 2D blitter working on nothing
///
/// Blends complete as soon as their inputs are ready.
#[derive(Debug)]
pub struct VirtualBlitter {
    formats: Vec<Fourcc>,
    blends: Mutex<Vec<(usize, u64)>>,
    next_buffer: Mutex<u64>,
}

impl Default for VirtualBlitter {
    fn default() -> Self {
        VirtualBlitter::new(vec![
            Fourcc::Argb8888,
            Fourcc::Xrgb8888,
            Fourcc::Abgr8888,
            Fourcc::Xbgr8888,
            Fourcc::Rgb565,
            Fourcc::Nv12,
            Fourcc::Nv21,
        ])
    }
}

impl VirtualBlitter {
    /// A blitter reading the given formats
    pub fn new(formats: Vec<Fourcc>) -> VirtualBlitter {
        VirtualBlitter {
            formats,
            blends: Mutex::new(Vec::new()),
            next_buffer: Mutex::new(0x1000),
        }
    }

    /// Recorded blends as number of inputs and output buffer id
    pub fn blends(&self) -> Vec<(usize, u64)> {
        self.blends.lock().unwrap().clone()
    }
}

impl Blitter for VirtualBlitter {
    fn supports_format(&self, format: Fourcc) -> bool {
        self.formats.contains(&format)
    }

    fn allocate(&self, size: Size<i32, Physical>, format: Fourcc) -> io::Result<BufferHandle> {
        let mut next = self.next_buffer.lock().unwrap();
        *next += 1;
        Ok(BufferHandle::new(*next, format, (size.w, size.h)))
    }

    fn blend(
        &self,
        inputs: &[&DrmFramebuffer],
        output: &BufferHandle,
        _damage: &[Rectangle<i32, Physical>],
        in_fence: DrmFence,
    ) -> io::Result<DrmFence> {
        self.blends.lock().unwrap().push((inputs.len(), output.id));
        // the blit itself is instant, it only waits for its inputs
        let done = eventfd(1, EventfdFlags::CLOEXEC)?;
        Ok(DrmFence::from(done).merge(in_fence))
    }
}
