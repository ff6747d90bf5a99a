//! Plane handles
//!
//! Every plane kind implements [`HwDisplayPlane`]. The kinds differ in which framebuffers they
//! accept, committing and blanking is shared.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use tracing::{debug, trace, warn};

use super::{BlankOp, DisplayDevice, PlaneCapabilities, PlaneCommit, PlaneInfo, PlaneType};
use crate::{
    error::{Error, Result},
    framebuffer::{BufferUsage, Composition, DrmFramebuffer},
    sync::DrmFence,
};

/// One hardware overlay
pub trait HwDisplayPlane: fmt::Debug + Send + Sync {
    /// Object id
    fn id(&self) -> u32;
    /// Kind of plane
    fn plane_type(&self) -> PlaneType;
    /// Capabilities
    fn capabilities(&self) -> PlaneCapabilities;
    /// Mask of crtc pipes the plane can be routed to
    fn possible_crtcs(&self) -> u32;
    /// Position the plane is hard-wired to, `None` if it is stacked by policy
    fn fixed_zorder(&self) -> Option<u32>;
    /// Returns whether the plane can scan out `fb`
    fn is_fb_support(&self, fb: &DrmFramebuffer) -> bool;
    /// Composition tag of a framebuffer shown by this plane
    fn composition(&self, fb: &DrmFramebuffer) -> Composition;
    /// Shows `fb` at `zorder`, or hides the plane
    ///
    /// The previously shown framebuffer is released, the driver's release fence of the new one
    /// is stored on it. Passing no framebuffer always blanks the plane.
    fn set_plane(&self, fb: Option<&Arc<DrmFramebuffer>>, zorder: u32, blank: BlankOp) -> Result<()>;
    /// Framebuffer shown by the last successful commit
    fn current_framebuffer(&self) -> Option<Arc<DrmFramebuffer>>;
    /// Returns whether the plane is hidden
    fn is_blanked(&self) -> bool;
    /// Returns whether the last commit failed
    fn has_failed(&self) -> bool;
    /// Debug flag excluding the plane from assignment
    fn set_idle(&self, idle: bool);
    /// See [`HwDisplayPlane::set_idle`]
    fn is_idle(&self) -> bool;
}

#[derive(Debug)]
struct PlaneState {
    current: Option<Arc<DrmFramebuffer>>,
    blanked: bool,
    failed: bool,
    idle: bool,
}

/// State and commit logic shared by all plane kinds
#[derive(Debug)]
struct PlaneBase {
    device: Arc<dyn DisplayDevice>,
    info: PlaneInfo,
    state: Mutex<PlaneState>,
}

impl PlaneBase {
    fn new(device: Arc<dyn DisplayDevice>, info: PlaneInfo) -> PlaneBase {
        PlaneBase {
            device,
            info,
            state: Mutex::new(PlaneState {
                current: None,
                blanked: true,
                failed: false,
                idle: false,
            }),
        }
    }

    // Format, size and capability checks every kind applies
    fn supports(&self, fb: &DrmFramebuffer, check_format: bool) -> bool {
        let Some(handle) = fb.handle() else {
            return false;
        };
        let caps = self.info.capabilities;

        if check_format && !self.info.formats.contains(&handle.format) {
            return false;
        }
        if !self.info.max_size.fits(handle.size) {
            return false;
        }
        if fb.is_secure() && !caps.contains(PlaneCapabilities::SECURE) {
            return false;
        }
        if fb.transform().swaps_axes() && !caps.contains(PlaneCapabilities::ROTATE) {
            return false;
        }
        if fb.plane_alpha() < 1.0 && !caps.contains(PlaneCapabilities::ALPHA) {
            return false;
        }
        if fb.is_scaled() && !caps.contains(PlaneCapabilities::SCALE) {
            return false;
        }
        true
    }

    fn set_plane(
        &self,
        fb: Option<&Arc<DrmFramebuffer>>,
        zorder: u32,
        blank: BlankOp,
        supported: impl FnOnce(&DrmFramebuffer) -> bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let plane = self.info.id;

        let fb = match (fb, blank) {
            (Some(fb), BlankOp::Unblank) => fb,
            _ => {
                if state.blanked {
                    return Ok(());
                }
                let release = self.device.commit_plane(plane, None);
                return self.finish_commit(&mut state, release, None);
            }
        };

        if !supported(fb) {
            warn!(plane, fb = fb.id(), "Framebuffer not supported by plane");
            return Err(Error::UnsupportedFramebuffer { plane });
        }
        let Some(handle) = fb.handle() else {
            return Err(Error::UnsupportedFramebuffer { plane });
        };

        let in_fence = if self.info.capabilities.contains(PlaneCapabilities::IN_FENCE) {
            fb.take_acquire_fence()
        } else {
            let fence = fb.take_acquire_fence();
            if !fence.is_signaled() {
                fb.set_acquire_fence(fence);
                debug!(plane, fb = fb.id(), "Acquire fence still pending");
                return Err(Error::FenceTimeout);
            }
            DrmFence::no_fence()
        };

        let commit = PlaneCommit {
            buffer: handle.id,
            format: handle.format,
            src: fb.source_crop(),
            dst: fb.display_frame(),
            zorder: self.info.fixed_zorder.unwrap_or(zorder),
            alpha: fb.plane_alpha(),
            transform: fb.transform(),
            in_fence,
        };
        trace!(plane, fb = fb.id(), zorder = commit.zorder, "Committing plane");
        let release = self.device.commit_plane(plane, Some(commit));
        self.finish_commit(&mut state, release, Some(fb))
    }

    fn finish_commit(
        &self,
        state: &mut PlaneState,
        release: std::io::Result<DrmFence>,
        fb: Option<&Arc<DrmFramebuffer>>,
    ) -> Result<()> {
        match release {
            Ok(release) => {
                if let Some(fb) = fb {
                    fb.set_release_fence(release);
                }
                state.current = fb.cloned();
                state.blanked = fb.is_none();
                state.failed = false;
                Ok(())
            }
            Err(source) => {
                warn!(plane = self.info.id, "Plane commit failed: {}", source);
                state.failed = true;
                Err(Error::Access {
                    errmsg: "Error committing plane",
                    source,
                })
            }
        }
    }
}

macro_rules! plane_base_impl {
    () => {
        fn id(&self) -> u32 {
            self.base.info.id
        }

        fn plane_type(&self) -> PlaneType {
            self.base.info.plane_type
        }

        fn capabilities(&self) -> PlaneCapabilities {
            self.base.info.capabilities
        }

        fn possible_crtcs(&self) -> u32 {
            self.base.info.possible_crtcs
        }

        fn fixed_zorder(&self) -> Option<u32> {
            self.base.info.fixed_zorder
        }

        fn set_plane(
            &self,
            fb: Option<&Arc<DrmFramebuffer>>,
            zorder: u32,
            blank: BlankOp,
        ) -> Result<()> {
            self.base
                .set_plane(fb, zorder, blank, |fb| self.is_fb_support(fb))
        }

        fn current_framebuffer(&self) -> Option<Arc<DrmFramebuffer>> {
            self.base.state.lock().unwrap().current.clone()
        }

        fn is_blanked(&self) -> bool {
            self.base.state.lock().unwrap().blanked
        }

        fn has_failed(&self) -> bool {
            self.base.state.lock().unwrap().failed
        }

        fn set_idle(&self, idle: bool) {
            self.base.state.lock().unwrap().idle = idle;
        }

        fn is_idle(&self) -> bool {
            self.base.state.lock().unwrap().idle
        }
    };
}

/// Graphics overlay
#[derive(Debug)]
pub struct OsdPlane {
    base: PlaneBase,
}

impl OsdPlane {
    pub(crate) fn new(device: Arc<dyn DisplayDevice>, info: PlaneInfo) -> OsdPlane {
        OsdPlane {
            base: PlaneBase::new(device, info),
        }
    }
}

impl HwDisplayPlane for OsdPlane {
    plane_base_impl!();

    fn is_fb_support(&self, fb: &DrmFramebuffer) -> bool {
        fb.video_composition().is_none() && self.base.supports(fb, true)
    }

    fn composition(&self, _fb: &DrmFramebuffer) -> Composition {
        Composition::PlaneOsd
    }
}

/// Cursor overlay, never scaled
#[derive(Debug)]
pub struct CursorPlane {
    base: PlaneBase,
}

impl CursorPlane {
    pub(crate) fn new(device: Arc<dyn DisplayDevice>, info: PlaneInfo) -> CursorPlane {
        CursorPlane {
            base: PlaneBase::new(device, info),
        }
    }
}

impl HwDisplayPlane for CursorPlane {
    plane_base_impl!();

    fn is_fb_support(&self, fb: &DrmFramebuffer) -> bool {
        fb.is_cursor() && !fb.is_scaled() && self.base.supports(fb, true)
    }

    fn composition(&self, _fb: &DrmFramebuffer) -> Composition {
        Composition::PlaneCursor
    }
}

/// Video overlay
///
/// A [`PlaneType::Video`] plane takes legacy video frames and sideband streams, whose formats
/// are handled by the video pipeline and not checked here. A [`PlaneType::HwcVideo`] plane
/// takes framebuffers tagged for it.
#[derive(Debug)]
pub struct VideoPlane {
    base: PlaneBase,
}

impl VideoPlane {
    pub(crate) fn new(device: Arc<dyn DisplayDevice>, info: PlaneInfo) -> VideoPlane {
        VideoPlane {
            base: PlaneBase::new(device, info),
        }
    }
}

impl HwDisplayPlane for VideoPlane {
    plane_base_impl!();

    fn is_fb_support(&self, fb: &DrmFramebuffer) -> bool {
        let usage = fb.usage();
        match self.base.info.plane_type {
            PlaneType::HwcVideo => {
                usage.contains(BufferUsage::HWC_VIDEO) && self.base.supports(fb, true)
            }
            _ => {
                usage.intersects(BufferUsage::VIDEO_OVERLAY | BufferUsage::SIDEBAND)
                    && self.base.supports(fb, false)
            }
        }
    }

    fn composition(&self, fb: &DrmFramebuffer) -> Composition {
        match self.base.info.plane_type {
            PlaneType::HwcVideo => Composition::PlaneHwcVideo,
            _ if fb.usage().contains(BufferUsage::SIDEBAND) => Composition::PlaneSideband,
            _ => Composition::PlaneAmvideo,
        }
    }
}

/// Creates the plane handle matching the enumerated plane kind
pub(crate) fn create_plane(device: Arc<dyn DisplayDevice>, info: PlaneInfo) -> Arc<dyn HwDisplayPlane> {
    match info.plane_type {
        PlaneType::Osd => Arc::new(OsdPlane::new(device, info)),
        PlaneType::Cursor => Arc::new(CursorPlane::new(device, info)),
        PlaneType::Video | PlaneType::HwcVideo => Arc::new(VideoPlane::new(device, info)),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use drm_fourcc::DrmFourcc as Fourcc;
    use rustix::event::{eventfd, EventfdFlags};

    use crate::{
        backend::virtual_device::VirtualDevice,
        error::Error,
        framebuffer::{BufferHandle, BufferUsage, Composition, DrmFramebuffer},
        hw::{BlankOp, HwDisplayManager, HwDisplayPlane},
        sync::DrmFence,
        utils::{Rectangle, Transform},
    };

    fn plane(device: &Arc<VirtualDevice>, id: u32) -> Arc<dyn HwDisplayPlane> {
        let manager = HwDisplayManager::new(device.clone());
        manager.load_drm_resources().unwrap();
        manager.planes().unwrap().into_iter().find(|p| p.id() == id).unwrap()
    }

    fn rgba(id: u64) -> Arc<DrmFramebuffer> {
        Arc::new(DrmFramebuffer::new(Some(BufferHandle::new(id, Fourcc::Argb8888, (640, 480)))))
    }

    #[test]
    fn capability_checks() {
        let device = Arc::new(VirtualDevice::default_layout());
        let osd = plane(&device, 30);
        let cursor = plane(&device, 32);
        let video = plane(&device, 33);

        assert!(osd.is_fb_support(&rgba(1)));
        assert!(!osd.is_fb_support(&DrmFramebuffer::new(None)));
        assert!(!osd.is_fb_support(&DrmFramebuffer::new(Some(BufferHandle::new(
            2,
            Fourcc::Nv12,
            (640, 480)
        )))));
        // no rotation support on the osd planes
        let rotated = DrmFramebuffer::new(Some(BufferHandle::new(3, Fourcc::Argb8888, (640, 480))))
            .with_transform(Transform::_90);
        assert!(!osd.is_fb_support(&rotated));
        let secure = DrmFramebuffer::new(Some(BufferHandle::new(4, Fourcc::Argb8888, (640, 480)))).with_secure(true);
        assert!(!osd.is_fb_support(&secure));

        // the cursor plane neither scales nor takes plain buffers
        assert!(!cursor.is_fb_support(&rgba(5)));
        let small = BufferHandle::new(6, Fourcc::Argb8888, (64, 64)).with_usage(BufferUsage::CURSOR);
        assert!(cursor.is_fb_support(&DrmFramebuffer::new(Some(small.clone()))));
        let scaled = DrmFramebuffer::new(Some(small)).with_display_frame(Rectangle::from_size((128, 128).into()));
        assert!(!cursor.is_fb_support(&scaled));

        let amvideo = DrmFramebuffer::new(Some(
            BufferHandle::new(7, Fourcc::Nv12, (1920, 1080)).with_usage(BufferUsage::VIDEO_OVERLAY),
        ));
        assert!(video.is_fb_support(&amvideo));
        assert!(!osd.is_fb_support(&amvideo));
        assert_eq!(video.composition(&amvideo), Composition::PlaneAmvideo);
        assert!(!video.is_fb_support(&rgba(8)));
    }

    #[test]
    fn unsupported_framebuffer_is_rejected() {
        let device = Arc::new(VirtualDevice::default_layout());
        let cursor = plane(&device, 32);
        let result = cursor.set_plane(Some(&rgba(1)), 0, BlankOp::Unblank);
        assert!(matches!(result, Err(Error::UnsupportedFramebuffer { plane: 32 })));
        assert!(device.take_commits().is_empty());
        assert!(cursor.is_blanked());
    }

    #[test]
    fn commit_and_blank() {
        let device = Arc::new(VirtualDevice::default_layout());
        let osd = plane(&device, 30);
        assert!(osd.is_blanked());
        // blanking a blanked plane does not reach the device
        osd.set_plane(None, 0, BlankOp::Blank).unwrap();
        assert!(device.take_commits().is_empty());

        let fb = rgba(1);
        osd.set_plane(Some(&fb), 3, BlankOp::Unblank).unwrap();
        assert!(!osd.is_blanked());
        assert!(Arc::ptr_eq(&osd.current_framebuffer().unwrap(), &fb));
        let release = fb.take_release_fence();
        assert!(release.is_valid());
        assert!(!release.is_signaled());

        osd.set_plane(Some(&fb), 3, BlankOp::Blank).unwrap();
        assert!(osd.is_blanked());
        assert!(osd.current_framebuffer().is_none());
        assert!(release.is_signaled());

        let commits = device.take_commits();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].buffer, Some(1));
        assert_eq!(commits[0].zorder, 3);
        assert_eq!(commits[1].buffer, None);
    }

    #[test]
    fn fixed_zorder_wins() {
        let device = Arc::new(VirtualDevice::default_layout());
        let video = plane(&device, 33);
        let fb = Arc::new(DrmFramebuffer::new(Some(
            BufferHandle::new(1, Fourcc::Nv12, (1920, 1080)).with_usage(BufferUsage::SIDEBAND),
        )));
        video.set_plane(Some(&fb), 12, BlankOp::Unblank).unwrap();
        assert_eq!(device.take_commits()[0].zorder, 0);
        assert_eq!(video.composition(&fb), Composition::PlaneSideband);
    }

    #[test]
    fn acquire_fences() {
        let device = Arc::new(VirtualDevice::default_layout());
        let osd = plane(&device, 30);
        let video = plane(&device, 33);

        // the osd driver waits itself
        let pending = eventfd(0, EventfdFlags::CLOEXEC).unwrap();
        let fb = Arc::new(
            DrmFramebuffer::new(Some(BufferHandle::new(1, Fourcc::Argb8888, (640, 480))))
                .with_acquire_fence(DrmFence::from(pending)),
        );
        osd.set_plane(Some(&fb), 1, BlankOp::Unblank).unwrap();
        assert!(device.take_commits()[0].in_fence);

        // the video plane only takes ready buffers
        let producer = eventfd(0, EventfdFlags::CLOEXEC).unwrap();
        let fb = Arc::new(
            DrmFramebuffer::new(Some(
                BufferHandle::new(2, Fourcc::Nv12, (1920, 1080)).with_usage(BufferUsage::VIDEO_OVERLAY),
            ))
            .with_acquire_fence(DrmFence::from(producer.try_clone().unwrap())),
        );
        assert!(matches!(
            video.set_plane(Some(&fb), 0, BlankOp::Unblank),
            Err(Error::FenceTimeout)
        ));
        assert!(device.take_commits().is_empty());

        rustix::io::write(&producer, &1u64.to_ne_bytes()).unwrap();
        assert!(fb.wait_acquire_fence(Duration::ZERO).is_ok());
        video.set_plane(Some(&fb), 0, BlankOp::Unblank).unwrap();
        assert!(!device.take_commits()[0].in_fence);
    }

    #[test]
    fn failed_commit_is_retried() {
        let device = Arc::new(VirtualDevice::default_layout());
        let osd = plane(&device, 31);
        let fb = rgba(1);

        device.fail_commits(31, true);
        assert!(matches!(
            osd.set_plane(Some(&fb), 1, BlankOp::Unblank),
            Err(Error::Access { .. })
        ));
        assert!(osd.has_failed());
        assert!(osd.is_blanked());

        device.fail_commits(31, false);
        osd.set_plane(Some(&fb), 1, BlankOp::Unblank).unwrap();
        assert!(!osd.has_failed());
        assert!(!osd.is_blanked());
    }
}
