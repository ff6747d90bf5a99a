//! Framebuffer descriptors
//!
//! A [`DrmFramebuffer`] describes one drawable surface handed to the display for a frame: the
//! buffer it points to, where it is placed and how it is blended. Its attributes are fixed at
//! construction. The [`Composition`] tag and the fences change every frame and are kept behind
//! an internal lock, so a framebuffer can be shared between the display, its planes and the
//! composers through an `Arc`.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

use crate::{
    sync::{DrmFence, FenceStatus},
    utils::{Buffer, Physical, Point, Rectangle, Size, Transform},
};

/// Who renders a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Composition {
    /// Not classified yet
    #[default]
    Undetermined,
    /// Rendered by the client into the client target
    Client,
    /// Blended by the 2D blitter
    Ge2d,
    /// Dropped
    Dummy,
    /// Scanned out by the cursor plane
    PlaneCursor,
    /// Scanned out by an osd plane
    PlaneOsd,
    /// Scanned out by the legacy video plane
    PlaneAmvideo,
    /// Scanned out by the video plane through a sideband stream
    PlaneSideband,
    /// Scanned out by an hwc video plane
    PlaneHwcVideo,
}

impl Composition {
    /// Every composition tag
    pub const ALL: [Composition; 9] = [
        Composition::Undetermined,
        Composition::Client,
        Composition::Ge2d,
        Composition::Dummy,
        Composition::PlaneCursor,
        Composition::PlaneOsd,
        Composition::PlaneAmvideo,
        Composition::PlaneSideband,
        Composition::PlaneHwcVideo,
    ];

    /// Returns whether the framebuffer is scanned out by a video plane
    pub fn is_video_plane_composition(self) -> bool {
        matches!(
            self,
            Composition::PlaneAmvideo | Composition::PlaneSideband | Composition::PlaneHwcVideo
        )
    }

    /// Returns whether the framebuffer goes through a composer
    pub fn is_composer_composition(self) -> bool {
        matches!(
            self,
            Composition::Client | Composition::Ge2d | Composition::Dummy
        )
    }
}

bitflags::bitflags! {
    /// Usage flags of a buffer, as set by its producer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Video frame for the legacy video path
        const VIDEO_OVERLAY = 1 << 0;
        /// Handle to a sideband stream, the buffer carries no pixels
        const SIDEBAND = 1 << 1;
        /// Video frame for an hwc video plane
        const HWC_VIDEO = 1 << 2;
        /// Cursor image
        const CURSOR = 1 << 3;
        /// Content protected buffer
        const PROTECTED = 1 << 4;
        /// Rendered by the gpu
        const GPU_RENDER = 1 << 5;
    }
}

/// Externally owned buffer a framebuffer points to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    /// Identifier of the buffer with its producer
    pub id: u64,
    /// Pixel format
    pub format: Fourcc,
    /// Format modifier
    pub modifier: Modifier,
    /// Size in pixels
    pub size: Size<i32, Buffer>,
    /// Stride in bytes
    pub stride: u32,
    /// Usage flags
    pub usage: BufferUsage,
}

impl BufferHandle {
    /// Linear buffer of the given format and size
    pub fn new(id: u64, format: Fourcc, size: impl Into<Size<i32, Buffer>>) -> BufferHandle {
        let size = size.into();
        BufferHandle {
            id,
            format,
            modifier: Modifier::Linear,
            stride: size.w.max(0) as u32 * 4,
            size,
            usage: BufferUsage::empty(),
        }
    }

    /// Sets the usage flags
    pub fn with_usage(mut self, usage: BufferUsage) -> BufferHandle {
        self.usage = usage;
        self
    }
}

/// How a framebuffer is blended with the content below
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    /// No blending, the framebuffer is opaque
    None,
    /// Color values are premultiplied by alpha
    #[default]
    Premultiplied,
    /// Color values are not premultiplied
    Coverage,
}

/// Color space of the framebuffer content
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dataspace {
    #[default]
    Unknown,
    Srgb,
    Bt601,
    Bt709,
    Bt2020,
    Bt2020Pq,
    Bt2020Hlg,
}

impl Dataspace {
    /// Returns whether the content is high dynamic range
    pub fn is_hdr(self) -> bool {
        matches!(self, Dataspace::Bt2020Pq | Dataspace::Bt2020Hlg)
    }
}

/// Keys of the static HDR metadata attached to a framebuffer
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HdrMetadataKey {
    DisplayRedPrimaryX,
    DisplayRedPrimaryY,
    DisplayGreenPrimaryX,
    DisplayGreenPrimaryY,
    DisplayBluePrimaryX,
    DisplayBluePrimaryY,
    WhitePointX,
    WhitePointY,
    MaxLuminance,
    MinLuminance,
    MaxContentLightLevel,
    MaxFrameAverageLightLevel,
}

#[derive(Debug, Default)]
struct FramebufferState {
    composition: Composition,
    acquire_fence: DrmFence,
    release_fence: DrmFence,
}

static NEXT_FRAMEBUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// One drawable surface of a frame
#[derive(Debug)]
pub struct DrmFramebuffer {
    id: u64,
    handle: Option<BufferHandle>,
    source_crop: Rectangle<f64, Buffer>,
    display_frame: Rectangle<i32, Physical>,
    blend_mode: BlendMode,
    plane_alpha: f32,
    transform: Transform,
    zorder: u32,
    dataspace: Dataspace,
    secure: bool,
    hdr_metadata: HashMap<HdrMetadataKey, f32>,
    state: Mutex<FramebufferState>,
}

impl DrmFramebuffer {
    /// Creates a framebuffer showing the whole buffer at the origin
    ///
    /// A framebuffer without handle carries no pixels, like the output of a composer that has
    /// not allocated its target yet.
    pub fn new(handle: Option<BufferHandle>) -> DrmFramebuffer {
        let size = handle.as_ref().map(|h| h.size).unwrap_or_default();
        DrmFramebuffer {
            id: NEXT_FRAMEBUFFER_ID.fetch_add(1, Ordering::Relaxed),
            source_crop: Rectangle::from_size(size).to_f64(),
            display_frame: Rectangle::from_size((size.w, size.h).into()),
            handle,
            blend_mode: BlendMode::default(),
            plane_alpha: 1.0,
            transform: Transform::Normal,
            zorder: 0,
            dataspace: Dataspace::default(),
            secure: false,
            hdr_metadata: HashMap::new(),
            state: Mutex::new(FramebufferState::default()),
        }
    }

    /// Sets the region of the buffer that is shown
    pub fn with_source_crop(mut self, crop: Rectangle<f64, Buffer>) -> Self {
        self.source_crop = crop;
        self
    }

    /// Sets where the framebuffer is placed on the display
    pub fn with_display_frame(mut self, frame: Rectangle<i32, Physical>) -> Self {
        self.display_frame = frame;
        self
    }

    /// Moves the display frame to `loc`, keeping its size
    pub fn with_position(mut self, loc: impl Into<Point<i32, Physical>>) -> Self {
        self.display_frame.loc = loc.into();
        self
    }

    /// Sets the blend mode
    pub fn with_blend_mode(mut self, blend_mode: BlendMode) -> Self {
        self.blend_mode = blend_mode;
        self
    }

    /// Sets the plane alpha, clamped to `0.0..=1.0`
    pub fn with_plane_alpha(mut self, alpha: f32) -> Self {
        self.plane_alpha = alpha.clamp(0.0, 1.0);
        self
    }

    /// Sets the transform applied when scanning out
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Sets the stacking position, higher is closer to the viewer
    pub fn with_zorder(mut self, zorder: u32) -> Self {
        self.zorder = zorder;
        self
    }

    /// Sets the dataspace of the content
    pub fn with_dataspace(mut self, dataspace: Dataspace) -> Self {
        self.dataspace = dataspace;
        self
    }

    /// Marks the framebuffer as secure
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Attaches one HDR metadata value
    pub fn with_hdr_metadata(mut self, key: HdrMetadataKey, value: f32) -> Self {
        self.hdr_metadata.insert(key, value);
        self
    }

    /// Sets the initial acquire fence
    pub fn with_acquire_fence(self, fence: DrmFence) -> Self {
        self.set_acquire_fence(fence);
        self
    }

    /// Process-unique identifier of this framebuffer
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Buffer the framebuffer points to
    pub fn handle(&self) -> Option<&BufferHandle> {
        self.handle.as_ref()
    }

    /// Pixel format, if the framebuffer points to a buffer
    pub fn format(&self) -> Option<Fourcc> {
        self.handle.as_ref().map(|h| h.format)
    }

    /// Usage flags of the buffer
    pub fn usage(&self) -> BufferUsage {
        self.handle
            .as_ref()
            .map(|h| h.usage)
            .unwrap_or(BufferUsage::empty())
    }

    /// Region of the buffer that is shown
    pub fn source_crop(&self) -> Rectangle<f64, Buffer> {
        self.source_crop
    }

    /// Placement on the display
    pub fn display_frame(&self) -> Rectangle<i32, Physical> {
        self.display_frame
    }

    /// Returns whether showing the source crop at the display frame needs scaling
    ///
    /// The crop is compared after the transform was applied.
    pub fn is_scaled(&self) -> bool {
        let src = self.transform.transform_size(self.source_crop.size);
        let dst = self.display_frame.size.to_f64();
        (src.w, src.h) != (dst.w, dst.h)
    }

    /// Blend mode
    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    /// Plane alpha
    pub fn plane_alpha(&self) -> f32 {
        self.plane_alpha
    }

    /// Transform applied when scanning out
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Stacking position
    pub fn zorder(&self) -> u32 {
        self.zorder
    }

    /// Dataspace of the content
    pub fn dataspace(&self) -> Dataspace {
        self.dataspace
    }

    /// Returns whether the content is protected
    pub fn is_secure(&self) -> bool {
        self.secure || self.usage().contains(BufferUsage::PROTECTED)
    }

    /// Static HDR metadata
    pub fn hdr_metadata(&self) -> &HashMap<HdrMetadataKey, f32> {
        &self.hdr_metadata
    }

    /// Returns whether the framebuffer hides everything below its display frame
    pub fn is_opaque(&self) -> bool {
        if self.plane_alpha < 1.0 {
            return false;
        }
        self.blend_mode == BlendMode::None || !self.format().map_or(true, has_alpha)
    }

    /// Composition a video framebuffer needs, derived from its usage
    ///
    /// Returns `None` for non-video content.
    pub fn video_composition(&self) -> Option<Composition> {
        let usage = self.usage();
        if usage.contains(BufferUsage::SIDEBAND) {
            Some(Composition::PlaneSideband)
        } else if usage.contains(BufferUsage::HWC_VIDEO) {
            Some(Composition::PlaneHwcVideo)
        } else if usage.contains(BufferUsage::VIDEO_OVERLAY) {
            Some(Composition::PlaneAmvideo)
        } else {
            None
        }
    }

    /// Returns whether the buffer is a cursor image
    pub fn is_cursor(&self) -> bool {
        self.usage().contains(BufferUsage::CURSOR)
    }

    /// Current composition tag
    pub fn composition(&self) -> Composition {
        self.state.lock().unwrap().composition
    }

    /// Replaces the composition tag
    pub fn set_composition(&self, composition: Composition) {
        self.state.lock().unwrap().composition = composition;
    }

    /// Replaces the acquire fence
    pub fn set_acquire_fence(&self, fence: DrmFence) {
        self.state.lock().unwrap().acquire_fence = fence;
    }

    /// Takes the acquire fence, leaving the invalid fence behind
    ///
    /// The caller is now responsible for waiting on or merging the fence before reading the
    /// pixel data.
    pub fn take_acquire_fence(&self) -> DrmFence {
        std::mem::take(&mut self.state.lock().unwrap().acquire_fence)
    }

    /// Waits up to `timeout` for the acquire fence
    ///
    /// A signaled fence is consumed, a pending one is kept for the next attempt.
    pub fn wait_acquire_fence(&self, timeout: Duration) -> io::Result<FenceStatus> {
        let fence = self.take_acquire_fence();
        let status = fence.wait(timeout);
        if !matches!(status, Ok(FenceStatus::Signaled)) {
            let mut state = self.state.lock().unwrap();
            if !state.acquire_fence.is_valid() {
                state.acquire_fence = fence;
            }
        }
        status
    }

    /// Replaces the release fence
    pub fn set_release_fence(&self, fence: DrmFence) {
        self.state.lock().unwrap().release_fence = fence;
    }

    /// Takes the release fence, leaving the invalid fence behind
    pub fn take_release_fence(&self) -> DrmFence {
        std::mem::take(&mut self.state.lock().unwrap().release_fence)
    }
}

fn has_alpha(format: Fourcc) -> bool {
    matches!(
        format,
        Fourcc::Argb8888
            | Fourcc::Abgr8888
            | Fourcc::Rgba8888
            | Fourcc::Bgra8888
            | Fourcc::Argb2101010
            | Fourcc::Abgr2101010
            | Fourcc::Argb4444
            | Fourcc::Argb1555
            | Fourcc::Abgr16161616f
    )
}
