use std::{fmt, io, sync::Arc};

use drm_fourcc::DrmFourcc as Fourcc;
use tracing::{debug, trace, warn};

use super::{release_unread, Composer, ComposerType};
use crate::{
    error::{Error, Result},
    framebuffer::{BlendMode, BufferHandle, Composition, DrmFramebuffer},
    sync::DrmFence,
    utils::{Buffer, Physical, Rectangle, Size},
};

/// Number of output buffers cycled through by the GE2D composer
pub const OUTPUT_RING_SIZE: usize = 3;

const OUTPUT_FORMAT: Fourcc = Fourcc::Argb8888;

/// The 2D blitter driving GE2D composition
pub trait Blitter: fmt::Debug + Send + Sync {
    /// Returns whether the blitter reads `format`
    fn supports_format(&self, format: Fourcc) -> bool;

    /// Allocates a buffer the blitter can write to
    fn allocate(&self, size: Size<i32, Physical>, format: Fourcc) -> io::Result<BufferHandle>;

    /// Blends `inputs` in order into `output`, once `in_fence` signaled
    ///
    /// Returns a fence signaled when the blit finished.
    fn blend(
        &self,
        inputs: &[&DrmFramebuffer],
        output: &BufferHandle,
        damage: &[Rectangle<i32, Physical>],
        in_fence: DrmFence,
    ) -> io::Result<DrmFence>;
}

// An output buffer and the framebuffer it was last shown through
#[derive(Debug)]
struct RingSlot {
    buffer: BufferHandle,
    shown: Option<Arc<DrmFramebuffer>>,
}

/// Composer blending its inputs with the 2D blitter
///
/// Without a target the output goes to a ring of [`OUTPUT_RING_SIZE`] buffers. A buffer is
/// written again only after the plane that scanned it out released it.
#[derive(Debug)]
pub struct Ge2dComposer {
    blitter: Arc<dyn Blitter>,
    max_inputs: usize,
    inputs: Vec<Arc<DrmFramebuffer>>,
    overlays: Vec<Arc<DrmFramebuffer>>,
    target: Option<Arc<DrmFramebuffer>>,
    damage: Vec<Rectangle<i32, Physical>>,
    ring: Vec<RingSlot>,
    ring_index: usize,
    output: Option<Arc<DrmFramebuffer>>,
}

impl Ge2dComposer {
    /// A composer blending up to `max_inputs` framebuffers per frame
    pub fn new(blitter: Arc<dyn Blitter>, max_inputs: usize) -> Ge2dComposer {
        Ge2dComposer {
            blitter,
            max_inputs,
            inputs: Vec::new(),
            overlays: Vec::new(),
            target: None,
            damage: Vec::new(),
            ring: Vec::with_capacity(OUTPUT_RING_SIZE),
            ring_index: 0,
            output: None,
        }
    }

    fn is_fb_support(&self, fb: &DrmFramebuffer) -> bool {
        let Some(format) = fb.format() else {
            return false;
        };
        if fb.video_composition().is_some() || fb.is_secure() {
            return false;
        }
        if is_yuv(format) && fb.transform().swaps_axes() {
            return false;
        }
        self.blitter.supports_format(format)
    }

    // An input is skipped when an opaque framebuffer above it hides it completely
    fn is_covered(&self, fb: &DrmFramebuffer) -> bool {
        self.overlays.iter().any(|overlay| {
            overlay.zorder() > fb.zorder()
                && overlay.is_opaque()
                && overlay.display_frame().contains_rect(fb.display_frame())
        })
    }

    // Next output buffer and the fence signaled once its last scanout ended
    fn next_ring_buffer(&mut self, size: Size<i32, Physical>) -> Result<(usize, BufferHandle, DrmFence)> {
        let index = self.ring_index;
        self.ring_index = (self.ring_index + 1) % OUTPUT_RING_SIZE;

        let buffer_size: Size<i32, Buffer> = (size.w, size.h).into();
        if let Some(slot) = self.ring.get_mut(index).filter(|slot| slot.buffer.size == buffer_size) {
            let release = slot
                .shown
                .take()
                .map_or_else(DrmFence::no_fence, |fb| fb.take_release_fence());
            return Ok((index, slot.buffer.clone(), release));
        }

        let buffer = self
            .blitter
            .allocate(size, OUTPUT_FORMAT)
            .map_err(|source| Error::Access {
                errmsg: "Error allocating ge2d output buffer",
                source,
            })?;
        debug!(buffer = buffer.id, ?size, slot = index, "Allocated ge2d output buffer");
        let slot = RingSlot {
            buffer: buffer.clone(),
            shown: None,
        };
        if index < self.ring.len() {
            self.ring[index] = slot;
        } else {
            self.ring.push(slot);
        }
        Ok((index, buffer, DrmFence::no_fence()))
    }
}

impl Composer for Ge2dComposer {
    fn name(&self) -> &'static str {
        "ge2d"
    }

    fn composer_type(&self) -> ComposerType {
        ComposerType::Ge2d
    }

    fn prepare(&mut self) {
        self.inputs.clear();
        self.overlays.clear();
        self.target = None;
        self.damage.clear();
        self.output = None;
    }

    fn is_fbs_support(&self, fbs: &[Arc<DrmFramebuffer>], overlay_fbs: &mut Vec<Arc<DrmFramebuffer>>) -> bool {
        let mut accepted = 0;
        let mut all = true;
        for fb in fbs {
            if accepted < self.max_inputs && self.is_fb_support(fb) {
                accepted += 1;
            } else {
                overlay_fbs.push(fb.clone());
                all = false;
            }
        }
        all
    }

    fn add_inputs(&mut self, fbs: &[Arc<DrmFramebuffer>], overlay_fbs: &[Arc<DrmFramebuffer>]) {
        self.overlays.extend(overlay_fbs.iter().cloned());
        let (covered, inputs): (Vec<_>, Vec<_>) = fbs.iter().cloned().partition(|fb| self.is_covered(fb));
        if !covered.is_empty() {
            trace!(count = covered.len(), "Skipping covered ge2d inputs");
            release_unread(&covered, Composition::Dummy);
        }
        self.inputs = inputs;
        self.inputs.sort_by_key(|fb| fb.zorder());
    }

    fn set_output(&mut self, fb: Option<Arc<DrmFramebuffer>>, damage: &[Rectangle<i32, Physical>]) {
        self.target = fb;
        self.damage = damage.to_vec();
    }

    #[profiling::function]
    fn start(&mut self) -> Result<()> {
        if self.inputs.is_empty() {
            self.output = None;
            return Ok(());
        }

        let (slot, handle, frame, release) = match self.target.as_ref() {
            Some(target) => {
                let handle = target
                    .handle()
                    .cloned()
                    .ok_or(Error::NoOutput(ComposerType::Ge2d))?;
                (None, handle, target.display_frame(), DrmFence::no_fence())
            }
            None => {
                let frame = self
                    .inputs
                    .iter()
                    .map(|fb| fb.display_frame())
                    .reduce(|a, b| a.merge(b))
                    .unwrap_or_default();
                let (slot, handle, release) = self.next_ring_buffer(frame.size)?;
                (Some(slot), handle, frame, release)
            }
        };

        // the blit waits for its inputs and for the scanout of its output buffer to end
        let in_fence = self
            .inputs
            .iter()
            .fold(release, |fence, fb| fence.merge(fb.take_acquire_fence()));
        let inputs = self.inputs.iter().map(|fb| &**fb).collect::<Vec<_>>();
        let damage = if self.damage.is_empty() {
            vec![frame]
        } else {
            self.damage.clone()
        };

        let blit_fence = self
            .blitter
            .blend(&inputs, &handle, &damage, in_fence)
            .map_err(|source| {
                warn!("GE2D blend failed: {}", source);
                Error::Access {
                    errmsg: "Error blending with ge2d",
                    source,
                }
            })?;

        for fb in &self.inputs {
            fb.set_composition(Composition::Ge2d);
            let release = blit_fence.dup().map_err(|source| Error::Access {
                errmsg: "Error duplicating ge2d fence",
                source,
            })?;
            fb.set_release_fence(release);
        }

        let output = match self.target.clone() {
            Some(target) => {
                target.set_acquire_fence(blit_fence);
                target
            }
            None => {
                let zorder = self.inputs.iter().map(|fb| fb.zorder()).min().unwrap_or_default();
                Arc::new(
                    DrmFramebuffer::new(Some(handle))
                        .with_display_frame(frame)
                        .with_blend_mode(BlendMode::Premultiplied)
                        .with_zorder(zorder)
                        .with_acquire_fence(blit_fence),
                )
            }
        };
        if let Some(slot) = slot.and_then(|slot| self.ring.get_mut(slot)) {
            slot.shown = Some(output.clone());
        }
        trace!(inputs = self.inputs.len(), output = output.id(), "GE2D composition");
        self.output = Some(output);
        Ok(())
    }

    fn output(&self) -> Option<Arc<DrmFramebuffer>> {
        self.output.clone()
    }

    fn overlay_fbs(&mut self) -> Vec<Arc<DrmFramebuffer>> {
        std::mem::take(&mut self.overlays)
    }
}

fn is_yuv(format: Fourcc) -> bool {
    matches!(
        format,
        Fourcc::Nv12 | Fourcc::Nv21 | Fourcc::Nv16 | Fourcc::Yuyv | Fourcc::Yuv420 | Fourcc::Yvu420
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use drm_fourcc::DrmFourcc as Fourcc;
    use rustix::event::{eventfd, EventfdFlags};

    use super::{Ge2dComposer, OUTPUT_RING_SIZE};
    use crate::{
        backend::virtual_device::{VirtualBlitter, VirtualDevice},
        composer::Composer,
        hw::{BlankOp, HwDisplayManager, HwDisplayPlane},
        framebuffer::{BlendMode, BufferHandle, BufferUsage, Composition, DrmFramebuffer},
        sync::DrmFence,
        utils::{Rectangle, Transform},
    };

    fn fb(id: u64, format: Fourcc, zorder: u32) -> Arc<DrmFramebuffer> {
        Arc::new(
            DrmFramebuffer::new(Some(BufferHandle::new(id, format, (100, 100))))
                .with_position((id as i32 * 10, 0))
                .with_zorder(zorder),
        )
    }

    #[test]
    fn partitions_unsupported_inputs() {
        let composer = Ge2dComposer::new(Arc::new(VirtualBlitter::default()), 2);
        let rgba = fb(1, Fourcc::Argb8888, 1);
        let rotated_yuv = Arc::new(
            DrmFramebuffer::new(Some(BufferHandle::new(2, Fourcc::Nv12, (100, 100))))
                .with_transform(Transform::_90),
        );
        let video = Arc::new(DrmFramebuffer::new(Some(
            BufferHandle::new(3, Fourcc::Nv12, (100, 100)).with_usage(BufferUsage::VIDEO_OVERLAY),
        )));
        let secure = Arc::new(DrmFramebuffer::new(Some(BufferHandle::new(4, Fourcc::Argb8888, (8, 8)))).with_secure(true));

        let mut overlay = Vec::new();
        assert!(composer.is_fbs_support(&[rgba.clone()], &mut overlay));
        assert!(overlay.is_empty());

        assert!(!composer.is_fbs_support(&[rgba, rotated_yuv, video, secure], &mut overlay));
        assert_eq!(overlay.len(), 3);
    }

    #[test]
    fn caps_input_count() {
        let composer = Ge2dComposer::new(Arc::new(VirtualBlitter::default()), 2);
        let fbs = (1..=3).map(|i| fb(i, Fourcc::Argb8888, i as u32)).collect::<Vec<_>>();
        let mut overlay = Vec::new();
        assert!(!composer.is_fbs_support(&fbs, &mut overlay));
        assert_eq!(overlay.len(), 1);
        assert_eq!(overlay[0].id(), fbs[2].id());
    }

    #[test]
    fn blend_merges_fences_and_releases_inputs() {
        let blitter = Arc::new(VirtualBlitter::default());
        let mut composer = Ge2dComposer::new(blitter.clone(), 3);

        let pending = eventfd(0, EventfdFlags::CLOEXEC).unwrap();
        let signal = pending.try_clone().unwrap();
        let first = fb(1, Fourcc::Argb8888, 1);
        first.set_acquire_fence(DrmFence::from(pending));
        let second = fb(2, Fourcc::Xrgb8888, 2);

        composer.prepare();
        composer.add_inputs(&[first.clone(), second.clone()], &[]);
        composer.set_output(None, &[]);
        composer.start().unwrap();

        let output = composer.output().unwrap();
        assert_eq!(output.display_frame(), Rectangle::from_extremities((10, 0), (120, 100)));
        assert_eq!(blitter.blends().len(), 1);
        assert_eq!(first.composition(), Composition::Ge2d);
        assert_eq!(second.composition(), Composition::Ge2d);

        let acquire = output.take_acquire_fence();
        let release = first.take_release_fence();
        assert!(acquire.is_valid() && release.is_valid());
        assert!(!acquire.is_signaled());
        assert!(!release.is_signaled());

        rustix::io::write(&signal, &1u64.to_ne_bytes()).unwrap();
        assert!(acquire.is_signaled());
        assert!(release.is_signaled());
    }

    #[test]
    fn covered_inputs_are_skipped() {
        let blitter = Arc::new(VirtualBlitter::default());
        let mut composer = Ge2dComposer::new(blitter.clone(), 3);
        let below = fb(1, Fourcc::Argb8888, 1);
        let visible = fb(25, Fourcc::Argb8888, 1);
        let opaque = Arc::new(
            DrmFramebuffer::new(Some(BufferHandle::new(5, Fourcc::Xrgb8888, (200, 200))))
                .with_blend_mode(BlendMode::None)
                .with_zorder(5),
        );

        composer.prepare();
        composer.add_inputs(&[below.clone(), visible.clone()], &[opaque]);
        composer.set_output(None, &[]);
        composer.start().unwrap();

        assert_eq!(below.composition(), Composition::Dummy);
        assert_eq!(visible.composition(), Composition::Ge2d);
        assert_eq!(blitter.blends()[0].0, 1);
        assert_eq!(composer.overlay_fbs().len(), 1);
    }

    #[test]
    fn output_buffers_are_recycled() {
        let blitter = Arc::new(VirtualBlitter::default());
        let mut composer = Ge2dComposer::new(blitter.clone(), 3);
        let mut outputs = Vec::new();
        for _ in 0..OUTPUT_RING_SIZE * 2 {
            composer.prepare();
            composer.add_inputs(&[fb(1, Fourcc::Argb8888, 1)], &[]);
            composer.set_output(None, &[]);
            composer.start().unwrap();
            outputs.push(composer.output().unwrap().handle().unwrap().id);
        }
        assert_eq!(outputs[..OUTPUT_RING_SIZE], outputs[OUTPUT_RING_SIZE..]);
        assert_ne!(outputs[0], outputs[1]);
    }

    #[test]
    fn recycled_buffer_waits_for_scanout() {
        let device = Arc::new(VirtualDevice::default_layout());
        let manager = HwDisplayManager::new(device);
        manager.load_drm_resources().unwrap();
        let planes = manager.planes().unwrap();
        let (first_plane, second_plane) = (&planes[0], &planes[1]);

        let blitter = Arc::new(VirtualBlitter::default());
        let mut composer = Ge2dComposer::new(blitter.clone(), 3);
        let mut compose = |plane: &Arc<dyn HwDisplayPlane>| {
            composer.prepare();
            composer.add_inputs(&[fb(1, Fourcc::Argb8888, 1)], &[]);
            composer.set_output(None, &[]);
            composer.start().unwrap();
            let output = composer.output().unwrap();
            plane.set_plane(Some(&output), 1, BlankOp::Unblank).unwrap();
            output
        };

        // the first buffer stays on screen while the two others are shown elsewhere
        let first = compose(first_plane);
        compose(second_plane);
        compose(second_plane);
        let reused = compose(second_plane);
        assert_eq!(reused.handle().unwrap().id, first.handle().unwrap().id);
        assert_eq!(blitter.blends().len(), OUTPUT_RING_SIZE + 1);

        // still scanned out, the blit into it has to wait
        let blit = reused.take_acquire_fence();
        assert!(blit.is_valid());
        assert!(!blit.is_signaled());

        first_plane.set_plane(None, 0, BlankOp::Blank).unwrap();
        assert!(blit.is_signaled());
    }

    #[test]
    fn nothing_to_blend() {
        let mut composer = Ge2dComposer::new(Arc::new(VirtualBlitter::default()), 3);
        composer.prepare();
        composer.set_output(None, &[]);
        composer.start().unwrap();
        assert!(composer.output().is_none());
    }
}
