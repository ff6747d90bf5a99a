//! Plane and composer assignment
//!
//! A [`CompositionStrategy`] decides, for the framebuffers of one frame, which ones are shown on
//! a plane of their own and which ones are merged by a composer, and at which z-order every
//! plane is stacked. [`MultiplanesStrategy`] is the default.

use std::{fmt, sync::Arc};

use tracing::trace;

use crate::{
    composer::{ComposerPool, ComposerType},
    error::Result,
    framebuffer::{Composition, DrmFramebuffer},
    hw::{HwDisplayPlane, PlaneType},
};

/// A framebuffer shown on a plane
#[derive(Debug, Clone)]
pub struct PlaneAssignment {
    /// Plane showing the framebuffer
    pub plane: Arc<dyn HwDisplayPlane>,
    /// Framebuffer shown
    pub fb: Arc<DrmFramebuffer>,
    /// Stacking position
    pub zorder: u32,
}

/// Framebuffers merged by a composer
#[derive(Debug, Clone)]
pub struct ComposerAssignment {
    /// Composer merging the inputs
    pub composer_type: ComposerType,
    /// Inputs in stacking order
    pub inputs: Vec<Arc<DrmFramebuffer>>,
    /// Plane showing the composer output, `None` if nothing is shown
    pub plane: Option<Arc<dyn HwDisplayPlane>>,
    /// Stacking position of the output
    pub zorder: u32,
}

/// Outcome of [`CompositionStrategy::decide`]
#[derive(Debug, Clone, Default)]
pub struct CompositionPlan {
    /// Framebuffers with a plane of their own
    pub planes: Vec<PlaneAssignment>,
    /// Framebuffers going through a composer
    pub composer: Option<ComposerAssignment>,
    /// Planes showing nothing this frame
    pub unused_planes: Vec<Arc<dyn HwDisplayPlane>>,
}

/// Policy assigning framebuffers to planes and composers
///
/// On return every framebuffer of `layers` carries the [`Composition`] it ends up with. The
/// composer of the plan has been prepared and given its inputs.
pub trait CompositionStrategy: fmt::Debug + Send {
    /// Name for logging
    fn name(&self) -> &'static str;

    /// Assigns `layers`, given in stacking order bottom to top, to `planes` and `composers`
    fn decide(
        &mut self,
        layers: &[Arc<DrmFramebuffer>],
        planes: &[Arc<dyn HwDisplayPlane>],
        composers: &mut ComposerPool,
    ) -> Result<CompositionPlan>;
}

/// Lowest z-order given to planes stacked by policy, above a bottom video plane
pub const FREE_ZORDER_BASE: u32 = 1;

#[derive(Debug, Clone)]
enum Placement {
    Plane(Arc<dyn HwDisplayPlane>),
    Composer,
    Dropped,
}

/// Default strategy using as many planes as possible
///
/// - video goes to a matching video plane, or is dropped, never composed
/// - a cursor on top of the stack goes to the cursor plane
/// - everything else goes to free osd planes
/// - if that does not work out, one osd plane is reserved for a composer output. The top of the
///   stack keeps its planes, the rest is merged by GE2D if it takes all of it, otherwise by the
///   client. Without any osd plane the rest is dropped.
///
/// Planes with a fixed z-order keep it. The others are stacked from `zorder_base` upwards in
/// stacking order, the composer output taking the position of its lowest input.
#[derive(Debug, Clone)]
pub struct MultiplanesStrategy {
    zorder_base: u32,
}

impl Default for MultiplanesStrategy {
    fn default() -> Self {
        MultiplanesStrategy {
            zorder_base: FREE_ZORDER_BASE,
        }
    }
}

impl MultiplanesStrategy {
    /// Stacks free planes from `zorder_base` upwards
    pub fn with_zorder_base(zorder_base: u32) -> MultiplanesStrategy {
        MultiplanesStrategy { zorder_base }
    }

    fn zorder(&self, slot: u32) -> u32 {
        self.zorder_base + slot
    }
}

fn take_plane(
    planes: &mut Vec<Arc<dyn HwDisplayPlane>>,
    matches: impl Fn(&dyn HwDisplayPlane) -> bool,
) -> Option<Arc<dyn HwDisplayPlane>> {
    let index = planes.iter().position(|plane| matches(plane.as_ref()))?;
    Some(planes.remove(index))
}

// Every candidate gets an osd plane, or `None`
fn match_all(
    candidates: &[(usize, Arc<DrmFramebuffer>)],
    osd: &[Arc<dyn HwDisplayPlane>],
) -> Option<Vec<(usize, Arc<dyn HwDisplayPlane>)>> {
    if candidates.len() > osd.len() {
        return None;
    }
    let mut spare = osd.to_vec();
    candidates
        .iter()
        .map(|(index, fb)| Some((*index, take_plane(&mut spare, |plane| plane.is_fb_support(fb))?)))
        .collect()
}

impl CompositionStrategy for MultiplanesStrategy {
    fn name(&self) -> &'static str {
        "multiplanes"
    }

    #[profiling::function]
    fn decide(
        &mut self,
        layers: &[Arc<DrmFramebuffer>],
        planes: &[Arc<dyn HwDisplayPlane>],
        composers: &mut ComposerPool,
    ) -> Result<CompositionPlan> {
        let (mut free, idle): (Vec<_>, Vec<_>) = planes.iter().cloned().partition(|plane| !plane.is_idle());
        let mut placements: Vec<Option<Placement>> = vec![None; layers.len()];
        let mut candidates = Vec::new();
        let top = layers.len().checked_sub(1);

        for (index, fb) in layers.iter().enumerate() {
            if fb.video_composition().is_some() {
                let plane = take_plane(&mut free, |plane| {
                    matches!(plane.plane_type(), PlaneType::Video | PlaneType::HwcVideo) && plane.is_fb_support(fb)
                });
                placements[index] = Some(plane.map_or(Placement::Dropped, Placement::Plane));
                continue;
            }
            if fb.is_cursor() && Some(index) == top {
                let plane = take_plane(&mut free, |plane| {
                    plane.plane_type() == PlaneType::Cursor && plane.is_fb_support(fb)
                });
                if let Some(plane) = plane {
                    placements[index] = Some(Placement::Plane(plane));
                    continue;
                }
            }
            candidates.push((index, fb.clone()));
        }

        let (mut osd, mut unused): (Vec<_>, Vec<_>) =
            free.into_iter().partition(|plane| plane.plane_type() == PlaneType::Osd);
        unused.extend(idle);

        let mut composer_inputs = Vec::new();
        let mut composer_plane = None;
        if let Some(assigned) = match_all(&candidates, &osd) {
            for (index, plane) in assigned {
                osd.retain(|spare| spare.id() != plane.id());
                placements[index] = Some(Placement::Plane(plane));
            }
        } else if osd.is_empty() {
            composer_inputs = candidates;
        } else {
            // the top of the stack keeps its planes while one is left for the composer output
            let mut split = candidates.len();
            while split > 0 && osd.len() > 1 {
                let (index, fb) = &candidates[split - 1];
                match take_plane(&mut osd, |plane| plane.is_fb_support(fb)) {
                    Some(plane) => placements[*index] = Some(Placement::Plane(plane)),
                    None => break,
                }
                split -= 1;
            }
            candidates.truncate(split);
            composer_inputs = candidates;
            composer_plane = Some(osd.remove(0));
        }
        unused.extend(osd);
        for (index, _) in &composer_inputs {
            placements[*index] = Some(Placement::Composer);
        }

        let mut plan = CompositionPlan::default();
        let mut slot = 0;
        let mut composer_zorder = None;
        for (index, placement) in placements.into_iter().enumerate() {
            let fb = &layers[index];
            match placement {
                Some(Placement::Plane(plane)) => {
                    let zorder = plane.fixed_zorder().unwrap_or_else(|| self.zorder(slot));
                    slot += 1;
                    fb.set_composition(plane.composition(fb));
                    plan.planes.push(PlaneAssignment {
                        plane,
                        fb: fb.clone(),
                        zorder,
                    });
                }
                Some(Placement::Composer) => {
                    if composer_zorder.is_none() {
                        composer_zorder = Some(self.zorder(slot));
                        slot += 1;
                    }
                }
                Some(Placement::Dropped) | None => fb.set_composition(Composition::Dummy),
            }
        }

        if let Some((first, _)) = composer_inputs.first() {
            let inputs = composer_inputs.iter().map(|(_, fb)| fb.clone()).collect::<Vec<_>>();
            let overlays = plan
                .planes
                .iter()
                .filter(|assignment| layers[*first + 1..].iter().any(|fb| Arc::ptr_eq(fb, &assignment.fb)))
                .map(|assignment| assignment.fb.clone())
                .collect::<Vec<_>>();

            let composer_type = match composer_plane {
                None => ComposerType::Dummy,
                Some(_) if composers.is_available(ComposerType::Ge2d) => {
                    let ge2d = composers.get(ComposerType::Ge2d)?;
                    ge2d.prepare();
                    let mut rejected = Vec::new();
                    if ge2d.is_fbs_support(&inputs, &mut rejected) {
                        ComposerType::Ge2d
                    } else {
                        trace!(rejected = rejected.len(), "GE2D can not take every input");
                        ComposerType::Client
                    }
                }
                Some(_) => ComposerType::Client,
            };

            // tagged first, inputs the composer skips are retagged while added
            for fb in &inputs {
                fb.set_composition(composer_type.composition());
            }
            let composer = composers.get(composer_type)?;
            composer.prepare();
            composer.add_inputs(&inputs, &overlays);

            plan.composer = Some(ComposerAssignment {
                composer_type,
                inputs,
                plane: composer_plane,
                zorder: composer_zorder.unwrap_or(self.zorder_base),
            });
        } else if let Some(plane) = composer_plane {
            unused.push(plane);
        }

        plan.unused_planes = unused;
        trace!(
            planes = plan.planes.len(),
            composer = ?plan.composer.as_ref().map(|c| c.composer_type),
            "Composition decided"
        );
        Ok(plan)
    }
}
