use std::sync::Arc;

use super::{release_unread, Composer, ComposerType};
use crate::{
    error::Result,
    framebuffer::{Composition, DrmFramebuffer},
    utils::{Physical, Rectangle},
};

/// Composer dropping its inputs
///
/// Used when nothing has to be shown, e.g. while the display is blanked or when no plane is
/// left for a composer output.
#[derive(Debug, Default)]
pub struct DummyComposer {
    inputs: Vec<Arc<DrmFramebuffer>>,
}

impl DummyComposer {
    /// A composer without inputs
    pub fn new() -> DummyComposer {
        DummyComposer::default()
    }
}

impl Composer for DummyComposer {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn composer_type(&self) -> ComposerType {
        ComposerType::Dummy
    }

    fn prepare(&mut self) {
        self.inputs.clear();
    }

    fn is_fbs_support(&self, _fbs: &[Arc<DrmFramebuffer>], _overlay_fbs: &mut Vec<Arc<DrmFramebuffer>>) -> bool {
        true
    }

    fn add_inputs(&mut self, fbs: &[Arc<DrmFramebuffer>], _overlay_fbs: &[Arc<DrmFramebuffer>]) {
        self.inputs.extend(fbs.iter().cloned());
    }

    fn set_output(&mut self, _fb: Option<Arc<DrmFramebuffer>>, _damage: &[Rectangle<i32, Physical>]) {}

    fn start(&mut self) -> Result<()> {
        release_unread(&self.inputs, Composition::Dummy);
        Ok(())
    }

    fn output(&self) -> Option<Arc<DrmFramebuffer>> {
        None
    }

    fn overlay_fbs(&mut self) -> Vec<Arc<DrmFramebuffer>> {
        Vec::new()
    }
}
