use std::sync::Arc;

use tracing::trace;

use super::{release_unread, Composer, ComposerType};
use crate::{
    error::{Error, Result},
    framebuffer::{Composition, DrmFramebuffer},
    utils::{Physical, Rectangle},
};

/// Composer whose output is the client target
///
/// The client renders every input itself, so this composer takes everything and only forwards
/// the client target with its acquire fence.
#[derive(Debug, Default)]
pub struct ClientComposer {
    inputs: Vec<Arc<DrmFramebuffer>>,
    overlays: Vec<Arc<DrmFramebuffer>>,
    target: Option<Arc<DrmFramebuffer>>,
}

impl ClientComposer {
    /// A composer without client target
    pub fn new() -> ClientComposer {
        ClientComposer::default()
    }
}

impl Composer for ClientComposer {
    fn name(&self) -> &'static str {
        "client"
    }

    fn composer_type(&self) -> ComposerType {
        ComposerType::Client
    }

    fn prepare(&mut self) {
        self.inputs.clear();
        self.overlays.clear();
        self.target = None;
    }

    fn is_fbs_support(&self, _fbs: &[Arc<DrmFramebuffer>], _overlay_fbs: &mut Vec<Arc<DrmFramebuffer>>) -> bool {
        true
    }

    fn add_inputs(&mut self, fbs: &[Arc<DrmFramebuffer>], overlay_fbs: &[Arc<DrmFramebuffer>]) {
        self.inputs.extend(fbs.iter().cloned());
        self.overlays.extend(overlay_fbs.iter().cloned());
    }

    fn set_output(&mut self, fb: Option<Arc<DrmFramebuffer>>, _damage: &[Rectangle<i32, Physical>]) {
        self.target = fb;
    }

    fn start(&mut self) -> Result<()> {
        let Some(target) = self.target.as_ref() else {
            return Err(Error::NoOutput(ComposerType::Client));
        };
        // the client read the inputs while rendering the target
        release_unread(&self.inputs, Composition::Client);
        trace!(inputs = self.inputs.len(), target = target.id(), "Client composition");
        Ok(())
    }

    fn output(&self) -> Option<Arc<DrmFramebuffer>> {
        self.target.clone()
    }

    fn overlay_fbs(&mut self) -> Vec<Arc<DrmFramebuffer>> {
        std::mem::take(&mut self.overlays)
    }
}
