//! Composers
//!
//! A composer turns framebuffers that did not get a plane of their own into one output
//! framebuffer, which is then scanned out by a plane. Three composers exist:
//!
//! - [`ClientComposer`]: the client already rendered everything into its client target
//! - [`Ge2dComposer`]: the 2D blitter blends the inputs
//! - [`DummyComposer`]: the inputs are dropped
//!
//! Every frame a composer goes through the same steps:
//!
//! 1. [`Composer::prepare`] resets the state of the last frame
//! 2. [`Composer::is_fbs_support`] checks which inputs it can take
//! 3. [`Composer::add_inputs`] hands over the inputs and the framebuffers shown above them
//! 4. [`Composer::set_output`] selects the output framebuffer
//! 5. [`Composer::start`] composes; afterwards the output and its acquire fence are valid
//! 6. [`Composer::overlay_fbs`] drains the framebuffers the composer handed back
//!
//! Video and cursor content never goes through a composer.

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    sync::Arc,
};

use tracing::debug;

use crate::{
    config::Config,
    error::{Error, Result},
    framebuffer::{Composition, DrmFramebuffer},
    utils::{Physical, Rectangle},
};

mod client;
mod dummy;
mod ge2d;

pub use self::client::ClientComposer;
pub use self::dummy::DummyComposer;
pub use self::ge2d::{Blitter, Ge2dComposer};

/// Kind of composer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComposerType {
    /// Client target rendered by the client
    Client,
    /// 2D blitter
    Ge2d,
    /// No output at all
    Dummy,
}

impl ComposerType {
    /// Composition tag given to the inputs of this composer
    pub fn composition(self) -> Composition {
        match self {
            ComposerType::Client => Composition::Client,
            ComposerType::Ge2d => Composition::Ge2d,
            ComposerType::Dummy => Composition::Dummy,
        }
    }
}

/// A composition strategy for framebuffers without a plane
pub trait Composer: fmt::Debug + Send {
    /// Name for logging
    fn name(&self) -> &'static str;

    /// Kind of composer
    fn composer_type(&self) -> ComposerType;

    /// Resets the state of the previous frame
    fn prepare(&mut self);

    /// Checks whether the composer can take every framebuffer of `fbs`
    ///
    /// Framebuffers it can not take are appended to `overlay_fbs`.
    fn is_fbs_support(&self, fbs: &[Arc<DrmFramebuffer>], overlay_fbs: &mut Vec<Arc<DrmFramebuffer>>) -> bool;

    /// Hands over the inputs and the framebuffers shown on planes above the output
    fn add_inputs(&mut self, fbs: &[Arc<DrmFramebuffer>], overlay_fbs: &[Arc<DrmFramebuffer>]);

    /// Selects the output framebuffer and the region that changed
    ///
    /// Composers owning their output buffers allocate one when `fb` is `None`.
    fn set_output(&mut self, fb: Option<Arc<DrmFramebuffer>>, damage: &[Rectangle<i32, Physical>]);

    /// Composes the inputs into the output
    fn start(&mut self) -> Result<()>;

    /// Output of the last [`Composer::start`], `None` if nothing has to be shown
    fn output(&self) -> Option<Arc<DrmFramebuffer>>;

    /// Drains the framebuffers the composer handed back to be shown on planes
    fn overlay_fbs(&mut self) -> Vec<Arc<DrmFramebuffer>>;
}

// Tags `fbs` and drops their release fence, for inputs whose pixels are never read
fn release_unread(fbs: &[Arc<DrmFramebuffer>], composition: Composition) {
    for fb in fbs {
        fb.set_composition(composition);
        fb.set_release_fence(crate::sync::DrmFence::no_fence());
    }
}

/// Creates composers for a display
#[derive(Debug, Clone)]
pub struct ComposerFactory {
    blitter: Option<Arc<dyn Blitter>>,
    ge2d_max_inputs: usize,
    disable_ge2d: bool,
}

impl ComposerFactory {
    /// A factory following `config`, GE2D needs a `blitter`
    pub fn new(config: &Config, blitter: Option<Arc<dyn Blitter>>) -> ComposerFactory {
        ComposerFactory {
            blitter,
            ge2d_max_inputs: config.ge2d_max_inputs,
            disable_ge2d: config.disable_ge2d,
        }
    }

    /// Returns whether `composer_type` can be created on this device
    pub fn is_available(&self, composer_type: ComposerType) -> bool {
        match composer_type {
            ComposerType::Client | ComposerType::Dummy => true,
            ComposerType::Ge2d => !self.disable_ge2d && self.blitter.is_some(),
        }
    }

    /// Creates a composer of the requested kind
    pub fn create(&self, composer_type: ComposerType) -> Result<Box<dyn Composer>> {
        let composer: Box<dyn Composer> = match composer_type {
            ComposerType::Client => Box::new(ClientComposer::new()),
            ComposerType::Dummy => Box::new(DummyComposer::new()),
            ComposerType::Ge2d => match (&self.blitter, self.disable_ge2d) {
                (Some(blitter), false) => Box::new(Ge2dComposer::new(blitter.clone(), self.ge2d_max_inputs)),
                _ => return Err(Error::ComposerUnavailable(ComposerType::Ge2d)),
            },
        };
        debug!(composer = composer.name(), "Composer created");
        Ok(composer)
    }
}

/// Composers of one display, created on first use and kept across frames
#[derive(Debug)]
pub struct ComposerPool {
    factory: ComposerFactory,
    composers: HashMap<ComposerType, Box<dyn Composer>>,
}

impl ComposerPool {
    /// An empty pool creating composers through `factory`
    pub fn new(factory: ComposerFactory) -> ComposerPool {
        ComposerPool {
            factory,
            composers: HashMap::new(),
        }
    }

    /// See [`ComposerFactory::is_available`]
    pub fn is_available(&self, composer_type: ComposerType) -> bool {
        self.factory.is_available(composer_type)
    }

    /// The composer of the requested kind, created if needed
    pub fn get(&mut self, composer_type: ComposerType) -> Result<&mut dyn Composer> {
        let composer = match self.composers.entry(composer_type) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.factory.create(composer_type)?),
        };
        Ok(&mut **composer)
    }
}
