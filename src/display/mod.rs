//! Displays
//!
//! A [`HwcDisplay`] drives one connector. It binds the connector to a crtc and the planes that
//! crtc can use, keeps the layers of the client, and runs the frame loop:
//!
//! 1. the client creates layers and attaches a framebuffer to each of them
//! 2. [`HwcDisplay::validate_display`] decides for every layer whether it gets a plane or goes
//!    through a composer, see [`CompositionStrategy`]
//! 3. the client renders the layers tagged [`Composition::Client`] into the client target
//! 4. [`HwcDisplay::present_display`] runs the composer and commits the planes
//! 5. [`HwcDisplay::layer_release_fences`] tells the client when it may reuse its buffers
//!
//! Hotplug, mode and power events are fed in by the embedder. Vsync and the resulting hotplug
//! and refresh requests are reported to a [`DisplayEventHandler`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use hwcomposer::{
//!     backend::virtual_device::VirtualDevice,
//!     config::Config,
//!     display::HwcDisplay,
//!     hw::{ConnectorType, HwDisplayManager},
//! };
//!
//! let manager = Arc::new(HwDisplayManager::new(Arc::new(VirtualDevice::default_layout())));
//! manager.load_drm_resources()?;
//!
//! let mut display = HwcDisplay::new(manager, ConnectorType::Hdmi, Config::from_env())?;
//! let layer = display.create_layer()?;
//! # let fb = unimplemented!();
//! display.set_layer_buffer(layer, fb)?;
//! display.validate_display()?;
//! let present_fence = display.present_display()?;
//! # Ok::<(), hwcomposer::Error>(())
//! ```

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tracing::{debug, debug_span, info, info_span, trace, warn};

use crate::{
    composer::{Blitter, ComposerFactory, ComposerPool, ComposerType},
    config::Config,
    error::{Error, Result},
    framebuffer::{Composition, DrmFramebuffer},
    hw::{
        BlankOp, ConnectorType, DisplayMode, HwDisplayConnector, HwDisplayCrtc, HwDisplayManager, HwDisplayPlane,
        PlaneCapabilities,
    },
    power::{HwcPowerMode, PowerState},
    sync::{DrmFence, FenceStatus},
    system_control::{MemorySystemControl, SystemControl},
    utils::{BitsMap, Monotonic, Time},
    vsync::{HwcVsync, VsyncObserver},
};

mod mode;
mod strategy;

pub use self::mode::{ModeManager, MODES_SINK};
pub use self::strategy::{
    ComposerAssignment, CompositionPlan, CompositionStrategy, MultiplanesStrategy, PlaneAssignment,
    FREE_ZORDER_BASE,
};

/// Number of layers a display can hold
pub const MAX_LAYERS: usize = 64;

/// Identifier of a layer of a [`HwcDisplay`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u32);

impl LayerId {
    /// Raw id, unique among the live layers of a display
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// Receiver of display events
///
/// Called from the vsync thread for vsync, from the caller's thread otherwise.
pub trait DisplayEventHandler: Send + Sync {
    /// A vsync tick
    fn on_vsync(&self, timestamp: Time<Monotonic>) {
        let _ = timestamp;
    }
    /// The sink was attached or removed
    fn on_hotplug(&self, connected: bool) {
        let _ = connected;
    }
    /// A new frame is needed
    fn on_refresh(&self) {}
}

#[derive(Default)]
struct EventForwarder {
    handler: Mutex<Option<Arc<dyn DisplayEventHandler>>>,
}

impl EventForwarder {
    fn handler(&self) -> Option<Arc<dyn DisplayEventHandler>> {
        self.handler.lock().unwrap().clone()
    }
}

impl VsyncObserver for EventForwarder {
    fn on_vsync(&self, timestamp: Time<Monotonic>) {
        if let Some(handler) = self.handler() {
            handler.on_vsync(timestamp);
        }
    }
}

/// One display: a connector, its crtc and planes
pub struct HwcDisplay {
    manager: Arc<HwDisplayManager>,
    connector: Arc<dyn HwDisplayConnector>,
    crtc: Arc<HwDisplayCrtc>,
    planes: Vec<Arc<dyn HwDisplayPlane>>,
    config: Config,

    layer_ids: BitsMap,
    layers: IndexMap<LayerId, Option<Arc<DrmFramebuffer>>>,
    client_target: Option<Arc<DrmFramebuffer>>,

    composers: ComposerPool,
    strategy: Box<dyn CompositionStrategy>,
    plan: Option<CompositionPlan>,

    modes: ModeManager,
    power: HwcPowerMode,
    powered: bool,
    vsync: HwcVsync,
    events: Arc<EventForwarder>,

    span: tracing::Span,
}

impl std::fmt::Debug for HwcDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwcDisplay")
            .field("connector", &self.connector)
            .field("crtc", &self.crtc.id())
            .field("planes", &self.planes.len())
            .field("layers", &self.layers.len())
            .field("strategy", &self.strategy.name())
            .field("power", &self.power)
            .field("vsync", &self.vsync)
            .finish_non_exhaustive()
    }
}

impl HwcDisplay {
    /// Binds the first connector of `connector_type` to a crtc and its planes
    ///
    /// If a sink is attached its mode is selected right away.
    pub fn new(manager: Arc<HwDisplayManager>, connector_type: ConnectorType, config: Config) -> Result<HwcDisplay> {
        let connector = manager.connector(connector_type)?;
        if let Err(err) = connector.update() {
            warn!(connector = connector.id(), "Failed to read connector state: {}", err);
        }
        let events = Arc::new(EventForwarder::default());
        let vsync = HwcVsync::new(config.default_vsync_period)?;
        vsync.set_observer(events.clone());

        // claimed last, nothing below fails
        let crtc = manager.crtc_for_connector(&connector)?;
        let planes = match manager.planes_for_crtc(&crtc) {
            Ok(planes) => planes,
            Err(err) => {
                manager.release_crtc(&connector);
                return Err(err);
            }
        };

        let span = info_span!("hwc_display", connector = ?connector_type, crtc = crtc.id());

        let mut display = HwcDisplay {
            composers: ComposerPool::new(ComposerFactory::new(&config, None)),
            strategy: Box::<MultiplanesStrategy>::default(),
            plan: None,
            modes: ModeManager::new(Arc::new(MemorySystemControl::new())),
            power: HwcPowerMode::new(),
            powered: true,
            layer_ids: BitsMap::new(MAX_LAYERS),
            layers: IndexMap::new(),
            client_target: None,
            manager,
            connector,
            crtc,
            planes,
            config,
            vsync,
            events,
            span,
        };

        let connected = display.connector.is_connected();
        display.power.set_connector_status(connected);
        if connected {
            display.update_mode();
        }
        let plane_count = display.planes.len();
        let span = &display.span;
        info!(parent: span, planes = plane_count, connected, "Display created");
        Ok(display)
    }

    /// Persists modes through `system_control` and reselects the mode with it
    pub fn with_system_control(mut self, system_control: Arc<dyn SystemControl>) -> Self {
        self.modes.set_system_control(system_control);
        if self.connector.is_connected() {
            self.update_mode();
        }
        self
    }

    /// Enables the GE2D composer backed by `blitter`
    pub fn with_blitter(mut self, blitter: Arc<dyn Blitter>) -> Self {
        self.composers = ComposerPool::new(ComposerFactory::new(&self.config, Some(blitter)));
        self.plan = None;
        self
    }

    /// Replaces the plane assignment policy
    pub fn with_strategy(mut self, strategy: Box<dyn CompositionStrategy>) -> Self {
        self.strategy = strategy;
        self.plan = None;
        self
    }

    /// Registers the receiver of vsync, hotplug and refresh events
    pub fn set_event_handler(&self, handler: Arc<dyn DisplayEventHandler>) {
        *self.events.handler.lock().unwrap() = Some(handler);
    }

    /// Kind of connector driven
    pub fn connector_type(&self) -> ConnectorType {
        self.connector.connector_type()
    }

    /// Connector driven
    pub fn connector(&self) -> &Arc<dyn HwDisplayConnector> {
        &self.connector
    }

    /// Crtc driving the connector
    pub fn crtc(&self) -> &Arc<HwDisplayCrtc> {
        &self.crtc
    }

    /// Planes of the crtc
    pub fn planes(&self) -> &[Arc<dyn HwDisplayPlane>] {
        &self.planes
    }

    /// State of the blanking state machine
    pub fn power_state(&self) -> PowerState {
        self.power.state()
    }

    /// Vsync source of the display
    pub fn vsync(&self) -> &HwcVsync {
        &self.vsync
    }

    // Layers

    /// Adds an empty layer
    pub fn create_layer(&mut self) -> Result<LayerId> {
        let idx = self.layer_ids.get_zero_bit().ok_or(Error::OutOfLayers)?;
        self.layer_ids.set_bit(idx);
        let id = LayerId(idx as u32);
        self.layers.insert(id, None);
        self.plan = None;
        trace!(parent: &self.span, layer = id.0, "Layer created");
        Ok(id)
    }

    /// Removes a layer, its id may be handed out again
    pub fn destroy_layer(&mut self, layer: LayerId) -> Result<()> {
        self.layers.shift_remove(&layer).ok_or(Error::InvalidLayer(layer))?;
        self.layer_ids.clear_bit(layer.0 as usize);
        self.plan = None;
        Ok(())
    }

    /// Attaches the framebuffer shown by `layer` in the next frame
    pub fn set_layer_buffer(&mut self, layer: LayerId, fb: Arc<DrmFramebuffer>) -> Result<()> {
        let slot = self.layers.get_mut(&layer).ok_or(Error::InvalidLayer(layer))?;
        *slot = Some(fb);
        self.plan = None;
        Ok(())
    }

    /// Sets the framebuffer the client renders [`Composition::Client`] layers into
    pub fn set_client_target(&mut self, fb: Option<Arc<DrmFramebuffer>>) {
        self.client_target = fb;
    }

    // Layers with a framebuffer, bottom to top
    fn stack(&self) -> Vec<(LayerId, Arc<DrmFramebuffer>)> {
        let mut stack = self
            .layers
            .iter()
            .filter_map(|(id, fb)| Some((*id, fb.clone()?)))
            .collect::<Vec<_>>();
        stack.sort_by_key(|(id, fb)| (fb.zorder(), *id));
        stack
    }

    fn need_blank(&self, layer_present: bool) -> bool {
        !self.powered || self.power.need_blank_screen(layer_present)
    }

    // Frame

    /// Decides how every layer of the next frame is shown
    ///
    /// Returns the composition of every layer holding a framebuffer.
    #[profiling::function]
    pub fn validate_display(&mut self) -> Result<Vec<(LayerId, Composition)>> {
        let _span = debug_span!(parent: &self.span, "validate_display").entered();
        let stack = self.stack();
        let fbs = stack.iter().map(|(_, fb)| fb.clone()).collect::<Vec<_>>();

        self.plan = None;
        let plan = if self.need_blank(!fbs.is_empty()) {
            debug!("Screen blanked, dropping every layer");
            for fb in &fbs {
                fb.set_composition(Composition::Dummy);
            }
            CompositionPlan {
                unused_planes: self.planes.clone(),
                ..CompositionPlan::default()
            }
        } else {
            self.strategy.decide(&fbs, &self.planes, &mut self.composers)?
        };
        self.plan = Some(plan);

        Ok(stack.into_iter().map(|(id, fb)| (id, fb.composition())).collect())
    }

    // Bounded wait for planes that can not wait for the fence themselves
    fn wait_for_plane(&self, plane: &dyn HwDisplayPlane, fb: &DrmFramebuffer) -> Result<()> {
        if plane.capabilities().contains(PlaneCapabilities::IN_FENCE) {
            return Ok(());
        }
        match fb.wait_acquire_fence(self.config.fence_timeout) {
            Ok(FenceStatus::Signaled) => Ok(()),
            Ok(FenceStatus::NotSignaled) => {
                warn!(plane = plane.id(), fb = fb.id(), "Acquire fence timed out, frame not ready");
                Err(Error::FenceTimeout)
            }
            Err(source) => Err(Error::Access {
                errmsg: "Error waiting for acquire fence",
                source,
            }),
        }
    }

    /// Shows the validated frame
    ///
    /// Validates first if the layers changed since the last validation. Returns a fence
    /// signaling once the frame has been replaced on screen.
    ///
    /// If an acquire fence does not signal within the configured timeout nothing is committed
    /// and [`Error::FenceTimeout`] is returned, presenting again retries the same frame. A
    /// failed plane commit does not stop the others, the first error is returned.
    #[profiling::function]
    pub fn present_display(&mut self) -> Result<DrmFence> {
        let _span = debug_span!(parent: &self.span, "present_display").entered();
        if self.plan.is_none() {
            self.validate_display()?;
        }
        let Some(plan) = self.plan.take() else {
            return Ok(DrmFence::no_fence());
        };

        for assignment in &plan.planes {
            if let Err(err) = self.wait_for_plane(assignment.plane.as_ref(), &assignment.fb) {
                self.plan = Some(plan);
                return Err(err);
            }
        }

        let mut output = None;
        if let Some(assignment) = plan.composer.as_ref() {
            let target = match assignment.composer_type {
                ComposerType::Client => self.client_target.clone(),
                _ => None,
            };
            let damage = assignment
                .inputs
                .iter()
                .map(|fb| fb.display_frame())
                .reduce(|a, b| a.merge(b))
                .into_iter()
                .collect::<Vec<_>>();

            let composer = self.composers.get(assignment.composer_type)?;
            composer.set_output(target, &damage);
            composer.start()?;
            let handed_back = composer.overlay_fbs();
            trace!(handed_back = handed_back.len(), "Composer done");

            if let (Some(fb), Some(plane)) = (composer.output(), assignment.plane.clone()) {
                if let Err(err) = self.wait_for_plane(plane.as_ref(), &fb) {
                    self.plan = Some(plan);
                    return Err(err);
                }
                output = Some((plane, fb, assignment.zorder));
            }
        }

        let mut result = Ok(());
        let mut committed = Vec::new();
        let commits = plan
            .planes
            .iter()
            .map(|a| (a.plane.clone(), a.fb.clone(), a.zorder))
            .chain(output);
        for (plane, fb, zorder) in commits {
            match plane.set_plane(Some(&fb), zorder, BlankOp::Unblank) {
                Ok(()) => committed.push(fb),
                Err(err) => {
                    warn!(plane = plane.id(), "Plane commit failed, retrying next frame: {}", err);
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        for plane in &plan.unused_planes {
            if let Err(err) = plane.set_plane(None, 0, BlankOp::Blank) {
                warn!(plane = plane.id(), "Blanking plane failed: {}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result?;

        let mut present = DrmFence::no_fence();
        for fb in &committed {
            let release = fb.take_release_fence();
            let copy = release.dup().map_err(|source| Error::Access {
                errmsg: "Error duplicating release fence",
                source,
            })?;
            fb.set_release_fence(release);
            present = present.merge(copy);
        }
        Ok(present)
    }

    /// Takes the release fences of the layers shown by the last frame
    ///
    /// A layer's buffer may be reused once its fence signaled. Layers without pending release
    /// are left out.
    pub fn layer_release_fences(&self) -> Vec<(LayerId, DrmFence)> {
        self.layers
            .iter()
            .filter_map(|(id, fb)| {
                let fence = fb.as_ref()?.take_release_fence();
                fence.is_valid().then_some((*id, fence))
            })
            .collect()
    }

    // Events

    /// Handles a sink being attached or removed
    pub fn on_hotplug(&mut self, connected: bool) {
        let _span = debug_span!(parent: &self.span, "hotplug", connected).entered();
        let connected = match self.connector.update() {
            Ok(()) => self.connector.is_connected(),
            Err(err) => {
                warn!("Failed to read connector state: {}", err);
                connected
            }
        };
        info!(connected, "Hotplug");

        self.power.set_connector_status(connected);
        if connected {
            self.update_mode();
        } else {
            self.modes.reset();
            self.vsync.set_software_mode();
        }
        self.plan = None;

        if let Some(handler) = self.events.handler() {
            handler.on_hotplug(connected);
        }
    }

    /// Handles a change of the connector properties
    pub fn on_update(&mut self) {
        let _guard = self.span.enter();
        if let Err(err) = self.connector.update() {
            warn!("Failed to read connector state: {}", err);
        }
        if let Err(err) = self.crtc.update() {
            warn!("Failed to update crtc: {}", err);
        }
        self.plan = None;
        self.request_refresh();
    }

    /// Handles an external mode change
    pub fn on_mode_changed(&mut self) {
        self.update_mode();
        self.plan = None;
        self.request_refresh();
    }

    /// Turns the display on or off
    ///
    /// A display turned off shows nothing until it is turned on again.
    pub fn set_power_mode(&mut self, on: bool) {
        let _span = debug_span!(parent: &self.span, "set_power_mode", on).entered();
        self.powered = on;
        self.power.set_screen_status(!on);
        self.plan = None;

        if on {
            self.request_refresh();
            return;
        }
        for plane in &self.planes {
            if let Err(err) = plane.set_plane(None, 0, BlankOp::Blank) {
                warn!(plane = plane.id(), "Blanking plane failed: {}", err);
            }
        }
    }

    /// Starts or stops vsync events
    pub fn set_vsync_enabled(&self, enabled: bool) {
        self.vsync.set_enabled(enabled);
    }

    // Modes

    /// Mode currently driven
    pub fn active_mode(&self) -> Option<DisplayMode> {
        self.modes.active_mode().cloned()
    }

    /// Switches to the mode called `name`
    pub fn set_active_mode(&mut self, name: &str) -> Result<DisplayMode> {
        let mode = self
            .modes
            .set_active_mode(self.connector.as_ref(), &self.crtc, name)?;
        self.apply_vsync(&mode);
        self.plan = None;
        self.request_refresh();
        Ok(mode)
    }

    fn update_mode(&mut self) {
        match self.modes.update(self.connector.as_ref(), &self.crtc) {
            Ok(mode) => self.apply_vsync(&mode),
            Err(err) => warn!(parent: &self.span, "Mode selection failed, no change: {}", err),
        }
    }

    fn apply_vsync(&self, mode: &DisplayMode) {
        if let Some(period) = mode.vsync_period() {
            self.vsync.set_period(period);
        }
        if self.config.software_vsync {
            if self.vsync.is_hardware_mode() {
                self.vsync.set_software_mode();
            }
        } else {
            self.vsync.set_hw_mode(self.crtc.clone());
        }
    }

    fn request_refresh(&self) {
        if let Some(handler) = self.events.handler() {
            handler.on_refresh();
        }
    }
}

impl Drop for HwcDisplay {
    fn drop(&mut self) {
        self.vsync.set_enabled(false);
        for plane in &self.planes {
            if let Err(err) = plane.set_plane(None, 0, BlankOp::Blank) {
                warn!(parent: &self.span, plane = plane.id(), "Blanking plane failed: {}", err);
            }
        }
        self.manager.release_crtc(&self.connector);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc, Mutex,
        },
        time::Duration,
    };

    use drm_fourcc::DrmFourcc as Fourcc;
    use rustix::event::{eventfd, EventfdFlags};

    use super::{
        CompositionPlan, CompositionStrategy, DisplayEventHandler, HwcDisplay, MultiplanesStrategy, MAX_LAYERS,
    };
    use crate::{
        backend::virtual_device::{VirtualBlitter, VirtualDevice},
        composer::{ComposerPool, ComposerType},
        config::Config,
        error::Error,
        framebuffer::{BufferHandle, BufferUsage, Composition, DrmFramebuffer},
        hw::{ConnectorInfo, ConnectorState, ConnectorType, HwDisplayManager, HwDisplayPlane},
        power::PowerState,
        sync::DrmFence,
        utils::{Monotonic, Rectangle, Time},
    };

    fn setup(config: Config) -> (Arc<VirtualDevice>, HwcDisplay) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let device = Arc::new(VirtualDevice::default_layout());
        let manager = Arc::new(HwDisplayManager::new(device.clone()));
        manager.load_drm_resources().unwrap();
        let display = HwcDisplay::new(manager, ConnectorType::Hdmi, config).unwrap();
        device.take_commits();
        (device, display)
    }

    fn rgba(id: u64, zorder: u32) -> Arc<DrmFramebuffer> {
        Arc::new(
            DrmFramebuffer::new(Some(BufferHandle::new(id, Fourcc::Argb8888, (1920, 1080))))
                .with_display_frame(Rectangle::from_size((1920, 1080).into()))
                .with_zorder(zorder),
        )
    }

    fn amvideo(id: u64) -> DrmFramebuffer {
        DrmFramebuffer::new(Some(
            BufferHandle::new(id, Fourcc::Nv12, (1920, 1080)).with_usage(BufferUsage::VIDEO_OVERLAY),
        ))
    }

    #[test]
    fn selects_mode_on_creation() {
        let (device, display) = setup(Config::default());
        assert_eq!(display.active_mode().unwrap().name, "2160p60hz");
        assert_eq!(device.crtc_mode(1).unwrap().name, "2160p60hz");
        assert!(display.vsync().is_hardware_mode());
        assert_eq!(display.power_state(), PowerState::Boot);
    }

    #[test]
    fn layer_ids() {
        let (_device, mut display) = setup(Config::default());
        let first = display.create_layer().unwrap();
        let second = display.create_layer().unwrap();
        assert_ne!(first, second);

        display.destroy_layer(first).unwrap();
        assert!(matches!(display.destroy_layer(first), Err(Error::InvalidLayer(_))));
        assert!(matches!(
            display.set_layer_buffer(first, rgba(1, 0)),
            Err(Error::InvalidLayer(_))
        ));
        // the lowest free id is reused
        assert_eq!(display.create_layer().unwrap(), first);

        for _ in 2..MAX_LAYERS {
            display.create_layer().unwrap();
        }
        assert!(matches!(display.create_layer(), Err(Error::OutOfLayers)));
    }

    #[test]
    fn video_on_plane_rgba_through_ge2d() {
        let (device, display) = setup(Config::default());
        let blitter = Arc::new(VirtualBlitter::default());
        let mut display = display.with_blitter(blitter.clone());

        let video = Arc::new(amvideo(100));
        let layers = [video.clone(), rgba(101, 1), rgba(102, 2), rgba(103, 3)];
        let mut ids = Vec::new();
        for fb in &layers {
            let id = display.create_layer().unwrap();
            display.set_layer_buffer(id, fb.clone()).unwrap();
            ids.push(id);
        }

        let compositions = display.validate_display().unwrap();
        assert_eq!(compositions.len(), 4);
        assert_eq!(compositions[0], (ids[0], Composition::PlaneAmvideo));
        assert_eq!(compositions[1], (ids[1], Composition::Ge2d));
        assert_eq!(compositions[2], (ids[2], Composition::Ge2d));
        assert_eq!(compositions[3], (ids[3], Composition::PlaneOsd));

        display.present_display().unwrap();
        assert_eq!(blitter.blends().len(), 1);
        assert_eq!(blitter.blends()[0].0, 2);

        let commits = device.take_commits();
        let video_commit = commits.iter().find(|c| c.plane == 33).unwrap();
        assert_eq!(video_commit.buffer, Some(100));
        // the video buffer never reached the blitter
        assert!(commits.iter().filter(|c| c.plane != 33).all(|c| c.buffer != Some(100)));
        assert!(commits.iter().any(|c| c.buffer == Some(103)));
        assert!(commits.iter().any(|c| c.buffer == Some(blitter.blends()[0].1)));
    }

    #[test]
    fn rgba_through_client_without_ge2d() {
        let (device, mut display) = setup(Config::default());
        for (index, fb) in [rgba(1, 0), rgba(2, 1), rgba(3, 2)].into_iter().enumerate() {
            let id = display.create_layer().unwrap();
            display.set_layer_buffer(id, fb).unwrap();
            assert_eq!(id.id(), index as u32);
        }

        let compositions = display.validate_display().unwrap();
        assert_eq!(compositions[0].1, Composition::Client);
        assert_eq!(compositions[1].1, Composition::Client);
        assert_eq!(compositions[2].1, Composition::PlaneOsd);
        assert!(matches!(
            display.present_display(),
            Err(Error::NoOutput(ComposerType::Client))
        ));

        display.set_client_target(Some(rgba(50, 0)));
        display.validate_display().unwrap();
        display.present_display().unwrap();
        let commits = device.take_commits();
        assert!(commits.iter().any(|c| c.buffer == Some(50)));
        assert!(commits.iter().any(|c| c.buffer == Some(3)));
    }

    #[test]
    fn fence_timeout_keeps_frame() {
        let config = Config {
            fence_timeout: Duration::from_millis(5),
            ..Config::default()
        };
        let (device, mut display) = setup(config);

        let producer = eventfd(0, EventfdFlags::CLOEXEC).unwrap();
        let fence = DrmFence::from(producer.try_clone().unwrap());
        let video = Arc::new(amvideo(7).with_acquire_fence(fence));
        let layer = display.create_layer().unwrap();
        display.set_layer_buffer(layer, video).unwrap();

        assert!(matches!(display.present_display(), Err(Error::FenceTimeout)));
        assert!(device.take_commits().is_empty());

        rustix::io::write(&producer, &1u64.to_ne_bytes()).unwrap();
        display.present_display().unwrap();
        let commits = device.take_commits();
        assert!(commits.iter().any(|c| c.plane == 33 && c.buffer == Some(7)));
    }

    #[test]
    fn release_fences_follow_next_frame() {
        let (_device, mut display) = setup(Config::default());
        let layer = display.create_layer().unwrap();
        display.set_layer_buffer(layer, rgba(1, 0)).unwrap();
        let present = display.present_display().unwrap();
        assert!(present.is_valid());
        assert!(!present.is_signaled());

        let fences = display.layer_release_fences();
        assert_eq!(fences.len(), 1);
        assert_eq!(fences[0].0, layer);
        assert!(!fences[0].1.is_signaled());
        assert!(display.layer_release_fences().is_empty());

        display.set_layer_buffer(layer, rgba(2, 0)).unwrap();
        display.present_display().unwrap();
        assert!(fences[0].1.is_signaled());
        assert!(present.is_signaled());
    }

    #[test]
    fn blanking() {
        let (device, mut display) = setup(Config::default());
        let layer = display.create_layer().unwrap();
        display.set_layer_buffer(layer, rgba(1, 0)).unwrap();
        display.present_display().unwrap();
        assert!(device.take_commits().iter().any(|c| c.buffer == Some(1)));

        display.set_power_mode(true);
        assert_eq!(display.power_state(), PowerState::ConnectorIn);

        // unplugging blanks everything
        device.set_connected(10, false);
        display.on_hotplug(false);
        assert_eq!(display.power_state(), PowerState::ConnectorOut);
        assert!(!display.vsync().is_hardware_mode());

        let compositions = display.validate_display().unwrap();
        assert_eq!(compositions[0].1, Composition::Dummy);
        display.present_display().unwrap();
        let commits = device.take_commits();
        assert!(!commits.is_empty());
        assert!(commits.iter().all(|c| c.buffer.is_none()));

        device.set_connected(10, true);
        display.on_hotplug(true);
        assert_eq!(display.power_state(), PowerState::ConnectorIn);
        display.set_power_mode(false);
        display.validate_display().unwrap();
        display.present_display().unwrap();
        assert!(device.take_commits().iter().all(|c| c.buffer.is_none()));
    }

    #[derive(Debug)]
    enum Event {
        Vsync,
        Hotplug(bool),
        Refresh,
    }

    struct Recorder(Mutex<mpsc::Sender<Event>>);

    impl DisplayEventHandler for Recorder {
        fn on_vsync(&self, _timestamp: Time<Monotonic>) {
            let _ = self.0.lock().unwrap().send(Event::Vsync);
        }
        fn on_hotplug(&self, connected: bool) {
            let _ = self.0.lock().unwrap().send(Event::Hotplug(connected));
        }
        fn on_refresh(&self) {
            let _ = self.0.lock().unwrap().send(Event::Refresh);
        }
    }

    #[test]
    fn events_reach_handler() {
        let config = Config {
            software_vsync: true,
            ..Config::default()
        };
        let (device, mut display) = setup(config);
        assert!(!display.vsync().is_hardware_mode());

        let (tx, rx) = mpsc::channel();
        display.set_event_handler(Arc::new(Recorder(Mutex::new(tx))));

        display.set_vsync_enabled(true);
        assert!(matches!(rx.recv_timeout(Duration::from_secs(1)), Ok(Event::Vsync)));
        display.set_vsync_enabled(false);
        while rx.try_recv().is_ok() {}

        device.set_connected(10, false);
        display.on_hotplug(false);
        assert!(matches!(rx.try_recv(), Ok(Event::Hotplug(false))));

        device.set_connected(10, true);
        display.on_hotplug(true);
        assert!(matches!(rx.try_recv(), Ok(Event::Hotplug(true))));
        display.set_active_mode("720p60hz").unwrap();
        assert!(matches!(rx.try_recv(), Ok(Event::Refresh)));
        assert_eq!(display.active_mode().unwrap().name, "720p60hz");
    }

    #[test]
    fn displays_release_their_crtc() {
        let device = Arc::new(VirtualDevice::default_layout());
        let manager = Arc::new(HwDisplayManager::new(device));
        manager.load_drm_resources().unwrap();

        let display = HwcDisplay::new(manager.clone(), ConnectorType::Hdmi, Config::default()).unwrap();
        assert!(matches!(
            manager.connector(ConnectorType::Cvbs),
            Err(Error::ConnectorNotFound(ConnectorType::Cvbs))
        ));
        drop(display);
        let display = HwcDisplay::new(manager, ConnectorType::Hdmi, Config::default()).unwrap();
        assert_eq!(display.planes().len(), 4);
    }

    #[test]
    fn one_display_per_connector() {
        let (_device, display) = setup(Config::default());
        let manager = display.manager.clone();

        let second = HwcDisplay::new(manager.clone(), ConnectorType::Hdmi, Config::default());
        assert!(matches!(second, Err(Error::ConnectorBusy(10))));

        // the failed attempt left the first display bound
        assert_eq!(display.connector().crtc().map(|crtc| crtc.id()), Some(1));
        assert_eq!(display.crtc().connector(), Some(10));
        assert_eq!(manager.planes_for_crtc(display.crtc()).unwrap().len(), 4);

        drop(display);
        assert!(HwcDisplay::new(manager, ConnectorType::Hdmi, Config::default()).is_ok());
    }

    #[test]
    fn failed_creation_claims_nothing() {
        let device = Arc::new(VirtualDevice::default_layout());
        device.add_connector(
            ConnectorInfo {
                id: 200,
                connector_type: ConnectorType::Cvbs,
                possible_crtcs: 0b1,
            },
            ConnectorState::default(),
        );
        let manager = Arc::new(HwDisplayManager::new(device));
        manager.load_drm_resources().unwrap();

        let hdmi = HwcDisplay::new(manager.clone(), ConnectorType::Hdmi, Config::default()).unwrap();
        assert!(matches!(
            HwcDisplay::new(manager.clone(), ConnectorType::Cvbs, Config::default()),
            Err(Error::NoFreeCrtc(200))
        ));
        assert!(manager.connector(ConnectorType::Cvbs).unwrap().crtc().is_none());
        assert_eq!(hdmi.crtc().connector(), Some(10));

        drop(hdmi);
        let cvbs = HwcDisplay::new(manager, ConnectorType::Cvbs, Config::default()).unwrap();
        assert_eq!(cvbs.planes().len(), 4);
    }

    #[test]
    fn failed_blank_on_drop_still_releases() {
        let (device, mut display) = setup(Config::default());
        let layer = display.create_layer().unwrap();
        display.set_layer_buffer(layer, rgba(1, 0)).unwrap();
        display.present_display().unwrap();
        let manager = display.manager.clone();

        device.fail_commits(30, true);
        drop(display);
        assert!(manager.connector(ConnectorType::Hdmi).unwrap().crtc().is_none());
        device.fail_commits(30, false);
    }

    #[derive(Debug)]
    struct Flaky {
        inner: MultiplanesStrategy,
        fail: Arc<AtomicBool>,
    }

    impl CompositionStrategy for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn decide(
            &mut self,
            layers: &[Arc<DrmFramebuffer>],
            planes: &[Arc<dyn HwDisplayPlane>],
            composers: &mut ComposerPool,
        ) -> crate::Result<CompositionPlan> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::ComposerUnavailable(ComposerType::Ge2d));
            }
            self.inner.decide(layers, planes, composers)
        }
    }

    #[test]
    fn failed_validation_drops_previous_frame() {
        let fail = Arc::new(AtomicBool::new(false));
        let (device, display) = setup(Config::default());
        let mut display = display.with_strategy(Box::new(Flaky {
            inner: MultiplanesStrategy::default(),
            fail: fail.clone(),
        }));
        let layer = display.create_layer().unwrap();
        display.set_layer_buffer(layer, rgba(1, 0)).unwrap();
        display.validate_display().unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(display.validate_display().is_err());
        assert!(matches!(
            display.present_display(),
            Err(Error::ComposerUnavailable(ComposerType::Ge2d))
        ));
        assert!(device.take_commits().is_empty());
    }
}
