//! Connector handles
//!
//! A connector's connection state and mode table are only known after
//! [`HwDisplayConnector::update`] succeeded once, [`HwDisplayConnector::modes`] returns
//! [`Error::NotLoaded`] before.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use indexmap::IndexMap;
use tracing::{debug, info};

use super::{
    ConnectorInfo, ConnectorState, ConnectorType, DisplayDevice, DisplayMode, HdrCapabilities,
    HwDisplayCrtc,
};
use crate::{
    error::{Error, Result},
    utils::{Raw, Size},
};

/// Modes a composite output can drive
pub const CVBS_MODES: [&str; 2] = ["480cvbs", "576cvbs"];

/// One physical output
pub trait HwDisplayConnector: fmt::Debug + Send + Sync {
    /// Object id
    fn id(&self) -> u32;
    /// Kind of output
    fn connector_type(&self) -> ConnectorType;
    /// Mask of crtc pipes the connector can be routed to
    fn possible_crtcs(&self) -> u32;
    /// Reads the static properties: physical size and HDR capabilities
    fn load_properties(&self) -> Result<()>;
    /// Refreshes the connection state and the mode table
    fn update(&self) -> Result<()>;
    /// Returns whether a sink is attached, `false` before the first update
    fn is_connected(&self) -> bool;
    /// Mode table keyed by mode id
    fn modes(&self) -> Result<IndexMap<u32, DisplayMode>>;
    /// Physical size in millimeters
    fn physical_size(&self) -> Size<i32, Raw>;
    /// HDR formats the sink accepts
    fn hdr_capabilities(&self) -> HdrCapabilities;
    /// Routes the connector to `crtc`
    fn set_crtc(&self, crtc: Option<Arc<HwDisplayCrtc>>);
    /// Crtc the connector is routed to
    fn crtc(&self) -> Option<Arc<HwDisplayCrtc>>;
}

#[derive(Debug, Default)]
struct ConnectorData {
    connected: bool,
    modes: Option<IndexMap<u32, DisplayMode>>,
    physical_size: Size<i32, Raw>,
    hdr: HdrCapabilities,
    crtc: Option<Arc<HwDisplayCrtc>>,
}

#[derive(Debug)]
struct ConnectorBase {
    device: Arc<dyn DisplayDevice>,
    info: ConnectorInfo,
    state: Mutex<ConnectorData>,
}

impl ConnectorBase {
    fn new(device: Arc<dyn DisplayDevice>, info: ConnectorInfo) -> ConnectorBase {
        ConnectorBase {
            device,
            info,
            state: Mutex::new(ConnectorData::default()),
        }
    }

    fn read_state(&self) -> Result<ConnectorState> {
        self.device
            .connector_state(self.info.id)
            .map_err(|source| Error::Access {
                errmsg: "Error reading connector state",
                source,
            })
    }

    fn load_properties(&self, with_hdr: bool) -> Result<()> {
        let props = self.read_state()?;
        let mut state = self.state.lock().unwrap();
        state.physical_size = props.physical_size;
        if with_hdr {
            state.hdr = props.hdr;
        }
        Ok(())
    }

    fn update(&self, always_connected: bool, keep: impl Fn(&DisplayMode) -> bool) -> Result<()> {
        let props = self.read_state()?;
        let mut state = self.state.lock().unwrap();

        let connected = always_connected || props.connected;
        if connected != state.connected {
            info!(
                connector = self.info.id,
                kind = ?self.info.connector_type,
                connected,
                "Connector state changed"
            );
        }
        state.connected = connected;
        if props.physical_size.w > 0 && props.physical_size.h > 0 {
            state.physical_size = props.physical_size;
        }

        let physical_size = state.physical_size;
        let modes = props
            .modes
            .into_iter()
            .filter(|mode| keep(mode))
            .map(|mut mode| {
                if mode.dpi == (0, 0) {
                    mode.dpi = dpi(mode.size.w, physical_size.w, mode.size.h, physical_size.h);
                }
                mode
            })
            .enumerate()
            .map(|(id, mode)| (id as u32, mode))
            .collect::<IndexMap<_, _>>();
        debug!(connector = self.info.id, modes = modes.len(), "Mode table updated");
        state.modes = Some(modes);
        Ok(())
    }

    fn modes(&self) -> Result<IndexMap<u32, DisplayMode>> {
        self.state.lock().unwrap().modes.clone().ok_or(Error::NotLoaded)
    }
}

fn dpi(width: i32, width_mm: i32, height: i32, height_mm: i32) -> (u32, u32) {
    let axis = |pixels: i32, mm: i32| {
        if mm <= 0 || pixels <= 0 {
            0
        } else {
            (pixels as u32 * 254) / (mm as u32 * 10)
        }
    };
    (axis(width, width_mm), axis(height, height_mm))
}

macro_rules! connector_base_impl {
    () => {
        fn id(&self) -> u32 {
            self.base.info.id
        }

        fn connector_type(&self) -> ConnectorType {
            self.base.info.connector_type
        }

        fn possible_crtcs(&self) -> u32 {
            self.base.info.possible_crtcs
        }

        fn modes(&self) -> Result<IndexMap<u32, DisplayMode>> {
            self.base.modes()
        }

        fn physical_size(&self) -> Size<i32, Raw> {
            self.base.state.lock().unwrap().physical_size
        }

        fn hdr_capabilities(&self) -> HdrCapabilities {
            self.base.state.lock().unwrap().hdr
        }

        fn set_crtc(&self, crtc: Option<Arc<HwDisplayCrtc>>) {
            self.base.state.lock().unwrap().crtc = crtc;
        }

        fn crtc(&self) -> Option<Arc<HwDisplayCrtc>> {
            self.base.state.lock().unwrap().crtc.clone()
        }
    };
}

/// HDMI output, the only one reporting HDR capabilities
#[derive(Debug)]
pub struct HdmiConnector {
    base: ConnectorBase,
}

impl HwDisplayConnector for HdmiConnector {
    connector_base_impl!();

    fn load_properties(&self) -> Result<()> {
        self.base.load_properties(true)
    }

    fn update(&self) -> Result<()> {
        self.base.update(false, |_| true)
    }

    fn is_connected(&self) -> bool {
        self.base.state.lock().unwrap().connected
    }
}

/// Composite output, limited to the standard definition modes
#[derive(Debug)]
pub struct CvbsConnector {
    base: ConnectorBase,
}

impl HwDisplayConnector for CvbsConnector {
    connector_base_impl!();

    fn load_properties(&self) -> Result<()> {
        self.base.load_properties(false)
    }

    fn update(&self) -> Result<()> {
        self.base
            .update(false, |mode| CVBS_MODES.contains(&mode.name.as_str()))
    }

    fn is_connected(&self) -> bool {
        self.base.state.lock().unwrap().connected
    }
}

/// Built-in panel, connected for as long as it exists
#[derive(Debug)]
pub struct PanelConnector {
    base: ConnectorBase,
}

impl HwDisplayConnector for PanelConnector {
    connector_base_impl!();

    fn load_properties(&self) -> Result<()> {
        self.base.load_properties(false)
    }

    fn update(&self) -> Result<()> {
        self.base.update(true, |_| true)
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Creates the connector handle matching the enumerated connector kind
pub(crate) fn create_connector(
    device: Arc<dyn DisplayDevice>,
    info: ConnectorInfo,
) -> Arc<dyn HwDisplayConnector> {
    let base = ConnectorBase::new(device, info);
    match info.connector_type {
        ConnectorType::Hdmi => Arc::new(HdmiConnector { base }),
        ConnectorType::Cvbs => Arc::new(CvbsConnector { base }),
        ConnectorType::Panel => Arc::new(PanelConnector { base }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{create_connector, dpi};
    use crate::{
        backend::virtual_device::VirtualDevice,
        error::Error,
        hw::{ConnectorInfo, ConnectorState, ConnectorType, DisplayMode, HdrCapabilities},
    };

    fn modes() -> Vec<DisplayMode> {
        vec![
            DisplayMode::new("1080p60hz", (1920, 1080), 60_000).preferred(),
            DisplayMode::new("480cvbs", (720, 480), 60_000),
            DisplayMode::new("576cvbs", (720, 576), 50_000),
        ]
    }

    fn device_with(kind: ConnectorType, connected: bool) -> Arc<VirtualDevice> {
        Arc::new(VirtualDevice::new().with_crtc(10, 0).with_connector(
            ConnectorInfo {
                id: 20,
                connector_type: kind,
                possible_crtcs: 1,
            },
            ConnectorState {
                connected,
                modes: modes(),
                physical_size: (600, 340).into(),
                hdr: HdrCapabilities {
                    hdr10: true,
                    ..Default::default()
                },
            },
        ))
    }

    #[test]
    fn modes_require_update() {
        let device = device_with(ConnectorType::Hdmi, true);
        let connector = create_connector(device.clone(), device.connector_info(20).unwrap());
        assert!(matches!(connector.modes(), Err(Error::NotLoaded)));
        assert!(!connector.is_connected());

        connector.update().unwrap();
        assert!(connector.is_connected());
        let modes = connector.modes().unwrap();
        assert_eq!(modes.len(), 3);
        assert_eq!(modes[&0].name, "1080p60hz");
    }

    #[test]
    fn hdmi_reports_hdr() {
        let device = device_with(ConnectorType::Hdmi, true);
        let connector = create_connector(device.clone(), device.connector_info(20).unwrap());
        connector.load_properties().unwrap();
        assert!(connector.hdr_capabilities().hdr10);
        assert_eq!(connector.physical_size(), (600, 340).into());

        let device = device_with(ConnectorType::Cvbs, true);
        let connector = create_connector(device.clone(), device.connector_info(20).unwrap());
        connector.load_properties().unwrap();
        assert!(!connector.hdr_capabilities().hdr10);
    }

    #[test]
    fn cvbs_keeps_standard_definition_modes() {
        let device = device_with(ConnectorType::Cvbs, true);
        let connector = create_connector(device.clone(), device.connector_info(20).unwrap());
        connector.update().unwrap();
        let names = connector
            .modes()
            .unwrap()
            .values()
            .map(|mode| mode.name.clone())
            .collect::<Vec<_>>();
        assert_eq!(names, ["480cvbs", "576cvbs"]);
    }

    #[test]
    fn panel_is_always_connected() {
        let device = device_with(ConnectorType::Panel, false);
        let connector = create_connector(device.clone(), device.connector_info(20).unwrap());
        connector.update().unwrap();
        assert!(connector.is_connected());
    }

    #[test]
    fn hotplug_is_picked_up_by_update() {
        let device = device_with(ConnectorType::Hdmi, false);
        let connector = create_connector(device.clone(), device.connector_info(20).unwrap());
        connector.update().unwrap();
        assert!(!connector.is_connected());
        device.set_connected(20, true);
        connector.update().unwrap();
        assert!(connector.is_connected());
    }

    #[test]
    fn dpi_from_physical_size() {
        assert_eq!(dpi(1920, 508, 1080, 0), (96, 0));
        assert_eq!(dpi(1920, 0, 1080, 0), (0, 0));
    }
}
