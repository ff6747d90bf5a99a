//! Inventory of the display hardware
//!
//! The [`HwDisplayManager`] owns every crtc, connector and plane of a [`DisplayDevice`]. It is
//! created once by the display service and shared with every display through an `Arc`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hwcomposer::{backend::virtual_device::VirtualDevice, hw::{ConnectorType, HwDisplayManager}};
//!
//! let device = Arc::new(VirtualDevice::default_layout());
//! let manager = HwDisplayManager::new(device);
//! manager.load_drm_resources()?;
//!
//! let connector = manager.connector(ConnectorType::Hdmi)?;
//! let crtc = manager.crtc_for_connector(&connector)?;
//! let planes = manager.planes_for_crtc(&crtc)?;
//! # Ok::<(), hwcomposer::Error>(())
//! ```

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
};

use indexmap::IndexMap;
use tracing::{debug, info, info_span, warn};

use super::{
    connector::create_connector, plane::create_plane, ConnectorInfo, ConnectorType, CrtcInfo,
    DisplayDevice, HwDisplayConnector, HwDisplayCrtc, HwDisplayPlane, PlaneInfo,
};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Resources {
    loaded: bool,
    crtcs: IndexMap<u32, Arc<HwDisplayCrtc>>,
    connectors: IndexMap<u32, Arc<dyn HwDisplayConnector>>,
    planes: IndexMap<u32, Arc<dyn HwDisplayPlane>>,
    // plane id -> crtc id
    plane_owners: HashMap<u32, u32>,
}

/// Owner of the crtcs, connectors and planes of one device
#[derive(Debug)]
pub struct HwDisplayManager {
    device: Arc<dyn DisplayDevice>,
    resources: Mutex<Resources>,
    span: tracing::Span,
}

impl HwDisplayManager {
    /// Creates a manager for `device`, nothing is loaded yet
    pub fn new(device: Arc<dyn DisplayDevice>) -> HwDisplayManager {
        HwDisplayManager {
            device,
            resources: Mutex::new(Resources::default()),
            span: info_span!("hwc_manager"),
        }
    }

    /// Device the resources belong to
    pub fn device(&self) -> &Arc<dyn DisplayDevice> {
        &self.device
    }

    /// Enumerates the device resources
    ///
    /// Can be called again to pick up resources that appeared since. Resources already known
    /// keep their handle, so references held by a display stay valid. If the enumeration fails
    /// nothing changes and the error is returned.
    pub fn load_drm_resources(&self) -> Result<()> {
        let _guard = self.span.enter();

        let enumerate = || -> io::Result<(Vec<CrtcInfo>, Vec<ConnectorInfo>, Vec<PlaneInfo>)> {
            Ok((self.device.crtcs()?, self.device.connectors()?, self.device.planes()?))
        };
        let (crtcs, connectors, planes) = enumerate().map_err(|source| {
            warn!("Failed to enumerate display resources: {}", source);
            Error::Access {
                errmsg: "Error enumerating display resources",
                source,
            }
        })?;

        let mut resources = self.resources.lock().unwrap();
        self.load_crtcs(&mut resources, crtcs);
        self.load_connectors(&mut resources, connectors);
        self.load_planes(&mut resources, planes);
        resources.loaded = true;

        info!(
            crtcs = resources.crtcs.len(),
            connectors = resources.connectors.len(),
            planes = resources.planes.len(),
            "Display resources loaded"
        );
        Ok(())
    }

    fn load_crtcs(&self, resources: &mut Resources, crtcs: Vec<CrtcInfo>) {
        for info in crtcs {
            resources.crtcs.entry(info.id).or_insert_with(|| {
                debug!(crtc = info.id, pipe = info.pipe, "New crtc");
                Arc::new(HwDisplayCrtc::new(self.device.clone(), info))
            });
        }
    }

    fn load_connectors(&self, resources: &mut Resources, connectors: Vec<ConnectorInfo>) {
        for info in connectors {
            resources.connectors.entry(info.id).or_insert_with(|| {
                debug!(connector = info.id, kind = ?info.connector_type, "New connector");
                let connector = create_connector(self.device.clone(), info);
                if let Err(err) = connector.load_properties() {
                    warn!(connector = info.id, "Failed to load connector properties: {}", err);
                }
                connector
            });
        }
    }

    fn load_planes(&self, resources: &mut Resources, planes: Vec<PlaneInfo>) {
        for info in planes {
            let id = info.id;
            resources.planes.entry(id).or_insert_with(|| {
                debug!(plane = id, kind = ?info.plane_type, zorder = ?info.fixed_zorder, "New plane");
                create_plane(self.device.clone(), info)
            });
        }
    }

    /// Every plane of the device
    pub fn planes(&self) -> Result<Vec<Arc<dyn HwDisplayPlane>>> {
        let resources = self.loaded()?;
        Ok(resources.planes.values().cloned().collect())
    }

    /// Every crtc of the device
    pub fn crtcs(&self) -> Result<Vec<Arc<HwDisplayCrtc>>> {
        let resources = self.loaded()?;
        Ok(resources.crtcs.values().cloned().collect())
    }

    /// Every connector of the device
    pub fn connectors(&self) -> Result<Vec<Arc<dyn HwDisplayConnector>>> {
        let resources = self.loaded()?;
        Ok(resources.connectors.values().cloned().collect())
    }

    /// First connector of the given kind
    pub fn connector(&self, connector_type: ConnectorType) -> Result<Arc<dyn HwDisplayConnector>> {
        let resources = self.loaded()?;
        resources
            .connectors
            .values()
            .find(|connector| connector.connector_type() == connector_type)
            .cloned()
            .ok_or(Error::ConnectorNotFound(connector_type))
    }

    /// Routes `connector` to a crtc
    ///
    /// Picks the first crtc the connector can be routed to that drives no other connector. A
    /// connector is routed once, [`Error::ConnectorBusy`] is returned until
    /// [`HwDisplayManager::release_crtc`] was called for it.
    pub fn crtc_for_connector(&self, connector: &Arc<dyn HwDisplayConnector>) -> Result<Arc<HwDisplayCrtc>> {
        let resources = self.loaded()?;
        if connector.crtc().is_some() {
            return Err(Error::ConnectorBusy(connector.id()));
        }

        let crtc = resources
            .crtcs
            .values()
            .filter(|crtc| connector.possible_crtcs() & crtc.mask() != 0)
            .find(|crtc| crtc.bind(connector.id()))
            .cloned()
            .ok_or(Error::NoFreeCrtc(connector.id()))?;

        debug!(connector = connector.id(), crtc = crtc.id(), "Connector routed");
        connector.set_crtc(Some(crtc.clone()));
        Ok(crtc)
    }

    /// Detaches `connector` from its crtc and frees the crtc's planes
    pub fn release_crtc(&self, connector: &Arc<dyn HwDisplayConnector>) {
        if let Some(crtc) = connector.crtc() {
            let mut resources = self.resources.lock().unwrap();
            resources.plane_owners.retain(|_, owner| *owner != crtc.id());
            crtc.unbind();
            connector.set_crtc(None);
        }
    }

    /// Planes usable by `crtc`
    ///
    /// Planes not used by another crtc yet are claimed for `crtc` until
    /// [`HwDisplayManager::release_crtc`] is called for its connector.
    pub fn planes_for_crtc(&self, crtc: &HwDisplayCrtc) -> Result<Vec<Arc<dyn HwDisplayPlane>>> {
        let mut resources = self.loaded()?;
        let resources = &mut *resources;

        let planes = resources
            .planes
            .values()
            .filter(|plane| plane.possible_crtcs() & crtc.mask() != 0)
            .filter(|plane| {
                *resources
                    .plane_owners
                    .entry(plane.id())
                    .or_insert_with(|| crtc.id())
                    == crtc.id()
            })
            .cloned()
            .collect::<Vec<_>>();
        Ok(planes)
    }

    fn loaded(&self) -> Result<std::sync::MutexGuard<'_, Resources>> {
        let resources = self.resources.lock().unwrap();
        if !resources.loaded {
            return Err(Error::NotLoaded);
        }
        Ok(resources)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::HwDisplayManager;
    use crate::{
        backend::virtual_device::VirtualDevice,
        error::Error,
        hw::{ConnectorInfo, ConnectorState, ConnectorType, PlaneType},
    };

    #[test]
    fn accessors_fail_before_load() {
        let manager = HwDisplayManager::new(Arc::new(VirtualDevice::default_layout()));
        assert!(matches!(manager.planes(), Err(Error::NotLoaded)));
        assert!(matches!(manager.crtcs(), Err(Error::NotLoaded)));
        assert!(matches!(manager.connector(ConnectorType::Hdmi), Err(Error::NotLoaded)));
    }

    #[test]
    fn enumeration_failure_leaves_collections_empty() {
        let device = Arc::new(VirtualDevice::default_layout());
        device.fail_enumeration(true);
        let manager = HwDisplayManager::new(device.clone());
        assert!(matches!(manager.load_drm_resources(), Err(Error::Access { .. })));
        assert!(matches!(manager.planes(), Err(Error::NotLoaded)));

        device.fail_enumeration(false);
        manager.load_drm_resources().unwrap();
        assert_eq!(manager.planes().unwrap().len(), 4);
    }

    #[test]
    fn rescan_keeps_existing_handles() {
        let device = Arc::new(VirtualDevice::default_layout());
        let manager = HwDisplayManager::new(device.clone());
        manager.load_drm_resources().unwrap();
        let hdmi = manager.connector(ConnectorType::Hdmi).unwrap();

        device.add_connector(
            ConnectorInfo {
                id: 200,
                connector_type: ConnectorType::Cvbs,
                possible_crtcs: 0b1,
            },
            ConnectorState::default(),
        );
        manager.load_drm_resources().unwrap();

        assert!(Arc::ptr_eq(&hdmi, &manager.connector(ConnectorType::Hdmi).unwrap()));
        assert_eq!(manager.connectors().unwrap().len(), 2);
        assert_eq!(
            manager.connector(ConnectorType::Cvbs).unwrap().id(),
            200
        );
        assert!(matches!(
            manager.connector(ConnectorType::Panel),
            Err(Error::ConnectorNotFound(ConnectorType::Panel))
        ));
    }

    #[test]
    fn crtcs_and_planes_are_not_shared() {
        let device = Arc::new(VirtualDevice::default_layout());
        device.add_connector(
            ConnectorInfo {
                id: 200,
                connector_type: ConnectorType::Cvbs,
                possible_crtcs: 0b1,
            },
            ConnectorState::default(),
        );
        let manager = HwDisplayManager::new(device);
        manager.load_drm_resources().unwrap();

        let hdmi = manager.connector(ConnectorType::Hdmi).unwrap();
        let cvbs = manager.connector(ConnectorType::Cvbs).unwrap();
        let crtc = manager.crtc_for_connector(&hdmi).unwrap();
        assert!(matches!(
            manager.crtc_for_connector(&hdmi),
            Err(Error::ConnectorBusy(10))
        ));
        assert!(Arc::ptr_eq(&crtc, &hdmi.crtc().unwrap()));
        assert!(matches!(
            manager.crtc_for_connector(&cvbs),
            Err(Error::NoFreeCrtc(200))
        ));

        let planes = manager.planes_for_crtc(&crtc).unwrap();
        assert_eq!(planes.len(), 4);
        assert!(planes.iter().any(|p| p.plane_type() == PlaneType::Cursor));

        manager.release_crtc(&hdmi);
        assert!(hdmi.crtc().is_none());
        let crtc = manager.crtc_for_connector(&cvbs).unwrap();
        assert_eq!(manager.planes_for_crtc(&crtc).unwrap().len(), 4);
    }
}
