//! Capability Catalog
//!
//! In-memory model of the services and characteristics discovered on the
//! connected peripheral. Built once per session, sealed before negotiation.

use crate::domain::models::{CapabilityFlag, Characteristic, Service};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityCatalog {
    services: Vec<Service>,
    #[serde(skip)]
    sealed: bool,
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a full enumeration, in discovery order
    pub fn from_services(services: Vec<Service>) -> Self {
        for service in &services {
            debug!("  Service: {}", service.uuid);
            for characteristic in &service.characteristics {
                debug!(
                    "    Characteristic: {} {:?}",
                    characteristic.uuid,
                    characteristic.capabilities.iter().collect::<Vec<_>>()
                );
            }
        }
        Self {
            services,
            sealed: false,
        }
    }

    /// Add a service; refused once the catalog is sealed
    pub fn insert_service(&mut self, service: Service) -> bool {
        if self.sealed {
            warn!("Ignoring service {} added after negotiation began", service.uuid);
            return false;
        }
        self.services.push(service);
        true
    }

    /// Freeze the catalog for the rest of the session
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// All characteristics, services in discovery order
    pub fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
    }

    /// First characteristic (by discovery order) having any of `capabilities`
    ///
    /// The vendor's data characteristic cannot be told apart without its
    /// documentation, so the first capable one is taken.
    pub fn find(&self, capabilities: &[CapabilityFlag]) -> Option<&Characteristic> {
        self.characteristics()
            .find(|characteristic| characteristic.capabilities.intersects(capabilities))
    }

    pub fn find_by_uuid(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics()
            .find(|characteristic| characteristic.uuid == uuid)
    }

    pub fn characteristic_count(&self) -> usize {
        self.characteristics().count()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Drop everything; the next session rebuilds from scratch
    pub fn clear(&mut self) {
        self.services.clear();
        self.sealed = false;
    }
}
