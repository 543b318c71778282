//! Service directory records
//!
//! The directory feed itself is delivered by another component; these are
//! the records it hands over, one per service added, changed or removed.

use serde::{Deserialize, Serialize};

/// What happened to a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceAction {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    Down,
    Up,
}

/// State filter of a service entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStateInfo {
    pub service_state: ServiceState,
    /// Absent when the provider does not advertise it
    pub accepting_requests: Option<bool>,
}

/// One service in a directory update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub action: ServiceAction,
    pub service_id: u16,
    pub name: Option<String>,
    /// Domain types the service supports
    pub capabilities: Option<Vec<u8>>,
    pub state: Option<ServiceStateInfo>,
}

impl ServiceEntry {
    pub fn add(service_id: u16, name: &str) -> Self {
        Self {
            action: ServiceAction::Add,
            service_id,
            name: Some(name.to_string()),
            capabilities: None,
            state: None,
        }
    }

    pub fn update(service_id: u16) -> Self {
        Self {
            action: ServiceAction::Update,
            service_id,
            name: None,
            capabilities: None,
            state: None,
        }
    }

    pub fn delete(service_id: u16) -> Self {
        Self {
            action: ServiceAction::Delete,
            service_id,
            name: None,
            capabilities: None,
            state: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<u8>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_state(mut self, service_state: ServiceState, accepting_requests: Option<bool>) -> Self {
        self.state = Some(ServiceStateInfo {
            service_state,
            accepting_requests,
        });
        self
    }
}

/// A batch of service entries delivered together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUpdate {
    pub services: Vec<ServiceEntry>,
}

impl DirectoryUpdate {
    pub fn new(services: Vec<ServiceEntry>) -> Self {
        Self { services }
    }
}
