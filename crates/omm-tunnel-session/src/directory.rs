//! Service directory tracking
//!
//! [`ServiceDirectory`] keeps the merged view of every directory update the
//! reactor has seen. [`ServiceTracker`] follows one named service through
//! those updates and answers whether a tunnel can be opened to it.

use std::collections::BTreeMap;

use omm_tunnel_proto::{DirectoryUpdate, ServiceAction, ServiceEntry, ServiceState};
use tracing::{debug, info};

/// Merged service directory
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    services: BTreeMap<u16, ServiceEntry>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: &DirectoryUpdate) {
        for entry in &update.services {
            match entry.action {
                ServiceAction::Delete => {
                    self.services.remove(&entry.service_id);
                }
                ServiceAction::Add | ServiceAction::Update => {
                    let merged = self
                        .services
                        .entry(entry.service_id)
                        .or_insert_with(|| ServiceEntry::add(entry.service_id, ""));
                    merged.action = ServiceAction::Add;
                    if entry.name.is_some() {
                        merged.name = entry.name.clone();
                    }
                    if entry.capabilities.is_some() {
                        merged.capabilities = entry.capabilities.clone();
                    }
                    if entry.state.is_some() {
                        merged.state = entry.state;
                    }
                }
            }
        }
    }

    /// Current directory as a single update of added services
    pub fn snapshot(&self) -> DirectoryUpdate {
        DirectoryUpdate::new(self.services.values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Availability of the service a consumer session binds to
#[derive(Debug, Clone)]
pub struct ServiceTracker {
    service_name: String,
    domain_type: u8,
    service_id: Option<u16>,
    is_service_found: bool,
    is_service_up: bool,
    is_service_supported: bool,
}

impl ServiceTracker {
    pub fn new(service_name: &str, domain_type: u8) -> Self {
        Self {
            service_name: service_name.to_string(),
            domain_type,
            service_id: None,
            is_service_found: false,
            is_service_up: false,
            is_service_supported: false,
        }
    }

    pub fn apply(&mut self, update: &DirectoryUpdate) {
        for entry in &update.services {
            self.apply_entry(entry);
        }
    }

    fn apply_entry(&mut self, entry: &ServiceEntry) {
        match entry.action {
            ServiceAction::Delete => {
                if self.service_id == Some(entry.service_id) {
                    info!(
                        service_id = entry.service_id,
                        service = %self.service_name,
                        "Bound service deleted"
                    );
                    self.service_id = None;
                    self.is_service_found = false;
                    self.is_service_up = false;
                    self.is_service_supported = false;
                }
            }
            ServiceAction::Add | ServiceAction::Update => {
                if self.service_id.is_none()
                    && entry.name.as_deref() == Some(self.service_name.as_str())
                {
                    debug!(
                        service_id = entry.service_id,
                        service = %self.service_name,
                        "Service found"
                    );
                    self.service_id = Some(entry.service_id);
                    self.is_service_found = true;
                }

                if self.service_id != Some(entry.service_id) {
                    return;
                }

                if let Some(state) = entry.state {
                    self.is_service_up = state.service_state == ServiceState::Up
                        && state.accepting_requests.unwrap_or(true);
                }

                if let Some(capabilities) = &entry.capabilities {
                    self.is_service_supported = capabilities.contains(&self.domain_type);
                }
            }
        }
    }

    pub fn service_id(&self) -> Option<u16> {
        self.service_id
    }

    pub fn is_service_found(&self) -> bool {
        self.is_service_found
    }

    pub fn is_service_up(&self) -> bool {
        self.is_service_up
    }

    pub fn is_service_supported(&self) -> bool {
        self.is_service_supported
    }

    /// Found, up and supporting the tunnel's domain
    pub fn is_available(&self) -> bool {
        self.is_service_found && self.is_service_up && self.is_service_supported
    }
}
