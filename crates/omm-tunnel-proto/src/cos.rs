//! Class of service descriptors
//!
//! A class of service is the capability set governing one tunnel stream.
//! Each side holds its own desired copy and the copy requested by the peer;
//! negotiation compares the two field by field.

use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_MAX_MSG_SIZE, MAX_FRAGMENT_SIZE, PROTOCOL_TYPE_RWF, RWF_MAJOR_VERSION,
    RWF_MINOR_VERSION,
};

/// How the tunnel authenticates its user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AuthenticationType {
    #[default]
    NotRequired,
    /// Login sub-message exchanged inside the tunnel
    Login,
    /// Value received from a peer that this side does not know
    Unknown(u32),
}

/// Flow control applied to the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FlowControlType {
    None,
    #[default]
    Bidirectional,
}

/// Data integrity requested for the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataIntegrityType {
    BestEffort,
    #[default]
    Reliable,
}

/// Delivery guarantee requested for the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GuaranteeType {
    #[default]
    None,
    /// Messages are persisted by the queue provider
    PersistentQueue,
}

/// Capability set of a tunnel stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassOfService {
    pub protocol_type: u32,
    pub protocol_major_version: u32,
    pub protocol_minor_version: u32,
    pub stream_version: u32,
    pub max_msg_size: u32,
    pub max_fragment_size: u32,
    pub authentication_type: AuthenticationType,
    pub flow_control_type: FlowControlType,
    /// Receive window in bytes; `None` lets the provider choose
    pub recv_window_size: Option<u32>,
    pub data_integrity_type: DataIntegrityType,
    pub guarantee_type: GuaranteeType,
}

impl Default for ClassOfService {
    fn default() -> Self {
        Self {
            protocol_type: PROTOCOL_TYPE_RWF,
            protocol_major_version: RWF_MAJOR_VERSION,
            protocol_minor_version: RWF_MINOR_VERSION,
            stream_version: 1,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_fragment_size: MAX_FRAGMENT_SIZE,
            authentication_type: AuthenticationType::NotRequired,
            flow_control_type: FlowControlType::Bidirectional,
            recv_window_size: None,
            data_integrity_type: DataIntegrityType::Reliable,
            guarantee_type: GuaranteeType::None,
        }
    }
}

impl ClassOfService {
    pub fn with_authentication(mut self, authentication_type: AuthenticationType) -> Self {
        self.authentication_type = authentication_type;
        self
    }

    pub fn with_guarantee(mut self, guarantee_type: GuaranteeType) -> Self {
        self.guarantee_type = guarantee_type;
        self
    }

    pub fn with_flow_control(mut self, flow_control_type: FlowControlType) -> Self {
        self.flow_control_type = flow_control_type;
        self
    }

    pub fn with_recv_window_size(mut self, size: u32) -> Self {
        self.recv_window_size = Some(size);
        self
    }

    pub fn with_version(mut self, major: u32, minor: u32) -> Self {
        self.protocol_major_version = major;
        self.protocol_minor_version = minor;
        self
    }

    pub fn requires_login(&self) -> bool {
        self.authentication_type == AuthenticationType::Login
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_rwf_bidirectional() {
        let cos = ClassOfService::default();
        assert_eq!(cos.protocol_type, PROTOCOL_TYPE_RWF);
        assert_eq!(cos.flow_control_type, FlowControlType::Bidirectional);
        assert_eq!(cos.guarantee_type, GuaranteeType::None);
        assert!(!cos.requires_login());
    }

    #[test]
    fn test_builder_helpers() {
        let cos = ClassOfService::default()
            .with_authentication(AuthenticationType::Login)
            .with_version(14, 0)
            .with_recv_window_size(1024);

        assert!(cos.requires_login());
        assert_eq!(cos.protocol_minor_version, 0);
        assert_eq!(cos.recv_window_size, Some(1024));
    }
}
