//! Class-of-service negotiation
//!
//! Compares what a consumer requests against what this end supports. The
//! checks run in a fixed order and stop at the first failure.

use omm_tunnel_proto::{
    AuthenticationType, ClassOfService, FlowControlType, GuaranteeType,
};
use thiserror::Error;

/// Why a requested class of service was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CosRejectReason {
    #[error("Protocol type {remote} does not match supported protocol type {local}")]
    ProtocolTypeMismatch { local: u32, remote: u32 },

    #[error("Protocol major version {remote} does not match supported major version {local}")]
    MajorVersionMismatch { local: u32, remote: u32 },

    #[error("Unsupported authentication type {0:?}")]
    UnsupportedAuthentication(AuthenticationType),

    #[error("Unsupported flow control type {0:?}")]
    UnsupportedFlowControl(FlowControlType),

    #[error("Guaranteed streams are not supported (requested {0:?})")]
    GuaranteedStreamsUnsupported(GuaranteeType),
}

/// Negotiate a remote request against the local class of service
///
/// The negotiated result takes the lower minor version, the remote's
/// authentication type, and a receive window raised to at least the
/// maximum fragment size.
pub fn negotiate(
    local: &ClassOfService,
    remote: &ClassOfService,
) -> Result<ClassOfService, CosRejectReason> {
    if remote.protocol_type != local.protocol_type {
        return Err(CosRejectReason::ProtocolTypeMismatch {
            local: local.protocol_type,
            remote: remote.protocol_type,
        });
    }

    if remote.protocol_major_version != local.protocol_major_version {
        return Err(CosRejectReason::MajorVersionMismatch {
            local: local.protocol_major_version,
            remote: remote.protocol_major_version,
        });
    }

    match remote.authentication_type {
        AuthenticationType::NotRequired | AuthenticationType::Login => {}
        other => return Err(CosRejectReason::UnsupportedAuthentication(other)),
    }

    if remote.flow_control_type != FlowControlType::Bidirectional {
        return Err(CosRejectReason::UnsupportedFlowControl(
            remote.flow_control_type,
        ));
    }

    if remote.guarantee_type != GuaranteeType::None {
        return Err(CosRejectReason::GuaranteedStreamsUnsupported(
            remote.guarantee_type,
        ));
    }

    let max_fragment_size = local.max_fragment_size;
    let recv_window_size = remote
        .recv_window_size
        .unwrap_or(max_fragment_size)
        .max(max_fragment_size);

    Ok(ClassOfService {
        protocol_type: local.protocol_type,
        protocol_major_version: local.protocol_major_version,
        protocol_minor_version: local
            .protocol_minor_version
            .min(remote.protocol_minor_version),
        stream_version: local.stream_version,
        max_msg_size: local.max_msg_size.min(remote.max_msg_size),
        max_fragment_size,
        authentication_type: remote.authentication_type,
        flow_control_type: FlowControlType::Bidirectional,
        recv_window_size: Some(recv_window_size),
        data_integrity_type: local.data_integrity_type,
        guarantee_type: GuaranteeType::None,
    })
}

/// The class of service this end would accept instead of `remote`
///
/// Sent back to the consumer when a request is redirected.
pub fn expected_class_of_service(local: &ClassOfService, remote: &ClassOfService) -> ClassOfService {
    let authentication_type = match remote.authentication_type {
        AuthenticationType::Unknown(_) => local.authentication_type,
        supported => supported,
    };

    ClassOfService {
        protocol_type: local.protocol_type,
        protocol_major_version: local.protocol_major_version,
        protocol_minor_version: local
            .protocol_minor_version
            .min(remote.protocol_minor_version),
        authentication_type,
        flow_control_type: FlowControlType::Bidirectional,
        guarantee_type: GuaranteeType::None,
        ..remote.clone()
    }
}
