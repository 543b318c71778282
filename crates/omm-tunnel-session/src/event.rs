//! Events produced by the reactor

use omm_tunnel_proto::{
    ClassOfService, QueueAck, QueueData, QueueDataExpired, QueueRefresh, QueueStatus, State,
    StreamId, TunnelPayload,
};

use crate::session::CloseCause;

/// A consumer asking a provider to open a tunnel stream
///
/// Answer with `Reactor::accept` or `Reactor::reject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub stream_id: StreamId,
    pub domain_type: u8,
    pub service_id: u16,
    pub name: String,
    pub class_of_service: ClassOfService,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReactorEvent {
    TunnelRequest(TunnelRequest),
    TunnelOpened {
        stream_id: StreamId,
        class_of_service: ClassOfService,
    },
    TunnelClosed {
        stream_id: StreamId,
        state: State,
        cause: CloseCause,
        /// Class of service the peer would accept, sent with a redirect
        expected_cos: Option<ClassOfService>,
    },
    /// Non-terminal status change
    Status { stream_id: StreamId, state: State },
    LoginAccepted { stream_id: StreamId, user_name: String },
    /// Opaque or generic payload
    Message {
        stream_id: StreamId,
        payload: TunnelPayload,
    },
    QueueRefresh {
        stream_id: StreamId,
        refresh: QueueRefresh,
    },
    QueueStatus {
        stream_id: StreamId,
        status: QueueStatus,
    },
    QueueData {
        stream_id: StreamId,
        data: QueueData,
        /// The application must call `ack` or `nack` for this message
        ack_required: bool,
    },
    QueueDataExpired {
        stream_id: StreamId,
        expired: QueueDataExpired,
    },
    QueueAck { stream_id: StreamId, ack: QueueAck },
}

impl ReactorEvent {
    /// Tunnel stream the event belongs to
    pub fn stream_id(&self) -> StreamId {
        match self {
            ReactorEvent::TunnelRequest(request) => request.stream_id,
            ReactorEvent::TunnelOpened { stream_id, .. }
            | ReactorEvent::TunnelClosed { stream_id, .. }
            | ReactorEvent::Status { stream_id, .. }
            | ReactorEvent::LoginAccepted { stream_id, .. }
            | ReactorEvent::Message { stream_id, .. }
            | ReactorEvent::QueueRefresh { stream_id, .. }
            | ReactorEvent::QueueStatus { stream_id, .. }
            | ReactorEvent::QueueData { stream_id, .. }
            | ReactorEvent::QueueDataExpired { stream_id, .. }
            | ReactorEvent::QueueAck { stream_id, .. } => *stream_id,
        }
    }
}
