//! Queue message types
//!
//! Point-to-point messages carried inside a tunnel stream. Each data
//! message is numbered by its sender; the receiver may acknowledge it, and
//! the queue provider may hand it back as expired when it cannot be
//! delivered.

use serde::{Deserialize, Serialize};

use crate::messages::{ContainerType, State};
use crate::StreamId;

/// How long the queue provider keeps an undelivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TimeoutPolicy {
    #[default]
    ProviderDefault,
    Infinite,
    /// Expire unless the destination can take it right away
    Immediate,
    Millis(u64),
}

/// Why a queue message could not be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UndeliverableCode {
    Unspecified,
    Expired,
    NoPermission,
    InvalidTarget,
    QueueFull,
    QueueDisabled,
    MaxMsgSize,
    InvalidSender,
    TargetDeleted,
    NoResponse,
}

/// Reason attached to a negative acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NackCode {
    Unspecified,
    AccessDenied,
    DeniedBySource,
    SourceDown,
    NoResources,
    NoResponse,
    InvalidContent,
}

/// Outcome carried by a queue acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckOutcome {
    Ack,
    Nack { code: NackCode, text: String },
}

/// Opens the queue sub-stream for `source_name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRequest {
    pub stream_id: StreamId,
    pub domain_type: u8,
    pub source_name: String,
}

/// The queue sub-stream is open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRefresh {
    pub stream_id: StreamId,
    pub domain_type: u8,
    pub source_name: String,
    pub state: State,
    /// Messages waiting for this source; may be stale when observed
    pub queue_depth: u32,
}

/// State change of the queue sub-stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub stream_id: StreamId,
    pub domain_type: u8,
    pub state: Option<State>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueData {
    pub stream_id: StreamId,
    pub domain_type: u8,
    /// Sender-assigned, strictly increasing, 0 means unset
    pub identifier: u64,
    pub source_name: String,
    pub dest_name: String,
    pub timeout: TimeoutPolicy,
    pub container_type: ContainerType,
    pub payload: Vec<u8>,
    pub queue_depth: u32,
    /// The message may already have been delivered once
    pub possible_duplicate: bool,
    /// The receiver must answer with exactly one ack or nack
    pub ack_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDataExpired {
    pub stream_id: StreamId,
    pub domain_type: u8,
    pub identifier: u64,
    pub source_name: String,
    pub dest_name: String,
    pub container_type: ContainerType,
    pub payload: Vec<u8>,
    pub queue_depth: u32,
    pub possible_duplicate: bool,
    pub undeliverable_code: UndeliverableCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAck {
    pub stream_id: StreamId,
    pub domain_type: u8,
    /// Identifier of the data message being acknowledged
    pub identifier: u64,
    pub source_name: String,
    pub dest_name: String,
    pub outcome: AckOutcome,
}

/// Queue sub-messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueMsg {
    Request(QueueRequest),
    Refresh(QueueRefresh),
    Status(QueueStatus),
    Data(QueueData),
    DataExpired(QueueDataExpired),
    Ack(QueueAck),
}

impl QueueMsg {
    pub fn stream_id(&self) -> StreamId {
        match self {
            QueueMsg::Request(m) => m.stream_id,
            QueueMsg::Refresh(m) => m.stream_id,
            QueueMsg::Status(m) => m.stream_id,
            QueueMsg::Data(m) => m.stream_id,
            QueueMsg::DataExpired(m) => m.stream_id,
            QueueMsg::Ack(m) => m.stream_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueueMsg::Request(_) => "request",
            QueueMsg::Refresh(_) => "refresh",
            QueueMsg::Status(_) => "status",
            QueueMsg::Data(_) => "data",
            QueueMsg::DataExpired(_) => "data-expired",
            QueueMsg::Ack(_) => "ack",
        }
    }
}

impl QueueData {
    /// Turn an undeliverable message into its expired form
    pub fn expire(self, undeliverable_code: UndeliverableCode) -> QueueDataExpired {
        QueueDataExpired {
            stream_id: self.stream_id,
            domain_type: self.domain_type,
            identifier: self.identifier,
            source_name: self.source_name,
            dest_name: self.dest_name,
            container_type: self.container_type,
            payload: self.payload,
            queue_depth: self.queue_depth,
            possible_duplicate: self.possible_duplicate,
            undeliverable_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> QueueData {
        QueueData {
            stream_id: 2000,
            domain_type: crate::domain::QUEUE_MESSAGING,
            identifier: 7,
            source_name: "QUEUE_A".to_string(),
            dest_name: "QUEUE_B".to_string(),
            timeout: TimeoutPolicy::Infinite,
            container_type: ContainerType::FieldList,
            payload: vec![35, 68],
            queue_depth: 3,
            possible_duplicate: true,
            ack_requested: false,
        }
    }

    #[test]
    fn test_expire_keeps_identity() {
        let expired = sample_data().expire(UndeliverableCode::QueueFull);
        assert_eq!(expired.identifier, 7);
        assert_eq!(expired.dest_name, "QUEUE_B");
        assert!(expired.possible_duplicate);
        assert_eq!(expired.undeliverable_code, UndeliverableCode::QueueFull);
    }

    #[test]
    fn test_queue_msg_accessors() {
        let msg = QueueMsg::Data(sample_data());
        assert_eq!(msg.stream_id(), 2000);
        assert_eq!(msg.kind(), "data");
    }
}
