//! Queue messaging over a tunnel stream
//!
//! Point-to-point messages with per-session identifiers, optional
//! acknowledgement and expiry. One queue sub-stream per tunnel.

use std::collections::BTreeMap;

use omm_tunnel_proto::{
    AckOutcome, ContainerType, QueueAck, QueueData, QueueDataExpired, QueueMsg, QueueRefresh,
    QueueRequest, QueueStatus, State, StateCode, StreamId, TimeoutPolicy,
};
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};

/// Sub-stream id of the queue stream inside a tunnel
pub const QUEUE_STREAM_ID: StreamId = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Closed,
    Requested,
    Open,
}

/// Options for an outgoing queue message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSendOptions {
    pub timeout: TimeoutPolicy,
    pub container_type: ContainerType,
    pub ack_requested: bool,
}

impl Default for QueueSendOptions {
    fn default() -> Self {
        Self {
            timeout: TimeoutPolicy::Infinite,
            container_type: ContainerType::FieldList,
            ack_requested: true,
        }
    }
}

/// An inbound message still waiting for its Ack or Nack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    pub stream_id: StreamId,
    pub domain_type: u8,
    pub identifier: u64,
    /// Destination of the original message, i.e. this end
    pub source_name: String,
    /// Sender of the original message
    pub dest_name: String,
}

impl PendingAck {
    fn for_data(data: &QueueData) -> Self {
        Self {
            stream_id: data.stream_id,
            domain_type: data.domain_type,
            identifier: data.identifier,
            source_name: data.dest_name.clone(),
            dest_name: data.source_name.clone(),
        }
    }

    pub fn into_ack(self, outcome: AckOutcome) -> QueueAck {
        QueueAck {
            stream_id: self.stream_id,
            domain_type: self.domain_type,
            identifier: self.identifier,
            source_name: self.source_name,
            dest_name: self.dest_name,
            outcome,
        }
    }
}

#[derive(Debug)]
pub struct QueueLayer {
    domain_type: u8,
    phase: QueuePhase,
    source_name: Option<String>,
    /// Last identifier assigned; 0 means none yet
    last_identifier: u64,
    /// Ack-requested messages sent and not yet acknowledged or expired
    in_flight: BTreeMap<u64, String>,
    queue_depth: u32,
}

impl QueueLayer {
    pub fn new(domain_type: u8) -> Self {
        Self {
            domain_type,
            phase: QueuePhase::Closed,
            source_name: None,
            last_identifier: 0,
            in_flight: BTreeMap::new(),
            queue_depth: 0,
        }
    }

    /// Build the request that opens the queue sub-stream
    pub fn request(&mut self, source_name: &str) -> SessionResult<QueueMsg> {
        if self.phase != QueuePhase::Closed {
            return Err(SessionError::QueueAlreadyRequested);
        }

        self.phase = QueuePhase::Requested;
        self.source_name = Some(source_name.to_string());

        Ok(QueueMsg::Request(QueueRequest {
            stream_id: QUEUE_STREAM_ID,
            domain_type: self.domain_type,
            source_name: source_name.to_string(),
        }))
    }

    /// Answer a consumer's queue request on the provider end
    pub fn answer_request(&mut self, request: &QueueRequest, queue_capable: bool) -> QueueMsg {
        if !queue_capable {
            warn!(source = %request.source_name, "Queue request refused: not queue capable");
            return QueueMsg::Status(QueueStatus {
                stream_id: request.stream_id,
                domain_type: request.domain_type,
                state: Some(State::closed(
                    StateCode::UsageError,
                    "Provider does not support queue messaging",
                )),
            });
        }

        self.phase = QueuePhase::Open;
        if self.source_name.is_none() {
            self.source_name = Some(request.source_name.clone());
        }

        QueueMsg::Refresh(QueueRefresh {
            stream_id: request.stream_id,
            domain_type: request.domain_type,
            source_name: request.source_name.clone(),
            state: State::open_ok("Queue stream open"),
            queue_depth: 0,
        })
    }

    pub fn on_refresh(&mut self, refresh: &QueueRefresh) {
        self.queue_depth = refresh.queue_depth;
        self.phase = if refresh.state.is_final() {
            QueuePhase::Closed
        } else {
            QueuePhase::Open
        };
    }

    pub fn on_status(&mut self, status: &QueueStatus) {
        if status.state.as_ref().is_some_and(State::is_final) {
            self.phase = QueuePhase::Closed;
        }
    }

    /// Next outgoing message; its identifier is reserved only by `on_sent`
    pub fn prepare(
        &self,
        dest_name: &str,
        payload: Vec<u8>,
        options: &QueueSendOptions,
    ) -> SessionResult<QueueData> {
        if self.phase != QueuePhase::Open {
            return Err(SessionError::QueueNotOpen);
        }

        Ok(QueueData {
            stream_id: QUEUE_STREAM_ID,
            domain_type: self.domain_type,
            identifier: self.last_identifier + 1,
            source_name: self.source_name.clone().unwrap_or_default(),
            dest_name: dest_name.to_string(),
            timeout: options.timeout,
            container_type: options.container_type,
            payload,
            queue_depth: 0,
            possible_duplicate: false,
            ack_requested: options.ack_requested,
        })
    }

    pub fn on_sent(&mut self, data: &QueueData) {
        self.last_identifier = data.identifier;
        if data.ack_requested {
            self.in_flight.insert(data.identifier, data.dest_name.clone());
        }
        debug!(identifier = data.identifier, dest = %data.dest_name, "Queue message sent");
    }

    /// Record an inbound message; returns the acknowledgement it is owed
    pub fn on_data(&mut self, data: &QueueData) -> Option<PendingAck> {
        self.queue_depth = data.queue_depth;
        if data.possible_duplicate {
            debug!(identifier = data.identifier, "Queue message is a possible duplicate");
        }
        data.ack_requested.then(|| PendingAck::for_data(data))
    }

    pub fn on_expired(&mut self, expired: &QueueDataExpired) {
        self.queue_depth = expired.queue_depth;
        if self.in_flight.remove(&expired.identifier).is_none() {
            debug!(identifier = expired.identifier, "Expired message was not tracked");
        }
    }

    pub fn on_ack(&mut self, ack: &QueueAck) {
        if self.in_flight.remove(&ack.identifier).is_none() {
            debug!(identifier = ack.identifier, "Ack for untracked queue message");
        }
    }

    pub fn phase(&self) -> QueuePhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == QueuePhase::Open
    }

    pub fn last_identifier(&self) -> u64 {
        self.last_identifier
    }

    pub fn in_flight(&self) -> Vec<u64> {
        self.in_flight.keys().copied().collect()
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    pub fn source_name(&self) -> Option<&str> {
        self.source_name.as_deref()
    }
}
