//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cos::ClassOfService;
use crate::queue::QueueMsg;
use crate::StreamId;

/// State of a stream as reported by its peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Open,
    Closed,
    /// Closed, but the peer expects the stream to be requested again
    ClosedRecover,
    /// Closed, the peer points at different parameters (see expected CoS)
    Redirected,
}

/// Health of the data carried on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataState {
    Ok,
    Suspect,
}

/// Additional detail attached to a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StateCode {
    #[default]
    None,
    NotFound,
    Timeout,
    NotAuthorized,
    InvalidArgument,
    UsageError,
    Preempted,
    NoResources,
    TooManyItems,
    AlreadyOpen,
    SourceUnknown,
    NotOpen,
}

/// Stream state, data state, code and text of a status or refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub stream_state: StreamState,
    pub data_state: DataState,
    pub code: StateCode,
    pub text: String,
}

impl State {
    pub fn new(stream_state: StreamState, data_state: DataState, code: StateCode, text: &str) -> Self {
        Self {
            stream_state,
            data_state,
            code,
            text: text.to_string(),
        }
    }

    pub fn open_ok(text: &str) -> Self {
        Self::new(StreamState::Open, DataState::Ok, StateCode::None, text)
    }

    pub fn closed(code: StateCode, text: &str) -> Self {
        Self::new(StreamState::Closed, DataState::Suspect, code, text)
    }

    pub fn closed_recover(code: StateCode, text: &str) -> Self {
        Self::new(StreamState::ClosedRecover, DataState::Suspect, code, text)
    }

    /// Whether this state ends the stream
    pub fn is_final(&self) -> bool {
        !matches!(self.stream_state, StreamState::Open)
    }

    pub fn is_open_ok(&self) -> bool {
        self.stream_state == StreamState::Open && self.data_state == DataState::Ok
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{:?} \"{}\"",
            self.stream_state, self.data_state, self.code, self.text
        )
    }
}

/// Layout of the bytes carried in a tunnel data message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContainerType {
    NoData = 128,
    Opaque = 130,
    Xml = 131,
    FieldList = 132,
    ElementList = 133,
    Map = 137,
    /// An encoded sub-message (login, generic or queue)
    Msg = 141,
    Json = 149,
}

/// Envelope exchanged between the two ends of a reactor channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TunnelMessage {
    /// Consumer asks the provider to open a tunnel stream
    OpenRequest {
        stream_id: StreamId,
        domain_type: u8,
        service_id: u16,
        name: String,
        class_of_service: ClassOfService,
    },
    /// Provider accepted the tunnel with the negotiated class of service
    Refresh {
        stream_id: StreamId,
        state: State,
        class_of_service: ClassOfService,
    },
    /// State change of the tunnel; a rejection carries the expected CoS
    Status {
        stream_id: StreamId,
        state: State,
        expected_cos: Option<ClassOfService>,
    },
    /// Either side closes the tunnel
    Close { stream_id: StreamId },
    /// Application content carried through the tunnel
    Data {
        stream_id: StreamId,
        container_type: ContainerType,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

impl TunnelMessage {
    pub fn stream_id(&self) -> StreamId {
        match self {
            TunnelMessage::OpenRequest { stream_id, .. }
            | TunnelMessage::Refresh { stream_id, .. }
            | TunnelMessage::Status { stream_id, .. }
            | TunnelMessage::Close { stream_id }
            | TunnelMessage::Data { stream_id, .. } => *stream_id,
        }
    }
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

/// Login request sent by a consumer inside an authenticated tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub stream_id: StreamId,
    pub user_name: String,
    /// Bearer credential, e.g. a JWT
    pub token: Option<String>,
    pub application_id: Option<String>,
}

/// Login sub-messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginMsg {
    Request(LoginRequest),
    Refresh {
        stream_id: StreamId,
        user_name: String,
        state: State,
    },
    Status {
        stream_id: StreamId,
        state: State,
    },
}

/// Kind of a generic domain message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericKind {
    Request,
    Refresh,
    Update,
    Close,
}

/// Message of any non-login, non-queue domain carried in the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericMsg {
    pub stream_id: StreamId,
    pub domain_type: u8,
    pub kind: GenericKind,
    pub name: Option<String>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Encoded body of a data message whose container type is `Msg`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubMsg {
    Login(LoginMsg),
    Generic(GenericMsg),
    Queue(QueueMsg),
}

/// Decoded content of an inbound tunnel data message
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelPayload {
    Opaque {
        container_type: ContainerType,
        data: Vec<u8>,
    },
    Login(LoginMsg),
    Generic(GenericMsg),
    Queue(QueueMsg),
}

impl From<SubMsg> for TunnelPayload {
    fn from(msg: SubMsg) -> Self {
        match msg {
            SubMsg::Login(login) => TunnelPayload::Login(login),
            SubMsg::Generic(generic) => TunnelPayload::Generic(generic),
            SubMsg::Queue(queue) => TunnelPayload::Queue(queue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = TunnelMessage::Close { stream_id: 1000 };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: TunnelMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_open_request_carries_cos() {
        let msg = TunnelMessage::OpenRequest {
            stream_id: 1000,
            domain_type: crate::domain::QUEUE_MESSAGING,
            service_id: 5,
            name: "QueueTunnel".to_string(),
            class_of_service: ClassOfService::default(),
        };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: TunnelMessage = bincode::deserialize(&serialized).unwrap();

        if let TunnelMessage::OpenRequest {
            stream_id,
            service_id,
            class_of_service,
            ..
        } = deserialized
        {
            assert_eq!(stream_id, 1000);
            assert_eq!(service_id, 5);
            assert_eq!(class_of_service, ClassOfService::default());
        } else {
            panic!("Expected OpenRequest message");
        }
    }

    #[test]
    fn test_state_finality() {
        assert!(!State::open_ok("ok").is_final());
        assert!(State::closed(StateCode::None, "bye").is_final());
        assert!(State::closed_recover(StateCode::Timeout, "later").is_final());
        assert!(State::open_ok("ok").is_open_ok());
    }

    #[test]
    fn test_stream_id_accessor() {
        let msg = TunnelMessage::Data {
            stream_id: 7,
            container_type: ContainerType::Opaque,
            data: vec![1, 2, 3],
        };
        assert_eq!(msg.stream_id(), 7);
    }
}
