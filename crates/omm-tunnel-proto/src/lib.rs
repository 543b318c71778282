//! Tunnel stream protocol definitions
//!
//! Message types exchanged between a consumer and a provider over one
//! reactor channel: the tunnel envelope, class-of-service descriptors,
//! login/generic/queue sub-messages and service directory records.

pub mod codec;
pub mod cos;
pub mod directory;
pub mod messages;
pub mod queue;

pub use codec::{CodecError, TunnelCodec};
pub use cos::{
    AuthenticationType, ClassOfService, DataIntegrityType, FlowControlType, GuaranteeType,
};
pub use directory::{DirectoryUpdate, ServiceAction, ServiceEntry, ServiceState, ServiceStateInfo};
pub use messages::*;
pub use queue::*;

/// Stream identifier within one reactor channel
pub type StreamId = u32;

/// Protocol type of the Reuters Wire Format
pub const PROTOCOL_TYPE_RWF: u32 = 0;

/// RWF major version spoken by this implementation
pub const RWF_MAJOR_VERSION: u32 = 14;

/// RWF minor version spoken by this implementation
pub const RWF_MINOR_VERSION: u32 = 1;

/// Largest fragment a tunnel stream puts on the wire
pub const MAX_FRAGMENT_SIZE: u32 = 6144;

/// Default largest message a tunnel stream accepts
pub const DEFAULT_MAX_MSG_SIZE: u32 = 614_400;

/// Stream ID used for the login sub-stream inside a tunnel
pub const LOGIN_STREAM_ID: StreamId = 1;

/// Well-known domain types
pub mod domain {
    pub const LOGIN: u8 = 1;
    pub const SOURCE: u8 = 4;
    pub const DICTIONARY: u8 = 5;
    pub const MARKET_PRICE: u8 = 6;
    pub const MARKET_BY_ORDER: u8 = 7;
    pub const SYSTEM: u8 = 127;
    /// Domain commonly used for queue messaging tunnels
    pub const QUEUE_MESSAGING: u8 = 199;
}
