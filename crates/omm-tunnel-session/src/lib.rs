//! Tunnel stream sessions and queue messaging
//!
//! A tunnel stream is an ordered, flow-controlled and optionally
//! authenticated virtual stream multiplexed over one reactor channel.
//! Queue messaging runs on top of it: point-to-point messages with
//! identifiers, acknowledgement and expiry.
//!
//! The [`Reactor`] is the entry point. It is single-threaded and
//! non-blocking; call [`Reactor::dispatch`] about once a second (or drive
//! it with the client crate's async driver) and act on the returned
//! [`ReactorEvent`]s.

pub mod buffer;
pub mod config;
pub mod cos;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod items;
pub mod queue;
pub mod reactor;
pub mod recovery;
pub mod session;

pub use buffer::{BufferGrant, BufferPool, SubmitError, TunnelBuffer};
pub use config::{AckPolicy, TunnelSessionConfig, TunnelSessionConfigBuilder};
pub use cos::{expected_class_of_service, negotiate, CosRejectReason};
pub use directory::{ServiceDirectory, ServiceTracker};
pub use error::{SessionError, SessionResult};
pub use event::{ReactorEvent, TunnelRequest};
pub use items::{ItemPhase, ItemState, ItemTable};
pub use queue::{PendingAck, QueuePhase, QueueSendOptions, QUEUE_STREAM_ID};
pub use reactor::{Reactor, DEFAULT_MAX_SESSIONS, FIRST_TUNNEL_STREAM_ID};
pub use recovery::RecoveryTimer;
pub use session::{CloseCause, Role, SessionState, TunnelSession};
