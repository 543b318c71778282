//! Tunnel stream client
//!
//! Runs a consumer or provider [`Reactor`] on tokio: configuration loading,
//! an interval-driven dispatch task and a periodic queue message producer.

pub mod config;
pub mod driver;
pub mod error;
pub mod producer;

pub use config::{ClientConfig, ClientConfigBuilder, ProducerConfig};
pub use driver::{DriverHandle, ReactorDriver, EVENT_CHANNEL_CAPACITY};
pub use error::ClientError;
pub use producer::{QueueMsgProducer, QueuePayload};

pub use omm_tunnel_session::{Reactor, ReactorEvent, TunnelSessionConfig};
