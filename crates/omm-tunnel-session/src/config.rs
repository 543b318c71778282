//! Tunnel session configuration

use omm_tunnel_proto::{domain, ClassOfService, StreamId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How inbound queue messages that request an acknowledgement are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// The queue layer acknowledges as soon as the message is processed
    #[default]
    Auto,
    /// The application answers with `ack` or `nack`; the session holds
    /// further inbound messages until it does
    Manual,
}

/// Immutable configuration of one tunnel stream
///
/// A consumer passes it to `Reactor::open`; a provider passes it to
/// `Reactor::accept`, where `class_of_service` describes what the provider
/// supports and the service fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSessionConfig {
    /// Tunnel stream name, identifies the peer application
    pub name: String,
    pub domain_type: u8,
    /// Service the consumer binds to via the directory
    pub service_name: String,
    /// Fixed stream id; allocated by the reactor when absent
    pub stream_id: Option<StreamId>,
    pub use_authentication: bool,
    pub is_queue_capable: bool,
    pub guaranteed_output_buffers: usize,
    #[serde(with = "duration_secs")]
    pub recovery_interval: Duration,
    pub class_of_service: ClassOfService,
    pub user_name: String,
    pub token: Option<String>,
    pub queue_source_name: Option<String>,
    pub ack_policy: AckPolicy,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for TunnelSessionConfig {
    fn default() -> Self {
        Self {
            name: "TunnelStream".to_string(),
            domain_type: domain::QUEUE_MESSAGING,
            service_name: "DIRECT_FEED".to_string(),
            stream_id: None,
            use_authentication: false,
            is_queue_capable: false,
            guaranteed_output_buffers: 25,
            recovery_interval: Duration::from_secs(5),
            class_of_service: ClassOfService::default(),
            user_name: String::new(),
            token: None,
            queue_source_name: None,
            ack_policy: AckPolicy::Auto,
        }
    }
}

impl TunnelSessionConfig {
    pub fn builder() -> TunnelSessionConfigBuilder {
        TunnelSessionConfigBuilder::default()
    }

    /// Local class of service as sent in an open request
    pub fn requested_class_of_service(&self) -> ClassOfService {
        let mut cos = self.class_of_service.clone();
        if self.use_authentication {
            cos.authentication_type = omm_tunnel_proto::AuthenticationType::Login;
        }
        cos
    }
}

/// Builder for TunnelSessionConfig
#[derive(Default)]
pub struct TunnelSessionConfigBuilder {
    config: TunnelSessionConfig,
}

impl TunnelSessionConfigBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    pub fn domain_type(mut self, domain_type: u8) -> Self {
        self.config.domain_type = domain_type;
        self
    }

    pub fn service_name(mut self, service_name: &str) -> Self {
        self.config.service_name = service_name.to_string();
        self
    }

    pub fn stream_id(mut self, stream_id: StreamId) -> Self {
        self.config.stream_id = Some(stream_id);
        self
    }

    pub fn use_authentication(mut self, enabled: bool) -> Self {
        self.config.use_authentication = enabled;
        self
    }

    pub fn queue_capable(mut self, enabled: bool) -> Self {
        self.config.is_queue_capable = enabled;
        self
    }

    pub fn guaranteed_output_buffers(mut self, count: usize) -> Self {
        self.config.guaranteed_output_buffers = count;
        self
    }

    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.config.recovery_interval = interval;
        self
    }

    pub fn class_of_service(mut self, cos: ClassOfService) -> Self {
        self.config.class_of_service = cos;
        self
    }

    pub fn login(mut self, user_name: &str, token: Option<String>) -> Self {
        self.config.user_name = user_name.to_string();
        self.config.token = token;
        self
    }

    pub fn queue_source_name(mut self, source_name: &str) -> Self {
        self.config.queue_source_name = Some(source_name.to_string());
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.config.ack_policy = policy;
        self
    }

    pub fn build(self) -> Result<TunnelSessionConfig, String> {
        if self.config.name.is_empty() {
            return Err("name is required".to_string());
        }
        if self.config.guaranteed_output_buffers == 0 {
            return Err("guaranteed_output_buffers must be at least 1".to_string());
        }
        if self.config.recovery_interval.is_zero() {
            return Err("recovery_interval must be non-zero".to_string());
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omm_tunnel_proto::AuthenticationType;

    #[test]
    fn test_config_builder() {
        let config = TunnelSessionConfig::builder()
            .name("QueueConsumer")
            .service_name("DIRECT_FEED")
            .queue_capable(true)
            .queue_source_name("QUEUE_A")
            .build()
            .unwrap();

        assert_eq!(config.domain_type, domain::QUEUE_MESSAGING);
        assert_eq!(config.guaranteed_output_buffers, 25);
        assert_eq!(config.queue_source_name.as_deref(), Some("QUEUE_A"));
        assert_eq!(config.ack_policy, AckPolicy::Auto);
    }

    #[test]
    fn test_config_builder_rejects_zero_buffers() {
        let result = TunnelSessionConfig::builder()
            .guaranteed_output_buffers(0)
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_config_builder_rejects_empty_name() {
        assert!(TunnelSessionConfig::builder().name("").build().is_err());
    }

    #[test]
    fn test_authentication_sets_login_cos() {
        let config = TunnelSessionConfig::builder()
            .use_authentication(true)
            .login("alice", None)
            .build()
            .unwrap();

        assert_eq!(
            config.requested_class_of_service().authentication_type,
            AuthenticationType::Login
        );
        assert_eq!(
            config.class_of_service.authentication_type,
            AuthenticationType::NotRequired
        );
    }

    #[test]
    fn test_yaml_config_uses_seconds() {
        let yaml = "name: Provider\nrecovery_interval: 3\nack_policy: manual\n";
        let config: TunnelSessionConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.name, "Provider");
        assert_eq!(config.recovery_interval, Duration::from_secs(3));
        assert_eq!(config.ack_policy, AckPolicy::Manual);
        assert_eq!(config.guaranteed_output_buffers, 25);
    }
}
