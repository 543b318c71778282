//! Client configuration

use omm_tunnel_proto::TimeoutPolicy;
use omm_tunnel_session::TunnelSessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::ClientError;

/// Periodic queue message producer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Queue names that receive one message per period
    pub destinations: Vec<String>,
    #[serde(with = "duration_secs")]
    pub period: Duration,
    pub ack_requested: bool,
    pub timeout: TimeoutPolicy,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            period: Duration::from_secs(2),
            ack_requested: true,
            timeout: TimeoutPolicy::Infinite,
        }
    }
}

/// Consumer client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub tunnel: TunnelSessionConfig,
    /// How often the driver dispatches the reactor
    #[serde(with = "duration_secs")]
    pub dispatch_interval: Duration,
    pub producer: ProducerConfig,
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

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelSessionConfig::default(),
            dispatch_interval: Duration::from_secs(1),
            producer: ProducerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, ClientError> {
        let config: ClientConfig = serde_yaml::from_str(yaml)?;
        config.validate().map_err(ClientError::Config)?;
        Ok(config)
    }

    /// Load a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tunnel.service_name.is_empty() {
            return Err("tunnel.service_name is required".to_string());
        }
        if self.dispatch_interval.is_zero() {
            return Err("dispatch_interval must be at least one second".to_string());
        }
        if !self.producer.destinations.is_empty() {
            if self.producer.period.is_zero() {
                return Err("producer.period must be at least one second".to_string());
            }
            if self.tunnel.queue_source_name.is_none() {
                return Err("tunnel.queue_source_name is required to produce queue messages".to_string());
            }
        }
        Ok(())
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn tunnel(mut self, tunnel: TunnelSessionConfig) -> Self {
        self.config.tunnel = tunnel;
        self
    }

    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.config.dispatch_interval = interval;
        self
    }

    pub fn destination(mut self, queue_name: impl Into<String>) -> Self {
        self.config.producer.destinations.push(queue_name.into());
        self
    }

    pub fn producer_period(mut self, period: Duration) -> Self {
        self.config.producer.period = period;
        self
    }

    pub fn ack_requested(mut self, ack_requested: bool) -> Self {
        self.config.producer.ack_requested = ack_requested;
        self
    }

    pub fn build(self) -> Result<ClientConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omm_tunnel_session::AckPolicy;

    fn tunnel() -> TunnelSessionConfig {
        TunnelSessionConfig::builder()
            .name("QueueConsumer")
            .queue_capable(true)
            .queue_source_name("QUEUE_A")
            .build()
            .unwrap()
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::builder()
            .tunnel(tunnel())
            .destination("QUEUE_B")
            .destination("QUEUE_C")
            .build()
            .unwrap();

        assert_eq!(config.producer.destinations, vec!["QUEUE_B", "QUEUE_C"]);
        assert_eq!(config.producer.period, Duration::from_secs(2));
        assert_eq!(config.dispatch_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_producer_requires_source_queue() {
        let result = ClientConfig::builder().destination("QUEUE_B").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_dispatch_interval_rejected() {
        let result = ClientConfig::builder()
            .dispatch_interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
tunnel:
  name: QueueConsumer
  service_name: DIRECT_FEED
  is_queue_capable: true
  queue_source_name: QUEUE_A
  recovery_interval: 10
  ack_policy: manual
dispatch_interval: 1
producer:
  destinations: [QUEUE_B]
  period: 3
"#;
        let config = ClientConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.tunnel.name, "QueueConsumer");
        assert_eq!(config.tunnel.recovery_interval, Duration::from_secs(10));
        assert_eq!(config.tunnel.ack_policy, AckPolicy::Manual);
        assert_eq!(config.producer.period, Duration::from_secs(3));
        assert!(config.producer.ack_requested);
    }

    #[test]
    fn test_from_yaml_rejects_invalid() {
        let yaml = "producer:\n  destinations: [QUEUE_B]\n";
        assert!(matches!(
            ClientConfig::from_yaml(yaml),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_yaml("tunnel: [1, 2"),
            Err(ClientError::Yaml(_))
        ));
    }
}
