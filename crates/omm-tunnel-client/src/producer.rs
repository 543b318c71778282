//! Periodic queue message producer
//!
//! Requests the queue stream once its tunnel opens, then sends one message
//! to every configured destination each period while the queue stream is
//! open.

use std::time::{Duration, Instant};

use omm_tunnel_proto::{ContainerType, State, StreamId};
use omm_tunnel_session::{QueueSendOptions, Reactor, ReactorEvent, SessionError};
use omm_tunnel_transport::Transport;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ProducerConfig;

/// Body of a produced queue message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePayload {
    pub sequence: u64,
    pub source: String,
    pub text: String,
}

#[derive(Debug)]
pub struct QueueMsgProducer {
    destinations: Vec<String>,
    period: Duration,
    options: QueueSendOptions,
    /// Tunnel whose queue stream is open
    stream_id: Option<StreamId>,
    next_send: Option<Instant>,
    sequence: u64,
}

impl QueueMsgProducer {
    pub fn new(config: &ProducerConfig) -> Self {
        Self {
            destinations: config.destinations.clone(),
            period: config.period,
            options: QueueSendOptions {
                timeout: config.timeout,
                container_type: ContainerType::Json,
                ack_requested: config.ack_requested,
            },
            stream_id: None,
            next_send: None,
            sequence: 0,
        }
    }

    /// Whether a queue stream is open for producing
    pub fn is_active(&self) -> bool {
        self.stream_id.is_some()
    }

    /// Messages sent so far
    pub fn sent(&self) -> u64 {
        self.sequence
    }

    pub fn on_event<T: Transport>(&mut self, event: &ReactorEvent, reactor: &mut Reactor<T>) {
        match event {
            ReactorEvent::TunnelOpened { stream_id, .. } => self.request_queue(*stream_id, reactor),
            ReactorEvent::QueueRefresh { stream_id, refresh } => {
                if refresh.state.is_open_ok() {
                    info!(stream_id = %stream_id, depth = refresh.queue_depth, "Queue stream open, producing");
                    self.stream_id = Some(*stream_id);
                    self.next_send = None;
                } else if refresh.state.is_final() {
                    self.stop(*stream_id);
                }
            }
            ReactorEvent::QueueStatus { stream_id, status }
                if status.state.as_ref().is_some_and(State::is_final) =>
            {
                self.stop(*stream_id);
            }
            ReactorEvent::TunnelClosed { stream_id, .. } => self.stop(*stream_id),
            _ => {}
        }
    }

    fn request_queue<T: Transport>(&mut self, stream_id: StreamId, reactor: &mut Reactor<T>) {
        let source = match reactor
            .session(stream_id)
            .and_then(|s| s.config().queue_source_name.clone())
        {
            Some(source) => source,
            None => return,
        };

        if let Err(e) = reactor.request_queue(stream_id, &source) {
            warn!(stream_id = %stream_id, source = %source, "Queue request failed: {}", e);
        }
    }

    fn stop(&mut self, stream_id: StreamId) {
        if self.stream_id == Some(stream_id) {
            info!(stream_id = %stream_id, "Queue stream closed, producer paused");
            self.stream_id = None;
            self.next_send = None;
        }
    }

    /// Send the messages due at `now`; returns how many were sent
    pub fn poll<T: Transport>(&mut self, now: Instant, reactor: &mut Reactor<T>) -> usize {
        let Some(stream_id) = self.stream_id else {
            return 0;
        };
        if self.next_send.is_some_and(|at| now < at) {
            return 0;
        }
        self.next_send = Some(now + self.period);

        let source = reactor
            .session(stream_id)
            .and_then(|s| s.queue().source_name())
            .unwrap_or_default()
            .to_string();

        let mut sent = 0;
        for dest in &self.destinations {
            let payload = QueuePayload {
                sequence: self.sequence + 1,
                source: source.clone(),
                text: format!("Hello {} from {}", dest, source),
            };
            let body = match serde_json::to_vec(&payload) {
                Ok(body) => body,
                Err(e) => {
                    error!("Failed to encode queue payload: {}", e);
                    continue;
                }
            };

            match reactor.send_queue_msg(stream_id, dest, body, &self.options) {
                Ok(identifier) => {
                    debug!(stream_id = %stream_id, identifier, dest = %dest, "Produced queue message");
                    self.sequence += 1;
                    sent += 1;
                }
                Err(SessionError::Busy(_)) => {
                    debug!(stream_id = %stream_id, dest = %dest, "No output buffer, message skipped");
                }
                Err(e) => {
                    warn!(stream_id = %stream_id, dest = %dest, "Failed to send queue message: {}", e);
                }
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omm_tunnel_proto::{DirectoryUpdate, ServiceEntry, ServiceState};
    use omm_tunnel_session::TunnelSessionConfig;
    use omm_tunnel_transport::MemoryTransport;

    fn producer() -> QueueMsgProducer {
        QueueMsgProducer::new(&ProducerConfig {
            destinations: vec!["QUEUE_B".to_string(), "QUEUE_C".to_string()],
            ..Default::default()
        })
    }

    fn reactors() -> (Reactor<MemoryTransport>, Reactor<MemoryTransport>) {
        let (a, b) = MemoryTransport::pair();
        let mut consumer = Reactor::consumer(a);
        consumer.on_directory_update(&DirectoryUpdate::new(vec![ServiceEntry::add(5, "DIRECT_FEED")
            .with_capabilities(vec![199])
            .with_state(ServiceState::Up, Some(true))]));
        (consumer, Reactor::provider(b))
    }

    /// Dispatch both ends, auto-accepting tunnel requests and feeding
    /// consumer events to the producer
    fn run(
        consumer: &mut Reactor<MemoryTransport>,
        provider: &mut Reactor<MemoryTransport>,
        producer: &mut QueueMsgProducer,
        now: Instant,
    ) -> Vec<ReactorEvent> {
        let mut provider_events = Vec::new();
        for _ in 0..4 {
            for event in consumer.dispatch(now).unwrap() {
                producer.on_event(&event, consumer);
            }
            for event in provider.dispatch(now).unwrap() {
                if let ReactorEvent::TunnelRequest(request) = &event {
                    let config = TunnelSessionConfig::builder()
                        .name("QueueProvider")
                        .queue_capable(true)
                        .build()
                        .unwrap();
                    provider.accept(request.stream_id, config).unwrap();
                }
                provider_events.push(event);
            }
        }
        provider_events
    }

    fn consumer_config() -> TunnelSessionConfig {
        TunnelSessionConfig::builder()
            .name("QueueConsumer")
            .queue_source_name("QUEUE_A")
            .build()
            .unwrap()
    }

    #[test]
    fn test_idle_until_queue_open() {
        let (mut consumer, _provider) = reactors();
        let mut producer = producer();

        assert!(!producer.is_active());
        assert_eq!(producer.poll(Instant::now(), &mut consumer), 0);
    }

    #[test]
    fn test_one_message_per_destination_each_period() {
        let (mut consumer, mut provider) = reactors();
        let mut producer = producer();
        let now = Instant::now();

        let stream_id = consumer.open(consumer_config(), now).unwrap();
        run(&mut consumer, &mut provider, &mut producer, now);
        assert!(producer.is_active());

        assert_eq!(producer.poll(now, &mut consumer), 2);
        assert_eq!(producer.poll(now + Duration::from_secs(1), &mut consumer), 0);
        assert_eq!(producer.poll(now + Duration::from_secs(2), &mut consumer), 2);
        assert_eq!(producer.sent(), 4);

        let provider_events = run(&mut consumer, &mut provider, &mut producer, now + Duration::from_secs(2));
        let received: Vec<(u64, String)> = provider_events
            .iter()
            .filter_map(|e| match e {
                ReactorEvent::QueueData { data, .. } => Some((data.identifier, data.dest_name.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            received,
            vec![
                (1, "QUEUE_B".to_string()),
                (2, "QUEUE_C".to_string()),
                (3, "QUEUE_B".to_string()),
                (4, "QUEUE_C".to_string()),
            ]
        );

        let payload: QueuePayload = provider_events
            .iter()
            .find_map(|e| match e {
                ReactorEvent::QueueData { data, .. } => serde_json::from_slice(&data.payload).ok(),
                _ => None,
            })
            .unwrap();
        assert_eq!(payload.sequence, 1);
        assert_eq!(payload.source, "QUEUE_A");

        assert!(consumer.session(stream_id).unwrap().queue().in_flight().is_empty());
    }

    #[test]
    fn test_tunnel_close_pauses_producer() {
        let (mut consumer, mut provider) = reactors();
        let mut producer = producer();
        let now = Instant::now();

        let stream_id = consumer.open(consumer_config(), now).unwrap();
        run(&mut consumer, &mut provider, &mut producer, now);
        assert!(producer.is_active());

        provider.close(stream_id, false).unwrap();
        run(&mut consumer, &mut provider, &mut producer, now);

        assert!(!producer.is_active());
        assert_eq!(producer.poll(now + Duration::from_secs(10), &mut consumer), 0);
    }
}
