//! Async dispatch driver
//!
//! Runs a [`Reactor`] inside one tokio task: dispatches it on a fixed
//! interval, forwards its events over an mpsc channel and executes calls
//! from the application between ticks. The reactor itself stays
//! single-threaded; only the task ever touches it.
//!
//! Events the channel cannot take yet wait in a local backlog. Calls keep
//! being served meanwhile, so an application may await a call from inside
//! its event handling.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use omm_tunnel_session::{Reactor, ReactorEvent};
use omm_tunnel_transport::Transport;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::producer::QueueMsgProducer;
use crate::ClientError;

/// Capacity of the event channel handed to the application
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

type DriverCall<T> = Box<dyn FnOnce(&mut Reactor<T>, Instant) + Send>;

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub struct ReactorDriver<T: Transport> {
    reactor: Reactor<T>,
    interval: Duration,
    event_capacity: usize,
    producer: Option<QueueMsgProducer>,
}

impl<T> ReactorDriver<T>
where
    T: Transport + Send + 'static,
{
    pub fn new(reactor: Reactor<T>, interval: Duration) -> Self {
        Self {
            reactor,
            interval,
            event_capacity: EVENT_CHANNEL_CAPACITY,
            producer: None,
        }
    }

    /// Capacity of the event channel returned by `spawn`
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Feed every event to `producer` and let it send on each tick
    pub fn with_producer(mut self, producer: QueueMsgProducer) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Start the dispatch task
    pub fn spawn(self) -> (DriverHandle<T>, mpsc::Receiver<ReactorEvent>) {
        let (calls_tx, calls_rx) = mpsc::channel::<DriverCall<T>>(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let (events_tx, events_rx) = mpsc::channel(self.event_capacity);

        let task = tokio::spawn(self.run(calls_rx, shutdown_rx, events_tx));

        let handle = DriverHandle {
            calls: calls_tx,
            shutdown_tx,
            task,
        };
        (handle, events_rx)
    }

    async fn run(
        mut self,
        mut calls: mpsc::Receiver<DriverCall<T>>,
        mut shutdown_rx: mpsc::Receiver<()>,
        events_tx: mpsc::Sender<ReactorEvent>,
    ) -> Reactor<T> {
        info!(role = %self.reactor.role(), interval = ?self.interval, "Dispatch driver running");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backlog = VecDeque::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping dispatch driver");
                    break;
                }
                Some(call) = calls.recv() => {
                    call(&mut self.reactor, now());
                }
                permit = events_tx.reserve(), if !backlog.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(event) = backlog.pop_front() {
                                permit.send(event);
                            }
                        }
                        Err(_) => {
                            info!("Event receiver dropped, stopping dispatch driver");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !self.tick(now(), &events_tx, &mut backlog) {
                        break;
                    }
                }
            }
        }

        debug!("Dispatch driver exiting");
        self.reactor
    }

    /// One dispatch round; false once nobody listens for events
    fn tick(
        &mut self,
        now: Instant,
        events_tx: &mpsc::Sender<ReactorEvent>,
        backlog: &mut VecDeque<ReactorEvent>,
    ) -> bool {
        match self.reactor.dispatch(now) {
            Ok(events) => {
                for event in events {
                    if let Some(producer) = self.producer.as_mut() {
                        producer.on_event(&event, &mut self.reactor);
                    }
                    backlog.push_back(event);
                }
            }
            Err(e) => error!("Dispatch failed: {}", e),
        }

        while let Some(event) = backlog.pop_front() {
            match events_tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    backlog.push_front(event);
                    warn!(backlog = backlog.len(), "Event channel full, holding events");
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    info!("Event receiver dropped, stopping dispatch driver");
                    return false;
                }
            }
        }

        if let Some(producer) = self.producer.as_mut() {
            producer.poll(now, &mut self.reactor);
        }
        true
    }
}

/// Application side of a running driver
pub struct DriverHandle<T: Transport> {
    calls: mpsc::Sender<DriverCall<T>>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<Reactor<T>>,
}

impl<T> DriverHandle<T>
where
    T: Transport + Send + 'static,
{
    /// Run `f` on the reactor between two dispatch rounds
    ///
    /// `f` also receives the driver's current time, for calls such as
    /// `Reactor::open` that need one.
    pub async fn call<R, F>(&self, f: F) -> Result<R, ClientError>
    where
        F: FnOnce(&mut Reactor<T>, Instant) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call: DriverCall<T> = Box::new(move |reactor, now| {
            let _ = reply_tx.send(f(reactor, now));
        });

        self.calls
            .send(call)
            .await
            .map_err(|_| ClientError::DriverStopped)?;
        reply_rx.await.map_err(|_| ClientError::DriverStopped)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the driver and take the reactor back
    pub async fn shutdown(self) -> Result<Reactor<T>, ClientError> {
        if self.shutdown_tx.send(()).await.is_err() {
            debug!("Dispatch driver already stopped");
        }
        Ok(self.task.await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omm_tunnel_proto::{
        ClassOfService, ContainerType, DirectoryUpdate, ServiceEntry, ServiceState, State,
        TunnelMessage, TunnelPayload,
    };
    use omm_tunnel_session::{SessionState, TunnelSessionConfig};
    use omm_tunnel_transport::{MemoryTransport, TunnelChannel};

    fn direct_feed() -> DirectoryUpdate {
        DirectoryUpdate::new(vec![ServiceEntry::add(5, "DIRECT_FEED")
            .with_capabilities(vec![199])
            .with_state(ServiceState::Up, Some(true))])
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_runs_on_reactor() {
        let (a, _b) = MemoryTransport::pair();
        let (handle, _events) = ReactorDriver::new(Reactor::consumer(a), Duration::from_secs(1)).spawn();

        let config = TunnelSessionConfig::builder()
            .name("DriverConsumer")
            .build()
            .unwrap();
        let stream_id = handle
            .call(move |reactor, now| reactor.open(config, now))
            .await
            .unwrap()
            .unwrap();

        let state = handle
            .call(move |reactor, _| reactor.session_state(stream_id))
            .await
            .unwrap();
        assert_eq!(state, Some(SessionState::Closed));

        let reactor = handle.shutdown().await.unwrap();
        assert!(reactor.session(stream_id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_forwarded() {
        let (a, b) = MemoryTransport::pair();
        let mut consumer = Reactor::consumer(a);
        consumer.on_directory_update(&direct_feed());

        let (consumer_handle, mut consumer_events) =
            ReactorDriver::new(consumer, Duration::from_secs(1)).spawn();
        let (provider_handle, mut provider_events) =
            ReactorDriver::new(Reactor::provider(b), Duration::from_secs(1)).spawn();

        let config = TunnelSessionConfig::builder()
            .name("DriverConsumer")
            .build()
            .unwrap();
        let stream_id = consumer_handle
            .call(move |reactor, now| reactor.open(config, now))
            .await
            .unwrap()
            .unwrap();

        let request = match provider_events.recv().await {
            Some(ReactorEvent::TunnelRequest(request)) => request,
            other => panic!("expected a tunnel request, got {:?}", other),
        };
        assert_eq!(request.stream_id, stream_id);
        provider_handle
            .call(move |reactor, _| reactor.accept(request.stream_id, TunnelSessionConfig::default()))
            .await
            .unwrap()
            .unwrap();

        let opened = tokio::time::timeout(Duration::from_secs(10), consumer_events.recv())
            .await
            .unwrap();
        assert!(matches!(
            opened,
            Some(ReactorEvent::TunnelOpened { stream_id: id, .. }) if id == stream_id
        ));

        consumer_handle.shutdown().await.unwrap();
        provider_handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_served_while_events_back_up() {
        let (a, b) = MemoryTransport::pair();
        let mut consumer = Reactor::consumer(a);
        consumer.on_directory_update(&direct_feed());
        let config = TunnelSessionConfig::builder()
            .name("DriverConsumer")
            .build()
            .unwrap();
        let stream_id = consumer.open(config, Instant::now()).unwrap();
        consumer.dispatch(Instant::now()).unwrap();

        let mut peer = TunnelChannel::new(b);
        assert_eq!(peer.recv_messages().unwrap().len(), 1);
        peer.send_message(&TunnelMessage::Refresh {
            stream_id,
            state: State::open_ok("ok"),
            class_of_service: ClassOfService::default(),
        })
        .unwrap();
        for i in 0..5u8 {
            peer.send_message(&TunnelMessage::Data {
                stream_id,
                container_type: ContainerType::Opaque,
                data: vec![i],
            })
            .unwrap();
        }
        peer.flush().unwrap();

        let (handle, mut events) = ReactorDriver::new(consumer, Duration::from_secs(1))
            .with_event_capacity(1)
            .spawn();
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Nothing has been read from the event channel yet
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            handle.call(move |reactor, _| reactor.session_state(stream_id)),
        )
        .await
        .expect("call not served while events were pending")
        .unwrap();
        assert_eq!(state, Some(SessionState::Ready));

        assert!(matches!(
            events.recv().await,
            Some(ReactorEvent::TunnelOpened { .. })
        ));
        let mut payloads = Vec::new();
        while payloads.len() < 5 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(ReactorEvent::Message {
                    payload: TunnelPayload::Opaque { data, .. },
                    ..
                })) => payloads.push(data[0]),
                other => panic!("expected an opaque message, got {:?}", other),
            }
        }
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_events_dropped() {
        let (a, b) = MemoryTransport::pair();
        let mut consumer = Reactor::consumer(a);
        consumer.on_directory_update(&direct_feed());
        let config = TunnelSessionConfig::builder()
            .name("DriverConsumer")
            .build()
            .unwrap();
        consumer.open(config, Instant::now()).unwrap();

        let (provider_handle, provider_events) =
            ReactorDriver::new(Reactor::provider(b), Duration::from_secs(1)).spawn();
        drop(provider_events);

        let (consumer_handle, _consumer_events) =
            ReactorDriver::new(consumer, Duration::from_secs(1)).spawn();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!provider_handle.is_running());
        assert!(matches!(
            provider_handle
                .call(|reactor, _| reactor.pending_requests().count())
                .await,
            Err(ClientError::DriverStopped)
        ));

        consumer_handle.shutdown().await.unwrap();
    }
}
