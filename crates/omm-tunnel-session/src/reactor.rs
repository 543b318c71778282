//! Reactor: every tunnel stream on one channel
//!
//! The reactor owns the channel and the sessions multiplexed on it. All
//! work happens in the caller's thread: `dispatch` flushes, reads, routes
//! inbound messages to their sessions, runs recovery and returns the
//! events produced since the previous call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use omm_tunnel_auth::{AllowAll, LoginValidator};
use omm_tunnel_proto::{
    AckOutcome, AuthenticationType, ClassOfService, ContainerType, DataState, DirectoryUpdate,
    GenericMsg, NackCode, State, StateCode, StreamId, StreamState, TunnelMessage,
};
use omm_tunnel_transport::{ChannelEvent, Transport, TransportError, TunnelChannel};
use tracing::{debug, info, warn};

use crate::buffer::{BufferGrant, SubmitError, TunnelBuffer};
use crate::config::TunnelSessionConfig;
use crate::cos::{expected_class_of_service, negotiate, CosRejectReason};
use crate::directory::ServiceDirectory;
use crate::error::{SessionError, SessionResult};
use crate::event::{ReactorEvent, TunnelRequest};
use crate::queue::QueueSendOptions;
use crate::session::{Role, SessionState, TunnelSession};

/// First stream id handed out to consumer tunnel streams
pub const FIRST_TUNNEL_STREAM_ID: StreamId = 1000;

/// Default limit on concurrently accepted tunnel streams
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// At most one open or opening session per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    name: String,
    domain_type: u8,
    service: String,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.name, self.domain_type, self.service)
    }
}

pub struct Reactor<T> {
    role: Role,
    channel: TunnelChannel<T>,
    sessions: BTreeMap<StreamId, TunnelSession>,
    keys: HashMap<SessionKey, StreamId>,
    pending_requests: BTreeMap<StreamId, TunnelRequest>,
    directory: ServiceDirectory,
    validator: Arc<dyn LoginValidator>,
    max_sessions: usize,
    next_stream_id: StreamId,
    channel_up: bool,
    recovery_suspended: bool,
    events: Vec<ReactorEvent>,
}

impl<T: Transport> Reactor<T> {
    fn new(role: Role, transport: T) -> Self {
        Self {
            role,
            channel: TunnelChannel::new(transport),
            sessions: BTreeMap::new(),
            keys: HashMap::new(),
            pending_requests: BTreeMap::new(),
            directory: ServiceDirectory::new(),
            validator: Arc::new(AllowAll),
            max_sessions: DEFAULT_MAX_SESSIONS,
            next_stream_id: FIRST_TUNNEL_STREAM_ID,
            channel_up: true,
            recovery_suspended: false,
            events: Vec::new(),
        }
    }

    pub fn consumer(transport: T) -> Self {
        Self::new(Role::Consumer, transport)
    }

    pub fn provider(transport: T) -> Self {
        Self::new(Role::Provider, transport)
    }

    /// Validator applied to logins on authenticated tunnels
    pub fn with_login_validator(mut self, validator: Arc<dyn LoginValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session(&self, stream_id: StreamId) -> Option<&TunnelSession> {
        self.sessions.get(&stream_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &TunnelSession> {
        self.sessions.values()
    }

    pub fn session_state(&self, stream_id: StreamId) -> Option<SessionState> {
        self.sessions.get(&stream_id).map(TunnelSession::state)
    }

    /// Submitted buffers of a session not yet confirmed flushed
    pub fn buffers_used(&self, stream_id: StreamId) -> SessionResult<usize> {
        Ok(self.session_ref(stream_id)?.buffers_used())
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = &TunnelRequest> {
        self.pending_requests.values()
    }

    pub fn is_channel_up(&self) -> bool {
        self.channel_up
    }

    pub fn channel(&self) -> &TunnelChannel<T> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut TunnelChannel<T> {
        &mut self.channel
    }

    fn session_ref(&self, stream_id: StreamId) -> SessionResult<&TunnelSession> {
        self.sessions
            .get(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))
    }

    fn session_mut(&mut self, stream_id: StreamId) -> SessionResult<&mut TunnelSession> {
        self.sessions
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))
    }

    fn require_role(&self, role: Role) -> SessionResult<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(SessionError::WrongRole(self.role))
        }
    }

    fn allocate_stream_id(&mut self) -> StreamId {
        while self.sessions.contains_key(&self.next_stream_id) {
            self.next_stream_id += 1;
        }
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        stream_id
    }

    /// Create a consumer tunnel stream and try to open it
    ///
    /// Returns the stream id even when the service is not yet available;
    /// the session then opens through recovery once it is.
    pub fn open(&mut self, config: TunnelSessionConfig, now: Instant) -> SessionResult<StreamId> {
        self.require_role(Role::Consumer)?;

        if config.service_name.is_empty() {
            return Err(SessionError::InvalidConfig(
                "service_name is required".to_string(),
            ));
        }
        if config.use_authentication && config.user_name.is_empty() {
            return Err(SessionError::InvalidConfig(
                "user_name is required when authentication is used".to_string(),
            ));
        }

        let key = SessionKey {
            name: config.name.clone(),
            domain_type: config.domain_type,
            service: config.service_name.clone(),
        };
        if self.keys.contains_key(&key) {
            return Err(SessionError::AlreadyOpen(key.to_string()));
        }

        let stream_id = match config.stream_id {
            Some(id) if self.sessions.contains_key(&id) => {
                return Err(SessionError::StreamIdInUse(id))
            }
            Some(id) => id,
            None => self.allocate_stream_id(),
        };

        let mut session = TunnelSession::consumer(stream_id, config);
        session.on_directory_update(&self.directory.snapshot());

        if self.channel_up && !self.recovery_suspended {
            if let Err(e) = session.open(now, &mut self.channel) {
                warn!(stream_id = %stream_id, "Open attempt failed, will retry: {}", e);
            }
        } else {
            session.request_open();
            session.suspend_recovery();
        }

        self.keys.insert(key, stream_id);
        self.sessions.insert(stream_id, session);
        Ok(stream_id)
    }

    /// Close a tunnel stream from this end
    pub fn close(&mut self, stream_id: StreamId, final_status_event: bool) -> SessionResult<()> {
        let session = self
            .sessions
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        session.close(final_status_event, &mut self.channel, &mut self.events)?;
        self.reap();
        Ok(())
    }

    /// Accept a pending tunnel request
    ///
    /// A duplicate or over-capacity request is rejected plainly; a class of
    /// service the provider cannot serve is redirected with the class of
    /// service it would accept.
    pub fn accept(&mut self, stream_id: StreamId, config: TunnelSessionConfig) -> SessionResult<()> {
        self.require_role(Role::Provider)?;

        let request = self
            .pending_requests
            .remove(&stream_id)
            .ok_or(SessionError::NoPendingRequest(stream_id))?;

        let key = SessionKey {
            name: request.name.clone(),
            domain_type: request.domain_type,
            service: request.service_id.to_string(),
        };
        if self.keys.contains_key(&key) || self.sessions.contains_key(&stream_id) {
            self.send_reject(
                stream_id,
                State::closed(StateCode::AlreadyOpen, "Tunnel stream already open"),
                None,
            );
            return Err(SessionError::AlreadyOpen(key.to_string()));
        }

        if self.sessions.len() >= self.max_sessions {
            self.send_reject(
                stream_id,
                State::closed(StateCode::NoResources, "No more tunnel streams accepted"),
                None,
            );
            return Err(SessionError::CapacityExhausted(self.max_sessions));
        }

        let local = &config.class_of_service;
        let negotiated = match negotiate(local, &request.class_of_service) {
            Ok(negotiated) => negotiated,
            Err(reason) => {
                let expected = expected_class_of_service(local, &request.class_of_service);
                self.send_reject(stream_id, redirect_state(&reason.to_string()), Some(expected));
                return Err(reason.into());
            }
        };

        if config.use_authentication && !negotiated.requires_login() {
            let expected = expected_class_of_service(local, &request.class_of_service)
                .with_authentication(AuthenticationType::Login);
            self.send_reject(
                stream_id,
                redirect_state("Login authentication is required"),
                Some(expected),
            );
            return Err(CosRejectReason::UnsupportedAuthentication(
                negotiated.authentication_type,
            )
            .into());
        }

        let mut session = TunnelSession::provider(stream_id, config, request.service_id, negotiated);
        session.accepted(&mut self.channel, &mut self.events)?;

        self.keys.insert(key, stream_id);
        self.sessions.insert(stream_id, session);
        Ok(())
    }

    /// Reject a pending tunnel request
    ///
    /// With `expected_cos` the consumer is redirected to that class of
    /// service; without it the request is simply closed.
    pub fn reject(
        &mut self,
        stream_id: StreamId,
        reason: &str,
        expected_cos: Option<ClassOfService>,
    ) -> SessionResult<()> {
        self.require_role(Role::Provider)?;

        self.pending_requests
            .remove(&stream_id)
            .ok_or(SessionError::NoPendingRequest(stream_id))?;

        let state = if expected_cos.is_some() {
            redirect_state(reason)
        } else {
            State::closed(StateCode::NotAuthorized, reason)
        };
        self.send_reject(stream_id, state, expected_cos);
        Ok(())
    }

    fn send_reject(&mut self, stream_id: StreamId, state: State, expected_cos: Option<ClassOfService>) {
        info!(stream_id = %stream_id, "Rejecting tunnel stream: {}", state);
        let status = TunnelMessage::Status {
            stream_id,
            state,
            expected_cos,
        };
        if let Err(e) = self.channel.send_message(&status) {
            warn!(stream_id = %stream_id, "Failed to send tunnel stream reject: {}", e);
        }
    }

    pub fn acquire(&mut self, stream_id: StreamId, size_hint: usize) -> SessionResult<BufferGrant> {
        self.session_mut(stream_id)?.acquire(size_hint)
    }

    pub fn release(&mut self, buffer: TunnelBuffer) -> SessionResult<()> {
        let session = self.session_mut(buffer.stream_id())?;
        session.release(buffer);
        Ok(())
    }

    pub fn submit(&mut self, buffer: TunnelBuffer, container_type: ContainerType) -> Result<(), SubmitError> {
        let stream_id = buffer.stream_id();
        match self.sessions.get_mut(&stream_id) {
            Some(session) => session.submit(buffer, container_type, &mut self.channel),
            None => Err(SubmitError {
                buffer,
                source: SessionError::UnknownStream(stream_id),
            }),
        }
    }

    pub fn send_generic(&mut self, stream_id: StreamId, msg: GenericMsg) -> SessionResult<()> {
        let session = self
            .sessions
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        session.send_generic(msg, &mut self.channel)
    }

    pub fn request_queue(&mut self, stream_id: StreamId, source_name: &str) -> SessionResult<()> {
        let session = self
            .sessions
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        session.request_queue(source_name, &mut self.channel)
    }

    pub fn send_queue_msg(
        &mut self,
        stream_id: StreamId,
        dest_name: &str,
        payload: Vec<u8>,
        options: &QueueSendOptions,
    ) -> SessionResult<u64> {
        let session = self
            .sessions
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        session.send_queue_msg(dest_name, payload, options, &mut self.channel)
    }

    pub fn ack(&mut self, stream_id: StreamId, identifier: u64) -> SessionResult<()> {
        let session = self
            .sessions
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        session.acknowledge(identifier, AckOutcome::Ack, &mut self.channel)
    }

    pub fn nack(
        &mut self,
        stream_id: StreamId,
        identifier: u64,
        code: NackCode,
        text: &str,
    ) -> SessionResult<()> {
        let session = self
            .sessions
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        session.nack(identifier, code, text, &mut self.channel)
    }

    /// Apply a service directory update to every consumer session
    pub fn on_directory_update(&mut self, update: &DirectoryUpdate) {
        self.directory.apply(update);
        for session in self.sessions.values_mut() {
            if session.role() == Role::Consumer {
                session.on_directory_update(update);
            }
        }
    }

    pub fn on_channel_event(&mut self, event: ChannelEvent) {
        info!(event = ?event, "Channel event");

        match event {
            ChannelEvent::ChannelDown | ChannelEvent::ChannelDownReconnecting => {
                self.channel_up = false;
                self.recovery_suspended = true;

                let discarded = self.channel.discard_unflushed();
                if !discarded.is_empty() {
                    debug!("Discarded {} unflushed frame(s)", discarded.len());
                }
                if !self.pending_requests.is_empty() {
                    debug!("Dropping {} pending tunnel request(s)", self.pending_requests.len());
                    self.pending_requests.clear();
                }

                for session in self.sessions.values_mut() {
                    session.on_channel_down(&mut self.events);
                }
                self.reap();
            }
            ChannelEvent::PreferredHostStartingFallback => {
                self.recovery_suspended = true;
                for session in self.sessions.values_mut() {
                    session.suspend_recovery();
                }
            }
            ChannelEvent::ChannelUp | ChannelEvent::PreferredHostComplete => {
                self.channel_up = true;
                self.recovery_suspended = false;
                for session in self.sessions.values_mut() {
                    session.resume_recovery();
                }
            }
        }
    }

    /// One dispatch round
    pub fn dispatch(&mut self, now: Instant) -> SessionResult<Vec<ReactorEvent>> {
        for session in self.sessions.values_mut() {
            session.finalize_if_delivered();
        }
        self.reap();

        if self.channel_up {
            self.flush_channel()?;

            let messages = match self.channel.recv_messages() {
                Ok(messages) => messages,
                Err(TransportError::ConnectionClosed) => {
                    warn!("Channel closed by peer");
                    self.on_channel_event(ChannelEvent::ChannelDown);
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            };

            for msg in messages {
                self.route(msg);
            }

            for session in self.sessions.values_mut() {
                session.process_backlog(now, &mut self.channel, self.validator.as_ref(), &mut self.events);
            }

            if !self.recovery_suspended {
                for session in self.sessions.values_mut() {
                    if session.recovery_due(now) {
                        if let Err(e) = session.open(now, &mut self.channel) {
                            warn!(stream_id = %session.stream_id(), "Recovery attempt failed: {}", e);
                        }
                    }
                }
            }

            if self.channel_up {
                self.flush_channel()?;
            }
            self.reap();
        }

        for session in self.sessions.values_mut() {
            session.mark_final_status_delivered();
        }
        Ok(std::mem::take(&mut self.events))
    }

    fn flush_channel(&mut self) -> SessionResult<()> {
        match self.channel.flush() {
            Ok(credited) => {
                for stream_id in credited {
                    if let Some(session) = self.sessions.get_mut(&stream_id) {
                        session.on_flushed(1);
                    }
                }
                Ok(())
            }
            Err(TransportError::ConnectionClosed) => {
                warn!("Channel closed while flushing");
                self.on_channel_event(ChannelEvent::ChannelDown);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn route(&mut self, msg: TunnelMessage) {
        match msg {
            TunnelMessage::OpenRequest {
                stream_id,
                domain_type,
                service_id,
                name,
                class_of_service,
            } => {
                if self.role != Role::Provider {
                    warn!(stream_id = %stream_id, "Consumer received a tunnel open request");
                    return;
                }
                if self.sessions.contains_key(&stream_id) || self.pending_requests.contains_key(&stream_id) {
                    self.send_reject(
                        stream_id,
                        State::closed(StateCode::AlreadyOpen, "Stream id already in use"),
                        None,
                    );
                    return;
                }

                debug!(stream_id = %stream_id, name = %name, service_id, "Tunnel stream requested");
                let request = TunnelRequest {
                    stream_id,
                    domain_type,
                    service_id,
                    name,
                    class_of_service,
                };
                self.pending_requests.insert(stream_id, request.clone());
                self.events.push(ReactorEvent::TunnelRequest(request));
            }
            TunnelMessage::Close { stream_id } if self.pending_requests.contains_key(&stream_id) => {
                self.pending_requests.remove(&stream_id);
                self.send_reject(
                    stream_id,
                    State::closed(StateCode::None, "Tunnel stream closed by peer"),
                    None,
                );
            }
            other => {
                let stream_id = other.stream_id();
                match self.sessions.get_mut(&stream_id) {
                    Some(session) => session.enqueue(other),
                    None => debug!(stream_id = %stream_id, "Message for unknown tunnel stream"),
                }
            }
        }
    }

    /// Drop sessions that are closed for good
    fn reap(&mut self) {
        let closed: Vec<StreamId> = self
            .sessions
            .values()
            .filter(|s| s.state() == SessionState::Closed && !s.is_open_requested())
            .map(TunnelSession::stream_id)
            .collect();

        for stream_id in closed {
            self.sessions.remove(&stream_id);
            self.keys.retain(|_, id| *id != stream_id);
            debug!(stream_id = %stream_id, "Tunnel stream removed");
        }
    }
}

fn redirect_state(text: &str) -> State {
    State::new(StreamState::Redirected, DataState::Suspect, StateCode::UsageError, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use omm_tunnel_transport::MemoryTransport;

    fn consumer_config() -> TunnelSessionConfig {
        TunnelSessionConfig::builder()
            .name("TunnelConsumer")
            .service_name("DIRECT_FEED")
            .build()
            .unwrap()
    }

    #[test]
    fn test_open_rejects_duplicate_key() {
        let (a, _b) = MemoryTransport::pair();
        let mut reactor = Reactor::consumer(a);
        let now = Instant::now();

        let stream_id = reactor.open(consumer_config(), now).unwrap();
        assert_eq!(stream_id, FIRST_TUNNEL_STREAM_ID);
        assert!(matches!(
            reactor.open(consumer_config(), now),
            Err(SessionError::AlreadyOpen(_))
        ));
    }

    #[test]
    fn test_provider_cannot_open() {
        let (a, _b) = MemoryTransport::pair();
        let mut reactor = Reactor::provider(a);

        assert!(matches!(
            reactor.open(consumer_config(), Instant::now()),
            Err(SessionError::WrongRole(Role::Provider))
        ));
    }

    #[test]
    fn test_open_requires_login_user() {
        let (a, _b) = MemoryTransport::pair();
        let mut reactor = Reactor::consumer(a);
        let config = TunnelSessionConfig::builder()
            .use_authentication(true)
            .build()
            .unwrap();

        assert!(matches!(
            reactor.open(config, Instant::now()),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_local_close_removes_session() {
        let (a, _b) = MemoryTransport::pair();
        let mut reactor = Reactor::consumer(a);

        let stream_id = reactor.open(consumer_config(), Instant::now()).unwrap();
        reactor.close(stream_id, false).unwrap();

        assert!(reactor.session(stream_id).is_none());
        assert!(reactor.open(consumer_config(), Instant::now()).is_ok());
    }

    #[test]
    fn test_accept_without_request() {
        let (a, _b) = MemoryTransport::pair();
        let mut reactor = Reactor::provider(a);

        assert!(matches!(
            reactor.accept(1000, consumer_config()),
            Err(SessionError::NoPendingRequest(1000))
        ));
    }
}
