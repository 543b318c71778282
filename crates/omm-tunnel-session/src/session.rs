//! Tunnel stream session state machine
//!
//! A session is one tunnel stream on a reactor channel. Consumer sessions
//! are created by `open` and survive closes so they can recover; provider
//! sessions exist from `accept` until they close.
//!
//! ```text
//! Closed -> OpenRequested -> (Authenticating) -> Ready -> Closing -> Closed
//!                                      any open state -> WaitingFinalStatusEvent -> Closed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use omm_tunnel_auth::{AuthError, LoginValidator};
use omm_tunnel_proto::{
    domain, AckOutcome, ClassOfService, ContainerType, GenericMsg, LoginMsg, LoginRequest,
    NackCode, QueueMsg, State, StateCode, StreamId, SubMsg, TunnelMessage, TunnelPayload,
    LOGIN_STREAM_ID,
};
use omm_tunnel_transport::{Transport, TunnelChannel};
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferGrant, BufferPool, SubmitError, TunnelBuffer};
use crate::config::{AckPolicy, TunnelSessionConfig};
use crate::directory::ServiceTracker;
use crate::dispatch::{decode_payload, encode_sub_msg};
use crate::error::{SessionError, SessionResult};
use crate::event::ReactorEvent;
use crate::items::ItemTable;
use crate::queue::{PendingAck, QueueLayer, QueueSendOptions, QUEUE_STREAM_ID};
use crate::recovery::RecoveryTimer;

/// Which end of the tunnel a reactor or session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Consumer,
    Provider,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Consumer => write!(f, "consumer"),
            Role::Provider => write!(f, "provider"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    OpenRequested,
    /// Open, provider waiting for the consumer's login
    Authenticating,
    Ready,
    /// Local close sent, waiting for the peer's closed status
    Closing,
    /// Closed, the final status event has not been delivered yet
    WaitingFinalStatusEvent,
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Authenticating | SessionState::Ready)
    }
}

/// Why a session closed; informational only, every cause ends in `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    Remote,
    Local,
    AuthenticationFailed,
    ChannelDown,
}

pub struct TunnelSession {
    stream_id: StreamId,
    role: Role,
    config: TunnelSessionConfig,
    state: SessionState,
    service_id: Option<u16>,
    tracker: ServiceTracker,
    open_requested: bool,
    final_status_requested: bool,
    final_status_delivered: bool,
    recovery: RecoveryTimer,
    negotiated: Option<ClassOfService>,
    pool: BufferPool,
    queue: QueueLayer,
    items: ItemTable,
    inbound: VecDeque<TunnelMessage>,
    pending_ack: Option<PendingAck>,
    authenticated_user: Option<String>,
    close_cause: Option<CloseCause>,
}

impl TunnelSession {
    fn new(stream_id: StreamId, role: Role, config: TunnelSessionConfig) -> Self {
        Self {
            stream_id,
            role,
            tracker: ServiceTracker::new(&config.service_name, config.domain_type),
            recovery: RecoveryTimer::new(config.recovery_interval),
            pool: BufferPool::new(
                config.guaranteed_output_buffers,
                config.class_of_service.max_msg_size as usize,
            ),
            queue: QueueLayer::new(config.domain_type),
            state: SessionState::Closed,
            service_id: None,
            open_requested: false,
            final_status_requested: false,
            final_status_delivered: false,
            negotiated: None,
            items: ItemTable::new(),
            inbound: VecDeque::new(),
            pending_ack: None,
            authenticated_user: None,
            close_cause: None,
            config,
        }
    }

    pub fn consumer(stream_id: StreamId, config: TunnelSessionConfig) -> Self {
        Self::new(stream_id, Role::Consumer, config)
    }

    /// Provider end of an accepted tunnel, open with `negotiated`
    pub fn provider(
        stream_id: StreamId,
        config: TunnelSessionConfig,
        service_id: u16,
        negotiated: ClassOfService,
    ) -> Self {
        let mut session = Self::new(stream_id, Role::Provider, config);
        session.service_id = Some(service_id);
        session.state = if negotiated.requires_login() {
            SessionState::Authenticating
        } else {
            SessionState::Ready
        };
        session.pool.set_max_msg_size(negotiated.max_msg_size as usize);
        session.pool.set_send_window(negotiated.recv_window_size.map(|w| w as usize));
        session.negotiated = Some(negotiated);
        session
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &TunnelSessionConfig {
        &self.config
    }

    pub fn service_id(&self) -> Option<u16> {
        self.service_id
    }

    pub fn tracker(&self) -> &ServiceTracker {
        &self.tracker
    }

    pub fn is_open_requested(&self) -> bool {
        self.open_requested
    }

    pub fn recovery(&self) -> &RecoveryTimer {
        &self.recovery
    }

    pub fn negotiated_cos(&self) -> Option<&ClassOfService> {
        self.negotiated.as_ref()
    }

    pub fn buffers_used(&self) -> usize {
        self.pool.buffers_used()
    }

    pub fn queue(&self) -> &QueueLayer {
        &self.queue
    }

    pub fn items(&self) -> &ItemTable {
        &self.items
    }

    pub fn pending_ack(&self) -> Option<&PendingAck> {
        self.pending_ack.as_ref()
    }

    pub fn authenticated_user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    pub fn close_cause(&self) -> Option<CloseCause> {
        self.close_cause
    }

    pub fn on_directory_update(&mut self, update: &omm_tunnel_proto::DirectoryUpdate) {
        self.tracker.apply(update);
    }

    /// Ask for the tunnel to be opened
    ///
    /// Sends the open request only when the bound service is found, up and
    /// supports the domain; otherwise the attempt is a no-op and recovery
    /// retries it after the interval.
    pub fn open<T: Transport>(
        &mut self,
        now: Instant,
        channel: &mut TunnelChannel<T>,
    ) -> SessionResult<()> {
        if self.state != SessionState::Closed {
            return Ok(());
        }
        self.open_requested = true;

        let service_id = match self.tracker.service_id() {
            Some(id) if self.tracker.is_available() => id,
            _ => {
                debug!(
                    stream_id = %self.stream_id,
                    service = %self.config.service_name,
                    "Service not available, tunnel stream open deferred"
                );
                self.recovery.schedule(now);
                return Ok(());
            }
        };

        let request = TunnelMessage::OpenRequest {
            stream_id: self.stream_id,
            domain_type: self.config.domain_type,
            service_id,
            name: self.config.name.clone(),
            class_of_service: self.config.requested_class_of_service(),
        };

        if let Err(e) = channel.send_message(&request) {
            error!(stream_id = %self.stream_id, "Failed to send tunnel stream open request: {}", e);
            self.recovery.schedule(now);
            return Err(e.into());
        }

        info!(
            stream_id = %self.stream_id,
            service_id = service_id,
            name = %self.config.name,
            "Tunnel stream open requested"
        );
        self.service_id = Some(service_id);
        self.state = SessionState::OpenRequested;
        Ok(())
    }

    /// Record that the application wants the tunnel open without trying now
    pub fn request_open(&mut self) {
        self.open_requested = true;
    }

    /// Whether recovery should attempt `open` at `now`
    pub fn recovery_due(&self, now: Instant) -> bool {
        self.role == Role::Consumer
            && self.state == SessionState::Closed
            && self.open_requested
            && self.recovery.is_due(now)
    }

    pub fn suspend_recovery(&mut self) {
        self.recovery.suspend();
    }

    /// Resume recovery with an attempt due immediately
    pub fn resume_recovery(&mut self) {
        self.recovery.resume();
        self.recovery.make_due();
    }

    /// Tell the consumer the provider accepted the tunnel
    pub fn accepted<T: Transport>(
        &mut self,
        channel: &mut TunnelChannel<T>,
        events: &mut Vec<ReactorEvent>,
    ) -> SessionResult<()> {
        let class_of_service = self.negotiated.clone().unwrap_or_default();
        channel.send_message(&TunnelMessage::Refresh {
            stream_id: self.stream_id,
            state: State::open_ok("Tunnel stream accepted"),
            class_of_service: class_of_service.clone(),
        })?;

        info!(stream_id = %self.stream_id, state = ?self.state, "Tunnel stream accepted");
        if self.state == SessionState::Ready {
            events.push(ReactorEvent::TunnelOpened {
                stream_id: self.stream_id,
                class_of_service,
            });
        }
        Ok(())
    }

    /// Close from this end
    ///
    /// With `final_status_event` the session waits for the peer to confirm
    /// and reports the close through one last event; without it the
    /// session is closed at once and no event follows.
    pub fn close<T: Transport>(
        &mut self,
        final_status_event: bool,
        channel: &mut TunnelChannel<T>,
        events: &mut Vec<ReactorEvent>,
    ) -> SessionResult<()> {
        self.open_requested = false;

        match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Closing | SessionState::WaitingFinalStatusEvent => return Ok(()),
            _ => {}
        }

        let state = State::closed(StateCode::None, "Tunnel stream closed");
        let msg = match self.role {
            Role::Consumer => TunnelMessage::Close {
                stream_id: self.stream_id,
            },
            Role::Provider => TunnelMessage::Status {
                stream_id: self.stream_id,
                state: state.clone(),
                expected_cos: None,
            },
        };
        if let Err(e) = channel.send_message(&msg) {
            warn!(stream_id = %self.stream_id, "Failed to send tunnel stream close: {}", e);
        }

        info!(stream_id = %self.stream_id, final_status_event, "Closing tunnel stream");

        match (self.role, final_status_event) {
            (Role::Consumer, true) => {
                self.final_status_requested = true;
                self.state = SessionState::Closing;
            }
            (Role::Provider, true) => {
                self.state = SessionState::WaitingFinalStatusEvent;
                self.close_cause = Some(CloseCause::Local);
                events.push(ReactorEvent::TunnelClosed {
                    stream_id: self.stream_id,
                    state,
                    cause: CloseCause::Local,
                    expected_cos: None,
                });
            }
            _ => self.enter_closed(CloseCause::Local),
        }

        Ok(())
    }

    /// The final status event returned by a dispatch has reached the
    /// application
    pub fn mark_final_status_delivered(&mut self) {
        if self.state == SessionState::WaitingFinalStatusEvent {
            self.final_status_delivered = true;
        }
    }

    /// Finish a close whose final status event was delivered
    pub fn finalize_if_delivered(&mut self) -> bool {
        if self.state == SessionState::WaitingFinalStatusEvent && self.final_status_delivered {
            let cause = self.close_cause.unwrap_or(CloseCause::Local);
            self.enter_closed(cause);
            true
        } else {
            false
        }
    }

    /// The channel went down; nothing in flight survives
    pub fn on_channel_down(&mut self, events: &mut Vec<ReactorEvent>) {
        self.recovery.suspend();

        match self.state {
            SessionState::Closed => {}
            SessionState::WaitingFinalStatusEvent => {
                self.enter_closed(self.close_cause.unwrap_or(CloseCause::Local));
            }
            _ => {
                self.enter_closed(CloseCause::ChannelDown);
                events.push(ReactorEvent::TunnelClosed {
                    stream_id: self.stream_id,
                    state: State::closed_recover(StateCode::None, "Channel down"),
                    cause: CloseCause::ChannelDown,
                    expected_cos: None,
                });
            }
        }
    }

    pub fn on_flushed(&mut self, count: usize) {
        self.pool.on_flushed(count);
    }

    fn enter_closed(&mut self, cause: CloseCause) {
        info!(stream_id = %self.stream_id, cause = ?cause, "Tunnel stream closed");

        self.state = SessionState::Closed;
        self.close_cause = Some(cause);
        self.negotiated = None;
        self.final_status_requested = false;
        self.final_status_delivered = false;
        self.pool.reset();
        self.queue = QueueLayer::new(self.config.domain_type);
        self.items.clear();
        self.inbound.clear();
        self.pending_ack = None;
        self.authenticated_user = None;
        if self.role == Role::Provider {
            self.open_requested = false;
        }
    }

    /// Queue an inbound message for this session
    pub fn enqueue(&mut self, msg: TunnelMessage) {
        self.inbound.push_back(msg);
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Process queued inbound messages in arrival order
    ///
    /// Stops while an inbound queue message waits for the application's
    /// Ack or Nack.
    pub fn process_backlog<T: Transport>(
        &mut self,
        now: Instant,
        channel: &mut TunnelChannel<T>,
        validator: &dyn LoginValidator,
        events: &mut Vec<ReactorEvent>,
    ) {
        self.retry_auto_ack(channel);

        while self.pending_ack.is_none() {
            let Some(msg) = self.inbound.pop_front() else {
                break;
            };
            if let Err(e) = self.handle_message(msg, now, channel, validator, events) {
                warn!(stream_id = %self.stream_id, "Failed to process tunnel message: {}", e);
            }
        }
    }

    fn handle_message<T: Transport>(
        &mut self,
        msg: TunnelMessage,
        now: Instant,
        channel: &mut TunnelChannel<T>,
        validator: &dyn LoginValidator,
        events: &mut Vec<ReactorEvent>,
    ) -> SessionResult<()> {
        match msg {
            TunnelMessage::Refresh {
                state,
                class_of_service,
                ..
            } => {
                if state.is_final() {
                    self.on_remote_close(state, None, now, events);
                } else {
                    self.on_open_state(state, Some(class_of_service), channel, events)?;
                }
            }
            TunnelMessage::Status {
                state, expected_cos, ..
            } => {
                if state.is_final() {
                    self.on_remote_close(state, expected_cos, now, events);
                } else {
                    self.on_open_state(state, None, channel, events)?;
                }
            }
            TunnelMessage::Close { .. } => {
                let state = State::closed(StateCode::None, "Tunnel stream closed by peer");
                if self.role == Role::Provider && self.state != SessionState::Closed {
                    channel.send_message(&TunnelMessage::Status {
                        stream_id: self.stream_id,
                        state: state.clone(),
                        expected_cos: None,
                    })?;
                }
                self.on_remote_close(state, None, now, events);
            }
            TunnelMessage::Data {
                container_type,
                data,
                ..
            } => {
                if !self.state.is_open() {
                    warn!(stream_id = %self.stream_id, state = ?self.state, "Dropping data on a tunnel stream that is not open");
                    return Ok(());
                }
                let payload = decode_payload(container_type, data)?;
                self.handle_payload(payload, channel, validator, now, events)?;
            }
            TunnelMessage::OpenRequest { .. } => {
                warn!(stream_id = %self.stream_id, "Unexpected open request on an existing tunnel stream");
            }
        }
        Ok(())
    }

    fn on_open_state<T: Transport>(
        &mut self,
        state: State,
        class_of_service: Option<ClassOfService>,
        channel: &mut TunnelChannel<T>,
        events: &mut Vec<ReactorEvent>,
    ) -> SessionResult<()> {
        if self.state != SessionState::OpenRequested || !state.is_open_ok() {
            events.push(ReactorEvent::Status {
                stream_id: self.stream_id,
                state,
            });
            return Ok(());
        }

        let negotiated =
            class_of_service.unwrap_or_else(|| self.config.requested_class_of_service());
        self.pool.set_max_msg_size(negotiated.max_msg_size as usize);
        self.pool.set_send_window(negotiated.recv_window_size.map(|w| w as usize));
        self.recovery.reset();
        self.state = SessionState::Ready;

        if self.config.use_authentication {
            let login = SubMsg::Login(LoginMsg::Request(LoginRequest {
                stream_id: LOGIN_STREAM_ID,
                user_name: self.config.user_name.clone(),
                token: self.config.token.clone(),
                application_id: None,
            }));
            self.send_control(channel, &login)?;
            self.items.requested(LOGIN_STREAM_ID, domain::LOGIN);
            debug!(stream_id = %self.stream_id, user = %self.config.user_name, "Login request sent");
        }

        info!(stream_id = %self.stream_id, minor = negotiated.protocol_minor_version, "Tunnel stream opened");
        events.push(ReactorEvent::TunnelOpened {
            stream_id: self.stream_id,
            class_of_service: negotiated.clone(),
        });
        self.negotiated = Some(negotiated);
        Ok(())
    }

    fn on_remote_close(
        &mut self,
        state: State,
        expected_cos: Option<ClassOfService>,
        now: Instant,
        events: &mut Vec<ReactorEvent>,
    ) {
        match self.state {
            SessionState::Closed | SessionState::WaitingFinalStatusEvent => {
                debug!(stream_id = %self.stream_id, "Ignoring close for a closed tunnel stream");
                return;
            }
            SessionState::Closing if self.final_status_requested => {
                self.state = SessionState::WaitingFinalStatusEvent;
                self.close_cause = Some(CloseCause::Local);
                events.push(ReactorEvent::TunnelClosed {
                    stream_id: self.stream_id,
                    state,
                    cause: CloseCause::Local,
                    expected_cos,
                });
                return;
            }
            _ => {}
        }

        let cause = if self.state == SessionState::Closing {
            CloseCause::Local
        } else {
            CloseCause::Remote
        };
        warn!(stream_id = %self.stream_id, "Tunnel stream closed by peer: {}", state);
        self.enter_closed(cause);
        if self.open_requested {
            self.recovery.schedule(now);
        }

        events.push(ReactorEvent::TunnelClosed {
            stream_id: self.stream_id,
            state,
            cause,
            expected_cos,
        });
    }

    fn on_auth_failed(&mut self, state: State, now: Instant, events: &mut Vec<ReactorEvent>) {
        self.enter_closed(CloseCause::AuthenticationFailed);
        if self.open_requested {
            self.recovery.schedule(now);
        }
        events.push(ReactorEvent::TunnelClosed {
            stream_id: self.stream_id,
            state,
            cause: CloseCause::AuthenticationFailed,
            expected_cos: None,
        });
    }

    fn handle_payload<T: Transport>(
        &mut self,
        payload: TunnelPayload,
        channel: &mut TunnelChannel<T>,
        validator: &dyn LoginValidator,
        now: Instant,
        events: &mut Vec<ReactorEvent>,
    ) -> SessionResult<()> {
        if self.state == SessionState::Authenticating {
            return match payload {
                TunnelPayload::Login(LoginMsg::Request(request)) => {
                    self.authenticate(request, channel, validator, now, events)
                }
                _ => {
                    warn!(stream_id = %self.stream_id, "Dropping message received before login");
                    Ok(())
                }
            };
        }

        match payload {
            TunnelPayload::Opaque { .. } => {
                events.push(ReactorEvent::Message {
                    stream_id: self.stream_id,
                    payload,
                });
            }
            TunnelPayload::Generic(ref msg) => {
                self.items.on_generic(msg.stream_id, msg.domain_type, msg.kind);
                events.push(ReactorEvent::Message {
                    stream_id: self.stream_id,
                    payload,
                });
            }
            TunnelPayload::Login(login) => self.handle_login(login, channel, validator, now, events)?,
            TunnelPayload::Queue(msg) => self.handle_queue(msg, channel, events)?,
        }
        Ok(())
    }

    fn authenticate<T: Transport>(
        &mut self,
        request: LoginRequest,
        channel: &mut TunnelChannel<T>,
        validator: &dyn LoginValidator,
        now: Instant,
        events: &mut Vec<ReactorEvent>,
    ) -> SessionResult<()> {
        let domain_type = self.config.domain_type;
        let result = validator.validate(&request).and_then(|auth| {
            if auth.permits_domain(domain_type) {
                Ok(auth)
            } else {
                Err(AuthError::DomainNotPermitted(domain_type))
            }
        });

        match result {
            Ok(auth) => {
                let refresh = SubMsg::Login(LoginMsg::Refresh {
                    stream_id: request.stream_id,
                    user_name: auth.user_name.clone(),
                    state: State::open_ok("Login accepted"),
                });
                self.send_control(channel, &refresh)?;
                self.items.opened(request.stream_id, domain::LOGIN);

                info!(stream_id = %self.stream_id, user = %auth.user_name, "Tunnel stream authenticated");
                self.authenticated_user = Some(auth.user_name);

                if self.state == SessionState::Authenticating {
                    self.state = SessionState::Ready;
                    events.push(ReactorEvent::TunnelOpened {
                        stream_id: self.stream_id,
                        class_of_service: self.negotiated.clone().unwrap_or_default(),
                    });
                }
                Ok(())
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, user = %request.user_name, "Login rejected: {}", e);

                let text = e.to_string();
                let login_status = SubMsg::Login(LoginMsg::Status {
                    stream_id: request.stream_id,
                    state: State::closed(StateCode::NotAuthorized, &text),
                });
                if let Err(e) = self.send_control(channel, &login_status) {
                    warn!(stream_id = %self.stream_id, "Failed to send login status: {}", e);
                }

                let state = State::closed(StateCode::NotAuthorized, "Authentication failed");
                if let Err(e) = channel.send_message(&TunnelMessage::Status {
                    stream_id: self.stream_id,
                    state: state.clone(),
                    expected_cos: None,
                }) {
                    warn!(stream_id = %self.stream_id, "Failed to send tunnel stream status: {}", e);
                }

                self.on_auth_failed(state, now, events);
                Ok(())
            }
        }
    }

    fn handle_login<T: Transport>(
        &mut self,
        login: LoginMsg,
        channel: &mut TunnelChannel<T>,
        validator: &dyn LoginValidator,
        now: Instant,
        events: &mut Vec<ReactorEvent>,
    ) -> SessionResult<()> {
        match login {
            LoginMsg::Request(request) if self.role == Role::Provider => {
                self.authenticate(request, channel, validator, now, events)?;
            }
            LoginMsg::Request(_) => {
                warn!(stream_id = %self.stream_id, "Consumer received a login request");
            }
            LoginMsg::Refresh {
                stream_id,
                user_name,
                state,
            } => {
                if state.is_final() {
                    self.on_auth_failed(state, now, events);
                } else {
                    self.items.opened(stream_id, domain::LOGIN);
                    self.authenticated_user = Some(user_name.clone());
                    events.push(ReactorEvent::LoginAccepted {
                        stream_id: self.stream_id,
                        user_name,
                    });
                }
            }
            LoginMsg::Status { state, .. } => {
                if state.is_final() {
                    warn!(stream_id = %self.stream_id, "Login closed: {}", state);
                    self.on_auth_failed(state, now, events);
                } else {
                    events.push(ReactorEvent::Status {
                        stream_id: self.stream_id,
                        state,
                    });
                }
            }
        }
        Ok(())
    }

    fn handle_queue<T: Transport>(
        &mut self,
        msg: QueueMsg,
        channel: &mut TunnelChannel<T>,
        events: &mut Vec<ReactorEvent>,
    ) -> SessionResult<()> {
        debug!(stream_id = %self.stream_id, kind = msg.kind(), "Queue message received");

        match msg {
            QueueMsg::Request(request) => {
                if self.role != Role::Provider {
                    warn!(stream_id = %self.stream_id, "Consumer received a queue request");
                    return Ok(());
                }
                let reply = self
                    .queue
                    .answer_request(&request, self.config.is_queue_capable);
                if self.queue.is_open() {
                    self.items.opened(request.stream_id, request.domain_type);
                }
                self.send_control(channel, &SubMsg::Queue(reply))?;
            }
            QueueMsg::Refresh(refresh) => {
                self.queue.on_refresh(&refresh);
                if self.queue.is_open() {
                    self.items.opened(refresh.stream_id, refresh.domain_type);
                } else {
                    self.items.closed(refresh.stream_id);
                }
                events.push(ReactorEvent::QueueRefresh {
                    stream_id: self.stream_id,
                    refresh,
                });
            }
            QueueMsg::Status(status) => {
                self.queue.on_status(&status);
                if !self.queue.is_open() {
                    self.items.closed(status.stream_id);
                }
                events.push(ReactorEvent::QueueStatus {
                    stream_id: self.stream_id,
                    status,
                });
            }
            QueueMsg::Data(data) => {
                self.items.updated(data.stream_id);
                let ack_required = match self.queue.on_data(&data) {
                    Some(pending) => {
                        self.pending_ack = Some(pending);
                        match self.config.ack_policy {
                            AckPolicy::Auto => {
                                self.retry_auto_ack(channel);
                                false
                            }
                            AckPolicy::Manual => true,
                        }
                    }
                    None => false,
                };
                events.push(ReactorEvent::QueueData {
                    stream_id: self.stream_id,
                    data,
                    ack_required,
                });
            }
            QueueMsg::DataExpired(expired) => {
                self.queue.on_expired(&expired);
                events.push(ReactorEvent::QueueDataExpired {
                    stream_id: self.stream_id,
                    expired,
                });
            }
            QueueMsg::Ack(ack) => {
                self.queue.on_ack(&ack);
                events.push(ReactorEvent::QueueAck {
                    stream_id: self.stream_id,
                    ack,
                });
            }
        }
        Ok(())
    }

    /// Answer the inbound queue message waiting for acknowledgement
    pub fn acknowledge<T: Transport>(
        &mut self,
        identifier: u64,
        outcome: AckOutcome,
        channel: &mut TunnelChannel<T>,
    ) -> SessionResult<()> {
        let pending = match self.pending_ack.take() {
            Some(pending) if pending.identifier == identifier => pending,
            other => {
                self.pending_ack = other;
                return Err(SessionError::NoPendingAck(identifier));
            }
        };

        let ack = pending.clone().into_ack(outcome);
        if let Err(e) = self.send_control(channel, &SubMsg::Queue(QueueMsg::Ack(ack))) {
            self.pending_ack = Some(pending);
            return Err(e);
        }

        debug!(stream_id = %self.stream_id, identifier, "Queue message acknowledged");
        Ok(())
    }

    /// Send the automatic Ack still owed for an inbound message
    ///
    /// A failed write keeps the message pending, so later inbound messages
    /// wait until the Ack goes out.
    fn retry_auto_ack<T: Transport>(&mut self, channel: &mut TunnelChannel<T>) {
        if self.config.ack_policy != AckPolicy::Auto {
            return;
        }
        let Some(identifier) = self.pending_ack.as_ref().map(|p| p.identifier) else {
            return;
        };
        if let Err(e) = self.acknowledge(identifier, AckOutcome::Ack, channel) {
            warn!(stream_id = %self.stream_id, identifier, "Automatic queue ack failed, will retry: {}", e);
        }
    }

    pub fn nack<T: Transport>(
        &mut self,
        identifier: u64,
        code: NackCode,
        text: &str,
        channel: &mut TunnelChannel<T>,
    ) -> SessionResult<()> {
        self.acknowledge(
            identifier,
            AckOutcome::Nack {
                code,
                text: text.to_string(),
            },
            channel,
        )
    }

    fn check_ready(&self) -> SessionResult<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Authenticating => Err(SessionError::Busy(self.stream_id)),
            _ => Err(SessionError::NotOpen(self.stream_id)),
        }
    }

    pub fn acquire(&mut self, size_hint: usize) -> SessionResult<BufferGrant> {
        match self.state {
            SessionState::Ready => self.pool.acquire(self.stream_id, size_hint),
            SessionState::Authenticating => Ok(BufferGrant::Busy),
            _ => Err(SessionError::NotOpen(self.stream_id)),
        }
    }

    pub fn release(&mut self, buffer: TunnelBuffer) {
        self.pool.release(buffer);
    }

    /// Hand a buffer to the transport; on failure the caller gets it back
    pub fn submit<T: Transport>(
        &mut self,
        buffer: TunnelBuffer,
        container_type: ContainerType,
        channel: &mut TunnelChannel<T>,
    ) -> Result<(), SubmitError> {
        if let Err(source) = self.check_ready() {
            return Err(SubmitError { buffer, source });
        }

        let len = buffer.len();
        let msg = TunnelMessage::Data {
            stream_id: self.stream_id,
            container_type,
            data: buffer.as_bytes().to_vec(),
        };

        match channel.send_tracked(&msg, self.stream_id) {
            Ok(()) => {
                self.pool.on_submitted(len);
                Ok(())
            }
            Err(e) => {
                error!(stream_id = %self.stream_id, "Submit failed: {}", e);
                Err(SubmitError {
                    buffer,
                    source: e.into(),
                })
            }
        }
    }

    /// Send application traffic, charged to the buffer budget
    fn send_charged<T: Transport>(
        &mut self,
        msg: &TunnelMessage,
        size: usize,
        channel: &mut TunnelChannel<T>,
    ) -> SessionResult<()> {
        self.check_ready()?;

        let buffer = match self.pool.acquire(self.stream_id, size)? {
            BufferGrant::Granted(buffer) => buffer,
            BufferGrant::Busy => return Err(SessionError::Busy(self.stream_id)),
        };

        match channel.send_tracked(msg, self.stream_id) {
            Ok(()) => {
                self.pool.on_submitted(size);
                Ok(())
            }
            Err(e) => {
                self.pool.release(buffer);
                Err(e.into())
            }
        }
    }

    fn send_control<T: Transport>(
        &self,
        channel: &mut TunnelChannel<T>,
        msg: &SubMsg,
    ) -> SessionResult<()> {
        let data = encode_sub_msg(self.stream_id, msg)?;
        channel.send_message(&data)?;
        Ok(())
    }

    pub fn send_generic<T: Transport>(
        &mut self,
        msg: GenericMsg,
        channel: &mut TunnelChannel<T>,
    ) -> SessionResult<()> {
        self.check_ready()?;

        let (stream_id, domain_type, kind, size) =
            (msg.stream_id, msg.domain_type, msg.kind, msg.data.len());
        let data = encode_sub_msg(self.stream_id, &SubMsg::Generic(msg))?;
        self.send_charged(&data, size, channel)?;
        self.items.on_generic(stream_id, domain_type, kind);
        Ok(())
    }

    /// Open the queue sub-stream
    pub fn request_queue<T: Transport>(
        &mut self,
        source_name: &str,
        channel: &mut TunnelChannel<T>,
    ) -> SessionResult<()> {
        self.check_ready()?;

        let request = self.queue.request(source_name)?;
        if let Err(e) = self.send_control(channel, &SubMsg::Queue(request)) {
            self.queue = QueueLayer::new(self.config.domain_type);
            return Err(e);
        }

        self.items.requested(QUEUE_STREAM_ID, self.config.domain_type);
        info!(stream_id = %self.stream_id, source = %source_name, "Queue stream requested");
        Ok(())
    }

    /// Send one queue message and return its identifier
    pub fn send_queue_msg<T: Transport>(
        &mut self,
        dest_name: &str,
        payload: Vec<u8>,
        options: &QueueSendOptions,
        channel: &mut TunnelChannel<T>,
    ) -> SessionResult<u64> {
        self.check_ready()?;

        let data = self.queue.prepare(dest_name, payload, options)?;
        let size = data.payload.len();
        let msg = encode_sub_msg(self.stream_id, &SubMsg::Queue(QueueMsg::Data(data.clone())))?;
        self.send_charged(&msg, size, channel)?;

        self.queue.on_sent(&data);
        Ok(data.identifier)
    }
}
