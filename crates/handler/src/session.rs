//! Per-connection login state machine.
//!
//! A session starts muted. Login success publishes the service directory,
//! re-issues every item token for this session's slot, then unmutes.
//! Suspect and closed login states mute again; closed also discards
//! tokens. While muted, `send` drops silently and no tokens are issued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{error, info, warn};

use psych_metadata::{Config, SessionConfig};

use crate::error::WireError;
use crate::metrics::SessionMetrics;
use crate::provider::{build_directory, SharedState};
use crate::wire::{
    DataState, ItemToken, LoginRequest, RespStatus, StreamState, WireContext, WireEvent, WireMsg,
    WirePublisher,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Init,
    LoginSent,
    LoginOk,
    LoginSuspect,
    LoginClosed,
}

pub struct Session {
    index: usize,
    config: SessionConfig,
    app_config: Arc<Config>,
    prefix: String,
    shared: Arc<SharedState>,
    publisher: OnceLock<Arc<dyn WirePublisher>>,
    state: Mutex<LoginState>,
    /// Written only by the event-pump task; read by the scheduler task.
    /// SeqCst pairs the unmute store with the token writes before it.
    muted: AtomicBool,
    metrics: SessionMetrics,
}

impl Session {
    pub fn new(
        index: usize,
        config: SessionConfig,
        app_config: Arc<Config>,
        shared: Arc<SharedState>,
    ) -> Self {
        let prefix = format!("{}:", config.session_name);
        let metrics = SessionMetrics::new(&config.session_name);
        Self {
            index,
            config,
            app_config,
            prefix,
            shared,
            publisher: OnceLock::new(),
            state: Mutex::new(LoginState::Init),
            muted: AtomicBool::new(true),
            metrics,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.config.session_name
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn login_state(&self) -> LoginState {
        *self.state.lock().unwrap()
    }

    /// Acquire the OMM provider and send the login request.
    pub fn init(&self, context: &dyn WireContext) -> Result<(), WireError> {
        let publisher = context.create_provider(&self.config.publisher_name)?;
        let publisher = self.publisher.get_or_init(|| publisher);
        self.send_login_request(publisher.as_ref())
    }

    fn send_login_request(&self, publisher: &dyn WirePublisher) -> Result<(), WireError> {
        let request = LoginRequest {
            user_name: self.config.user_name.clone(),
            application_id: self.config.application_id.clone(),
            instance_id: if self.config.instance_id.is_empty() {
                None
            } else {
                Some(self.config.instance_id.clone())
            },
            position: self.config.position.clone(),
        };
        let rwf = publisher.register_login(self.index, &request)?;
        *self.state.lock().unwrap() = LoginState::LoginSent;
        self.shared.observe_rwf(rwf, &self.prefix);
        Ok(())
    }

    /// Issue a token for a new item stream, or record a nil slot while
    /// muted; the slot is filled on the next unmute.
    pub fn create_item_token(&self) -> Option<ItemToken> {
        if self.is_muted() {
            return None;
        }
        let publisher = self.publisher.get()?;
        self.metrics.inc_token_generated();
        Some(publisher.generate_token())
    }

    /// Ship a message through this session. Muted sessions drop silently.
    pub fn send(&self, msg: &WireMsg, token: Option<ItemToken>) -> bool {
        if self.is_muted() {
            return false;
        }
        match token {
            Some(token) => self.submit(msg, token),
            None => {
                warn!(session = %self.prefix, "no token for unmuted session, dropping message");
                false
            }
        }
    }

    fn submit(&self, msg: &WireMsg, token: ItemToken) -> bool {
        let Some(publisher) = self.publisher.get() else {
            warn!(session = %self.prefix, "submit before init");
            return false;
        };
        match publisher.submit(token, msg) {
            Ok(_) => {
                self.metrics.inc_submit();
                true
            }
            Err(e) => {
                error!(session = %self.prefix, error = %e, "submit failed");
                false
            }
        }
    }

    /// Dispatch one inbound wire event.
    pub fn process_event(&self, event: WireEvent) {
        match event {
            WireEvent::Login { status, .. } => self.process_login_response(status),
            WireEvent::CmdError { cmd_id, status_text, .. } => {
                self.metrics.inc_cmd_error();
                error!(
                    session = %self.prefix,
                    cmd_id,
                    status_text = %status_text,
                    "command error event"
                );
            }
            WireEvent::Other { kind, .. } => {
                self.metrics.inc_event_discarded();
                warn!(session = %self.prefix, kind = %kind, "uncaught event");
            }
        }
    }

    fn process_login_response(&self, status: RespStatus) {
        match (status.stream_state, status.data_state) {
            (StreamState::Open, DataState::Ok) => self.process_login_success(),
            (StreamState::Open, DataState::Suspect) => {
                *self.state.lock().unwrap() = LoginState::LoginSuspect;
                info!(session = %self.prefix, "login suspect, muting provider");
                self.muted.store(true, Ordering::SeqCst);
            }
            (StreamState::Closed, _) => {
                *self.state.lock().unwrap() = LoginState::LoginClosed;
                info!(session = %self.prefix, "login closed, muting provider");
                self.muted.store(true, Ordering::SeqCst);
                self.discard_tokens();
            }
            _ => {
                self.metrics.inc_event_discarded();
                warn!(session = %self.prefix, ?status, "uncaught login response");
            }
        }
    }

    /// Directory first, then token regeneration, then unmute; publishing
    /// cannot start until the directory is on the wire.
    fn process_login_success(&self) {
        if !self.send_directory_response() {
            return;
        }
        self.reset_tokens();
        *self.state.lock().unwrap() = LoginState::LoginOk;
        info!(session = %self.prefix, "unmuting provider");
        self.muted.store(false, Ordering::SeqCst);
    }

    fn send_directory_response(&self) -> bool {
        let Some(publisher) = self.publisher.get() else {
            warn!(session = %self.prefix, "directory response before init");
            return false;
        };
        let directory = build_directory(&self.app_config, self.shared.rwf_version());
        // First token after login is spent on MMT_DIRECTORY.
        let token = publisher.generate_token();
        match publisher.submit(token, &WireMsg::Directory(directory)) {
            Ok(_) => {
                self.metrics.inc_submit();
                true
            }
            Err(e) => {
                error!(session = %self.prefix, error = %e, "directory response failed");
                false
            }
        }
    }

    /// Walk the shared directory and re-issue this session's token slot
    /// on every stream. Idempotent: a second pass leaves every stream
    /// with exactly one live token for this slot.
    pub fn reset_tokens(&self) {
        let Some(publisher) = self.publisher.get() else {
            warn!(session = %self.prefix, "reset tokens whilst invalid provider");
            return;
        };
        let count = self.shared.for_each_stream(|stream| {
            stream.set_token(self.index, Some(publisher.generate_token()));
            self.metrics.inc_token_generated();
        });
        info!(session = %self.prefix, count, "reset provider tokens");
    }

    fn discard_tokens(&self) {
        self.shared.for_each_stream(|stream| {
            stream.set_token(self.index, None);
        });
    }
}
