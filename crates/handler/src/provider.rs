//! Provider: fixed-order session list, the shared item-stream directory
//! and the service directory payload.
//!
//! Ownership is one-way: the provider owns its sessions by value; sessions
//! hold an `Arc` of [`SharedState`] only, used for the stream walk on
//! reconnect and the negotiated wire version.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::Bytes;
use tracing::{debug, info, warn};

use psych_metadata::Config;

use crate::error::WireError;
use crate::metrics;
use crate::session::Session;
use crate::wire::{
    DirectoryRefresh, ItemToken, Qos, Rate, RwfVersion, ServiceInfo, ServiceState, Timeliness,
    WireContext, WireEvent, WireMsg, MODEL_MARKET_PRICE,
};

/// Reuters Wire Format dictionary names every consumer may need.
const FIELD_DICTIONARY_NAME: &str = "RWFFld";
const ENUM_DICTIONARY_NAME: &str = "RWFEnum";

/// Publisher-side state for one distinct ric. Token slots are written by
/// the event-pump task on login transitions and read by the scheduler
/// task when publishing.
pub struct ItemStream {
    ric: String,
    tokens: RwLock<Vec<Option<ItemToken>>>,
}

impl ItemStream {
    fn new(ric: &str, sessions: usize) -> Self {
        Self {
            ric: ric.to_string(),
            tokens: RwLock::new(vec![None; sessions]),
        }
    }

    pub fn ric(&self) -> &str {
        &self.ric
    }

    pub fn token(&self, session: usize) -> Option<ItemToken> {
        self.tokens.read().unwrap().get(session).copied().flatten()
    }

    pub(crate) fn set_token(&self, session: usize, token: Option<ItemToken>) {
        let mut tokens = self.tokens.write().unwrap();
        if let Some(slot) = tokens.get_mut(session) {
            *slot = token;
        }
    }
}

/// State shared between the provider and its sessions: the ric-keyed
/// directory of weak stream references and the negotiated wire version
/// (minimum across all sessions, ratcheted down on every login).
pub struct SharedState {
    directory: RwLock<HashMap<String, Weak<ItemStream>>>,
    min_rwf: Mutex<Option<RwfVersion>>,
}

impl SharedState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            directory: RwLock::new(HashMap::new()),
            min_rwf: Mutex::new(None),
        })
    }

    pub fn rwf_version(&self) -> RwfVersion {
        self.min_rwf
            .lock()
            .unwrap()
            .unwrap_or(RwfVersion { major: 0, minor: 0 })
    }

    pub fn observe_rwf(&self, rwf: RwfVersion, prefix: &str) {
        let mut current = self.min_rwf.lock().unwrap();
        match *current {
            None => {
                info!(session = %prefix, rwf = %rwf, "negotiated wire version");
                *current = Some(rwf);
            }
            Some(existing) if rwf < existing => {
                info!(session = %prefix, rwf = %rwf, "degrading wire version");
                *current = Some(rwf);
            }
            _ => {}
        }
    }

    fn insert(&self, ric: &str, stream: &Arc<ItemStream>) {
        self.directory
            .write()
            .unwrap()
            .insert(ric.to_string(), Arc::downgrade(stream));
    }

    /// Visit every live stream; returns how many were visited.
    pub fn for_each_stream(&self, mut f: impl FnMut(&Arc<ItemStream>)) -> usize {
        let directory = self.directory.read().unwrap();
        let mut count = 0;
        for weak in directory.values() {
            if let Some(stream) = weak.upgrade() {
                f(&stream);
                count += 1;
            }
        }
        count
    }

    pub fn lookup(&self, ric: &str) -> Option<Arc<ItemStream>> {
        self.directory.read().unwrap().get(ric).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.directory.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.read().unwrap().is_empty()
    }
}

pub struct Provider {
    config: Arc<Config>,
    context: Arc<dyn WireContext>,
    sessions: Vec<Session>,
    shared: Arc<SharedState>,
}

impl Provider {
    pub fn new(config: Arc<Config>, context: Arc<dyn WireContext>) -> Self {
        let shared = SharedState::new();
        let sessions = config
            .sessions
            .iter()
            .enumerate()
            .map(|(index, session)| {
                Session::new(index, session.clone(), Arc::clone(&config), Arc::clone(&shared))
            })
            .collect();
        Self { config, context, sessions, shared }
    }

    /// Verify the wire library, then initialize every session, which
    /// acquires its OMM provider and sends its login request. Any
    /// session failure fails the whole provider.
    pub fn init(&self) -> Result<(), WireError> {
        if !self.context.verify_version() {
            return Err(WireError::InvalidConfiguration(
                "wire library version check failed".to_string(),
            ));
        }
        info!(version = %self.context.version_string(), "wire library verified");
        for session in &self.sessions {
            session.init(self.context.as_ref())?;
        }
        Ok(())
    }

    /// Allocate the stream for a ric, reserving one token slot per
    /// session; slots stay nil until the owning session unmutes.
    pub fn create_item_stream(&self, ric: &str) -> Arc<ItemStream> {
        debug!(ric, "creating item stream");
        let stream = Arc::new(ItemStream::new(ric, self.sessions.len()));
        for session in &self.sessions {
            if let Some(token) = session.create_item_token() {
                stream.set_token(session.index(), Some(token));
            }
        }
        self.shared.insert(ric, &stream);
        debug!(directory_size = self.shared.len(), "directory updated");
        stream
    }

    /// Dispatch one message to every session over its own token.
    pub fn send(&self, stream: &ItemStream, msg: &WireMsg) {
        for session in &self.sessions {
            session.send(msg, stream.token(session.index()));
        }
        metrics::inc_msgs_sent();
    }

    /// Encode the permission lock for a resource's entitlement codes, or
    /// `None` when locks are disabled or the encoder fails; an unlocked
    /// message is still published, world-readable within the service.
    pub fn encode_lock(&self, entitlement_codes: &[u32]) -> Option<Bytes> {
        let service_id = self.config.dacs_id?;
        match self.context.encode_lock(service_id, entitlement_codes) {
            Ok(lock) => Some(lock),
            Err(e) => {
                metrics::inc_lock_failure();
                warn!(error = %e, "permission lock encoding failed, publishing without lock");
                None
            }
        }
    }

    pub fn directory_refresh(&self) -> DirectoryRefresh {
        build_directory(&self.config, self.rwf_version())
    }

    pub fn rwf_version(&self) -> RwfVersion {
        self.shared.rwf_version()
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn session(&self, index: usize) -> Option<&Session> {
        self.sessions.get(index)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn unmuted_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| !s.is_muted()).count()
    }

    /// Route one event from the pump into its session.
    pub fn process_event(&self, event: WireEvent) {
        let index = match &event {
            WireEvent::Login { session, .. }
            | WireEvent::CmdError { session, .. }
            | WireEvent::Other { session, .. } => *session,
        };
        match self.sessions.get(index) {
            Some(session) => session.process_event(event),
            None => warn!(index, "event for unknown session"),
        }
    }
}

/// Build the one-entry service directory: SERVICE_INFO_ID with name,
/// vendor, capabilities, dictionaries and QoS, and SERVICE_STATE_ID up.
/// The provider is non-interactive, so AcceptingRequests is omitted.
pub fn build_directory(config: &Config, rwf: RwfVersion) -> DirectoryRefresh {
    DirectoryRefresh {
        rwf,
        service_name: config.service_name.clone(),
        info: ServiceInfo {
            name: config.service_name.clone(),
            vendor: config.vendor_name.clone(),
            capabilities: vec![u32::from(MODEL_MARKET_PRICE)],
            dictionaries: vec![
                FIELD_DICTIONARY_NAME.to_string(),
                ENUM_DICTIONARY_NAME.to_string(),
            ],
            qos: Qos { timeliness: Timeliness::RealTime, rate: Rate::TickByTick },
        },
        state: ServiceState { service_state: 1 },
    }
}
