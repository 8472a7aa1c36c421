//! The downstream wire library, reduced to the surface this handler uses.
//!
//! The real fabric is an external dependency; the core talks to it through
//! [`WireContext`] and [`WirePublisher`] and receives its asynchronous
//! login/error events on the process event queue.

pub mod loopback;
pub mod message;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::WireError;
pub use message::{
    DataState, DirectoryRefresh, FieldEntry, FieldValue, Qos, Rate, RefreshMsg, RespStatus,
    RwfVersion, ServiceInfo, ServiceState, StreamState, Timeliness, WireMsg, MODEL_DIRECTORY,
    MODEL_LOGIN, MODEL_MARKET_PRICE, STATUS_CODE_NONE,
};

/// Opaque per-session item token. Valid from login success to login close;
/// re-issued by the library on every reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemToken(pub u64);

/// Login request attributes; bearer-style identifiers only.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub user_name: String,
    pub application_id: String,
    pub instance_id: Option<String>,
    pub position: String,
}

/// Asynchronous events delivered by the library on the event queue.
/// `session` is the index assigned at login registration.
#[derive(Debug, Clone)]
pub enum WireEvent {
    /// Login response for MMT_LOGIN.
    Login { session: usize, status: RespStatus },
    /// Error raised by a prior submit call.
    CmdError {
        session: usize,
        cmd_id: u64,
        status_text: String,
    },
    /// Anything the session has no handler for.
    Other { session: usize, kind: String },
}

/// Sender half of the process event queue, handed to the wire library at
/// construction; the pump task owns the receiver.
pub type EventSender = mpsc::Sender<WireEvent>;
pub type EventReceiver = mpsc::Receiver<WireEvent>;

/// Depth of the process event queue.
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// Create the process event queue.
pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_QUEUE_DEPTH)
}

/// The library context: version checks, provider construction and the
/// DACS lock encoder.
pub trait WireContext: Send + Sync {
    /// True when the linked library is usable.
    fn verify_version(&self) -> bool;

    /// Library version string, for the startup log.
    fn version_string(&self) -> String;

    /// Create one OMM provider publishing under `publisher_name`.
    fn create_provider(
        &self,
        publisher_name: &str,
    ) -> Result<std::sync::Arc<dyn WirePublisher>, WireError>;

    /// Encode a permission lock over `entitlement_codes`, OR-combined,
    /// for the numeric `service_id`.
    fn encode_lock(&self, service_id: i32, entitlement_codes: &[u32]) -> Result<Bytes, WireError>;
}

/// One OMM provider bound to one session.
pub trait WirePublisher: Send + Sync {
    /// Register login interest; events for this login arrive on the event
    /// queue tagged with `session`. Returns the connection's negotiated
    /// wire version.
    fn register_login(&self, session: usize, request: &LoginRequest)
        -> Result<RwfVersion, WireError>;

    /// Issue a fresh item token.
    fn generate_token(&self) -> ItemToken;

    /// Write a response message out through `token`.
    fn submit(&self, token: ItemToken, msg: &WireMsg) -> Result<u32, WireError>;
}
