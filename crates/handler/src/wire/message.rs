//! Message model handed across the wire-library boundary.
//!
//! The fabric's codec is opaque; these structs are the structural form the
//! library encodes. Field values are pre-quantized by the mapper.

use bytes::Bytes;

/// Message model types used by this provider.
pub const MODEL_LOGIN: u8 = 1;
pub const MODEL_DIRECTORY: u8 = 4;
pub const MODEL_MARKET_PRICE: u8 = 6;

/// Refresh status code carried on every message we publish.
pub const STATUS_CODE_NONE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unspecified,
    Open,
    NonStreaming,
    Closed,
    ClosedRecover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    Unspecified,
    Ok,
    Suspect,
}

/// (stream state, data state, status code) triple attached to responses
/// and reported back on login events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespStatus {
    pub stream_state: StreamState,
    pub data_state: DataState,
    pub status_code: u8,
}

impl RespStatus {
    pub fn open_ok() -> Self {
        Self {
            stream_state: StreamState::Open,
            data_state: DataState::Ok,
            status_code: STATUS_CODE_NONE,
        }
    }

    pub fn open_suspect() -> Self {
        Self {
            stream_state: StreamState::Open,
            data_state: DataState::Suspect,
            status_code: STATUS_CODE_NONE,
        }
    }

    pub fn closed() -> Self {
        Self {
            stream_state: StreamState::Closed,
            data_state: DataState::Suspect,
            status_code: STATUS_CODE_NONE,
        }
    }
}

/// Negotiated wire format version tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RwfVersion {
    pub major: u8,
    pub minor: u8,
}

impl RwfVersion {
    /// Lower of the two versions, major first.
    pub fn min(self, other: RwfVersion) -> RwfVersion {
        std::cmp::min(self, other)
    }
}

impl std::fmt::Display for RwfVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// ASCII string buffer.
    Ascii(String),
    /// RMTES string buffer.
    Rmtes(String),
    /// Signed mantissa with decimal exponent.
    Real64 { mantissa: i64, exponent: i8 },
    /// Blank Real64, bound for nonfinite cells.
    Blank,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldEntry {
    pub fid: i32,
    pub value: FieldValue,
}

/// A full unsolicited image for one item stream.
#[derive(Debug, Clone)]
pub struct RefreshMsg {
    pub model_type: u8,
    pub unsolicited: bool,
    pub complete: bool,
    pub rwf: RwfVersion,
    pub service_name: String,
    pub item_name: String,
    pub status: RespStatus,
    pub fields: Vec<FieldEntry>,
    /// DACS permission lock; absent messages are world-readable within
    /// the service.
    pub permission_data: Option<Bytes>,
}

impl RefreshMsg {
    pub fn field(&self, fid: i32) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.fid == fid).map(|f| &f.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeliness {
    RealTime,
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rate {
    TickByTick,
    JustInTimeFiltered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qos {
    pub timeliness: Timeliness,
    pub rate: Rate,
}

/// SERVICE_INFO_ID filter entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    pub vendor: String,
    /// Message model types the service can provide.
    pub capabilities: Vec<u32>,
    /// Dictionaries a consumer may need for this service.
    pub dictionaries: Vec<String>,
    pub qos: Qos,
}

/// SERVICE_STATE_ID filter entry. 1 is up, 0 is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceState {
    pub service_state: u8,
}

/// The one-service directory map published after every login.
#[derive(Debug, Clone)]
pub struct DirectoryRefresh {
    pub rwf: RwfVersion,
    pub service_name: String,
    pub info: ServiceInfo,
    pub state: ServiceState,
}

/// Anything submitted through an item token.
#[derive(Debug, Clone)]
pub enum WireMsg {
    Refresh(RefreshMsg),
    Directory(DirectoryRefresh),
}
