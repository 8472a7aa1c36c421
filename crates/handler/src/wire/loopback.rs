//! In-process stand-in for the downstream wire library.
//!
//! Answers every login with a configurable status (Open/Ok unless told
//! otherwise), issues sequential tokens and records every submitted
//! message. Backs the test suite and standalone runs without a fabric.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::WireError;
use crate::wire::{
    EventSender, ItemToken, LoginRequest, RespStatus, RwfVersion, WireContext, WireEvent,
    WireMsg, WirePublisher,
};

/// Lock blob layout version.
const LOCK_VERSION: u8 = 1;
/// OR combinator tag.
const LOCK_COMBINATOR_OR: u8 = 1;

/// One message captured by [`LoopbackContext`].
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub publisher: String,
    pub token: ItemToken,
    pub msg: WireMsg,
}

/// Shared capture log, readable while the context is live.
pub type SubmitLog = Arc<Mutex<Vec<SubmitRecord>>>;

pub struct LoopbackContext {
    events: EventSender,
    rwf: RwfVersion,
    login_status: Mutex<RespStatus>,
    fail_submits: Arc<AtomicBool>,
    fail_locks: AtomicBool,
    submitted: SubmitLog,
}

impl LoopbackContext {
    pub fn new(events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            events,
            rwf: RwfVersion { major: 14, minor: 1 },
            login_status: Mutex::new(RespStatus::open_ok()),
            fail_submits: Arc::new(AtomicBool::new(false)),
            fail_locks: AtomicBool::new(false),
            submitted: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Messages submitted so far, across all publishers.
    pub fn submitted(&self) -> SubmitLog {
        Arc::clone(&self.submitted)
    }

    /// Status delivered on subsequent login registrations.
    pub fn set_login_status(&self, status: RespStatus) {
        *self.login_status.lock().unwrap() = status;
    }

    /// Make every submit fail, for publish-error paths.
    pub fn set_fail_submits(&self, fail: bool) {
        self.fail_submits.store(fail, Ordering::SeqCst);
    }

    /// Make the lock encoder fail, for lockless-publish paths.
    pub fn set_fail_locks(&self, fail: bool) {
        self.fail_locks.store(fail, Ordering::SeqCst);
    }
}

impl WireContext for LoopbackContext {
    fn verify_version(&self) -> bool {
        true
    }

    fn version_string(&self) -> String {
        format!("loopback/{} rwf {}", env!("CARGO_PKG_VERSION"), self.rwf)
    }

    fn create_provider(
        &self,
        publisher_name: &str,
    ) -> Result<Arc<dyn WirePublisher>, WireError> {
        if publisher_name.is_empty() {
            return Err(WireError::InvalidConfiguration(
                "empty publisher name".to_string(),
            ));
        }
        Ok(Arc::new(LoopbackPublisher {
            name: publisher_name.to_string(),
            events: self.events.clone(),
            rwf: self.rwf,
            login_status: *self.login_status.lock().unwrap(),
            next_token: AtomicU64::new(1),
            fail_submits: Arc::clone(&self.fail_submits),
            submitted: Arc::clone(&self.submitted),
        }))
    }

    fn encode_lock(&self, service_id: i32, entitlement_codes: &[u32]) -> Result<Bytes, WireError> {
        if self.fail_locks.load(Ordering::SeqCst) {
            return Err(WireError::InvalidUsage("lock encoder disabled".to_string()));
        }
        if entitlement_codes.is_empty() {
            return Err(WireError::InvalidUsage("empty entitlement list".to_string()));
        }
        let mut buf = BytesMut::with_capacity(8 + 4 * entitlement_codes.len());
        buf.put_u8(LOCK_VERSION);
        buf.put_i32(service_id);
        buf.put_u8(LOCK_COMBINATOR_OR);
        buf.put_u16(entitlement_codes.len() as u16);
        for code in entitlement_codes {
            buf.put_u32(*code);
        }
        Ok(buf.freeze())
    }
}

pub struct LoopbackPublisher {
    name: String,
    events: EventSender,
    rwf: RwfVersion,
    login_status: RespStatus,
    next_token: AtomicU64,
    fail_submits: Arc<AtomicBool>,
    submitted: SubmitLog,
}

impl WirePublisher for LoopbackPublisher {
    fn register_login(
        &self,
        session: usize,
        request: &LoginRequest,
    ) -> Result<RwfVersion, WireError> {
        if request.user_name.is_empty() {
            return Err(WireError::InvalidConfiguration("empty user name".to_string()));
        }
        debug!(
            publisher = %self.name,
            user = %request.user_name,
            application_id = %request.application_id,
            "login registered"
        );
        let event = WireEvent::Login { session, status: self.login_status };
        self.events
            .try_send(event)
            .map_err(|e| WireError::InvalidUsage(format!("event queue: {e}")))?;
        Ok(self.rwf)
    }

    fn generate_token(&self) -> ItemToken {
        ItemToken(self.next_token.fetch_add(1, Ordering::SeqCst))
    }

    fn submit(&self, token: ItemToken, msg: &WireMsg) -> Result<u32, WireError> {
        if self.fail_submits.load(Ordering::SeqCst) {
            return Err(WireError::InvalidUsage("submit disabled".to_string()));
        }
        debug!(publisher = %self.name, token = token.0, "submit");
        self.submitted.lock().unwrap().push(SubmitRecord {
            publisher: self.name.clone(),
            token,
            msg: msg.clone(),
        });
        Ok(token.0 as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{event_queue, DataState, StreamState};

    fn login_request() -> LoginRequest {
        LoginRequest {
            user_name: "user1".to_string(),
            application_id: "256".to_string(),
            instance_id: Some("Instance1".to_string()),
            position: "127.0.0.1/net".to_string(),
        }
    }

    #[tokio::test]
    async fn test_login_delivers_open_ok_event() {
        let (tx, mut rx) = event_queue();
        let context = LoopbackContext::new(tx);
        let publisher = context.create_provider("PUBLISHERA").unwrap();

        let rwf = publisher.register_login(0, &login_request()).unwrap();
        assert_eq!(rwf, RwfVersion { major: 14, minor: 1 });

        match rx.recv().await.unwrap() {
            WireEvent::Login { session, status } => {
                assert_eq!(session, 0);
                assert_eq!(status.stream_state, StreamState::Open);
                assert_eq!(status.data_state, DataState::Ok);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tokens_are_sequential() {
        let (tx, _rx) = event_queue();
        let context = LoopbackContext::new(tx);
        let publisher = context.create_provider("PUBLISHERA").unwrap();
        let a = publisher.generate_token();
        let b = publisher.generate_token();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_lock_encoding_is_deterministic() {
        let (tx, _rx) = event_queue();
        let context = LoopbackContext::new(tx);
        let a = context.encode_lock(2326, &[29]).unwrap();
        let b = context.encode_lock(2326, &[29]).unwrap();
        assert_eq!(a, b);
        // version, i32 service id, combinator, u16 count, one u32 code
        assert_eq!(a.len(), 1 + 4 + 1 + 2 + 4);
        assert_eq!(a[0], LOCK_VERSION);
        assert_eq!(a[5], LOCK_COMBINATOR_OR);
    }

    #[tokio::test]
    async fn test_lock_rejects_empty_entitlements() {
        let (tx, _rx) = event_queue();
        let context = LoopbackContext::new(tx);
        assert!(context.encode_lock(2326, &[]).is_err());
    }

    #[tokio::test]
    async fn test_submit_capture_and_failure_injection() {
        let (tx, _rx) = event_queue();
        let context = LoopbackContext::new(tx);
        let publisher = context.create_provider("PUBLISHERA").unwrap();
        let token = publisher.generate_token();
        let msg = WireMsg::Directory(crate::wire::DirectoryRefresh {
            rwf: RwfVersion { major: 14, minor: 1 },
            service_name: "NI_PSYCH".to_string(),
            info: crate::wire::ServiceInfo {
                name: "NI_PSYCH".to_string(),
                vendor: "vendor".to_string(),
                capabilities: vec![6],
                dictionaries: vec!["RWFFld".to_string(), "RWFEnum".to_string()],
                qos: crate::wire::Qos {
                    timeliness: crate::wire::Timeliness::RealTime,
                    rate: crate::wire::Rate::TickByTick,
                },
            },
            state: crate::wire::ServiceState { service_state: 1 },
        });

        publisher.submit(token, &msg).unwrap();
        assert_eq!(context.submitted().lock().unwrap().len(), 1);

        context.set_fail_submits(true);
        assert!(publisher.submit(token, &msg).is_err());
    }
}
