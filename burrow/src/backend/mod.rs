//! Backend connection managers.
//!
//! A manager owns the link(s) to whatever carries traffic out: relay workers
//! reached over HTTP, or direct sockets to the destination. The session
//! router only sees the uniform [`ConnectionManager`] contract and is
//! agnostic to how many physical endpoints back a manager.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use burrow_proto::Event;
use tokio::sync::mpsc;

use crate::error::BackendError;

pub mod direct;
pub mod relay;

/// What a manager needs to know about the session asking.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Process-unique session number, used as the correlation hash.
    pub id: u32,
    /// Client address, for logging only.
    pub peer: String,
}

/// A bidirectional byte pipe for CONNECT/SOCKS tunnels. `tx` carries
/// client-to-remote bytes, `rx` remote-to-client. Either side closing its
/// channel ends the tunnel.
pub struct TunnelHandle {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
pub trait ConnectionManager: Send + Sync {
    fn name(&self) -> &str;

    /// Sends one event over the backend link. `Ok(None)` means no reply is
    /// needed yet. An error means the link is unusable for this request and
    /// the session must treat it like a remote-closed connection.
    async fn request(
        &self,
        session: &SessionHandle,
        ev: Box<dyn Event>,
    ) -> Result<Option<Box<dyn Event>>, BackendError>;

    /// Opens a raw byte tunnel to `addr` for this session.
    async fn open_tunnel(
        &self,
        session: &SessionHandle,
        addr: &str,
    ) -> Result<TunnelHandle, BackendError>;

    /// Releases any per-session state. Called once when the session closes.
    async fn close_session(&self, session: &SessionHandle);
}

/// The managers built at startup, keyed by name. One of them is the active
/// proxy selector for every session.
#[derive(Default)]
pub struct ManagerSet {
    managers: HashMap<String, Arc<dyn ConnectionManager>>,
}

impl ManagerSet {
    pub fn new() -> Self {
        ManagerSet::default()
    }

    pub fn insert(&mut self, manager: Arc<dyn ConnectionManager>) {
        self.managers.insert(manager.name().to_string(), manager);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ConnectionManager>, BackendError> {
        self.managers
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NoManager(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullManager;

    #[async_trait]
    impl ConnectionManager for NullManager {
        fn name(&self) -> &str {
            "null"
        }

        async fn request(
            &self,
            _session: &SessionHandle,
            _ev: Box<dyn Event>,
        ) -> Result<Option<Box<dyn Event>>, BackendError> {
            Ok(None)
        }

        async fn open_tunnel(
            &self,
            _session: &SessionHandle,
            _addr: &str,
        ) -> Result<TunnelHandle, BackendError> {
            Err(BackendError::Closed)
        }

        async fn close_session(&self, _session: &SessionHandle) {}
    }

    #[test]
    fn lookup_by_name() {
        let mut set = ManagerSet::new();
        set.insert(Arc::new(NullManager));
        assert!(set.get("null").is_ok());
        assert!(matches!(set.get("bogus"), Err(BackendError::NoManager(_))));
    }
}
