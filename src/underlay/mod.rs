//! Packet-transport underlays.
//!
//! An underlay carries many logical sessions over one network endpoint. The
//! [`Underlay`] trait is the capability set upper layers see; transport
//! implementations (today UDP, the seam is open for TCP) compose the shared
//! [`BaseUnderlay`] record instead of inheriting from it.

mod udp;

pub use udp::UdpUnderlay;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{IpVersion, Segment, TransportProtocol};
use crate::session::Session;
use crate::signal::Signal;

/// Sessions queued for the acceptor before it picks them up.
const READY_SESSIONS_BACKLOG: usize = 64;

/// Capability set of a packet-transport underlay.
#[async_trait]
pub trait Underlay: Send + Sync {
    /// Local endpoint of the underlying socket.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Remote endpoint, when the underlay is bound to one peer.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// IP version of the local endpoint.
    fn ip_version(&self) -> IpVersion;

    /// Transport protocol this underlay speaks.
    fn transport_protocol(&self) -> TransportProtocol;

    /// Path MTU this underlay was configured with.
    fn mtu(&self) -> usize;

    /// Register a session, bind it to this underlay, and start its loops.
    async fn add_session(self: Arc<Self>, session: Arc<Session>) -> Result<()>;

    /// Drop a session from the session table. The underlay closes itself
    /// when the last session is removed.
    async fn remove_session(&self, session_id: u32) -> Result<()>;

    /// Run the receive pump until `cancel` fires, the underlay closes, or a
    /// fatal error occurs.
    async fn run_event_loop(self: Arc<Self>, cancel: Signal) -> Result<()>;

    /// Send one segment to the bound peer. Serialized internally; never
    /// writes partial datagrams.
    async fn write_segment(&self, seg: Segment) -> Result<()>;

    /// Signal shutdown and release the socket. Idempotent.
    fn close(&self) -> Result<()>;

    /// Whether `close` has been called (or the underlay closed itself).
    fn is_closed(&self) -> bool;
}

/// State shared by every underlay implementation: the session table, role
/// flag, MTU, acceptor queue, and shutdown signal.
pub(crate) struct BaseUnderlay {
    pub(crate) is_client: bool,
    pub(crate) mtu: usize,
    session_map: Mutex<HashMap<u32, Arc<Session>>>,
    ready_tx: mpsc::Sender<Arc<Session>>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Session>>>,
    pub(crate) done: Signal,
}

impl BaseUnderlay {
    pub(crate) fn new(is_client: bool, mtu: usize) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(READY_SESSIONS_BACKLOG);
        Self {
            is_client,
            mtu,
            session_map: Mutex::new(HashMap::new()),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            done: Signal::new(),
        }
    }

    /// Insert a session into the table. Rejects id 0 and duplicates.
    pub(crate) fn insert_session(&self, session: Arc<Session>) -> Result<()> {
        if session.id() == 0 {
            return Err(Error::ReservedSessionId);
        }
        let mut map = self.session_map.lock();
        if map.contains_key(&session.id()) {
            return Err(Error::invalid_op(format!(
                "session {} already exists",
                session.id()
            )));
        }
        map.insert(session.id(), session);
        Ok(())
    }

    /// Remove a session. Returns whether the table is now empty.
    pub(crate) fn take_session(&self, session_id: u32) -> (Option<Arc<Session>>, bool) {
        let mut map = self.session_map.lock();
        let removed = map.remove(&session_id);
        (removed, map.is_empty())
    }

    pub(crate) fn get_session(&self, session_id: u32) -> Option<Arc<Session>> {
        self.session_map.lock().get(&session_id).cloned()
    }

    pub(crate) fn has_session(&self, session_id: u32) -> bool {
        self.session_map.lock().contains_key(&session_id)
    }

    pub(crate) fn session_count(&self) -> usize {
        self.session_map.lock().len()
    }

    /// Queue a freshly created server session for the acceptor.
    pub(crate) fn publish_ready(&self, session: Arc<Session>) -> bool {
        self.ready_tx.try_send(session).is_ok()
    }

    /// Wait for the next session created by a peer's open request.
    pub(crate) async fn next_ready(&self) -> Option<Arc<Session>> {
        let mut rx = self.ready_rx.lock().await;
        tokio::select! {
            biased;
            session = rx.recv() => session,
            _ = self.done.wait() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    #[test]
    fn test_insert_rejects_reserved_id() {
        let base = BaseUnderlay::new(false, 1400);
        let session = Session::new(0, false, 1400);
        assert!(matches!(
            base.insert_session(session),
            Err(Error::ReservedSessionId)
        ));
        assert_eq!(base.session_count(), 0);
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let base = BaseUnderlay::new(false, 1400);
        assert!(base.insert_session(Session::new(7, false, 1400)).is_ok());
        assert!(base.insert_session(Session::new(7, false, 1400)).is_err());
        assert_eq!(base.session_count(), 1);
    }

    #[test]
    fn test_take_session_reports_empty() {
        let base = BaseUnderlay::new(false, 1400);
        base.insert_session(Session::new(1, false, 1400)).unwrap();
        base.insert_session(Session::new(2, false, 1400)).unwrap();

        let (removed, empty) = base.take_session(1);
        assert!(removed.is_some());
        assert!(!empty);

        let (removed, empty) = base.take_session(2);
        assert!(removed.is_some());
        assert!(empty);

        let (removed, empty) = base.take_session(3);
        assert!(removed.is_none());
        assert!(empty);
    }

    #[tokio::test]
    async fn test_ready_queue() {
        let base = BaseUnderlay::new(false, 1400);
        let session = Session::new(9, false, 1400);
        assert!(base.publish_ready(Arc::clone(&session)));

        let accepted = base.next_ready().await.unwrap();
        assert_eq!(accepted.id(), 9);
    }

    #[tokio::test]
    async fn test_next_ready_observes_done() {
        let base = BaseUnderlay::new(false, 1400);
        base.done.set();
        assert!(base.next_ready().await.is_none());
    }
}
