//! Logical bidirectional streams multiplexed over an underlay.
//!
//! A session owns three segment trees: staged outbound data, sent-but-
//! unacknowledged data, and received data awaiting the reader. Two loops
//! drive it: the input loop drains the queue fed by the underlay's event
//! loop, and the output loop moves staged segments to the wire under a
//! simple sliding window with timed retransmission.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{
    max_fragment_size, seq_less, Metadata, ProtocolType, Segment, SegmentTree,
};
use crate::signal::Signal;
use crate::underlay::Underlay;

/// Segments the underlay may queue before delivery backpressure kicks in.
/// Sized to absorb a full handshake plus a window of data.
const RECV_CHAN_CAPACITY: usize = 256;

/// Capacity of each per-session segment tree.
const QUEUE_CAPACITY: usize = 256;

/// Upper bound on unacknowledged segments in flight.
const DEFAULT_WINDOW: u16 = 32;

/// Output loop scheduling quantum.
const OUTPUT_TICK: Duration = Duration::from_millis(5);

/// Retransmission interval for unacknowledged segments.
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(500);

/// How long `close` waits for the peer's confirmation.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One logical stream identified by a non-zero 32-bit id.
pub struct Session {
    id: u32,
    is_client: bool,
    mtu: usize,

    /// Outbound segments staged by `write`, not yet on the wire
    send_queue: SegmentTree,
    /// Sent segments awaiting acknowledgement
    pending: SegmentTree,
    /// Received data segments awaiting the reader
    recv_queue: SegmentTree,

    recv_tx: mpsc::Sender<Segment>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Segment>>,

    /// Set once the session is bound to an underlay
    ready: Signal,
    /// Set once the open handshake completed
    established: Signal,
    /// Set when the session is finished
    done: Signal,

    /// Non-owning send handle; the underlay owns session lifetime
    conn: OnceLock<Weak<dyn Underlay>>,

    /// Next outbound data sequence number
    next_seq: AtomicU32,
    /// Everything below this inbound sequence number has been received
    next_recv_seq: AtomicU32,
    /// Next sequence number the reader will deliver
    next_read_seq: AtomicU32,
    /// Last receive window advertised by the peer
    peer_window: AtomicU32,

    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Create a detached session. It becomes usable once an underlay adds
    /// it and starts its loops.
    pub fn new(id: u32, is_client: bool, mtu: usize) -> Arc<Self> {
        let (recv_tx, recv_rx) = mpsc::channel(RECV_CHAN_CAPACITY);
        Arc::new(Self {
            id,
            is_client,
            mtu,
            send_queue: SegmentTree::new(QUEUE_CAPACITY),
            pending: SegmentTree::new(QUEUE_CAPACITY),
            recv_queue: SegmentTree::new(QUEUE_CAPACITY),
            recv_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            ready: Signal::new(),
            established: Signal::new(),
            done: Signal::new(),
            conn: OnceLock::new(),
            next_seq: AtomicU32::new(0),
            next_recv_seq: AtomicU32::new(0),
            next_read_seq: AtomicU32::new(0),
            peer_window: AtomicU32::new(DEFAULT_WINDOW as u32),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Session identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this is the dialing side.
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Whether the open handshake completed.
    pub fn is_established(&self) -> bool {
        self.established.is_set()
    }

    /// Whether the session has finished.
    pub fn is_done(&self) -> bool {
        self.done.is_set()
    }

    /// Wait until the open handshake completes.
    pub async fn established(&self) {
        self.established.wait().await
    }

    /// Wait until the session finishes.
    pub async fn done(&self) {
        self.done.wait().await
    }

    pub(crate) fn ready_signal(&self) -> &Signal {
        &self.ready
    }

    pub(crate) fn recv_sender(&self) -> mpsc::Sender<Segment> {
        self.recv_tx.clone()
    }

    /// Attach the non-owning underlay handle. First caller wins.
    pub(crate) fn bind(&self, conn: Weak<dyn Underlay>) {
        let _ = self.conn.set(conn);
    }

    /// Spawn the input and output loops.
    pub(crate) fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();

        let input = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            input.run_input_loop().await;
        }));

        let output = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            output.run_output_loop().await;
        }));
    }

    /// Wait for both loops to finish. Used by the close handshake.
    pub(crate) async fn wait(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn conn(&self) -> Result<Arc<dyn Underlay>> {
        self.conn
            .get()
            .and_then(|conn| conn.upgrade())
            .ok_or(Error::Closed)
    }

    fn data_protocol(&self) -> ProtocolType {
        if self.is_client {
            ProtocolType::DataClientToServer
        } else {
            ProtocolType::DataServerToClient
        }
    }

    fn ack_protocol(&self) -> ProtocolType {
        if self.is_client {
            ProtocolType::AckClientToServer
        } else {
            ProtocolType::AckServerToClient
        }
    }

    /// Send the open-session request. Called by the dialing side after the
    /// session is bound to an underlay.
    pub async fn open(&self) -> Result<()> {
        self.ready.wait().await;
        let conn = self.conn()?;
        conn.write_segment(Segment::session(
            ProtocolType::OpenSessionRequest,
            self.id,
            0,
            Bytes::new(),
        ))
        .await
    }

    /// Finish the session immediately without a close handshake.
    ///
    /// Used when the open handshake never completed and there is no peer
    /// state to tear down.
    pub(crate) fn abort(&self) {
        self.done.set();
    }

    /// Start the close handshake and wait for it to finish.
    ///
    /// Idempotent; a second call returns immediately.
    pub async fn close(&self) -> Result<()> {
        if self.done.is_set() {
            return Ok(());
        }
        if let Ok(conn) = self.conn() {
            let seq = self.next_seq.load(Ordering::SeqCst);
            let _ = conn
                .write_segment(Segment::session(
                    ProtocolType::CloseSessionRequest,
                    self.id,
                    seq,
                    Bytes::new(),
                ))
                .await;
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, self.done.wait())
            .await
            .is_err()
        {
            // Peer never confirmed; finish unilaterally
            self.done.set();
        }
        Ok(())
    }

    /// Write a byte buffer, fragmenting it into data segments.
    ///
    /// Blocks when the send queue is full.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        if self.done.is_set() {
            return Err(Error::Closed);
        }
        let conn = self.conn()?;
        let fragment =
            max_fragment_size(self.mtu, conn.ip_version(), conn.transport_protocol()).max(1);
        drop(conn);

        for chunk in buf.chunks(fragment) {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let seg = Segment::data(
                self.data_protocol(),
                self.id,
                seq,
                0,
                0,
                Bytes::copy_from_slice(chunk),
            );
            tokio::select! {
                biased;
                _ = self.send_queue.insert_blocking(seg) => {}
                _ = self.done.wait() => return Err(Error::Closed),
            }
        }
        Ok(())
    }

    /// Read the next payload in strict sequence order.
    ///
    /// Blocks until the next in-order segment arrives. Returns
    /// [`Error::Closed`] once the session finished and the buffer drained.
    pub async fn read(&self) -> Result<Bytes> {
        loop {
            let next = self.next_read_seq.load(Ordering::SeqCst);
            let in_order = move |s: &Segment| {
                s.seq().map(|seq| !seq_less(next, seq)).unwrap_or(false)
            };

            let seg = tokio::select! {
                biased;
                seg = self.recv_queue.delete_min_if_blocking(in_order) => seg,
                _ = self.done.wait() => {
                    match self.recv_queue.delete_min_if(in_order) {
                        Some(seg) => seg,
                        None => return Err(Error::Closed),
                    }
                }
            };

            let seq = seg.seq()?;
            if seq_less(seq, next) {
                // Stale retransmission already delivered
                continue;
            }
            self.next_read_seq
                .store(seq.wrapping_add(1), Ordering::SeqCst);
            return Ok(seg.payload);
        }
    }

    async fn run_input_loop(self: Arc<Self>) {
        let mut rx = self.recv_rx.lock().await;
        loop {
            let seg = tokio::select! {
                biased;
                seg = rx.recv() => match seg {
                    Some(seg) => seg,
                    None => break,
                },
                _ = self.done.wait() => break,
            };

            match seg.metadata.clone() {
                Metadata::Session(ss) => match ss.protocol {
                    ProtocolType::OpenSessionRequest => {
                        self.deliver_payload(ss.seq, seg.payload).await;
                        self.send_session_reply(ProtocolType::OpenSessionResponse, 0)
                            .await;
                        self.established.set();
                    }
                    ProtocolType::OpenSessionResponse => {
                        self.deliver_payload(ss.seq, seg.payload).await;
                        self.established.set();
                    }
                    ProtocolType::CloseSessionRequest => {
                        self.send_session_reply(ProtocolType::CloseSessionResponse, ss.seq)
                            .await;
                        self.done.set();
                        break;
                    }
                    ProtocolType::CloseSessionResponse => {
                        self.done.set();
                        break;
                    }
                    other => {
                        debug!(
                            "session {} ignoring unexpected session protocol {:?}",
                            self.id, other
                        );
                    }
                },
                Metadata::DataAck(das) => {
                    self.prune_acked(das.un_ack_seq);
                    self.peer_window
                        .store(das.window_size as u32, Ordering::SeqCst);
                    if matches!(
                        das.protocol,
                        ProtocolType::DataClientToServer | ProtocolType::DataServerToClient
                    ) {
                        let next = self.next_recv_seq.load(Ordering::SeqCst);
                        if !seq_less(das.seq, next) {
                            let data = Segment::new(seg.metadata, seg.payload);
                            tokio::select! {
                                biased;
                                _ = self.recv_queue.insert_blocking(data) => {}
                                _ = self.done.wait() => break,
                            }
                            self.advance_recv_cursor();
                        }
                        self.send_ack().await;
                    }
                }
                Metadata::CloseConn(_) => {
                    // The event loop never routes close-conn to a session
                    trace!("session {} ignoring close-conn segment", self.id);
                }
            }
        }
        debug!("session {} input loop finished", self.id);
    }

    async fn run_output_loop(self: Arc<Self>) {
        tokio::select! {
            biased;
            _ = self.established.wait() => {}
            _ = self.done.wait() => return,
        }

        let mut tick = tokio::time::interval(OUTPUT_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_retransmit = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.done.wait() => break,
                _ = tick.tick() => {}
            }

            let Ok(conn) = self.conn() else { break };

            // Move staged segments to the wire within the window
            while (self.pending.len() as u32) < self.window_limit() {
                let Some(seg) = self.send_queue.delete_min() else {
                    break;
                };
                let seg = self.stamp(seg);
                if conn.write_segment(seg.clone()).await.is_err() {
                    debug!("session {} send failed, finishing", self.id);
                    self.done.set();
                    return;
                }
                self.pending.insert(seg);
            }

            // Resend everything unacknowledged on a coarse timer
            if last_retransmit.elapsed() >= RETRANSMIT_INTERVAL && !self.pending.is_empty() {
                let mut unacked = Vec::new();
                self.pending.ascend(|s| {
                    unacked.push(s.clone());
                    true
                });
                for seg in unacked {
                    if conn.write_segment(self.stamp(seg)).await.is_err() {
                        self.done.set();
                        return;
                    }
                }
                last_retransmit = Instant::now();
            }
        }
        debug!("session {} output loop finished", self.id);
    }

    /// Queue a handshake payload for the reader, if any.
    async fn deliver_payload(&self, seq: u32, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        let seg = Segment::data(self.data_protocol(), self.id, seq, 0, 0, payload);
        tokio::select! {
            biased;
            _ = self.recv_queue.insert_blocking(seg) => {}
            _ = self.done.wait() => {}
        }
        self.advance_recv_cursor();
    }

    async fn send_session_reply(&self, protocol: ProtocolType, seq: u32) {
        if let Ok(conn) = self.conn() {
            if let Err(e) = conn
                .write_segment(Segment::session(protocol, self.id, seq, Bytes::new()))
                .await
            {
                debug!("session {} failed to send {:?}: {}", self.id, protocol, e);
            }
        }
    }

    async fn send_ack(&self) {
        if let Ok(conn) = self.conn() {
            let ack = Segment::ack(
                self.ack_protocol(),
                self.id,
                self.next_seq.load(Ordering::SeqCst),
                self.next_recv_seq.load(Ordering::SeqCst),
                self.recv_window(),
            );
            if let Err(e) = conn.write_segment(ack).await {
                trace!("session {} failed to send ack: {}", self.id, e);
            }
        }
    }

    /// Drop acknowledged segments from the pending tree.
    fn prune_acked(&self, un_ack_seq: u32) {
        while self
            .pending
            .delete_min_if(|s| s.seq().map(|seq| seq_less(seq, un_ack_seq)).unwrap_or(true))
            .is_some()
        {}
    }

    /// Advance the cumulative-receive point past contiguous buffered
    /// segments.
    fn advance_recv_cursor(&self) {
        let mut next = self.next_recv_seq.load(Ordering::SeqCst);
        // Segments the reader already consumed count as received
        let read = self.next_read_seq.load(Ordering::SeqCst);
        if seq_less(next, read) {
            next = read;
        }
        self.recv_queue.ascend(|s| match s.seq() {
            Ok(seq) if seq == next => {
                next = next.wrapping_add(1);
                true
            }
            Ok(seq) if seq_less(seq, next) => true,
            _ => false,
        });
        self.next_recv_seq.store(next, Ordering::SeqCst);
    }

    fn window_limit(&self) -> u32 {
        (DEFAULT_WINDOW as u32).min(self.peer_window.load(Ordering::SeqCst).max(1))
    }

    fn recv_window(&self) -> u16 {
        self.recv_queue.remaining().min(u16::MAX as usize) as u16
    }

    /// Refresh the acknowledgement fields of an outbound data segment at
    /// send time.
    fn stamp(&self, seg: Segment) -> Segment {
        match seg.metadata {
            Metadata::DataAck(mut das) => {
                das.un_ack_seq = self.next_recv_seq.load(Ordering::SeqCst);
                das.window_size = self.recv_window();
                Segment::new(Metadata::DataAck(das), seg.payload)
            }
            other => Segment::new(other, seg.payload),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("is_client", &self.is_client)
            .field("established", &self.established.is_set())
            .field("done", &self.done.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_state() {
        let session = Session::new(7, true, 1400);
        assert_eq!(session.id(), 7);
        assert!(session.is_client());
        assert!(!session.is_established());
        assert!(!session.is_done());
    }

    #[test]
    fn test_protocol_direction() {
        let client = Session::new(1, true, 1400);
        assert_eq!(client.data_protocol(), ProtocolType::DataClientToServer);
        assert_eq!(client.ack_protocol(), ProtocolType::AckClientToServer);

        let server = Session::new(2, false, 1400);
        assert_eq!(server.data_protocol(), ProtocolType::DataServerToClient);
        assert_eq!(server.ack_protocol(), ProtocolType::AckServerToClient);
    }

    #[test]
    fn test_prune_acked() {
        let session = Session::new(1, true, 1400);
        for seq in 0..5u32 {
            session.pending.insert(Segment::data(
                ProtocolType::DataClientToServer,
                1,
                seq,
                0,
                0,
                Bytes::from_static(b"x"),
            ));
        }

        session.prune_acked(3);
        assert_eq!(session.pending.len(), 2);
        assert_eq!(session.pending.min_seq().unwrap(), 3);
    }

    #[test]
    fn test_advance_recv_cursor_skips_gaps() {
        let session = Session::new(1, false, 1400);
        for seq in [0u32, 1, 3] {
            session.recv_queue.insert(Segment::data(
                ProtocolType::DataClientToServer,
                1,
                seq,
                0,
                0,
                Bytes::from_static(b"x"),
            ));
        }

        session.advance_recv_cursor();
        assert_eq!(session.next_recv_seq.load(Ordering::SeqCst), 2);

        session.recv_queue.insert(Segment::data(
            ProtocolType::DataClientToServer,
            1,
            2,
            0,
            0,
            Bytes::from_static(b"x"),
        ));
        session.advance_recv_cursor();
        assert_eq!(session.next_recv_seq.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_write_without_underlay_fails() {
        let session = Session::new(1, true, 1400);
        assert!(matches!(session.write(b"data").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_read_after_done_drains_then_closes() {
        let session = Session::new(1, false, 1400);
        session.recv_queue.insert(Segment::data(
            ProtocolType::DataClientToServer,
            1,
            0,
            0,
            0,
            Bytes::from_static(b"last words"),
        ));
        session.done.set();

        let payload = session.read().await.unwrap();
        assert_eq!(payload, Bytes::from_static(b"last words"));
        assert!(matches!(session.read().await, Err(Error::Closed)));
    }
}
