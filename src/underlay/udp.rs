//! UDP packet pump.
//!
//! One [`UdpUnderlay`] owns one socket and carries every session between a
//! pair of endpoints. Each datagram is self-contained:
//!
//! ```text
//! nonce | Enc(metadata)+tag | [prefix_pad] | Enc(payload)+tag | suffix_pad
//! ```
//!
//! The metadata block always encrypts to the same size, prefix/suffix
//! padding lengths are random, and the payload nonce is derived from the
//! datagram nonce, so an observer sees nothing but a stream of
//! random-looking packets of decorrelated lengths.
//!
//! A server underlay does not know which configured user is talking until
//! the first datagram authenticates against one of the candidate ciphers;
//! from then on the matching cipher is bound and used directly.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, trace, warn};

use crate::crypto::{
    advance_nonce, new_padding, padding_len, select_decrypt, BlockCipher, SecureRandom,
    NONCE_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};
use crate::metrics::TransportMetrics;
use crate::protocol::{
    is_close_conn_protocol, is_data_ack_protocol, is_session_protocol, CloseConnStruct,
    DataAckStruct, IpVersion, Metadata, ProtocolType, Segment, SessionStruct, TransportProtocol,
    METADATA_LENGTH, UDP_NON_HEADER_POSITION, UDP_OVERHEAD,
};
use crate::replay::ReplayCache;
use crate::session::Session;
use crate::signal::Signal;
use crate::underlay::{BaseUnderlay, Underlay};

/// UDP implementation of the [`Underlay`] capability set.
pub struct UdpUnderlay {
    base: BaseUnderlay,
    socket: UdpSocket,

    /// The cipher bound to the authenticated peer. A client binds its sole
    /// candidate at construction; a server binds after the first datagram
    /// passes trial decryption.
    block: Mutex<Option<BlockCipher>>,

    /// Ciphers that may decrypt incoming data. Exactly one element on the
    /// client; one per configured user on the server.
    candidates: Vec<BlockCipher>,

    /// Serializes socket writes; no partial or interleaved datagrams.
    send_lock: tokio::sync::Mutex<()>,

    /// The configured server endpoint (client role only).
    server_addr: Option<SocketAddr>,

    /// The authenticated peer (server role; follows the peer on roam).
    peer_addr: Mutex<Option<SocketAddr>>,

    replay: Arc<ReplayCache>,
    metrics: Arc<TransportMetrics>,
}

impl UdpUnderlay {
    /// Connect a client underlay to `raddr` over `network`
    /// (`udp`/`udp4`/`udp6`), binding locally to `laddr` when given.
    pub async fn new(
        network: &str,
        laddr: Option<&str>,
        raddr: &str,
        mtu: usize,
        block: BlockCipher,
        replay: Arc<ReplayCache>,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Arc<Self>> {
        check_network(network)?;
        if !block.is_stateless() {
            return Err(Error::config("UDP block cipher must be stateless"));
        }

        let server_addr = resolve(network, raddr).await?;
        let local = match laddr {
            Some(laddr) => resolve(network, laddr).await?,
            None if server_addr.is_ipv4() => "0.0.0.0:0".parse().expect("literal addr"),
            None => "[::]:0".parse().expect("literal addr"),
        };
        let socket = UdpSocket::bind(local).await?;
        debug!(
            "created client UDP underlay [{} - {}]",
            socket.local_addr()?,
            server_addr
        );

        Ok(Arc::new(Self {
            base: BaseUnderlay::new(true, mtu),
            socket,
            block: Mutex::new(Some(block.clone())),
            candidates: vec![block],
            send_lock: tokio::sync::Mutex::new(()),
            server_addr: Some(server_addr),
            peer_addr: Mutex::new(None),
            replay,
            metrics,
        }))
    }

    /// Bind a server underlay on `laddr` with one candidate cipher per
    /// configured user.
    pub async fn new_server(
        network: &str,
        laddr: &str,
        mtu: usize,
        candidates: Vec<BlockCipher>,
        replay: Arc<ReplayCache>,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Arc<Self>> {
        check_network(network)?;
        if candidates.is_empty() {
            return Err(Error::config("server needs at least one candidate cipher"));
        }
        if candidates.iter().any(|c| !c.is_stateless()) {
            return Err(Error::config("UDP block cipher must be stateless"));
        }

        let local = resolve(network, laddr).await?;
        let socket = UdpSocket::bind(local).await?;
        debug!("created server UDP underlay [{}]", socket.local_addr()?);

        Ok(Arc::new(Self {
            base: BaseUnderlay::new(false, mtu),
            socket,
            block: Mutex::new(None),
            candidates,
            send_lock: tokio::sync::Mutex::new(()),
            server_addr: None,
            peer_addr: Mutex::new(None),
            replay,
            metrics,
        }))
    }

    /// Wait for the next session a peer opened on this underlay.
    pub async fn accept_session(&self) -> Result<Arc<Session>> {
        self.base.next_ready().await.ok_or(Error::Closed)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.base.session_count()
    }

    fn bound_cipher(&self) -> Result<BlockCipher> {
        self.block
            .lock()
            .clone()
            .ok_or_else(|| Error::crypto("cipher block is not ready"))
    }

    /// Read datagrams until one yields a valid segment.
    ///
    /// Unsolicited sources, short datagrams, and authentication failures
    /// are counted and skipped; replays and malformed-but-authenticated
    /// packets are fatal.
    async fn read_one_segment(&self) -> Result<(Segment, SocketAddr)> {
        let mut buf = vec![0u8; self.base.mtu];
        loop {
            let (n, addr) = self.socket.recv_from(&mut buf).await?;

            if self.base.is_client && Some(addr) != self.server_addr {
                self.metrics.add_unsolicited();
                trace!("{:?} received unsolicited UDP packet from {}", self, addr);
                continue;
            }
            if n < UDP_OVERHEAD {
                self.metrics.add_malformed();
                trace!(
                    "{:?} received UDP packet from {} with only {} bytes, too short",
                    self,
                    addr,
                    n
                );
                continue;
            }
            let datagram = &buf[..n];

            if self.replay.is_duplicate(&datagram[..TAG_SIZE], addr) {
                self.metrics.add_replay();
                return Err(Error::Replay(addr));
            }

            let encrypted_meta = &datagram[..UDP_NON_HEADER_POSITION];
            let Some(meta_plain) = self.decrypt_metadata(encrypted_meta, addr) else {
                continue;
            };
            if meta_plain.len() != METADATA_LENGTH {
                return Err(Error::protocol(format!(
                    "decrypted metadata size {} is unexpected",
                    meta_plain.len()
                )));
            }

            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&datagram[..NONCE_SIZE]);
            let payload_nonce = advance_nonce(&nonce);
            let remaining = &datagram[UDP_NON_HEADER_POSITION..];

            let protocol = meta_plain[0];
            let seg = if is_session_protocol(protocol) {
                let ss = SessionStruct::unmarshal(&meta_plain)?;
                self.read_session_segment(ss, remaining, &payload_nonce)?
            } else if is_data_ack_protocol(protocol) {
                let das = DataAckStruct::unmarshal(&meta_plain)?;
                self.read_data_ack_segment(das, remaining, &payload_nonce)?
            } else if is_close_conn_protocol(protocol) {
                let ccs = CloseConnStruct::unmarshal(&meta_plain)?;
                self.read_close_conn_segment(ccs, remaining, &payload_nonce)?
            } else {
                return Err(Error::protocol(format!(
                    "unable to handle protocol {protocol}"
                )));
            };

            if !self.base.is_client {
                *self.peer_addr.lock() = Some(addr);
            }
            return Ok((seg, addr));
        }
    }

    /// Decrypt the metadata block, binding the peer cipher on first
    /// success. Returns `None` (after counting) when no cipher
    /// authenticates the packet.
    fn decrypt_metadata(&self, encrypted_meta: &[u8], addr: SocketAddr) -> Option<Vec<u8>> {
        let mut block = self.block.lock();
        if block.is_none() && self.base.is_client {
            *block = Some(self.candidates[0].clone());
        }

        match block.as_ref() {
            Some(cipher) => match cipher.decrypt(encrypted_meta) {
                Ok(plain) => Some(plain),
                Err(_) => {
                    self.metrics.add_malformed();
                    trace!("{:?} failed to decrypt UDP packet from {}", self, addr);
                    None
                }
            },
            None => match select_decrypt(encrypted_meta, &self.candidates) {
                Ok((index, plain)) => {
                    *block = Some(self.candidates[index].clone());
                    debug!("{:?} bound cipher candidate {} for {}", self, index, addr);
                    Some(plain)
                }
                Err(_) => {
                    self.metrics.add_malformed();
                    trace!(
                        "{:?} trial decryption failed with UDP packet from {}",
                        self,
                        addr
                    );
                    None
                }
            },
        }
    }

    fn read_session_segment(
        &self,
        ss: SessionStruct,
        remaining: &[u8],
        payload_nonce: &[u8; NONCE_SIZE],
    ) -> Result<Segment> {
        let payload = self.read_payload_block(
            ss.payload_len as usize,
            0,
            ss.suffix_len as usize,
            remaining,
            payload_nonce,
        )?;
        Ok(Segment::new(Metadata::Session(ss), payload))
    }

    fn read_data_ack_segment(
        &self,
        das: DataAckStruct,
        remaining: &[u8],
        payload_nonce: &[u8; NONCE_SIZE],
    ) -> Result<Segment> {
        let payload = self.read_payload_block(
            das.payload_len as usize,
            das.prefix_len as usize,
            das.suffix_len as usize,
            remaining,
            payload_nonce,
        )?;
        Ok(Segment::new(Metadata::DataAck(das), payload))
    }

    fn read_close_conn_segment(
        &self,
        ccs: CloseConnStruct,
        remaining: &[u8],
        payload_nonce: &[u8; NONCE_SIZE],
    ) -> Result<Segment> {
        let payload =
            self.read_payload_block(0, 0, ccs.suffix_len as usize, remaining, payload_nonce)?;
        Ok(Segment::new(Metadata::CloseConn(ccs), payload))
    }

    /// Verify the padding-length identity and decrypt the payload block.
    ///
    /// `prefix_len + payload_len + TAG_SIZE + suffix_len` must equal the
    /// bytes remaining after the metadata block; anything else means the
    /// datagram was truncated or tampered with, which is fatal.
    fn read_payload_block(
        &self,
        payload_len: usize,
        prefix_len: usize,
        suffix_len: usize,
        remaining: &[u8],
        payload_nonce: &[u8; NONCE_SIZE],
    ) -> Result<Bytes> {
        if remaining.len() < prefix_len + payload_len + TAG_SIZE {
            return Err(Error::protocol("payload: received incomplete UDP packet"));
        }
        if prefix_len + payload_len + TAG_SIZE + suffix_len != remaining.len() {
            return Err(Error::protocol("padding: size does not match"));
        }

        let cipher = self.bound_cipher()?;
        let block = &remaining[prefix_len..prefix_len + payload_len + TAG_SIZE];
        let payload = cipher.open_with(payload_nonce, block)?;
        Ok(Bytes::from(payload))
    }

    /// Encrypt and send one segment. Serialized by the send lock.
    async fn write_one_segment(&self, seg: Segment, addr: SocketAddr) -> Result<()> {
        if self.base.is_client && Some(addr) != self.server_addr {
            return Err(Error::InvalidArgument(format!(
                "can't write to {}, UDP server address is {:?}",
                addr, self.server_addr
            )));
        }

        let _guard = self.send_lock.lock().await;
        let cipher = self.bound_cipher()?;

        let nonce: [u8; NONCE_SIZE] = SecureRandom::bytes();
        let payload_nonce = advance_nonce(&nonce);

        // Random padding must not push the datagram past the path MTU, or
        // the receiver's MTU-sized buffer would truncate it. 48 bytes
        // covers the worst-case IPv6 + UDP headers.
        let headroom = self
            .base
            .mtu
            .saturating_sub(48 + UDP_OVERHEAD + seg.payload.len());

        let datagram = match seg.metadata {
            Metadata::Session(mut ss) => {
                let suffix_len = padding_len().min(headroom.min(254) as u8);
                ss.suffix_len = suffix_len;
                ss.payload_len = seg.payload.len() as u16;

                let meta_block = cipher.seal_with(&nonce, &ss.marshal())?;
                let payload_block = cipher.seal_with(&payload_nonce, &seg.payload)?;

                let mut out =
                    Vec::with_capacity(NONCE_SIZE + meta_block.len() + payload_block.len() + 255);
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&meta_block);
                out.extend_from_slice(&payload_block);
                out.extend_from_slice(&new_padding(suffix_len as usize));
                out
            }
            Metadata::DataAck(mut das) => {
                let prefix_len = padding_len().min((headroom / 2).min(254) as u8);
                let suffix_len =
                    padding_len().min((headroom - prefix_len as usize).min(254) as u8);
                das.prefix_len = prefix_len;
                das.suffix_len = suffix_len;
                das.payload_len = seg.payload.len() as u16;

                let meta_block = cipher.seal_with(&nonce, &das.marshal())?;
                let payload_block = cipher.seal_with(&payload_nonce, &seg.payload)?;

                let mut out = Vec::with_capacity(
                    NONCE_SIZE + meta_block.len() + payload_block.len() + 510,
                );
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&meta_block);
                out.extend_from_slice(&new_padding(prefix_len as usize));
                out.extend_from_slice(&payload_block);
                out.extend_from_slice(&new_padding(suffix_len as usize));
                out
            }
            Metadata::CloseConn(mut ccs) => {
                let suffix_len = padding_len().min(headroom.min(254) as u8);
                ccs.suffix_len = suffix_len;

                let meta_block = cipher.seal_with(&nonce, &ccs.marshal())?;
                let payload_block = cipher.seal_with(&payload_nonce, &[])?;

                let mut out =
                    Vec::with_capacity(NONCE_SIZE + meta_block.len() + payload_block.len() + 255);
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&meta_block);
                out.extend_from_slice(&payload_block);
                out.extend_from_slice(&new_padding(suffix_len as usize));
                out
            }
        };

        self.socket.send_to(&datagram, addr).await?;
        self.metrics.add_segment_sent();
        Ok(())
    }

    async fn dispatch(this: &Arc<Self>, seg: Segment) -> Result<()> {
        this.metrics.add_segment_received();
        let protocol = seg.protocol();

        if protocol.is_session() {
            match protocol {
                ProtocolType::OpenSessionRequest => Self::on_open_session_request(this, seg).await,
                ProtocolType::OpenSessionResponse => this.on_open_session_response(seg).await,
                ProtocolType::CloseSessionRequest | ProtocolType::CloseSessionResponse => {
                    this.on_close_session(seg).await
                }
                _ => Err(Error::protocol(format!(
                    "protocol {:?} is classified as a session protocol but has no handler",
                    protocol
                ))),
            }
        } else if protocol.is_data_ack() {
            let Some(das) = seg.metadata.as_data_ack() else {
                return Ok(());
            };
            let session_id = das.session_id;
            match this.base.get_session(session_id) {
                Some(session) => {
                    // Data and acks must not stall the event loop; drop on
                    // backpressure and let retransmission recover
                    if session.recv_sender().try_send(seg).is_err() {
                        this.metrics.add_recv_queue_drop();
                        debug!("session {} receive queue is full, dropping", session_id);
                    }
                }
                None => {
                    debug!("session {} is not registered to {:?}", session_id, this);
                }
            }
            Ok(())
        } else {
            // Close-connection semantics are not negotiated yet; ignore
            debug!("{:?} ignoring protocol {:?}", this, protocol);
            Ok(())
        }
    }

    async fn on_open_session_request(this: &Arc<Self>, seg: Segment) -> Result<()> {
        if this.base.is_client {
            return Err(Error::invalid_op(
                "client received open session request",
            ));
        }
        let session_id = seg.session_id()?;
        if session_id == 0 {
            return Err(Error::ReservedSessionId);
        }
        if this.base.has_session(session_id) {
            debug!(
                "{:?} received open session request, but session {} already exists",
                this, session_id
            );
            return Ok(());
        }

        let session = Session::new(session_id, false, this.base.mtu);
        Arc::clone(this).add_session(Arc::clone(&session)).await?;

        // Handshake delivery is awaited: the session queue absorbs it
        if session.recv_sender().send(seg).await.is_err() {
            debug!("session {} closed before open request delivery", session_id);
        }
        if !this.base.publish_ready(session) {
            warn!(
                "ready-session backlog is full, session {} is not observable by accept",
                session_id
            );
        }
        Ok(())
    }

    async fn on_open_session_response(&self, seg: Segment) -> Result<()> {
        if !self.base.is_client {
            return Err(Error::invalid_op(
                "server received open session response",
            ));
        }
        let session_id = seg.session_id()?;
        let session = self
            .base
            .get_session(session_id)
            .ok_or(Error::SessionNotFound(session_id))?;
        if session.recv_sender().send(seg).await.is_err() {
            debug!("session {} closed before open response delivery", session_id);
        }
        Ok(())
    }

    async fn on_close_session(&self, seg: Segment) -> Result<()> {
        let session_id = seg.session_id()?;
        let Some(session) = self.base.get_session(session_id) else {
            debug!(
                "{:?} received close session segment, but session {} is not found",
                self, session_id
            );
            return Ok(());
        };
        if session.recv_sender().send(seg).await.is_err() {
            debug!("session {} closed before close delivery", session_id);
        }
        session.wait().await;
        self.remove_session(session_id).await
    }
}

#[async_trait]
impl Underlay for UdpUnderlay {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.server_addr.or_else(|| *self.peer_addr.lock())
    }

    fn ip_version(&self) -> IpVersion {
        match self.socket.local_addr() {
            Ok(addr) => IpVersion::of(&addr),
            Err(_) => IpVersion::Unknown,
        }
    }

    fn transport_protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn mtu(&self) -> usize {
        self.base.mtu
    }

    async fn add_session(self: Arc<Self>, session: Arc<Session>) -> Result<()> {
        self.base.insert_session(Arc::clone(&session))?;
        let handle: Arc<dyn Underlay> = self.clone();
        session.bind(Arc::downgrade(&handle));
        session.start();
        session.ready_signal().set();
        debug!("adding session {} to {:?}", session.id(), self);
        Ok(())
    }

    async fn remove_session(&self, session_id: u32) -> Result<()> {
        let (removed, empty) = self.base.take_session(session_id);
        if removed.is_some() {
            debug!("removed session {} from {:?}", session_id, self);
        }
        if empty {
            self.close()?;
        }
        Ok(())
    }

    async fn run_event_loop(self: Arc<Self>, cancel: Signal) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.wait() => return Ok(()),
                _ = self.base.done.wait() => return Ok(()),
                result = self.read_one_segment() => {
                    let (seg, addr) = result?;
                    trace!(
                        "{:?} received one segment: peer = {}, protocol = {:?}, payload size = {}",
                        self,
                        addr,
                        seg.protocol(),
                        seg.payload.len()
                    );
                    Self::dispatch(&self, seg).await?;
                }
            }
        }
    }

    async fn write_segment(&self, seg: Segment) -> Result<()> {
        let addr = if self.base.is_client {
            self.server_addr.ok_or(Error::Closed)?
        } else {
            (*self.peer_addr.lock())
                .ok_or_else(|| Error::invalid_op("no authenticated peer to write to"))?
        };
        self.write_one_segment(seg, addr).await
    }

    fn close(&self) -> Result<()> {
        if self.base.done.is_set() {
            return Ok(());
        }
        debug!("closing {:?}", self);
        self.base.done.set();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.base.done.is_set()
    }
}

impl std::fmt::Debug for UdpUnderlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let local = self
            .socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into());
        if self.base.is_client {
            write!(
                f,
                "UdpUnderlay{{{} - {}}}",
                local,
                self.server_addr
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "?".into())
            )
        } else {
            write!(f, "UdpUnderlay{{{local}}}")
        }
    }
}

fn check_network(network: &str) -> Result<()> {
    match network {
        "udp" | "udp4" | "udp6" => Ok(()),
        other => Err(Error::InvalidArgument(format!(
            "network {other} is not supported for UDP underlay"
        ))),
    }
}

/// Resolve a host:port string, honoring the address family the network
/// name requests.
async fn resolve(network: &str, addr: &str) -> Result<SocketAddr> {
    let mut last = None;
    for candidate in lookup_host(addr).await? {
        match network {
            "udp4" if !candidate.is_ipv4() => continue,
            "udp6" if !candidate.is_ipv6() => continue,
            _ => {}
        }
        last = Some(candidate);
        break;
    }
    last.ok_or_else(|| Error::InvalidArgument(format!("unable to resolve address {addr}")))
}
