//! The unit of exchange between peers: metadata plus an optional payload.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::metadata::{DataAckStruct, Metadata, ProtocolType, SessionStruct};

/// One protocol segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Fixed-size, always-encrypted header
    pub metadata: Metadata,
    /// Application bytes; may be empty
    pub payload: Bytes,
}

impl Segment {
    /// Build a segment from metadata and payload.
    pub fn new(metadata: Metadata, payload: Bytes) -> Self {
        Self { metadata, payload }
    }

    /// Build a session-handshake segment.
    pub fn session(protocol: ProtocolType, session_id: u32, seq: u32, payload: Bytes) -> Self {
        Self {
            metadata: Metadata::Session(SessionStruct {
                protocol,
                session_id,
                seq,
                status: 0,
                payload_len: payload.len() as u16,
                suffix_len: 0,
            }),
            payload,
        }
    }

    /// Build a data segment.
    pub fn data(
        protocol: ProtocolType,
        session_id: u32,
        seq: u32,
        un_ack_seq: u32,
        window_size: u16,
        payload: Bytes,
    ) -> Self {
        Self {
            metadata: Metadata::DataAck(DataAckStruct {
                protocol,
                session_id,
                seq,
                un_ack_seq,
                window_size,
                prefix_len: 0,
                payload_len: payload.len() as u16,
                suffix_len: 0,
            }),
            payload,
        }
    }

    /// Build a bare acknowledgement segment.
    pub fn ack(
        protocol: ProtocolType,
        session_id: u32,
        seq: u32,
        un_ack_seq: u32,
        window_size: u16,
    ) -> Self {
        Self::data(protocol, session_id, seq, un_ack_seq, window_size, Bytes::new())
    }

    /// The protocol tag of this segment.
    pub fn protocol(&self) -> ProtocolType {
        self.metadata.protocol()
    }

    /// The session this segment belongs to.
    ///
    /// # Errors
    ///
    /// Close-connection segments carry no session.
    pub fn session_id(&self) -> Result<u32> {
        self.metadata
            .session_id()
            .ok_or_else(|| Error::protocol("segment carries no session ID"))
    }

    /// The sequence number of this segment.
    ///
    /// # Errors
    ///
    /// Close-connection segments carry no sequence number.
    pub fn seq(&self) -> Result<u32> {
        self.metadata
            .seq()
            .ok_or_else(|| Error::protocol("segment carries no sequence number"))
    }
}

/// Sliding-window comparison of 32-bit sequence numbers.
///
/// `a` is considered before `b` when the forward distance from `a` to `b`
/// is shorter than half the sequence space, so ordering survives
/// wraparound.
pub fn seq_less(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000_0000
}
