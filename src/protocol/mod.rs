//! Wire protocol definitions.
//!
//! A datagram on the wire is:
//!
//! ```text
//! nonce | Enc(metadata)+tag | [prefix_pad] | Enc(payload)+tag | suffix_pad
//! ```
//!
//! Metadata always encrypts to the same size, so an observer sees only a
//! nonce followed by bytes indistinguishable from random, with a total
//! length decoupled from the payload length by the padding.

mod metadata;
mod segment;
mod tree;

pub use metadata::{
    is_close_conn_protocol, is_data_ack_protocol, is_session_protocol, CloseConnStruct,
    DataAckStruct, Metadata, ProtocolType, SessionStruct, METADATA_LENGTH,
};
pub use segment::{seq_less, Segment};
pub use tree::SegmentTree;

use crate::crypto::{NONCE_SIZE, TAG_SIZE};

/// Largest protocol data unit accepted from upper layers on a
/// stream-oriented transport.
pub const MAX_PDU: usize = 65535;

/// Fixed per-datagram overhead on UDP:
/// nonce, encrypted metadata with its tag, and the payload tag.
pub const UDP_OVERHEAD: usize = NONCE_SIZE + METADATA_LENGTH + TAG_SIZE * 2;

/// Offset of the first byte after the encrypted metadata block.
pub const UDP_NON_HEADER_POSITION: usize = NONCE_SIZE + METADATA_LENGTH + TAG_SIZE;

/// IP version of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
    /// Version not yet determined
    Unknown,
}

impl IpVersion {
    /// Classify a socket address.
    pub fn of(addr: &std::net::SocketAddr) -> Self {
        if addr.is_ipv4() {
            IpVersion::V4
        } else {
            IpVersion::V6
        }
    }

    /// IP header bytes to budget for this version.
    /// Unknown assumes the worst case of IPv6 plus options.
    const fn header_len(self) -> usize {
        match self {
            IpVersion::V4 => 20,
            IpVersion::V6 => 40,
            IpVersion::Unknown => 52,
        }
    }
}

/// Transport protocol of an underlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    /// Datagram transport
    Udp,
    /// Stream transport
    Tcp,
    /// Transport not yet determined
    Unknown,
}

/// UDP header size in bytes.
const UDP_HEADER_LEN: usize = 8;

/// Largest payload one fragment can carry for a given path MTU.
///
/// Stream transports are not fragment-limited and get the PDU budget.
pub fn max_fragment_size(mtu: usize, ip_version: IpVersion, transport: TransportProtocol) -> usize {
    if transport == TransportProtocol::Tcp {
        return MAX_PDU;
    }
    mtu.saturating_sub(ip_version.header_len() + UDP_HEADER_LEN + UDP_OVERHEAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_fragment_size() {
        let testcases = [
            (1500, IpVersion::V6, TransportProtocol::Tcp, MAX_PDU),
            (
                1500,
                IpVersion::V4,
                TransportProtocol::Udp,
                1472 - UDP_OVERHEAD,
            ),
            (
                1500,
                IpVersion::Unknown,
                TransportProtocol::Unknown,
                1440 - UDP_OVERHEAD,
            ),
        ];
        for (mtu, ipv, transport, want) in testcases {
            assert_eq!(max_fragment_size(mtu, ipv, transport), want);
        }
    }

    #[test]
    fn test_ip_version_of() {
        let v4: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let v6: std::net::SocketAddr = "[::1]:1".parse().unwrap();
        assert_eq!(IpVersion::of(&v4), IpVersion::V4);
        assert_eq!(IpVersion::of(&v6), IpVersion::V6);
    }

    #[test]
    fn test_overhead_constants() {
        assert_eq!(UDP_OVERHEAD, 12 + 32 + 16 * 2);
        assert_eq!(UDP_NON_HEADER_POSITION, 12 + 32 + 16);
    }
}
