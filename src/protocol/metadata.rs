//! Segment metadata variants and their fixed-size codec.
//!
//! Every variant marshals to exactly [`METADATA_LENGTH`] bytes so the
//! encrypted header has a constant size on the wire regardless of what it
//! says. Fields are network byte order; the protocol tag is always byte 0.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// Marshaled size of every metadata variant.
pub const METADATA_LENGTH: usize = 32;

/// Protocol numbers carried in the first metadata byte.
///
/// The numbers partition into three disjoint sets: session protocols
/// (open/close handshakes), data-ack protocols, and the close-connection
/// protocol. Receivers dispatch on the set, then the value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    /// Client asks the server to create a session
    OpenSessionRequest = 2,
    /// Server confirms (or refuses) a session
    OpenSessionResponse = 3,
    /// Either side starts the close handshake
    CloseSessionRequest = 4,
    /// Close handshake confirmation
    CloseSessionResponse = 5,
    /// Data, client to server
    DataClientToServer = 6,
    /// Data, server to client
    DataServerToClient = 7,
    /// Acknowledgement, client to server
    AckClientToServer = 8,
    /// Acknowledgement, server to client
    AckServerToClient = 9,
    /// Tear down the whole connection
    CloseConnRequest = 10,
}

impl ProtocolType {
    /// Whether this tag belongs to the session (handshake) set.
    pub fn is_session(self) -> bool {
        is_session_protocol(self as u8)
    }

    /// Whether this tag belongs to the data-ack set.
    pub fn is_data_ack(self) -> bool {
        is_data_ack_protocol(self as u8)
    }

    /// Whether this tag is the close-connection protocol.
    pub fn is_close_conn(self) -> bool {
        is_close_conn_protocol(self as u8)
    }
}

impl TryFrom<u8> for ProtocolType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            2 => Ok(ProtocolType::OpenSessionRequest),
            3 => Ok(ProtocolType::OpenSessionResponse),
            4 => Ok(ProtocolType::CloseSessionRequest),
            5 => Ok(ProtocolType::CloseSessionResponse),
            6 => Ok(ProtocolType::DataClientToServer),
            7 => Ok(ProtocolType::DataServerToClient),
            8 => Ok(ProtocolType::AckClientToServer),
            9 => Ok(ProtocolType::AckServerToClient),
            10 => Ok(ProtocolType::CloseConnRequest),
            _ => Err(Error::protocol(format!("unknown protocol {value}"))),
        }
    }
}

/// Is this byte a session (handshake) protocol?
pub fn is_session_protocol(p: u8) -> bool {
    (2..=5).contains(&p)
}

/// Is this byte a data or ack protocol?
pub fn is_data_ack_protocol(p: u8) -> bool {
    (6..=9).contains(&p)
}

/// Is this byte the close-connection protocol?
pub fn is_close_conn_protocol(p: u8) -> bool {
    p == 10
}

/// Metadata of an open/close session handshake segment.
///
/// Layout: protocol(1) | session_id(4) | seq(4) | status(1) |
/// payload_len(2) | suffix_len(1), zero-padded to [`METADATA_LENGTH`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStruct {
    /// Protocol tag (one of the session set)
    pub protocol: ProtocolType,
    /// Target session; never 0 on the wire
    pub session_id: u32,
    /// Sequence number of this handshake segment
    pub seq: u32,
    /// 0 on success, non-zero otherwise
    pub status: u8,
    /// Payload bytes carried after the metadata block
    pub payload_len: u16,
    /// Trailing padding bytes
    pub suffix_len: u8,
}

impl SessionStruct {
    /// Marshal to the fixed wire size.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(METADATA_LENGTH);
        buf.put_u8(self.protocol as u8);
        buf.put_u32(self.session_id);
        buf.put_u32(self.seq);
        buf.put_u8(self.status);
        buf.put_u16(self.payload_len);
        buf.put_u8(self.suffix_len);
        buf.resize(METADATA_LENGTH, 0);
        buf.to_vec()
    }

    /// Unmarshal from exactly [`METADATA_LENGTH`] bytes.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut buf = check_length(data)?;
        let protocol = ProtocolType::try_from(buf.get_u8())?;
        if !protocol.is_session() {
            return Err(Error::protocol(format!(
                "protocol {} is not a session protocol",
                protocol as u8
            )));
        }
        Ok(Self {
            protocol,
            session_id: buf.get_u32(),
            seq: buf.get_u32(),
            status: buf.get_u8(),
            payload_len: buf.get_u16(),
            suffix_len: buf.get_u8(),
        })
    }
}

/// Metadata of a data or ack segment.
///
/// Layout: protocol(1) | session_id(4) | seq(4) | un_ack_seq(4) |
/// window_size(2) | prefix_len(1) | payload_len(2) | suffix_len(1),
/// zero-padded to [`METADATA_LENGTH`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAckStruct {
    /// Protocol tag (one of the data-ack set)
    pub protocol: ProtocolType,
    /// Target session
    pub session_id: u32,
    /// Sequence number of this segment
    pub seq: u32,
    /// All segments below this sequence number have been received
    pub un_ack_seq: u32,
    /// Free receive-buffer slots on the sending side
    pub window_size: u16,
    /// Padding bytes between the metadata block and the payload block
    pub prefix_len: u8,
    /// Payload bytes carried after the prefix padding
    pub payload_len: u16,
    /// Trailing padding bytes
    pub suffix_len: u8,
}

impl DataAckStruct {
    /// Marshal to the fixed wire size.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(METADATA_LENGTH);
        buf.put_u8(self.protocol as u8);
        buf.put_u32(self.session_id);
        buf.put_u32(self.seq);
        buf.put_u32(self.un_ack_seq);
        buf.put_u16(self.window_size);
        buf.put_u8(self.prefix_len);
        buf.put_u16(self.payload_len);
        buf.put_u8(self.suffix_len);
        buf.resize(METADATA_LENGTH, 0);
        buf.to_vec()
    }

    /// Unmarshal from exactly [`METADATA_LENGTH`] bytes.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut buf = check_length(data)?;
        let protocol = ProtocolType::try_from(buf.get_u8())?;
        if !protocol.is_data_ack() {
            return Err(Error::protocol(format!(
                "protocol {} is not a data-ack protocol",
                protocol as u8
            )));
        }
        Ok(Self {
            protocol,
            session_id: buf.get_u32(),
            seq: buf.get_u32(),
            un_ack_seq: buf.get_u32(),
            window_size: buf.get_u16(),
            prefix_len: buf.get_u8(),
            payload_len: buf.get_u16(),
            suffix_len: buf.get_u8(),
        })
    }
}

/// Metadata of a close-connection segment.
///
/// Layout: protocol(1) | status(1) | suffix_len(1), zero-padded to
/// [`METADATA_LENGTH`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseConnStruct {
    /// Protocol tag (the close-connection protocol)
    pub protocol: ProtocolType,
    /// 0 on orderly close, non-zero otherwise
    pub status: u8,
    /// Trailing padding bytes
    pub suffix_len: u8,
}

impl CloseConnStruct {
    /// Marshal to the fixed wire size.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(METADATA_LENGTH);
        buf.put_u8(self.protocol as u8);
        buf.put_u8(self.status);
        buf.put_u8(self.suffix_len);
        buf.resize(METADATA_LENGTH, 0);
        buf.to_vec()
    }

    /// Unmarshal from exactly [`METADATA_LENGTH`] bytes.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut buf = check_length(data)?;
        let protocol = ProtocolType::try_from(buf.get_u8())?;
        if !protocol.is_close_conn() {
            return Err(Error::protocol(format!(
                "protocol {} is not the close-connection protocol",
                protocol as u8
            )));
        }
        Ok(Self {
            protocol,
            status: buf.get_u8(),
            suffix_len: buf.get_u8(),
        })
    }
}

fn check_length(data: &[u8]) -> Result<&[u8]> {
    if data.len() != METADATA_LENGTH {
        return Err(Error::Buffer {
            expected: METADATA_LENGTH,
            actual: data.len(),
        });
    }
    Ok(data)
}

/// Tagged metadata of one segment, dispatched by the protocol byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    /// Open/close session handshake
    Session(SessionStruct),
    /// Data or acknowledgement
    DataAck(DataAckStruct),
    /// Connection teardown
    CloseConn(CloseConnStruct),
}

impl Metadata {
    /// The protocol tag.
    pub fn protocol(&self) -> ProtocolType {
        match self {
            Metadata::Session(m) => m.protocol,
            Metadata::DataAck(m) => m.protocol,
            Metadata::CloseConn(m) => m.protocol,
        }
    }

    /// The session this metadata belongs to, if any.
    pub fn session_id(&self) -> Option<u32> {
        match self {
            Metadata::Session(m) => Some(m.session_id),
            Metadata::DataAck(m) => Some(m.session_id),
            Metadata::CloseConn(_) => None,
        }
    }

    /// The sequence number, if the variant carries one.
    pub fn seq(&self) -> Option<u32> {
        match self {
            Metadata::Session(m) => Some(m.seq),
            Metadata::DataAck(m) => Some(m.seq),
            Metadata::CloseConn(_) => None,
        }
    }

    /// Declared payload length.
    pub fn payload_len(&self) -> u16 {
        match self {
            Metadata::Session(m) => m.payload_len,
            Metadata::DataAck(m) => m.payload_len,
            Metadata::CloseConn(_) => 0,
        }
    }

    /// Marshal whichever variant this is to the fixed wire size.
    pub fn marshal(&self) -> Vec<u8> {
        match self {
            Metadata::Session(m) => m.marshal(),
            Metadata::DataAck(m) => m.marshal(),
            Metadata::CloseConn(m) => m.marshal(),
        }
    }

    /// Unmarshal by dispatching on the protocol byte.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        check_length(data)?;
        let p = data[0];
        if is_session_protocol(p) {
            Ok(Metadata::Session(SessionStruct::unmarshal(data)?))
        } else if is_data_ack_protocol(p) {
            Ok(Metadata::DataAck(DataAckStruct::unmarshal(data)?))
        } else if is_close_conn_protocol(p) {
            Ok(Metadata::CloseConn(CloseConnStruct::unmarshal(data)?))
        } else {
            Err(Error::protocol(format!("unable to handle protocol {p}")))
        }
    }

    /// View as a session struct, if it is one.
    pub fn as_session(&self) -> Option<&SessionStruct> {
        match self {
            Metadata::Session(m) => Some(m),
            _ => None,
        }
    }

    /// View as a data-ack struct, if it is one.
    pub fn as_data_ack(&self) -> Option<&DataAckStruct> {
        match self {
            Metadata::DataAck(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_sets_are_disjoint() {
        for p in 0..=255u8 {
            let classes = [
                is_session_protocol(p),
                is_data_ack_protocol(p),
                is_close_conn_protocol(p),
            ];
            assert!(classes.iter().filter(|&&c| c).count() <= 1, "protocol {p}");
        }
    }

    #[test]
    fn test_session_struct_roundtrip() {
        let m = SessionStruct {
            protocol: ProtocolType::OpenSessionRequest,
            session_id: 0xDEADBEEF,
            seq: 7,
            status: 0,
            payload_len: 100,
            suffix_len: 42,
        };

        let wire = m.marshal();
        assert_eq!(wire.len(), METADATA_LENGTH);
        assert_eq!(wire[0], ProtocolType::OpenSessionRequest as u8);

        let back = SessionStruct::unmarshal(&wire).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_data_ack_struct_roundtrip() {
        let m = DataAckStruct {
            protocol: ProtocolType::AckServerToClient,
            session_id: 12,
            seq: u32::MAX,
            un_ack_seq: 99,
            window_size: 16,
            prefix_len: 3,
            payload_len: 1400,
            suffix_len: 254,
        };

        let wire = m.marshal();
        assert_eq!(wire.len(), METADATA_LENGTH);

        let back = DataAckStruct::unmarshal(&wire).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_close_conn_struct_roundtrip() {
        let m = CloseConnStruct {
            protocol: ProtocolType::CloseConnRequest,
            status: 1,
            suffix_len: 9,
        };

        let wire = m.marshal();
        assert_eq!(wire.len(), METADATA_LENGTH);

        let back = CloseConnStruct::unmarshal(&wire).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_unmarshal_rejects_wrong_size() {
        let m = SessionStruct {
            protocol: ProtocolType::OpenSessionRequest,
            session_id: 1,
            seq: 0,
            status: 0,
            payload_len: 0,
            suffix_len: 0,
        };
        let wire = m.marshal();

        assert!(SessionStruct::unmarshal(&wire[..31]).is_err());
        let mut long = wire.clone();
        long.push(0);
        assert!(SessionStruct::unmarshal(&long).is_err());
    }

    #[test]
    fn test_unmarshal_rejects_wrong_class() {
        let m = DataAckStruct {
            protocol: ProtocolType::DataClientToServer,
            session_id: 1,
            seq: 0,
            un_ack_seq: 0,
            window_size: 0,
            prefix_len: 0,
            payload_len: 0,
            suffix_len: 0,
        };
        let wire = m.marshal();
        assert!(SessionStruct::unmarshal(&wire).is_err());
        assert!(CloseConnStruct::unmarshal(&wire).is_err());
    }

    #[test]
    fn test_metadata_dispatch() {
        let wire = SessionStruct {
            protocol: ProtocolType::CloseSessionRequest,
            session_id: 3,
            seq: 8,
            status: 0,
            payload_len: 0,
            suffix_len: 0,
        }
        .marshal();

        let meta = Metadata::unmarshal(&wire).unwrap();
        assert_eq!(meta.protocol(), ProtocolType::CloseSessionRequest);
        assert_eq!(meta.session_id(), Some(3));
        assert_eq!(meta.seq(), Some(8));
        assert!(meta.as_session().is_some());
        assert!(meta.as_data_ack().is_none());
    }

    #[test]
    fn test_metadata_unknown_protocol() {
        let mut wire = vec![0u8; METADATA_LENGTH];
        wire[0] = 0xEE;
        assert!(Metadata::unmarshal(&wire).is_err());

        wire[0] = 0;
        assert!(Metadata::unmarshal(&wire).is_err());
    }
}
