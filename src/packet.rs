//! Wire framing.
//!
//! Every packet exchanged between peers is the concatenation of a fixed
//! 8-byte header, the sender's socket name, an ancillary-data block, and
//! the user payload, in that order. The header carries the lengths of all
//! three blocks plus the total, so the block offsets are derived, never
//! stored. All fields are host-endian; both ends live on the same host.
//!
//! ```text
//! offset 0  u16 pckt_len   total, header included
//! offset 2  u8  shut_info  SHUT_RD | SHUT_WR
//! offset 3  u8  name_len   sockaddr_un bytes that follow
//! offset 4  u16 cmsg_len   ancillary block bytes
//! offset 6  u16 data_len   user payload bytes
//! ```

use nix::errno::Errno;

use crate::addr::SunName;

/// Size of the fixed header.
pub const HEADER_LEN: usize = 8;

/// Largest packet the framing can carry, header included.
pub const MAX_PACKET_LEN: usize = u16::MAX as usize;

bitflags::bitflags! {
    /// Shutdown announcement carried in the header. `RD` means the sender
    /// shut down its read side, so the receiver must stop sending; `WR` the
    /// reverse. Both together precede a close of the transport.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ShutInfo: u8 {
        const RD = 1 << 0;
        const WR = 1 << 1;
    }
}

/// The decoded fixed header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub pckt_len: u16,
    pub shut_info: ShutInfo,
    pub name_len: u8,
    pub cmsg_len: u16,
    pub data_len: u16,
}

impl PacketHeader {
    fn new(shut_info: ShutInfo, name_len: u8, cmsg_len: u16, data_len: u16) -> Self {
        let pckt_len =
            HEADER_LEN as u16 + name_len as u16 + cmsg_len + data_len;
        Self {
            pckt_len,
            shut_info,
            name_len,
            cmsg_len,
            data_len,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.pckt_len.to_ne_bytes());
        buf[2] = self.shut_info.bits();
        buf[3] = self.name_len;
        buf[4..6].copy_from_slice(&self.cmsg_len.to_ne_bytes());
        buf[6..8].copy_from_slice(&self.data_len.to_ne_bytes());
        buf
    }

    /// Decode and cross-check a header against the bytes that carry it.
    pub fn decode(bytes: &[u8]) -> Result<Self, Errno> {
        if bytes.len() < HEADER_LEN {
            return Err(Errno::EPROTO);
        }
        let header = Self {
            pckt_len: u16::from_ne_bytes([bytes[0], bytes[1]]),
            shut_info: ShutInfo::from_bits_truncate(bytes[2]),
            name_len: bytes[3],
            cmsg_len: u16::from_ne_bytes([bytes[4], bytes[5]]),
            data_len: u16::from_ne_bytes([bytes[6], bytes[7]]),
        };
        let expected = HEADER_LEN
            + header.name_len as usize
            + header.cmsg_len as usize
            + header.data_len as usize;
        if header.pckt_len as usize != expected || bytes.len() < expected {
            return Err(Errno::EPROTO);
        }
        Ok(header)
    }

    pub fn name_offset(&self) -> usize {
        HEADER_LEN
    }

    pub fn cmsg_offset(&self) -> usize {
        HEADER_LEN + self.name_len as usize
    }

    pub fn data_offset(&self) -> usize {
        HEADER_LEN + self.name_len as usize + self.cmsg_len as usize
    }
}

/// An owned, encoded packet.
#[derive(Clone, Debug)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    /// Assemble a packet. The name block is the sender's bound address, or
    /// absent for an unbound sender; bound datagram sockets pass theirs on
    /// every send so the receiver can fill in the source address.
    pub fn build(
        shut_info: ShutInfo,
        name: Option<&SunName>,
        cmsg: &[u8],
        data: &[u8],
    ) -> Result<Self, Errno> {
        let name_bytes = name.map(SunName::as_bytes).unwrap_or(&[]);
        let total = HEADER_LEN + name_bytes.len() + cmsg.len() + data.len();
        if total > MAX_PACKET_LEN || cmsg.len() > u16::MAX as usize || data.len() > u16::MAX as usize
        {
            return Err(Errno::EMSGSIZE);
        }
        let header = PacketHeader::new(
            shut_info,
            name_bytes.len() as u8,
            cmsg.len() as u16,
            data.len() as u16,
        );
        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(&header.encode());
        bytes.extend_from_slice(name_bytes);
        bytes.extend_from_slice(cmsg);
        bytes.extend_from_slice(data);
        Ok(Self { bytes })
    }

    /// The one-shot name announcement a freshly connected or late-bound
    /// endpoint sends: just the local address, no ancillary data, no
    /// payload. An unbound sender announces a zero-length name.
    pub fn announcement(name: Option<&SunName>) -> Self {
        // an announcement always fits: header + at most one sockaddr_un
        Packet::build(ShutInfo::empty(), name, &[], &[]).unwrap()
    }

    /// Parse a received packet.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, Errno> {
        PacketHeader::decode(&bytes)?;
        Ok(Self { bytes })
    }

    pub fn header(&self) -> PacketHeader {
        // already validated by build() or parse()
        PacketHeader::decode(&self.bytes).unwrap()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The sender's address carried in the name block, if any.
    pub fn name(&self) -> Result<Option<SunName>, Errno> {
        let header = self.header();
        if header.name_len == 0 {
            return Ok(None);
        }
        let start = header.name_offset();
        let name = SunName::from_bytes(&self.bytes[start..start + header.name_len as usize])?;
        Ok(Some(name))
    }

    pub fn cmsg(&self) -> &[u8] {
        let header = self.header();
        &self.bytes[header.cmsg_offset()..][..header.cmsg_len as usize]
    }

    pub fn data(&self) -> &[u8] {
        let header = self.header();
        &self.bytes[header.data_offset()..][..header.data_len as usize]
    }
}
