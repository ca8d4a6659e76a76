use crate::block_id::BlockId;
use crate::destination::Destination;
use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::{Display, Formatter};

bitflags! {
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Hash)]
    pub struct PacketFlags: u16 {
        const SYN                      = 1 << 0;
        const CLOSE                    = 1 << 1;
        const RESET                    = 1 << 2;
        const SIGNATURE_INCLUDED       = 1 << 3;
        const SIGNATURE_REQUESTED      = 1 << 4;
        const FROM_INCLUDED            = 1 << 5;
        const DELAY_REQUESTED          = 1 << 6;
        const MAX_PACKET_SIZE_INCLUDED = 1 << 7;
        const PROFILE_INTERACTIVE      = 1 << 8;
        const ECHO                     = 1 << 9;
        const NO_ACK                   = 1 << 10;

        /// flags that are derived from other packet fields during serialization rather than
        ///  being set explicitly
        const DERIVED = Self::FROM_INCLUDED.bits()
            | Self::DELAY_REQUESTED.bits()
            | Self::MAX_PACKET_SIZE_INCLUDED.bits()
            | Self::NO_ACK.bits();
    }
}

/// Optional header fields. Each one is announced by its own flag, and they are serialized in
///  flag order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketOptions {
    pub delay_requested_millis: Option<u16>,
    pub from: Option<Destination>,
    pub max_packet_size: Option<u16>,
}

impl PacketOptions {
    fn serialized_len(&self) -> usize {
        self.delay_requested_millis.map(|_| size_of::<u16>()).unwrap_or(0)
            + self.from.as_ref().map(|d| size_of::<u16>() + d.len()).unwrap_or(0)
            + self.max_packet_size.map(|_| size_of::<u16>()).unwrap_or(0)
    }

    fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        flags.set(PacketFlags::DELAY_REQUESTED, self.delay_requested_millis.is_some());
        flags.set(PacketFlags::FROM_INCLUDED, self.from.is_some());
        flags.set(PacketFlags::MAX_PACKET_SIZE_INCLUDED, self.max_packet_size.is_some());
        flags
    }
}

/// The unit of transfer between two connection endpoints.
///
/// Stream ids are always given from the point of view of the packet's *recipient* for
///  `send_stream_id` and from the point of view of its *sender* for `receive_stream_id`: The
///  recipient looks up its connection by `send_stream_id`, and replies with the received
///  `receive_stream_id` as the new `send_stream_id`.
///
/// A packet is assembled once by its sender (ack fields are filled in just before it is
///  queued) and treated as immutable afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub send_stream_id: u32,
    pub receive_stream_id: u32,
    /// SYN is always block 0. A non-SYN packet with block 0 carries no block, i.e. it is a
    ///  pure ack or control packet.
    pub block_id: BlockId,
    /// all blocks up to and including this id were received except those listed in `nacks`
    pub ack_through: Option<BlockId>,
    /// strictly ascending, all strictly below `ack_through`
    pub nacks: Vec<BlockId>,
    /// sender's hint in seconds after which it will resend this packet
    pub resend_delay: u8,
    /// explicitly set flags; flags in [PacketFlags::DERIVED] are ignored here and computed
    ///  during serialization
    pub flags: PacketFlags,
    pub options: PacketOptions,
    pub payload: Bytes,
    /// trailer supplied by the lower layer's signer, covering all bytes before it. It is not
    ///  written by [Packet::ser] but appended by the sender after signing.
    pub signature: Bytes,
}

impl Display for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{}->{} #{}", self.receive_stream_id, self.send_stream_id, self.block_id)?;
        if let Some(ack_through) = self.ack_through {
            write!(f, " ack {}", ack_through)?;
        }
        if !self.nacks.is_empty() {
            write!(f, " nack {:?}", self.nacks.iter().map(|n| n.to_raw()).collect::<Vec<_>>())?;
        }
        let visible_flags = self.flags - PacketFlags::DERIVED - PacketFlags::SIGNATURE_INCLUDED;
        if !visible_flags.is_empty() {
            write!(f, " ")?;
            bitflags::parser::to_writer(&visible_flags, &mut *f)?;
        }
        write!(f, " {}b}}", self.payload.len())
    }
}

impl Packet {
    pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;
    pub const MAX_NACKS: usize = u8::MAX as usize;

    /// a requested delay of at least this many milliseconds asks the recipient to stop sending
    ///  new blocks
    pub const MIN_DELAY_CHOKE: u16 = 60_001;
    /// the delay we request to choke the peer
    pub const SEND_DELAY_CHOKE: u16 = 61_000;

    /// SYN, CLOSE, RESET and ECHO are security relevant and must carry a signature
    pub const FLAGS_REQUIRING_SIGNATURE: PacketFlags = PacketFlags::SYN
        .union(PacketFlags::CLOSE)
        .union(PacketFlags::RESET)
        .union(PacketFlags::ECHO);

    pub fn is_flag_set(&self, flag: PacketFlags) -> bool {
        self.flags.contains(flag)
    }

    /// true if this packet occupies a block id, i.e. it needs to be acknowledged and passed
    ///  through the receive buffer
    pub fn carries_block(&self) -> bool {
        self.is_flag_set(PacketFlags::SYN) || self.block_id != BlockId::ZERO
    }

    pub fn is_signed(&self) -> bool {
        self.is_flag_set(PacketFlags::SIGNATURE_INCLUDED)
    }

    fn effective_flags(&self) -> PacketFlags {
        let mut flags = (self.flags - PacketFlags::DERIVED) | self.options.flags();
        flags.set(PacketFlags::NO_ACK, self.ack_through.is_none());
        flags
    }

    pub fn serialized_len(&self) -> usize {
        size_of::<u32>()                           // send stream id
            + size_of::<u32>()                     // receive stream id
            + size_of::<u64>()                     // block id
            + size_of::<u64>()                     // ack through
            + size_of::<u8>()                      // nack count
            + self.nacks.len() * size_of::<u64>()  // nacks
            + size_of::<u8>()                      // resend delay
            + size_of::<u16>()                     // flags
            + size_of::<u16>()                     // option size
            + self.options.serialized_len()
            + size_of::<u16>()                     // payload length
            + self.payload.len()
    }

    /// Writes everything except the signature trailer. All numbers are in network byte order.
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        if self.nacks.len() > Self::MAX_NACKS {
            bail!("too many NACKs for a single packet: {}", self.nacks.len());
        }
        if self.payload.len() > Self::MAX_PAYLOAD_SIZE {
            bail!("payload of {} bytes exceeds the maximum of {}", self.payload.len(), Self::MAX_PAYLOAD_SIZE);
        }
        if let Some(from) = &self.options.from {
            if from.len() > Destination::MAX_LEN {
                bail!("destination of {} bytes is too long for the FROM option", from.len());
            }
        }

        buf.reserve(self.serialized_len());
        buf.put_u32(self.send_stream_id);
        buf.put_u32(self.receive_stream_id);
        buf.put_u64(self.block_id.to_raw());
        buf.put_u64(self.ack_through.map(|id| id.to_raw()).unwrap_or(0));
        buf.put_u8(self.nacks.len() as u8);
        for nack in &self.nacks {
            buf.put_u64(nack.to_raw());
        }
        buf.put_u8(self.resend_delay);
        buf.put_u16(self.effective_flags().bits());

        buf.put_u16(self.options.serialized_len() as u16);
        if let Some(delay) = self.options.delay_requested_millis {
            buf.put_u16(delay);
        }
        if let Some(from) = &self.options.from {
            buf.put_u16(from.len() as u16);
            buf.put_slice(from.as_bytes());
        }
        if let Some(max_packet_size) = self.options.max_packet_size {
            buf.put_u16(max_packet_size);
        }

        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Parses and validates a packet. Everything after the payload is the signature trailer,
    ///  which must be empty unless SIGNATURE_INCLUDED is set. Verifying the signature is left
    ///  to the caller.
    pub fn deser(raw: &Bytes) -> anyhow::Result<Packet> {
        let mut buf = raw.clone();

        let send_stream_id = buf.try_get_u32()?;
        let receive_stream_id = buf.try_get_u32()?;
        let block_id = BlockId::from_raw(buf.try_get_u64()?);
        let raw_ack_through = BlockId::from_raw(buf.try_get_u64()?);

        let nack_count = buf.try_get_u8()? as usize;
        let mut nacks = Vec::with_capacity(nack_count);
        for _ in 0..nack_count {
            nacks.push(BlockId::from_raw(buf.try_get_u64()?));
        }
        let resend_delay = buf.try_get_u8()?;

        let raw_flags = buf.try_get_u16()?;
        let flags = PacketFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("malformed flags: {:04x}", raw_flags))?;

        let option_size = buf.try_get_u16()? as usize;
        if buf.remaining() < option_size {
            bail!("option size {} exceeds remaining packet length {}", option_size, buf.remaining());
        }
        let mut option_buf = buf.split_to(option_size);
        let mut options = PacketOptions::default();
        if flags.contains(PacketFlags::DELAY_REQUESTED) {
            options.delay_requested_millis = Some(option_buf.try_get_u16()?);
        }
        if flags.contains(PacketFlags::FROM_INCLUDED) {
            let len = option_buf.try_get_u16()? as usize;
            if option_buf.remaining() < len {
                bail!("FROM option of length {} exceeds option size", len);
            }
            options.from = Some(Destination::new(option_buf.split_to(len)));
        }
        if flags.contains(PacketFlags::MAX_PACKET_SIZE_INCLUDED) {
            options.max_packet_size = Some(option_buf.try_get_u16()?);
        }
        if option_buf.has_remaining() {
            bail!("{} bytes of unknown options", option_buf.remaining());
        }

        let payload_len = buf.try_get_u16()? as usize;
        if payload_len > Self::MAX_PAYLOAD_SIZE {
            bail!("payload length {} exceeds the maximum of {}", payload_len, Self::MAX_PAYLOAD_SIZE);
        }
        if buf.remaining() < payload_len {
            bail!("payload length {} exceeds remaining packet length {}", payload_len, buf.remaining());
        }
        let payload = buf.split_to(payload_len);

        let signature = if flags.contains(PacketFlags::SIGNATURE_INCLUDED) {
            buf
        }
        else if buf.has_remaining() {
            bail!("{} bytes of trailing garbage in unsigned packet", buf.remaining());
        }
        else {
            Bytes::new()
        };

        let ack_through = if flags.contains(PacketFlags::NO_ACK) {
            if !nacks.is_empty() {
                bail!("packet has NACKs but no ack-through");
            }
            None
        }
        else {
            Some(raw_ack_through)
        };

        if let Some(ack_through) = ack_through {
            Self::validate_nacks(ack_through, &nacks)?;
        }
        if flags.contains(PacketFlags::SYN) && block_id != BlockId::ZERO {
            bail!("SYN packet with block id {}", block_id);
        }
        if flags.contains(PacketFlags::ECHO) && flags.intersects(PacketFlags::SYN | PacketFlags::CLOSE) {
            bail!("ECHO combined with stream flags: {:?}", flags);
        }

        Ok(Packet {
            send_stream_id,
            receive_stream_id,
            block_id,
            ack_through,
            nacks,
            resend_delay,
            flags: flags - PacketFlags::DERIVED,
            options,
            payload,
            signature,
        })
    }

    fn validate_nacks(ack_through: BlockId, nacks: &[BlockId]) -> anyhow::Result<()> {
        let mut prev: Option<BlockId> = None;
        for &nack in nacks {
            if nack >= ack_through {
                bail!("NACK {} is not below ack-through {}", nack, ack_through);
            }
            if let Some(prev) = prev {
                if nack <= prev {
                    bail!("NACKs are not strictly ascending: {} after {}", nack, prev);
                }
            }
            prev = Some(nack);
        }
        Ok(())
    }
}
