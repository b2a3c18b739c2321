use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

use crate::identity::{ClusterIdentity, MessageId};

/// serialized length of [FrameHeader], i.e. the offset of the first trailer byte
pub const HEADER_LEN: usize = 55;

/// upper bound for the negotiated per-message chunk size
pub const MAX_CHUNK_SIZE: u16 = 1024;

/// upper bound for a whole UDP datagram, and the size of receive buffers
pub const MAX_PACKET_SIZE: usize = 16 * 1024;

/// The type discriminators on the wire. Matching is done modulo 16, the high nibble
///  is reserved.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Chunk = 1,
    ReceiptRequest = 2,
    Receipt = 3,
    ChunksNeeded = 4,
    ChunkRangesNeeded = 5,
    NoLongerExists = 6,
}

/// The fixed 55-byte prefix shared by all frames. All integers are little-endian.
///
/// ```ascii
///  0: frame type (u8), matched modulo 16
///  1: message id (4 x u64): cluster identity (time, rand), local (time, rand)
/// 33: destination cluster identity (2 x u64) - the all-zero pair means broadcast
/// 49: total payload size in bytes (u32)
/// 53: chunk size in bytes (u16)
/// ```
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct FrameHeader {
    pub id: MessageId,
    pub destination: Option<ClusterIdentity>,
    pub total_size: u32,
    pub chunk_size: u16,
}

impl FrameHeader {
    fn ser(&self, frame_type: FrameType, buf: &mut BytesMut) {
        buf.put_u8(frame_type as u8);
        self.id.ser(buf);
        self.destination
            .unwrap_or(ClusterIdentity::BROADCAST)
            .ser(buf);
        buf.put_u32_le(self.total_size);
        buf.put_u16_le(self.chunk_size);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<(FrameType, FrameHeader)> {
        let raw_type = buf.try_get_u8()?;
        let frame_type = match FrameType::try_from(raw_type & 0x0f) {
            Ok(t) => t,
            Err(_) => bail!("unknown frame type {}", raw_type),
        };

        let id = MessageId::try_deser(buf)?;
        let destination = match ClusterIdentity::try_deser(buf)? {
            ClusterIdentity::BROADCAST => None,
            dest => Some(dest),
        };
        let total_size = buf.try_get_u32_le()?;
        let chunk_size = buf.try_get_u16_le()?;

        Ok((
            frame_type,
            FrameHeader {
                id,
                destination,
                total_size,
                chunk_size,
            },
        ))
    }
}

/// A parsed datagram: the common header plus the type-specific trailer.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum FrameBody {
    /// one slice of a message's payload, at `index * chunk_size`
    Chunk { index: u32, data: Bytes },
    /// sender asking the receiver to (re-)acknowledge
    ReceiptRequest,
    /// receiver confirming complete and processed delivery; `error_code` 0 is success,
    ///  1 means the payload could not be decoded
    Receipt { error_code: u16 },
    /// receiver listing individual chunk indices it still needs
    ChunksNeeded { indices: Vec<u32> },
    /// like [FrameBody::ChunksNeeded] but with inclusive-inclusive index ranges
    ChunkRangesNeeded { ranges: Vec<(u32, u32)> },
    /// sender telling the receiver that it no longer has state for this message id
    NoLongerExists,
}

impl Frame {
    pub fn new(header: FrameHeader, body: FrameBody) -> Frame {
        Frame { header, body }
    }

    pub fn frame_type(&self) -> FrameType {
        match self.body {
            FrameBody::Chunk { .. } => FrameType::Chunk,
            FrameBody::ReceiptRequest => FrameType::ReceiptRequest,
            FrameBody::Receipt { .. } => FrameType::Receipt,
            FrameBody::ChunksNeeded { .. } => FrameType::ChunksNeeded,
            FrameBody::ChunkRangesNeeded { .. } => FrameType::ChunkRangesNeeded,
            FrameBody::NoLongerExists => FrameType::NoLongerExists,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.header.ser(self.frame_type(), buf);

        match &self.body {
            FrameBody::Chunk { index, data } => {
                buf.put_u32_le(*index);
                buf.put_slice(data);
            }
            FrameBody::ReceiptRequest => {}
            FrameBody::Receipt { error_code } => {
                buf.put_u16_le(*error_code);
            }
            FrameBody::ChunksNeeded { indices } => {
                buf.put_u16_le(indices.len() as u16);
                for index in indices {
                    buf.put_u32_le(*index);
                }
            }
            FrameBody::ChunkRangesNeeded { ranges } => {
                buf.put_u16_le(ranges.len() as u16);
                for (lo, hi) in ranges {
                    buf.put_u32_le(*lo);
                    buf.put_u32_le(*hi);
                }
            }
            FrameBody::NoLongerExists => {}
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let (frame_type, header) = FrameHeader::try_deser(buf)?;

        let body = match frame_type {
            FrameType::Chunk => {
                let index = buf.try_get_u32_le()?;
                let data = buf.copy_to_bytes(buf.remaining());
                FrameBody::Chunk { index, data }
            }
            FrameType::ReceiptRequest => FrameBody::ReceiptRequest,
            FrameType::Receipt => FrameBody::Receipt {
                error_code: buf.try_get_u16_le()?,
            },
            FrameType::ChunksNeeded => {
                let count = buf.try_get_u16_le()?;
                let mut indices = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    indices.push(buf.try_get_u32_le()?);
                }
                FrameBody::ChunksNeeded { indices }
            }
            FrameType::ChunkRangesNeeded => {
                let count = buf.try_get_u16_le()?;
                let mut ranges = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let lo = buf.try_get_u32_le()?;
                    let hi = buf.try_get_u32_le()?;
                    ranges.push((lo, hi));
                }
                FrameBody::ChunkRangesNeeded { ranges }
            }
            FrameType::NoLongerExists => FrameBody::NoLongerExists,
        };

        Ok(Frame { header, body })
    }
}
