use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::identity::MessageId;

/// The application-level messages the transport carries between cluster members.
///
/// The transport never interprets the `payload` bytes - they belong to the actor layer.
///  It does match on the variants though, because routing on the receiving node differs
///  between them (delivery to one actor, to all actors of a class, to all actors with a
///  local id, node-level control).
///
/// The encoding is a one-byte tag followed by the variant's fields; strings are
///  u16-length-prefixed UTF-8, payloads are u32-length-prefixed byte runs. Byte-identical
///  encodings decode to equal values.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ClusterMessage {
    /// payload for one specific actor, addressed by its global id
    ActorMessage { actor: MessageId, payload: Bytes },
    /// payload for every local actor of the given class
    ActorMessageByClass { class_name: String, payload: Bytes },
    /// payload for every local actor registered under the given application-assigned id
    ActorMessageById { actor_id: String, payload: Bytes },
    /// ask the receiving node to stop its actor runtime
    Stop,
    /// ask the receiving node to report its status
    StatusRequest,
    /// answer to [ClusterMessage::StatusRequest]
    StatusResponse { actor_count: u32 },
}

const TAG_ACTOR_MESSAGE: u8 = 1;
const TAG_ACTOR_MESSAGE_BY_CLASS: u8 = 2;
const TAG_ACTOR_MESSAGE_BY_ID: u8 = 3;
const TAG_STOP: u8 = 4;
const TAG_STATUS_REQUEST: u8 = 5;
const TAG_STATUS_RESPONSE: u8 = 6;

impl ClusterMessage {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            ClusterMessage::ActorMessage { actor, payload } => {
                buf.put_u8(TAG_ACTOR_MESSAGE);
                actor.ser(buf);
                ser_payload(payload, buf);
            }
            ClusterMessage::ActorMessageByClass { class_name, payload } => {
                buf.put_u8(TAG_ACTOR_MESSAGE_BY_CLASS);
                ser_string(class_name, buf);
                ser_payload(payload, buf);
            }
            ClusterMessage::ActorMessageById { actor_id, payload } => {
                buf.put_u8(TAG_ACTOR_MESSAGE_BY_ID);
                ser_string(actor_id, buf);
                ser_payload(payload, buf);
            }
            ClusterMessage::Stop => {
                buf.put_u8(TAG_STOP);
            }
            ClusterMessage::StatusRequest => {
                buf.put_u8(TAG_STATUS_REQUEST);
            }
            ClusterMessage::StatusResponse { actor_count } => {
                buf.put_u8(TAG_STATUS_RESPONSE);
                buf.put_u32_le(*actor_count);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ClusterMessage> {
        let msg = match buf.try_get_u8()? {
            TAG_ACTOR_MESSAGE => ClusterMessage::ActorMessage {
                actor: MessageId::try_deser(buf)?,
                payload: try_deser_payload(buf)?,
            },
            TAG_ACTOR_MESSAGE_BY_CLASS => ClusterMessage::ActorMessageByClass {
                class_name: try_deser_string(buf)?,
                payload: try_deser_payload(buf)?,
            },
            TAG_ACTOR_MESSAGE_BY_ID => ClusterMessage::ActorMessageById {
                actor_id: try_deser_string(buf)?,
                payload: try_deser_payload(buf)?,
            },
            TAG_STOP => ClusterMessage::Stop,
            TAG_STATUS_REQUEST => ClusterMessage::StatusRequest,
            TAG_STATUS_RESPONSE => ClusterMessage::StatusResponse {
                actor_count: buf.try_get_u32_le()?,
            },
            tag => bail!("unknown cluster message tag {}", tag),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after cluster message", buf.remaining());
        }
        Ok(msg)
    }
}

fn ser_string(s: &str, buf: &mut BytesMut) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn try_deser_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_u16_le()? as usize;
    if buf.remaining() < len {
        bail!("string of declared length {} exceeds the buffer", len);
    }
    Ok(String::from_utf8(buf.copy_to_bytes(len).to_vec())?)
}

fn ser_payload(payload: &Bytes, buf: &mut BytesMut) {
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

fn try_deser_payload(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_u32_le()? as usize;
    if buf.remaining() < len {
        bail!("payload of declared length {} exceeds the buffer", len);
    }
    Ok(buf.copy_to_bytes(len))
}
