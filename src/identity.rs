use std::fmt::{Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};
use rand::RngCore;

/// A 128-bit node identifier, minted once per process and stable for the process' lifetime.
///
/// The `time` half is the minting timestamp in millis since the epoch, the `rand` half is
///  random. Neither half is interpreted anywhere - together they just make collisions
///  between nodes (including a restarted node on the same network address) overwhelmingly
///  unlikely.
///
/// NB: The all-zero value is reserved on the wire to mean 'no destination', i.e. broadcast,
///      and is never minted.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ClusterIdentity {
    pub time: u64,
    pub rand: u64,
}

impl ClusterIdentity {
    /// wire representation of a missing destination
    pub(crate) const BROADCAST: ClusterIdentity = ClusterIdentity { time: 0, rand: 0 };

    pub fn mint() -> ClusterIdentity {
        ClusterIdentity {
            time: millis_since_epoch(),
            rand: nonzero_rand(),
        }
    }

    pub(crate) fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.time);
        buf.put_u64_le(self.rand);
    }

    pub(crate) fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ClusterIdentity> {
        let time = buf.try_get_u64_le()?;
        let rand = buf.try_get_u64_le()?;
        Ok(ClusterIdentity { time, rand })
    }
}

impl Debug for ClusterIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}:{:016x}", self.time, self.rand)
    }
}

/// A 256-bit identifier for messages and actors: the minting node's [ClusterIdentity] plus
///  a locally unique `(time, rand)` pair. Receivers use it to deduplicate re-sent messages,
///  and both sides use it to correlate receipts and re-send requests with in-flight state.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct MessageId {
    pub cluster: ClusterIdentity,
    pub time: u64,
    pub rand: u64,
}

impl MessageId {
    pub fn mint(cluster: ClusterIdentity) -> MessageId {
        MessageId {
            cluster,
            time: millis_since_epoch(),
            rand: nonzero_rand(),
        }
    }

    pub(crate) fn ser(&self, buf: &mut impl BufMut) {
        self.cluster.ser(buf);
        buf.put_u64_le(self.time);
        buf.put_u64_le(self.rand);
    }

    pub(crate) fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageId> {
        let cluster = ClusterIdentity::try_deser(buf)?;
        let time = buf.try_get_u64_le()?;
        let rand = buf.try_get_u64_le()?;
        Ok(MessageId { cluster, time, rand })
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}/{:016x}:{:016x}]", self.cluster, self.time, self.rand)
    }
}

fn millis_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX epoch")
        .as_millis() as u64
}

fn nonzero_rand() -> u64 {
    loop {
        let r = rand::thread_rng().next_u64();
        if r != 0 {
            return r;
        }
    }
}
