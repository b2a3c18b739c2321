use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::bail;

use crate::frame::MAX_CHUNK_SIZE;

/// UDP port that broadcast-receive sockets bind to. Wire-visible: peers must agree on it.
pub const BROADCAST_PORT: u16 = 9900;

/// Port range that unicast sockets are bound from, first free port wins. Wire-visible.
pub const DYNAMIC_PORT_RANGE: RangeInclusive<u16> = 9901..=9999;

/// Tuning knobs of the transport. The defaults are the protocol's nominal values; tests
///  shrink the timeouts to keep their runtime down.
///
/// NB: Everything in here is node-local. The wire-visible constants ([BROADCAST_PORT],
///      [DYNAMIC_PORT_RANGE], [MAX_CHUNK_SIZE](crate::frame::MAX_CHUNK_SIZE)) are consts
///      on purpose - peers cannot negotiate them.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// chunk size used for outbound messages; inbound messages carry their own
    pub sending_chunk_size: u16,

    /// upper bound for queue polls so worker loops observe shutdown with bounded latency
    pub poll_timeout: Duration,

    /// how long the sender waits for a receipt before requesting one explicitly
    pub waiting_for_receipt_timeout: Duration,
    /// how often the sender re-requests a receipt before giving the message up as lost
    pub max_receipt_waits: u32,
    /// retention after a successful send, absorbing late duplicates and re-send requests
    pub waiting_after_receipt_timeout: Duration,

    /// how long the receiver waits for outstanding chunks before requesting them
    pub waiting_for_all_chunks_timeout: Duration,
    /// how often the receiver re-requests chunks before abandoning the message
    pub max_chunk_waits: u32,
    /// retention after complete delivery, deduplicating late re-sent chunks
    pub waiting_after_complete_timeout: Duration,

    /// cap on missing-chunk indices per nack frame; longer lists are split
    pub max_missing_list: usize,

    /// upper bound for a single message's payload, guarding the receive-side allocation
    pub max_message_size: u32,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            sending_chunk_size: 1024,
            poll_timeout: Duration::from_millis(200),
            waiting_for_receipt_timeout: Duration::from_millis(1000),
            max_receipt_waits: 3,
            waiting_after_receipt_timeout: Duration::from_millis(6000),
            waiting_for_all_chunks_timeout: Duration::from_millis(1000),
            max_chunk_waits: 3,
            waiting_after_complete_timeout: Duration::from_millis(6000),
            max_missing_list: 256,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sending_chunk_size == 0 || self.sending_chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "sending chunk size must be in 1..={}, was {}",
                MAX_CHUNK_SIZE,
                self.sending_chunk_size
            );
        }
        if self.max_missing_list == 0 {
            bail!("max missing list must not be empty");
        }
        if self.max_missing_list > 256 {
            // 55 byte header + u16 count + 256 * u32 stays well below the packet limit
            bail!("max missing list of {} does not fit a single nack frame", self.max_missing_list);
        }
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_chunk_size() {
        let mut config = TransportConfig::default();
        config.sending_chunk_size = 0;
        assert!(config.validate().is_err());

        config.sending_chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_missing_list() {
        let mut config = TransportConfig::default();
        config.max_missing_list = 257;
        assert!(config.validate().is_err());
    }
}
