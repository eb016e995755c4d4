//! ISO-TP configuration container.

use core::time::Duration;

use crate::errors::IsoTpError;
use crate::frame::{CLASSIC_FRAME_LEN, dlc_to_len};

/// Handling of CAN frames that are not (only) ISO-TP traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnsegmentedPolicy {
    /// Only ISO-TP messages are delivered.
    #[default]
    Off,
    /// Frames that cannot be read as ISO-TP are delivered as unformatted messages.
    On,
    /// Every frame is also delivered as an unformatted message, including ISO-TP segments.
    AllFrames,
}

/// Configuration for an ISO-TP stack.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct IsoTpConfig {
    /// Block size advertised in Flow Control frames (0 = unlimited).
    pub block_size: u8,
    /// Separation time advertised in Flow Control frames.
    pub st_min: Duration,
    /// Maximum number of consecutive FlowControl::Wait frames (0 = unlimited / never sent).
    pub wft_max: u8,
    /// Pad transmitted frames to full length.
    pub padding: bool,
    /// Byte used for padding.
    pub padding_value: u8,
    /// Delivery of non ISO-TP frames.
    pub unsegmented: UnsegmentedPolicy,
    /// J1939 priority for 29-bit fixed, mixed and enhanced identifiers.
    pub j1939_priority: u8,
    /// DLC code of segmented CAN FD frames (8..=15, 15 = 64 bytes).
    pub can_tx_dl: u8,
    /// Maximum application payload length, sent or received.
    ///
    /// Lengths above 4095 use the 32-bit First Frame length escape.
    pub max_payload_len: usize,
    /// Timeout for the transmission of one frame by a sender.
    pub n_as: Duration,
    /// Timeout for the transmission of one Flow Control frame by a receiver.
    pub n_ar: Duration,
    /// Timeout waiting for flow control after a First Frame or a completed block.
    pub n_bs: Duration,
    /// Delay before a throttled reception is re-evaluated.
    pub n_br: Duration,
    /// Timeout waiting for the next Consecutive Frame while receiving.
    pub n_cr: Duration,
    /// Bytes that concurrent receptions may reserve (None = unbounded).
    ///
    /// A First Frame that does not fit is answered with Wait, then Overflow.
    pub rx_buffer_limit: Option<usize>,
    /// Report pending transfers (indications) alongside completed messages.
    pub show_pending: bool,
    /// Decode unmapped 29-bit identifiers with the enhanced layout.
    pub enhanced_addressing: bool,
    /// Use CAN FD for keys without a static mapping.
    pub default_fd: bool,
    /// Use bit-rate switching for keys without a static mapping (CAN FD only).
    pub default_brs: bool,
    /// Capacity of the received-message / event queue.
    pub event_queue_capacity: usize,
}

impl Default for IsoTpConfig {
    /// Vendor defaults: no pacing, 16 waits, padding with 0x55, 64-byte CAN FD frames.
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: Duration::from_millis(0),
            wft_max: 16,
            padding: true,
            padding_value: 0x55,
            unsegmented: UnsegmentedPolicy::Off,
            j1939_priority: 6,
            can_tx_dl: 15,
            max_payload_len: 4095,
            n_as: Duration::from_millis(1000),
            n_ar: Duration::from_millis(1000),
            n_bs: Duration::from_millis(1000),
            n_br: Duration::from_millis(500),
            n_cr: Duration::from_millis(1000),
            rx_buffer_limit: None,
            show_pending: false,
            enhanced_addressing: false,
            default_fd: false,
            default_brs: false,
            event_queue_capacity: 1024,
        }
    }
}

impl IsoTpConfig {
    /// Reject out-of-range parameters.
    pub fn validate(&self) -> Result<(), IsoTpError> {
        if self.max_payload_len == 0 || u32::try_from(self.max_payload_len).is_err() {
            return Err(IsoTpError::InvalidConfig("max_payload_len"));
        }
        if !(8..=15).contains(&self.can_tx_dl) {
            return Err(IsoTpError::InvalidConfig("can_tx_dl"));
        }
        if self.j1939_priority > 7 {
            return Err(IsoTpError::InvalidConfig("j1939_priority"));
        }
        if self.st_min > Duration::from_millis(0x7F) {
            return Err(IsoTpError::InvalidConfig("st_min"));
        }
        let timeouts = [self.n_as, self.n_ar, self.n_bs, self.n_br, self.n_cr];
        if timeouts.iter().any(Duration::is_zero) {
            return Err(IsoTpError::InvalidConfig("protocol timeouts must be nonzero"));
        }
        if self.rx_buffer_limit == Some(0) {
            return Err(IsoTpError::InvalidConfig("rx_buffer_limit"));
        }
        if self.event_queue_capacity == 0 {
            return Err(IsoTpError::InvalidConfig("event_queue_capacity"));
        }
        Ok(())
    }

    /// Padding byte for transmitted frames, if padding is enabled.
    pub fn padding_byte(&self) -> Option<u8> {
        self.padding.then_some(self.padding_value)
    }

    /// Payload size of segmented frames.
    pub fn frame_len(&self, fd: bool) -> usize {
        if fd {
            dlc_to_len(self.can_tx_dl)
        } else {
            CLASSIC_FRAME_LEN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = IsoTpConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.padding_byte(), Some(0x55));
        assert_eq!(cfg.frame_len(true), 64);
        assert_eq!(cfg.frame_len(false), 8);
    }

    #[test]
    fn validate_rejects_bad_limits() {
        let cfg = IsoTpConfig {
            can_tx_dl: 7,
            ..IsoTpConfig::default()
        };
        assert_eq!(cfg.validate(), Err(IsoTpError::InvalidConfig("can_tx_dl")));

        let cfg = IsoTpConfig {
            max_payload_len: 0,
            ..IsoTpConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = IsoTpConfig {
            n_bs: Duration::ZERO,
            ..IsoTpConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = IsoTpConfig {
            j1939_priority: 8,
            ..IsoTpConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn partial_config_deserializes_with_defaults() {
        let cfg: IsoTpConfig =
            serde_json::from_str(r#"{ "block_size": 8, "padding": false }"#).unwrap();
        assert_eq!(cfg.block_size, 8);
        assert!(!cfg.padding);
        assert_eq!(cfg.wft_max, 16);
    }
}
