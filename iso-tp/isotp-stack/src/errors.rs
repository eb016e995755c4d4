//! Transport-layer error types.
//!
//! Two families are kept apart:
//! - [`Confirmation`] is the ISO 15765-2 result of one conversation (a send or a reception). It is
//!   reported asynchronously, against the conversation that produced it.
//! - [`IsoTpError`] is a local failure reported synchronously to the caller of an operation.

use thiserror::Error;

use crate::address::ConversationKey;
use crate::async_io::TransportError;
use crate::pdu::PduError;

/// Timeout category identifiers (ISO-TP naming).
///
/// - `N_As` / `N_Ar` bound the transmission of one CAN frame by the sender / receiver.
/// - `N_Bs` bounds the wait for a Flow Control frame on the sender side.
/// - `N_Br` is the receiver-side delay before the next Flow Control frame (used to re-check a
///   throttled reception).
/// - `N_Cs` is the sender-side pacing delay between Consecutive Frames (STmin).
/// - `N_Cr` bounds the wait for the next Consecutive Frame on the receiver side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Timeout while sending a frame.
    NAs,
    /// Timeout while the receiver sends a frame (Flow Control).
    NAr,
    /// Timeout waiting for flow control.
    NBs,
    /// Delay before the receiver re-evaluates a throttled reception.
    NBr,
    /// Separation time between consecutive frame sends.
    NCs,
    /// Timeout waiting for consecutive frame.
    NCr,
}

impl TimeoutKind {
    /// Result reported when a timer of this kind expires, or `None` for scheduling timers.
    pub fn confirmation(self) -> Option<Confirmation> {
        match self {
            TimeoutKind::NAs | TimeoutKind::NAr => Some(Confirmation::TimeoutA),
            TimeoutKind::NBs => Some(Confirmation::TimeoutBs),
            TimeoutKind::NCr => Some(Confirmation::TimeoutCr),
            TimeoutKind::NBr | TimeoutKind::NCs => None,
        }
    }
}

/// ISO 15765-2 network-layer result codes (`N_Result`), with the legacy numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Confirmation {
    /// Transfer completed.
    #[error("ok")]
    Ok = 0x00,
    /// N_Ar/N_As expired: a frame could not be transmitted in time.
    #[error("timeout transmitting a frame (N_As/N_Ar)")]
    TimeoutA = 0x01,
    /// N_Bs expired: no Flow Control arrived in time.
    #[error("timeout waiting for flow control (N_Bs)")]
    TimeoutBs = 0x02,
    /// N_Cr expired: no Consecutive Frame arrived in time.
    #[error("timeout waiting for consecutive frame (N_Cr)")]
    TimeoutCr = 0x03,
    /// Consecutive Frame carried an unexpected sequence number.
    #[error("wrong sequence number")]
    WrongSequenceNumber = 0x04,
    /// Flow Control carried a reserved flow status.
    #[error("invalid flow status")]
    InvalidFlowStatus = 0x05,
    /// Protocol data unit not expected in the current state.
    #[error("unexpected protocol data unit")]
    UnexpectedPdu = 0x06,
    /// More Wait frames than `wft_max`.
    #[error("wait frame overrun")]
    WaitFrameOverrun = 0x07,
    /// Receiver reported (or ran into) a buffer overflow.
    #[error("buffer overflow")]
    BufferOverflow = 0x08,
    /// Conversation aborted for a local reason (reset, encoding failure).
    #[error("general error")]
    GeneralError = 0x09,
    /// Frame ignored: no matching conversation.
    #[error("frame ignored")]
    Ignored = 0x0A,
}

impl Confirmation {
    /// Numeric result code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a numeric result code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Confirmation::Ok,
            0x01 => Confirmation::TimeoutA,
            0x02 => Confirmation::TimeoutBs,
            0x03 => Confirmation::TimeoutCr,
            0x04 => Confirmation::WrongSequenceNumber,
            0x05 => Confirmation::InvalidFlowStatus,
            0x06 => Confirmation::UnexpectedPdu,
            0x07 => Confirmation::WaitFrameOverrun,
            0x08 => Confirmation::BufferOverflow,
            0x09 => Confirmation::GeneralError,
            0x0A => Confirmation::Ignored,
            _ => return None,
        })
    }

    /// `true` for [`Confirmation::Ok`].
    pub fn is_ok(self) -> bool {
        self == Confirmation::Ok
    }

    /// `Ok(())` for a successful transfer, the confirmation itself otherwise.
    pub fn into_result(self) -> Result<(), Confirmation> {
        if self.is_ok() { Ok(()) } else { Err(self) }
    }
}

/// Local errors surfaced synchronously by the ISO-TP implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IsoTpError {
    /// The stack is not running (never started, or shut down).
    #[error("stack not initialized")]
    NotInitialized,
    /// The stack was already started.
    #[error("stack already initialized")]
    AlreadyInitialized,
    /// A reassembly buffer could not be allocated.
    #[error("out of memory")]
    NoMemory,
    /// An internal queue is full.
    #[error("internal queue overflow")]
    Overflow,
    /// Nothing to read.
    #[error("no message available")]
    NoMessage,
    /// An argument was rejected.
    #[error("wrong parameter: {0}")]
    WrongParameter(&'static str),
    /// A conversation with the same key is still open.
    #[error("conversation {0:?} already in progress")]
    AlreadyInProgress(ConversationKey),
    /// A CAN identifier matched no mapping and no fixed addressing layout.
    #[error("no addressing format matches CAN id {0:#x}")]
    UnknownFormat(u32),
    /// A frame could not be encoded or decoded.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] PduError),
    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Wrapper around transport errors.
    #[error("link error: {0}")]
    Link(#[from] TransportError),
    /// A request could not be delivered to its peer.
    #[error("request transfer failed: {0}")]
    Transfer(Confirmation),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_codes_match_legacy_values() {
        for code in 0x00..=0x0A {
            let confirmation = Confirmation::from_code(code).unwrap();
            assert_eq!(confirmation.code(), code);
        }
        assert_eq!(Confirmation::WaitFrameOverrun.code(), 0x07);
        assert!(Confirmation::from_code(0x0B).is_none());
    }

    #[test]
    fn scheduling_timers_are_not_failures() {
        assert_eq!(TimeoutKind::NBs.confirmation(), Some(Confirmation::TimeoutBs));
        assert_eq!(TimeoutKind::NCr.confirmation(), Some(Confirmation::TimeoutCr));
        assert_eq!(TimeoutKind::NAr.confirmation(), Some(Confirmation::TimeoutA));
        assert!(TimeoutKind::NCs.confirmation().is_none());
        assert!(TimeoutKind::NBr.confirmation().is_none());
    }

    #[test]
    fn into_result_splits_success() {
        assert_eq!(Confirmation::Ok.into_result(), Ok(()));
        assert_eq!(
            Confirmation::TimeoutBs.into_result(),
            Err(Confirmation::TimeoutBs)
        );
    }
}
