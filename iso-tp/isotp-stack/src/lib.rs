//! `isotp-stack`: an ISO-TP (ISO 15765-2) engine for CAN and CAN FD.
//!
//! ISO-TP (“ISO Transport Protocol”) carries payloads larger than one CAN frame by segmenting
//! messages into:
//! - a **Single Frame** (small payloads),
//! - a **First Frame** + multiple **Consecutive Frames** (larger payloads), and
//! - **Flow Control** frames through which the receiver paces the sender.
//!
//! This crate provides:
//! - A sans-IO engine ([`IsoTpStack`]) that handles many concurrent conversations on one CAN
//!   channel, driven entirely by the caller (frames in, frames out, time in).
//! - A tokio front-end ([`IsoTpAsyncStack`]) that runs the engine on a background task over any
//!   [`CanTransport`], plus an in-memory [`VirtualBus`] for tests and simulations.
//! - The building blocks: addressing ([`address`]), PCI encoding ([`pdu`]), segmentation ([`tx`]),
//!   reassembly ([`rx`]), flow control ([`flow`]) and timers ([`timer`]).
//!
//! # Feature flags
//! - `serde`: `Serialize`/`Deserialize` for the configuration, addressing types and messages.
//!
//! # Concepts
//! - **Conversation key**: one direction of traffic between two logical addresses
//!   ([`ConversationKey`]). At most one transfer per key is in flight; Flow Control frames travel
//!   on the reversed key.
//! - **Addressing**: normal, extended and 11-bit mixed addressing rely on static [`Mapping`]s;
//!   normal-fixed, 29-bit mixed and enhanced addressing derive the CAN identifier from the
//!   addresses.
//! - **Results**: every finished transfer reports a [`Confirmation`] (`N_Result`). Local API
//!   misuse fails synchronously with an [`IsoTpError`].
//!
//! # Quick start
//! ```rust,no_run
//! use isotp_stack::{AddressingFormat, ConversationKey, IsoTpAsyncStack, IsoTpConfig, VirtualBus};
//!
//! # async fn example() -> Result<(), isotp_stack::IsoTpError> {
//! let bus = VirtualBus::new(64);
//! let mut stack = IsoTpAsyncStack::new(IsoTpConfig::default())?;
//! stack.start(bus.endpoint())?;
//!
//! let tester = ConversationKey::physical(AddressingFormat::FixedNormal, 0xF1, 0x10);
//! let result = stack.handle()?.send(tester, vec![0x22, 0xF1, 0x90]).await?;
//! assert!(result.is_ok());
//!
//! let message = stack.recv().await?;
//! println!("{:02x?} from {:?}", message.data, message.key);
//! stack.shutdown().await?;
//! # Ok(()) }
//! ```

pub mod address;
pub mod async_io;
pub mod async_stack;
pub mod config;
pub mod conversation;
pub mod errors;
pub mod flow;
pub mod frame;
pub mod pdu;
pub mod rx;
pub mod stack;
pub mod timer;
pub mod tx;

pub use address::{AddressingFormat, ConversationKey, Mapping, TargetAddressType};
pub use async_io::{CanTransport, TransportError, VirtualBus, VirtualEndpoint, VirtualTap};
pub use async_stack::{IsoTpAsyncStack, IsoTpHandle};
pub use config::{IsoTpConfig, UnsegmentedPolicy};
pub use errors::{Confirmation, IsoTpError, TimeoutKind};
pub use flow::RxFlowControl;
pub use frame::{CanFrame, CanIdType};
pub use stack::{IsoTpStack, OutgoingFrame, SendOptions, StackEvent, TransmitStatus, TxReceipt};
pub use timer::{Clock, StdClock, TokioClock};

/// Kind of traffic a [`Message`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageType {
    /// Not classified.
    Unknown,
    /// Diagnostic traffic (every format except mixed).
    Diagnostic,
    /// Remote diagnostic traffic (mixed addressing).
    RemoteDiagnostic,
    /// Confirmation of a local send.
    RequestConfirmation,
    /// A reception started.
    Indication,
    /// A segmented send started.
    IndicationTx,
}

impl MessageType {
    /// Numeric code.
    pub fn code(self) -> u8 {
        match self {
            MessageType::Unknown => 0,
            MessageType::Diagnostic => 1,
            MessageType::RemoteDiagnostic => 2,
            MessageType::RequestConfirmation => 3,
            MessageType::Indication => 4,
            MessageType::IndicationTx => 5,
        }
    }

    /// Parse a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => MessageType::Unknown,
            1 => MessageType::Diagnostic,
            2 => MessageType::RemoteDiagnostic,
            3 => MessageType::RequestConfirmation,
            4 => MessageType::Indication,
            5 => MessageType::IndicationTx,
            _ => return None,
        })
    }

    /// Message type implied by an addressing format.
    pub fn for_format(format: AddressingFormat) -> Self {
        match format {
            AddressingFormat::Mixed => MessageType::RemoteDiagnostic,
            _ => MessageType::Diagnostic,
        }
    }
}

/// A message (or unformatted frame) delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    /// CAN identifier the data arrived on.
    pub can_id: u32,
    /// Logical addresses of the sender (`source`) and receiver (`target`).
    pub key: ConversationKey,
    /// Identifier type of the data frames.
    pub id_type: CanIdType,
    /// Kind of traffic.
    pub message_type: MessageType,
    /// Payload; partial when `result` is not [`Confirmation::Ok`].
    pub data: Vec<u8>,
    /// Network-layer result.
    pub result: Confirmation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_codes() {
        for code in 0..=5 {
            assert_eq!(MessageType::from_code(code).unwrap().code(), code);
        }
        assert_eq!(MessageType::from_code(6), None);
        assert_eq!(
            MessageType::for_format(AddressingFormat::Mixed),
            MessageType::RemoteDiagnostic
        );
        assert_eq!(
            MessageType::for_format(AddressingFormat::Enhanced),
            MessageType::Diagnostic
        );
    }
}
