//! In-flight conversations, one per key.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::MessageType;
use crate::address::{ConversationKey, FrameHeader};
use crate::errors::{Confirmation, IsoTpError};
use crate::frame::CanIdType;
use crate::rx::{ReceiveState, RxPhase};
use crate::timer::Expiry;
use crate::tx::SendState;

/// Direction-specific state of a conversation.
#[derive(Debug, Clone)]
pub enum ConversationState {
    /// Outbound transfer.
    Sending(SendState),
    /// Inbound transfer.
    Receiving(ReceiveState),
}

/// One in-flight transfer.
#[derive(Debug, Clone)]
pub struct Conversation {
    /// Generation number, unique within a table.
    pub id: u64,
    /// Logical addresses of the data direction.
    pub key: ConversationKey,
    /// Direction-specific state.
    pub state: ConversationState,
    /// Header of the frames this side transmits (data frames, or Flow Control when receiving).
    pub header: FrameHeader,
    /// CAN identifier of the data frames.
    pub can_id: u32,
    /// Identifier type of the data frames.
    pub id_type: CanIdType,
    /// Message type reported with the result.
    pub message_type: MessageType,
}

impl Conversation {
    /// New conversation; the table assigns `id`.
    pub fn new(
        key: ConversationKey,
        state: ConversationState,
        header: FrameHeader,
        can_id: u32,
        id_type: CanIdType,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: 0,
            key,
            state,
            header,
            can_id,
            id_type,
            message_type,
        }
    }

    /// `true` for inbound transfers.
    pub fn is_receiving(&self) -> bool {
        matches!(self.state, ConversationState::Receiving(_))
    }
}

/// Conversation key to in-flight state.
#[derive(Debug, Default)]
pub struct ConversationTable {
    conversations: HashMap<ConversationKey, Conversation>,
    next_id: u64,
}

impl ConversationTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a conversation for `key`, built by `init`.
    ///
    /// Fails with [`IsoTpError::AlreadyInProgress`] while a conversation with the same key is open.
    pub fn get_or_create(
        &mut self,
        key: ConversationKey,
        init: impl FnOnce() -> Conversation,
    ) -> Result<&mut Conversation, IsoTpError> {
        match self.conversations.entry(key) {
            Entry::Occupied(_) => Err(IsoTpError::AlreadyInProgress(key)),
            Entry::Vacant(slot) => {
                self.next_id += 1;
                let mut conversation = init();
                conversation.id = self.next_id;
                Ok(slot.insert(conversation))
            }
        }
    }

    /// Open conversation for `key`.
    pub fn find_active(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.conversations.get(key)
    }

    /// Open conversation for `key`, mutably.
    pub fn find_active_mut(&mut self, key: &ConversationKey) -> Option<&mut Conversation> {
        self.conversations.get_mut(key)
    }

    /// Close the conversation of `key`.
    pub fn remove(&mut self, key: &ConversationKey) -> Option<Conversation> {
        self.conversations.remove(key)
    }

    /// Remove the conversations whose protocol timer expired, paired with their failure result.
    ///
    /// Scheduling timers (N_Cs, N_Br) are skipped.
    pub fn sweep(&mut self, expired: &[Expiry]) -> Vec<(Conversation, Confirmation)> {
        expired
            .iter()
            .filter_map(|expiry| {
                let result = expiry.kind.confirmation()?;
                self.conversations
                    .remove(&expiry.key)
                    .map(|conversation| (conversation, result))
            })
            .collect()
    }

    /// Bytes reserved by receptions that are not throttled.
    pub fn reserved_rx_bytes(&self) -> usize {
        self.conversations
            .values()
            .filter_map(|c| match &c.state {
                ConversationState::Receiving(state) if state.phase() != RxPhase::Throttled => {
                    Some(state.expected_len())
                }
                _ => None,
            })
            .sum()
    }

    /// Remove every conversation.
    pub fn clear(&mut self) -> Vec<Conversation> {
        self.conversations.drain().map(|(_, c)| c).collect()
    }

    /// Number of open conversations.
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// `true` when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}
