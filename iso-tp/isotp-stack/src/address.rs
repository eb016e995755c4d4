//! Address resolution: CAN identifiers and addressing bytes to logical ISO-TP addresses.
//!
//! A [`ConversationKey`] names one direction of traffic (source address, target address, format,
//! target type and, for mixed addressing, the remote address / address extension). The
//! [`AddressResolver`] turns a key into a [`FrameHeader`] for transmission and a received frame
//! back into a key.
//!
//! | format | identifier | first data byte |
//! |---|---|---|
//! | `None` | static mapping | none (raw CAN payload) |
//! | `Normal` | static mapping | none |
//! | `FixedNormal` | `prio<<26 \| 0xDA<<16 \| TA<<8 \| SA` (functional: `0xDB`) | none |
//! | `Extended` | static mapping | TA |
//! | `Mixed` (11-bit) | static mapping | AE |
//! | `Mixed` (29-bit) | `prio<<26 \| 0xCE<<16 \| TA<<8 \| SA` (functional: `0xCD`) | AE |
//! | `Enhanced` | `prio<<26 \| TA<<11 \| SA` | none |

use embedded_can::{Frame, Id};

use crate::MessageType;
use crate::errors::IsoTpError;
use crate::frame::{CanFrame, CanIdType, make_id};

/// J1939 priority used when nothing else is configured.
pub const DEFAULT_PRIORITY: u8 = 6;
/// PDU format byte of physically addressed normal-fixed frames.
pub const PF_FIXED_PHYSICAL: u8 = 0xDA;
/// PDU format byte of functionally addressed normal-fixed frames.
pub const PF_FIXED_FUNCTIONAL: u8 = 0xDB;
/// PDU format byte of physically addressed 29-bit mixed frames.
pub const PF_MIXED_PHYSICAL: u8 = 0xCE;
/// PDU format byte of functionally addressed 29-bit mixed frames.
pub const PF_MIXED_FUNCTIONAL: u8 = 0xCD;

const PRIORITY_SHIFT: u32 = 26;
const PRIORITY_MASK: u32 = 0x7 << PRIORITY_SHIFT;

/// J1939 priority carried by a 29-bit identifier.
pub fn priority_of(raw_id: u32) -> u8 {
    ((raw_id & PRIORITY_MASK) >> PRIORITY_SHIFT) as u8
}

/// Replace the J1939 priority of a 29-bit identifier.
pub fn with_priority(raw_id: u32, priority: u8) -> u32 {
    (raw_id & !PRIORITY_MASK) | (u32::from(priority & 0x07) << PRIORITY_SHIFT)
}

/// ISO-TP addressing format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressingFormat {
    /// Unformatted CAN frames (no protocol control information).
    None,
    /// Normal addressing: the identifier alone names the addresses.
    Normal,
    /// Normal fixed addressing (29-bit, addresses inside the identifier).
    FixedNormal,
    /// Extended addressing: the target address is the first data byte.
    Extended,
    /// Mixed addressing: the address extension is the first data byte.
    Mixed,
    /// Enhanced addressing (ISO 15765-3 style 29-bit identifiers).
    Enhanced,
}

impl AddressingFormat {
    /// Legacy numeric code.
    pub fn code(self) -> u8 {
        match self {
            AddressingFormat::None => 0x00,
            AddressingFormat::Normal => 0x01,
            AddressingFormat::FixedNormal => 0x02,
            AddressingFormat::Extended => 0x03,
            AddressingFormat::Mixed => 0x04,
            AddressingFormat::Enhanced => 0x05,
        }
    }

    /// Parse a legacy numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => AddressingFormat::None,
            0x01 => AddressingFormat::Normal,
            0x02 => AddressingFormat::FixedNormal,
            0x03 => AddressingFormat::Extended,
            0x04 => AddressingFormat::Mixed,
            0x05 => AddressingFormat::Enhanced,
            _ => return None,
        })
    }

    /// `true` when frames of this format carry an addressing byte before the PCI.
    pub fn has_address_byte(self) -> bool {
        matches!(self, AddressingFormat::Extended | AddressingFormat::Mixed)
    }
}

/// Address type used in 29-bit fixed/mixed addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TargetAddressType {
    /// 1-to-1 communication (physical addressing).
    Physical,
    /// 1-to-n communication (functional addressing).
    Functional,
}

/// Logical address of one direction of ISO-TP traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConversationKey {
    /// Source address (SA).
    pub source: u8,
    /// Target address (TA).
    pub target: u8,
    /// Addressing format.
    pub format: AddressingFormat,
    /// Physical or functional target.
    pub target_type: TargetAddressType,
    /// Remote address / address extension (mixed addressing only).
    pub remote: Option<u8>,
}

impl ConversationKey {
    /// Physically addressed key without a remote address.
    pub fn physical(format: AddressingFormat, source: u8, target: u8) -> Self {
        Self {
            source,
            target,
            format,
            target_type: TargetAddressType::Physical,
            remote: None,
        }
    }

    /// Functionally addressed key without a remote address.
    pub fn functional(format: AddressingFormat, source: u8, target: u8) -> Self {
        Self {
            target_type: TargetAddressType::Functional,
            ..Self::physical(format, source, target)
        }
    }

    /// Mixed-addressing key with an address extension.
    pub fn mixed(source: u8, target: u8, remote: u8, target_type: TargetAddressType) -> Self {
        Self {
            source,
            target,
            format: AddressingFormat::Mixed,
            target_type,
            remote: Some(remote),
        }
    }

    /// Key for unformatted frames that match no addressing.
    pub fn unformatted() -> Self {
        Self::physical(AddressingFormat::None, 0, 0)
    }

    /// Key of the opposite direction. Replies are always physically addressed.
    pub fn reversed(&self) -> Self {
        Self {
            source: self.target,
            target: self.source,
            target_type: TargetAddressType::Physical,
            ..*self
        }
    }

    fn address_byte(&self) -> Option<u8> {
        match self.format {
            AddressingFormat::Extended => Some(self.target),
            AddressingFormat::Mixed => self.remote,
            _ => None,
        }
    }
}

/// Static binding of a CAN identifier pair to a conversation key.
///
/// Frames for `key` are sent on `can_id`; frames of the reverse direction (`key.reversed()`) use
/// `can_id_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mapping {
    /// Identifier carrying traffic for `key`.
    pub can_id: u32,
    /// Identifier carrying traffic for `key.reversed()`.
    pub can_id_response: u32,
    /// Identifier width and CAN FD flags.
    pub id_type: CanIdType,
    /// Message type reported for traffic on this mapping.
    pub message_type: MessageType,
    /// Logical addresses bound to `can_id`.
    pub key: ConversationKey,
}

/// Options applied when a key is resolved without a static mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderOptions {
    /// Send as CAN FD.
    pub fd: bool,
    /// Bit-rate switch (CAN FD only).
    pub brs: bool,
    /// J1939 priority for 29-bit fixed layouts.
    pub priority: u8,
}

impl Default for HeaderOptions {
    fn default() -> Self {
        Self {
            fd: false,
            brs: false,
            priority: DEFAULT_PRIORITY,
        }
    }
}

/// Everything needed to put one frame of a conversation on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// CAN identifier.
    pub id: Id,
    /// Addressing byte placed before the PCI (extended/mixed addressing).
    pub prefix: Option<u8>,
    /// Identifier type.
    pub id_type: CanIdType,
}

impl FrameHeader {
    /// Index within the CAN payload where the PCI starts.
    pub fn pci_offset(&self) -> usize {
        usize::from(self.prefix.is_some())
    }
}

/// Result of resolving a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedHeader {
    /// Logical addresses of the frame.
    pub key: ConversationKey,
    /// Identifier type, with the priority for fixed 29-bit layouts.
    pub id_type: CanIdType,
    /// Message type of the traffic.
    pub message_type: MessageType,
    /// Index within the CAN payload where the PCI starts.
    pub pci_offset: usize,
}

/// Bidirectional translation between CAN identifiers and conversation keys.
#[derive(Debug, Clone, Default)]
pub struct AddressResolver {
    mappings: Vec<Mapping>,
    enhanced: bool,
}

impl AddressResolver {
    /// Resolver with no mappings. `enhanced` enables decoding of unmapped enhanced identifiers.
    pub fn new(enhanced: bool) -> Self {
        Self {
            mappings: Vec::new(),
            enhanced,
        }
    }

    /// Registered mappings.
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Register a static mapping.
    pub fn add_mapping(&mut self, mapping: Mapping) -> Result<(), IsoTpError> {
        let extended = mapping.id_type.extended;
        for raw in [mapping.can_id, mapping.can_id_response] {
            if make_id(raw, extended).is_none() {
                return Err(IsoTpError::WrongParameter("CAN id does not fit the id type"));
            }
        }
        match mapping.key.format {
            AddressingFormat::FixedNormal | AddressingFormat::Enhanced => {
                return Err(IsoTpError::WrongParameter(
                    "format derives its CAN id from the addresses",
                ));
            }
            AddressingFormat::Mixed if mapping.key.remote.is_none() => {
                return Err(IsoTpError::WrongParameter(
                    "mixed addressing requires a remote address",
                ));
            }
            _ => {}
        }
        let duplicate = self.mappings.iter().any(|m| {
            m.can_id == mapping.can_id
                && m.id_type.extended == extended
                && m.key.address_byte() == mapping.key.address_byte()
        });
        if duplicate {
            return Err(IsoTpError::WrongParameter("CAN id already mapped"));
        }
        tracing::debug!(can_id = mapping.can_id, key = ?mapping.key, "mapping added");
        self.mappings.push(mapping);
        Ok(())
    }

    /// Remove every mapping registered on `can_id`.
    pub fn remove_mapping(&mut self, can_id: u32) -> Result<(), IsoTpError> {
        let before = self.mappings.len();
        self.mappings.retain(|m| m.can_id != can_id);
        if self.mappings.len() == before {
            return Err(IsoTpError::WrongParameter("no mapping for CAN id"));
        }
        tracing::debug!(can_id, "mapping removed");
        Ok(())
    }

    /// Message type reported for traffic of `key`.
    pub fn message_type(&self, key: &ConversationKey) -> MessageType {
        self.mappings
            .iter()
            .find(|m| m.key == *key || m.key.reversed() == *key)
            .map(|m| m.message_type)
            .unwrap_or_else(|| MessageType::for_format(key.format))
    }

    /// Resolve the header used to transmit frames for `key`.
    pub fn encode_header(
        &self,
        key: &ConversationKey,
        options: &HeaderOptions,
    ) -> Result<FrameHeader, IsoTpError> {
        if key.format == AddressingFormat::Mixed && key.remote.is_none() {
            return Err(IsoTpError::WrongParameter(
                "mixed addressing requires a remote address",
            ));
        }
        let prefix = key.address_byte();

        let mapped = self.mappings.iter().find_map(|m| {
            if m.key == *key {
                Some((m.can_id, m.id_type))
            } else if m.key.reversed() == *key {
                Some((m.can_id_response, m.id_type))
            } else {
                None
            }
        });
        if let Some((raw, id_type)) = mapped {
            let id = make_id(raw, id_type.extended)
                .ok_or(IsoTpError::WrongParameter("CAN id does not fit the id type"))?;
            return Ok(FrameHeader { id, prefix, id_type });
        }

        let (target, source) = (u32::from(key.target), u32::from(key.source));
        let functional = key.target_type == TargetAddressType::Functional;
        let raw = match key.format {
            AddressingFormat::FixedNormal => {
                let pf = if functional { PF_FIXED_FUNCTIONAL } else { PF_FIXED_PHYSICAL };
                (u32::from(pf) << 16) | (target << 8) | source
            }
            AddressingFormat::Mixed => {
                let pf = if functional { PF_MIXED_FUNCTIONAL } else { PF_MIXED_PHYSICAL };
                (u32::from(pf) << 16) | (target << 8) | source
            }
            AddressingFormat::Enhanced => (target << 11) | source,
            _ => return Err(IsoTpError::WrongParameter("no mapping for conversation key")),
        };
        let raw = with_priority(raw, options.priority);
        let id = make_id(raw, true).ok_or(IsoTpError::UnknownFormat(raw))?;
        Ok(FrameHeader {
            id,
            prefix,
            id_type: CanIdType {
                extended: true,
                fd: options.fd,
                brs: options.fd && options.brs,
                priority: Some(options.priority & 0x07),
            },
        })
    }

    /// Resolve a received frame to its logical addresses.
    pub fn decode_header(&self, frame: &CanFrame) -> Result<DecodedHeader, IsoTpError> {
        let raw = frame.raw_id();
        let extended = frame.is_extended();
        let first = frame.data().first().copied();
        let frame_type = frame.id_type();

        for m in self.mappings.iter().filter(|m| m.id_type.extended == extended) {
            let key = if raw == m.can_id {
                m.key
            } else if raw == m.can_id_response {
                m.key.reversed()
            } else {
                continue;
            };
            if let Some(expected) = key.address_byte()
                && first != Some(expected)
            {
                continue;
            }
            return Ok(DecodedHeader {
                key,
                id_type: frame_type,
                message_type: m.message_type,
                pci_offset: usize::from(key.format.has_address_byte()),
            });
        }

        if !extended {
            return Err(IsoTpError::UnknownFormat(raw));
        }

        let pf = ((raw >> 16) & 0xFF) as u8;
        let reserved = (raw >> 24) & 0x3;
        let source = (raw & 0xFF) as u8;
        let target = ((raw >> 8) & 0xFF) as u8;
        let id_type = CanIdType {
            priority: Some(priority_of(raw)),
            ..frame_type
        };
        let fixed = |format, target_type, remote| ConversationKey {
            source,
            target,
            format,
            target_type,
            remote,
        };

        let decoded = match (reserved, pf) {
            (0, PF_FIXED_PHYSICAL) => Some((
                fixed(AddressingFormat::FixedNormal, TargetAddressType::Physical, None),
                0,
            )),
            (0, PF_FIXED_FUNCTIONAL) => Some((
                fixed(AddressingFormat::FixedNormal, TargetAddressType::Functional, None),
                0,
            )),
            (0, PF_MIXED_PHYSICAL) if first.is_some() => Some((
                fixed(AddressingFormat::Mixed, TargetAddressType::Physical, first),
                1,
            )),
            (0, PF_MIXED_FUNCTIONAL) if first.is_some() => Some((
                fixed(AddressingFormat::Mixed, TargetAddressType::Functional, first),
                1,
            )),
            _ => None,
        };
        if let Some((key, pci_offset)) = decoded {
            return Ok(DecodedHeader {
                key,
                id_type,
                message_type: MessageType::for_format(key.format),
                pci_offset,
            });
        }

        if self.enhanced && (raw >> 19) & 0x7F == 0 && (raw >> 8) & 0x07 == 0 {
            let key = ConversationKey::physical(
                AddressingFormat::Enhanced,
                source,
                ((raw >> 11) & 0xFF) as u8,
            );
            return Ok(DecodedHeader {
                key,
                id_type,
                message_type: MessageType::Diagnostic,
                pci_offset: 0,
            });
        }

        Err(IsoTpError::UnknownFormat(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bits_roundtrip() {
        let raw = 0x18DA_F110;
        assert_eq!(priority_of(raw), 6);
        let raised = with_priority(raw, 3);
        assert_eq!(raised, 0x0CDA_F110);
        assert_eq!(priority_of(raised), 3);
        assert_eq!(with_priority(raised, 6), raw);
    }

    #[test]
    fn reversed_key_swaps_addresses_and_is_physical() {
        let key = ConversationKey::functional(AddressingFormat::FixedNormal, 0xF1, 0x33);
        let back = key.reversed();
        assert_eq!((back.source, back.target), (0x33, 0xF1));
        assert_eq!(back.target_type, TargetAddressType::Physical);
    }

    #[test]
    fn format_codes_roundtrip() {
        for code in 0..=5 {
            assert_eq!(AddressingFormat::from_code(code).unwrap().code(), code);
        }
        assert!(AddressingFormat::from_code(0xFF).is_none());
    }
}
