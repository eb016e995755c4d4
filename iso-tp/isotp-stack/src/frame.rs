//! CAN / CAN FD frame model used by the stack and its transports.

use embedded_can::{ExtendedId, Frame, Id, StandardId};

/// Payload size of a classic CAN frame.
pub const CLASSIC_FRAME_LEN: usize = 8;
/// Largest CAN FD payload.
pub const FD_FRAME_LEN: usize = 64;
/// Filler used when an unpadded CAN FD frame must be rounded up to a valid length.
pub const FD_FILLER: u8 = 0xCC;

const FD_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

const ID_11BIT: u8 = 0x01;
const ID_29BIT: u8 = 0x02;
const ID_FD: u8 = 0x04;
const ID_BRS: u8 = 0x08;
const ID_IS_PRIORITY: u8 = 0x10;
const ID_PRIORITY_MASK: u8 = 0xE0;

/// Payload length for a DLC code (CAN FD table; codes 0..=8 are the classic lengths).
pub fn dlc_to_len(dlc: u8) -> usize {
    FD_LENGTHS[usize::from(dlc & 0x0F)]
}

/// DLC code for an exact payload length, if the length is representable.
pub fn len_to_dlc(len: usize) -> Option<u8> {
    FD_LENGTHS.iter().position(|&l| l == len).map(|p| p as u8)
}

/// Smallest valid CAN FD payload length that can hold `len` bytes.
pub fn fd_padded_len(len: usize) -> usize {
    FD_LENGTHS
        .iter()
        .copied()
        .find(|&l| l >= len)
        .unwrap_or(FD_FRAME_LEN)
}

/// Raw numeric value of a CAN identifier.
pub fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => u32::from(id.as_raw()),
        Id::Extended(id) => id.as_raw(),
    }
}

/// Build an identifier from its raw value, or `None` when it does not fit the requested width.
pub fn make_id(raw: u32, extended: bool) -> Option<Id> {
    if extended {
        ExtendedId::new(raw).map(Id::Extended)
    } else {
        u16::try_from(raw)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    }
}

/// A CAN or CAN FD data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    data: [u8; FD_FRAME_LEN],
    len: u8,
    fd: bool,
    brs: bool,
    remote: bool,
}

impl CanFrame {
    /// Build a frame with explicit CAN FD flags.
    ///
    /// Classic frames carry at most 8 bytes; CAN FD frames must use a length from the FD DLC table.
    /// Bit-rate switching requires `fd`.
    pub fn with_flags(id: impl Into<Id>, data: &[u8], fd: bool, brs: bool) -> Option<Self> {
        let valid = if fd {
            len_to_dlc(data.len()).is_some()
        } else {
            data.len() <= CLASSIC_FRAME_LEN
        };
        if !valid || (brs && !fd) {
            return None;
        }
        let mut buf = [0u8; FD_FRAME_LEN];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            data: buf,
            len: data.len() as u8,
            fd,
            brs,
            remote: false,
        })
    }

    /// `true` for CAN FD frames.
    pub fn is_fd(&self) -> bool {
        self.fd
    }

    /// `true` when the data phase uses the switched bit rate.
    pub fn brs(&self) -> bool {
        self.brs
    }

    /// Raw numeric identifier.
    pub fn raw_id(&self) -> u32 {
        raw_id(self.id)
    }

    /// Identifier type of this frame (width and FD flags, no priority).
    pub fn id_type(&self) -> CanIdType {
        CanIdType {
            extended: self.is_extended(),
            fd: self.fd,
            brs: self.brs,
            priority: None,
        }
    }
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Self::with_flags(id, data, data.len() > CLASSIC_FRAME_LEN, false)
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > CLASSIC_FRAME_LEN {
            return None;
        }
        Some(Self {
            id: id.into(),
            data: [0u8; FD_FRAME_LEN],
            len: dlc as u8,
            fd: false,
            brs: false,
            remote: true,
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        usize::from(self.len)
    }

    fn data(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..usize::from(self.len)]
        }
    }
}

/// Kind of CAN identifier used by a message: width, CAN FD flags and optional J1939 priority.
///
/// The legacy API packs this into one byte; [`CanIdType::to_bits`] / [`CanIdType::from_bits`]
/// convert to and from that layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanIdType {
    /// 29-bit identifier.
    pub extended: bool,
    /// CAN FD frame format.
    pub fd: bool,
    /// Bit-rate switch (CAN FD only).
    pub brs: bool,
    /// J1939 priority (0..=7) carried in bits 26..=28 of a 29-bit identifier.
    pub priority: Option<u8>,
}

impl CanIdType {
    /// Classic 11-bit identifiers.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Classic 29-bit identifiers.
    pub fn extended() -> Self {
        Self {
            extended: true,
            ..Self::default()
        }
    }

    /// Enable CAN FD (and optionally bit-rate switching).
    pub fn with_fd(mut self, brs: bool) -> Self {
        self.fd = true;
        self.brs = brs;
        self
    }

    /// Attach a J1939 priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority & 0x07);
        self
    }

    /// Pack into the legacy id-type byte.
    pub fn to_bits(self) -> u8 {
        let mut bits = if self.extended { ID_29BIT } else { ID_11BIT };
        if self.fd {
            bits |= ID_FD;
        }
        if self.brs {
            bits |= ID_BRS;
        }
        if let Some(priority) = self.priority {
            bits |= ID_IS_PRIORITY | ((priority & 0x07) << 5);
        }
        bits
    }

    /// Unpack the legacy id-type byte.
    ///
    /// Exactly one of the 11/29-bit flags must be set; BRS requires FD and a priority requires a
    /// 29-bit identifier.
    pub fn from_bits(bits: u8) -> Option<Self> {
        let extended = match (bits & ID_11BIT != 0, bits & ID_29BIT != 0) {
            (true, false) => false,
            (false, true) => true,
            _ => return None,
        };
        let fd = bits & ID_FD != 0;
        let brs = bits & ID_BRS != 0;
        let priority = (bits & ID_IS_PRIORITY != 0).then_some((bits & ID_PRIORITY_MASK) >> 5);
        if (brs && !fd) || (priority.is_some() && !extended) {
            return None;
        }
        Some(Self {
            extended,
            fd,
            brs,
            priority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlc_tables_agree() {
        for dlc in 0..16u8 {
            assert_eq!(len_to_dlc(dlc_to_len(dlc)), Some(dlc));
        }
        assert_eq!(dlc_to_len(0x0F), 64);
        assert_eq!(len_to_dlc(13), None);
        assert_eq!(fd_padded_len(13), 16);
        assert_eq!(fd_padded_len(8), 8);
        assert_eq!(fd_padded_len(49), 64);
    }

    #[test]
    fn frame_lengths_are_checked_per_format() {
        let id = make_id(0x123, false).unwrap();
        assert!(CanFrame::with_flags(id, &[0u8; 9], false, false).is_none());
        assert!(CanFrame::with_flags(id, &[0u8; 13], true, false).is_none());
        assert!(CanFrame::with_flags(id, &[0u8; 8], false, true).is_none());
        let fd = CanFrame::new(id, &[0xAA; 12]).unwrap();
        assert!(fd.is_fd());
        assert_eq!(fd.dlc(), 12);
        assert_eq!(fd.data(), &[0xAA; 12]);
    }

    #[test]
    fn make_id_respects_width() {
        assert!(make_id(0x800, false).is_none());
        assert_eq!(raw_id(make_id(0x7FF, false).unwrap()), 0x7FF);
        assert_eq!(raw_id(make_id(0x18DA_F110, true).unwrap()), 0x18DA_F110);
        assert!(make_id(0x2000_0000, true).is_none());
    }

    #[test]
    fn id_type_bits_follow_legacy_layout() {
        assert_eq!(CanIdType::standard().to_bits(), 0x01);
        assert_eq!(CanIdType::extended().with_fd(true).to_bits(), 0x0E);
        let prio = CanIdType::extended().with_priority(6);
        assert_eq!(prio.to_bits(), 0xD2);
        assert_eq!(CanIdType::from_bits(0xD2), Some(prio));
        assert!(CanIdType::from_bits(0x03).is_none());
        assert!(CanIdType::from_bits(0x09).is_none());
        assert!(CanIdType::from_bits(0x11).is_none());
    }
}
