//! Encode and decode ISO-TP protocol control information.

use core::time::Duration;

use thiserror::Error;

use crate::address::FrameHeader;
use crate::frame::{CLASSIC_FRAME_LEN, CanFrame, FD_FILLER, FD_FRAME_LEN, fd_padded_len};

/// Largest length expressible in the 12-bit First Frame length field.
pub const FF_DL_12BIT_MAX: u32 = 0xFFF;

/// Flow control status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Clear to send more consecutive frames.
    ClearToSend,
    /// Wait before resuming.
    Wait,
    /// Abort due to overflow.
    Overflow,
}

impl FlowStatus {
    /// Low nibble of the Flow Control PCI byte.
    pub fn code(self) -> u8 {
        match self {
            FlowStatus::ClearToSend => 0x0,
            FlowStatus::Wait => 0x1,
            FlowStatus::Overflow => 0x2,
        }
    }

    /// Parse the low nibble of the Flow Control PCI byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0 => Some(FlowStatus::ClearToSend),
            0x1 => Some(FlowStatus::Wait),
            0x2 => Some(FlowStatus::Overflow),
            _ => None,
        }
    }
}

/// Flow Control parameters as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    /// Flow status from receiver to sender.
    pub status: FlowStatus,
    /// Block size requested by receiver (0 = unlimited).
    pub block_size: u8,
    /// STmin (encoded byte form, not a `Duration`).
    pub st_min: u8,
}

/// Parsed ISO-TP Protocol Data Unit (PDU).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu<'a> {
    /// Single Frame payload.
    SingleFrame { data: &'a [u8] },
    /// First Frame with total length and first bytes.
    FirstFrame { len: u32, data: &'a [u8] },
    /// Consecutive Frame carrying sequence and bytes.
    ConsecutiveFrame { sn: u8, data: &'a [u8] },
    /// Flow Control feedback.
    FlowControl(FlowControl),
}

/// Codec failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PduError {
    /// Frame shorter than its protocol control information requires.
    #[error("frame truncated")]
    Truncated,
    /// Field values inconsistent with the frame.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    /// Flow Control with a reserved flow status.
    #[error("invalid flow status {0:#x}")]
    InvalidFlowStatus(u8),
    /// PCI type nibble outside 0..=3.
    #[error("unknown PCI type {0:#x}")]
    UnknownPci(u8),
}

/// Payload geometry of the frames of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// CAN payload size used for segmented frames.
    pub frame_len: usize,
    /// Index where the PCI starts (1 with an addressing byte).
    pub pci_offset: usize,
}

impl FrameLayout {
    /// Build a layout.
    pub fn new(frame_len: usize, pci_offset: usize) -> Self {
        Self {
            frame_len,
            pci_offset,
        }
    }

    /// Max application bytes in a Single Frame.
    pub fn max_single_frame(&self) -> usize {
        single_frame_capacity(self.frame_len, self.pci_offset)
    }

    /// Application bytes carried by the First Frame of a `total`-byte message.
    pub fn first_frame_capacity(&self, total: usize) -> usize {
        let header = if total > FF_DL_12BIT_MAX as usize { 6 } else { 2 };
        self.frame_len.saturating_sub(self.pci_offset + header)
    }

    /// Max application bytes carried by a Consecutive Frame.
    pub fn consecutive_capacity(&self) -> usize {
        self.frame_len.saturating_sub(self.pci_offset + 1)
    }
}

fn single_frame_capacity(frame_len: usize, pci_offset: usize) -> usize {
    if frame_len > CLASSIC_FRAME_LEN {
        frame_len.saturating_sub(2 + pci_offset)
    } else {
        (CLASSIC_FRAME_LEN - 1).saturating_sub(pci_offset)
    }
}

/// Build a CAN frame representing the given PDU.
///
/// `frame_len` is the payload size of full segmented frames (8 for classic CAN, up to 64 for
/// CAN FD; ignored for classic headers). With `padding = Some(byte)` frames are padded to 8
/// bytes, or to the next valid CAN FD length when longer. Without padding, CAN FD frames longer
/// than 8 bytes are still rounded up to a valid length with [`FD_FILLER`].
pub fn encode(
    header: &FrameHeader,
    pdu: &Pdu<'_>,
    padding: Option<u8>,
    frame_len: usize,
) -> Result<CanFrame, PduError> {
    let frame_len = if header.id_type.fd {
        frame_len
    } else {
        CLASSIC_FRAME_LEN
    };
    if !(CLASSIC_FRAME_LEN..=FD_FRAME_LEN).contains(&frame_len) {
        return Err(PduError::Malformed("frame length"));
    }
    let mut buf = [0u8; FD_FRAME_LEN];
    let offset = header.pci_offset();
    if let Some(prefix) = header.prefix {
        buf[0] = prefix;
    }

    let used = match pdu {
        Pdu::SingleFrame { data } => {
            let len = data.len();
            if len == 0 {
                return Err(PduError::Malformed("empty single frame"));
            }
            if len <= single_frame_capacity(CLASSIC_FRAME_LEN, offset) {
                buf[offset] = len as u8;
                buf[offset + 1..offset + 1 + len].copy_from_slice(data);
                offset + 1 + len
            } else {
                // CAN FD escape: SF_DL nibble = 0, length in the next byte.
                if frame_len <= CLASSIC_FRAME_LEN || len > single_frame_capacity(frame_len, offset)
                {
                    return Err(PduError::Malformed("single frame exceeds frame capacity"));
                }
                buf[offset] = 0x00;
                buf[offset + 1] = len as u8;
                buf[offset + 2..offset + 2 + len].copy_from_slice(data);
                offset + 2 + len
            }
        }
        Pdu::FirstFrame { len, data } => {
            if (*len as usize) <= single_frame_capacity(frame_len, offset) {
                return Err(PduError::Malformed("first frame length fits a single frame"));
            }
            let start = if *len > FF_DL_12BIT_MAX {
                // ISO 15765-2:2016 escape: FF_DL = 0, 32-bit length follows.
                buf[offset] = 0x10;
                buf[offset + 1] = 0x00;
                buf[offset + 2..offset + 6].copy_from_slice(&len.to_be_bytes());
                offset + 6
            } else {
                buf[offset] = 0x10 | ((*len >> 8) as u8 & 0x0F);
                buf[offset + 1] = (*len & 0xFF) as u8;
                offset + 2
            };
            let chunk = data.len().min(frame_len - start);
            if chunk == 0 {
                return Err(PduError::Malformed("first frame without data"));
            }
            buf[start..start + chunk].copy_from_slice(&data[..chunk]);
            start + chunk
        }
        Pdu::ConsecutiveFrame { sn, data } => {
            if data.len() > frame_len.saturating_sub(1 + offset) {
                return Err(PduError::Malformed("consecutive frame exceeds frame capacity"));
            }
            buf[offset] = 0x20 | (*sn & 0x0F);
            let used = offset + 1 + data.len();
            buf[offset + 1..used].copy_from_slice(data);
            used
        }
        Pdu::FlowControl(fc) => {
            buf[offset] = 0x30 | fc.status.code();
            buf[offset + 1] = fc.block_size;
            buf[offset + 2] = fc.st_min;
            offset + 3
        }
    };

    let len = match padding {
        Some(pad) => {
            let target = fd_padded_len(used.max(CLASSIC_FRAME_LEN));
            buf[used..target].fill(pad);
            target
        }
        None if used > CLASSIC_FRAME_LEN => {
            let target = fd_padded_len(used);
            buf[used..target].fill(FD_FILLER);
            target
        }
        None => used,
    };

    CanFrame::with_flags(header.id, &buf[..len], header.id_type.fd, header.id_type.brs)
        .ok_or(PduError::Malformed("frame flags"))
}

/// Build an unformatted frame (no PCI) carrying `data` as-is.
pub fn encode_raw(header: &FrameHeader, data: &[u8]) -> Result<CanFrame, PduError> {
    if data.len() > FD_FRAME_LEN {
        return Err(PduError::Malformed("unformatted payload exceeds frame capacity"));
    }
    let mut buf = [0u8; FD_FRAME_LEN];
    buf[..data.len()].copy_from_slice(data);
    let len = if data.len() > CLASSIC_FRAME_LEN {
        let target = fd_padded_len(data.len());
        buf[data.len()..target].fill(FD_FILLER);
        target
    } else {
        data.len()
    };
    CanFrame::with_flags(header.id, &buf[..len], header.id_type.fd, header.id_type.brs)
        .ok_or(PduError::Malformed("unformatted payload exceeds frame capacity"))
}

/// Decode raw CAN data into a PDU view, interpreting the PCI at the provided byte offset.
///
/// `pci_offset` is 0 (normal addressing) or 1 (extended/mixed addressing).
pub fn decode(data: &[u8], pci_offset: usize) -> Result<Pdu<'_>, PduError> {
    let pci = *data.get(pci_offset).ok_or(PduError::Truncated)?;
    match pci >> 4 {
        0x0 => {
            let dl = usize::from(pci & 0x0F);
            let (len, start) = if dl == 0 {
                if data.len() <= CLASSIC_FRAME_LEN {
                    return Err(PduError::Malformed("zero single frame length"));
                }
                let len = usize::from(*data.get(pci_offset + 1).ok_or(PduError::Truncated)?);
                if len == 0 {
                    return Err(PduError::Malformed("zero single frame length"));
                }
                (len, pci_offset + 2)
            } else {
                if dl > single_frame_capacity(CLASSIC_FRAME_LEN, pci_offset) {
                    return Err(PduError::Malformed("single frame length exceeds classic capacity"));
                }
                (dl, pci_offset + 1)
            };
            let data = data.get(start..start + len).ok_or(PduError::Truncated)?;
            Ok(Pdu::SingleFrame { data })
        }
        0x1 => {
            let low = *data.get(pci_offset + 1).ok_or(PduError::Truncated)?;
            let len12 = (u32::from(pci & 0x0F) << 8) | u32::from(low);
            let (len, start) = if len12 == 0 {
                let bytes: [u8; 4] = data
                    .get(pci_offset + 2..pci_offset + 6)
                    .and_then(|s| s.try_into().ok())
                    .ok_or(PduError::Truncated)?;
                (u32::from_be_bytes(bytes), pci_offset + 6)
            } else {
                (len12, pci_offset + 2)
            };
            if (len as usize) <= single_frame_capacity(data.len(), pci_offset) {
                return Err(PduError::Malformed("first frame length fits a single frame"));
            }
            Ok(Pdu::FirstFrame {
                len,
                data: &data[start..],
            })
        }
        0x2 => Ok(Pdu::ConsecutiveFrame {
            sn: pci & 0x0F,
            data: &data[pci_offset + 1..],
        }),
        0x3 => {
            if data.len() < pci_offset + 3 {
                return Err(PduError::Truncated);
            }
            let raw = pci & 0x0F;
            let status = FlowStatus::from_code(raw).ok_or(PduError::InvalidFlowStatus(raw))?;
            Ok(Pdu::FlowControl(FlowControl {
                status,
                block_size: data[pci_offset + 1],
                st_min: data[pci_offset + 2],
            }))
        }
        other => Err(PduError::UnknownPci(other)),
    }
}

/// Convert an STmin byte to a Duration. Reserved values are read as the 127 ms maximum.
pub fn st_min_to_duration(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(u64::from(raw)),
        0xF1..=0xF9 => Duration::from_micros(u64::from(raw - 0xF0) * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Encode a Duration into an STmin byte, clamping to the supported range.
pub fn duration_to_st_min(duration: Duration) -> u8 {
    let micros = duration.as_micros();
    if micros == 0 {
        return 0;
    }
    if (100..=900).contains(&micros) && micros.is_multiple_of(100) {
        return 0xF0 + (micros / 100) as u8;
    }
    let millis = duration.as_millis();
    if millis <= 0x7F { millis as u8 } else { 0x7F }
}
