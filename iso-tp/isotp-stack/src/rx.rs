//! Receive-side reassembly.

use core::cmp::min;

use crate::errors::{Confirmation, IsoTpError};
use crate::pdu::FlowStatus;

/// Where an inbound conversation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPhase {
    /// A Flow Control frame with this status is being transmitted.
    SendingFlowControl(FlowStatus),
    /// Waiting for the next Consecutive Frame (N_Cr).
    AwaitingConsecutive,
    /// The sender was told to wait; the reception is re-evaluated after N_Br.
    Throttled,
}

/// Outcome after processing a Consecutive Frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Nothing to send back yet.
    None,
    /// Block complete: emit a new Flow Control frame.
    SendFlowControl,
    /// Declared length reached.
    Completed,
    /// Frame shorter than the First Frame while more data is due; dropped, state unchanged.
    Malformed,
}

/// Reassembly state for one inbound transfer.
#[derive(Debug, Clone)]
pub struct ReceiveState {
    expected_len: usize,
    rx_dl: usize,
    buffer: Vec<u8>,
    next_sn: u8,
    block_size: u8,
    block_remaining: u8,
    waits_sent: u8,
    phase: RxPhase,
}

impl ReceiveState {
    /// Open a reception from a First Frame declaring `declared_len` bytes.
    ///
    /// `rx_dl` is the CAN frame length of the First Frame; every Consecutive Frame but the last
    /// must be at least that long. The declared length must be nonzero and at most `max_len`;
    /// the full buffer is reserved up front.
    pub fn start(
        declared_len: usize,
        first: &[u8],
        max_len: usize,
        rx_dl: usize,
    ) -> Result<Self, IsoTpError> {
        if declared_len == 0 || declared_len > max_len {
            return Err(IsoTpError::WrongParameter("first frame length out of range"));
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(declared_len)
            .map_err(|_| IsoTpError::NoMemory)?;
        buffer.extend_from_slice(&first[..min(first.len(), declared_len)]);
        Ok(Self {
            expected_len: declared_len,
            rx_dl,
            buffer,
            next_sn: 1,
            block_size: 0,
            block_remaining: 0,
            waits_sent: 0,
            phase: RxPhase::SendingFlowControl(FlowStatus::ClearToSend),
        })
    }

    /// Record that a Flow Control frame with `status` is going out.
    ///
    /// A ClearToSend opens a new block of `block_size` frames.
    pub fn flow_control_sent(&mut self, status: FlowStatus, block_size: u8) {
        match status {
            FlowStatus::ClearToSend => {
                self.block_size = block_size;
                self.block_remaining = block_size;
            }
            FlowStatus::Wait => self.waits_sent = self.waits_sent.saturating_add(1),
            FlowStatus::Overflow => {}
        }
        self.phase = RxPhase::SendingFlowControl(status);
    }

    /// The transport confirmed a ClearToSend.
    pub fn await_consecutive(&mut self) {
        self.phase = RxPhase::AwaitingConsecutive;
    }

    /// The transport confirmed a Wait.
    pub fn throttle(&mut self) {
        self.phase = RxPhase::Throttled;
    }

    /// `true` while Consecutive Frames are acceptable.
    pub fn accepts_consecutive(&self) -> bool {
        matches!(
            self.phase,
            RxPhase::AwaitingConsecutive | RxPhase::SendingFlowControl(FlowStatus::ClearToSend)
        )
    }

    /// Append a Consecutive Frame whose CAN frame is `frame_len` bytes long.
    ///
    /// A non-final frame shorter than the First Frame is reported as
    /// [`RxOutcome::Malformed`] and not consumed. A sequence number other than the expected one
    /// fails the reception.
    pub fn on_consecutive(
        &mut self,
        sn: u8,
        data: &[u8],
        frame_len: usize,
    ) -> Result<RxOutcome, Confirmation> {
        let remaining = self.expected_len - self.buffer.len();
        if remaining > data.len() && frame_len < self.rx_dl {
            return Ok(RxOutcome::Malformed);
        }
        if sn != self.next_sn {
            return Err(Confirmation::WrongSequenceNumber);
        }
        self.buffer
            .extend_from_slice(&data[..min(data.len(), remaining)]);
        self.next_sn = (self.next_sn + 1) & 0x0F;
        self.phase = RxPhase::AwaitingConsecutive;

        if self.buffer.len() >= self.expected_len {
            return Ok(RxOutcome::Completed);
        }

        if self.block_size > 0 {
            self.block_remaining = self.block_remaining.saturating_sub(1);
            if self.block_remaining == 0 {
                return Ok(RxOutcome::SendFlowControl);
            }
        }

        Ok(RxOutcome::None)
    }

    /// Current phase.
    pub fn phase(&self) -> RxPhase {
        self.phase
    }

    /// CAN frame length of the First Frame.
    pub fn rx_dl(&self) -> usize {
        self.rx_dl
    }

    /// Length announced by the First Frame.
    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// Bytes received so far.
    pub fn received(&self) -> &[u8] {
        &self.buffer
    }

    /// Sequence number expected next.
    pub fn next_sn(&self) -> u8 {
        self.next_sn
    }

    /// Wait frames sent for this reception.
    pub fn waits_sent(&self) -> u8 {
        self.waits_sent
    }

    /// Consume the state, yielding the received bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.buffer
    }
}
