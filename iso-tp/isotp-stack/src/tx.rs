//! Transmit-side segmentation state.

use core::time::Duration;

use crate::pdu::{FrameLayout, Pdu};

/// Where an outbound conversation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    /// Next frame may be produced.
    ReadyToSend,
    /// A frame was handed to the transport; waiting for its confirmation.
    AwaitingTxConfirm,
    /// Waiting for a Flow Control frame (after the First Frame or a full block).
    AwaitingFlowControl,
    /// Waiting out STmin before the next Consecutive Frame.
    Pacing,
}

/// What the sender does after the transport confirmed a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStep {
    /// The whole payload went out.
    Complete,
    /// Wait for Flow Control (N_Bs).
    AwaitFlowControl,
    /// Send the next Consecutive Frame immediately.
    SendNext,
    /// Send the next Consecutive Frame after the given separation time (N_Cs).
    Pace(Duration),
}

/// Bookkeeping for an outbound transfer.
#[derive(Debug, Clone)]
pub struct SendState {
    payload: Vec<u8>,
    layout: FrameLayout,
    offset: usize,
    next_sn: u8,
    block_size: u8,
    block_remaining: u8,
    st_min: Duration,
    wait_count: u8,
    fc_due: bool,
    phase: TxPhase,
}

impl SendState {
    /// Start a transfer of `payload` with the given frame geometry.
    pub fn new(payload: Vec<u8>, layout: FrameLayout) -> Self {
        Self {
            payload,
            layout,
            offset: 0,
            next_sn: 1,
            block_size: 0,
            block_remaining: 0,
            st_min: Duration::ZERO,
            wait_count: 0,
            fc_due: false,
            phase: TxPhase::ReadyToSend,
        }
    }

    /// `true` when the payload fits a Single Frame.
    pub fn is_single_frame(&self) -> bool {
        self.payload.len() <= self.layout.max_single_frame()
    }

    /// Produce the next PDU and move to [`TxPhase::AwaitingTxConfirm`].
    ///
    /// The first call yields a Single Frame or a First Frame; later calls yield Consecutive Frames
    /// with cyclic sequence numbers starting at 1.
    pub fn next_pdu(&mut self) -> Pdu<'_> {
        self.phase = TxPhase::AwaitingTxConfirm;
        let total = self.payload.len();
        if self.offset == 0 {
            if self.is_single_frame() {
                self.offset = total;
                return Pdu::SingleFrame {
                    data: &self.payload,
                };
            }
            let chunk = total.min(self.layout.first_frame_capacity(total));
            self.offset = chunk;
            self.fc_due = true;
            return Pdu::FirstFrame {
                len: total as u32,
                data: &self.payload[..chunk],
            };
        }

        let start = self.offset;
        let chunk = (total - start).min(self.layout.consecutive_capacity());
        self.offset += chunk;
        let sn = self.next_sn;
        self.next_sn = (self.next_sn + 1) & 0x0F;
        if self.block_size > 0 {
            self.block_remaining = self.block_remaining.saturating_sub(1);
            self.fc_due = self.block_remaining == 0;
        }
        Pdu::ConsecutiveFrame {
            sn,
            data: &self.payload[start..start + chunk],
        }
    }

    /// Hand out the whole payload as one unformatted frame.
    pub fn take_raw(&mut self) -> &[u8] {
        self.phase = TxPhase::AwaitingTxConfirm;
        self.offset = self.payload.len();
        &self.payload
    }

    /// The transport confirmed the last frame.
    pub fn on_frame_sent(&mut self) -> TxStep {
        if self.offset >= self.payload.len() {
            self.phase = TxPhase::ReadyToSend;
            return TxStep::Complete;
        }
        if self.fc_due {
            self.phase = TxPhase::AwaitingFlowControl;
            return TxStep::AwaitFlowControl;
        }
        if self.st_min.is_zero() {
            self.phase = TxPhase::ReadyToSend;
            TxStep::SendNext
        } else {
            self.phase = TxPhase::Pacing;
            TxStep::Pace(self.st_min)
        }
    }

    /// Apply a ClearToSend: open a new block with the receiver's parameters.
    pub fn on_clear_to_send(&mut self, block_size: u8, st_min: Duration) {
        self.block_size = block_size;
        self.block_remaining = block_size;
        self.st_min = st_min;
        self.wait_count = 0;
        self.fc_due = false;
        self.phase = TxPhase::ReadyToSend;
    }

    /// Count a Wait frame; returns the number of consecutive waits.
    pub fn register_wait(&mut self) -> u8 {
        self.wait_count = self.wait_count.saturating_add(1);
        self.wait_count
    }

    /// STmin elapsed.
    pub fn pacing_elapsed(&mut self) {
        if self.phase == TxPhase::Pacing {
            self.phase = TxPhase::ReadyToSend;
        }
    }

    /// Current phase.
    pub fn phase(&self) -> TxPhase {
        self.phase
    }

    /// Frame geometry.
    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Full payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bytes handed out so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Sequence number of the next Consecutive Frame.
    pub fn next_sn(&self) -> u8 {
        self.next_sn
    }

    /// Block size granted by the last ClearToSend.
    pub fn block_size(&self) -> u8 {
        self.block_size
    }

    /// Separation time granted by the last ClearToSend.
    pub fn st_min(&self) -> Duration {
        self.st_min
    }

    /// Consecutive Wait frames received.
    pub fn wait_count(&self) -> u8 {
        self.wait_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classic() -> FrameLayout {
        FrameLayout::new(8, 0)
    }

    #[test]
    fn small_payload_is_one_single_frame() {
        let mut state = SendState::new(vec![1, 2, 3, 4, 5, 6], classic());
        assert!(state.is_single_frame());
        assert_eq!(
            state.next_pdu(),
            Pdu::SingleFrame {
                data: &[1, 2, 3, 4, 5, 6]
            }
        );
        assert_eq!(state.on_frame_sent(), TxStep::Complete);
    }

    #[test]
    fn sequence_numbers_wrap_after_fifteen() {
        let payload: Vec<u8> = (0..=255).collect();
        let mut state = SendState::new(payload, classic());
        assert!(matches!(state.next_pdu(), Pdu::FirstFrame { len: 256, .. }));
        assert_eq!(state.on_frame_sent(), TxStep::AwaitFlowControl);
        state.on_clear_to_send(0, Duration::ZERO);

        let mut sns = Vec::new();
        loop {
            match state.next_pdu() {
                Pdu::ConsecutiveFrame { sn, .. } => sns.push(sn),
                other => panic!("unexpected PDU {other:?}"),
            }
            if state.on_frame_sent() == TxStep::Complete {
                break;
            }
        }
        // 256 - 6 = 250 bytes in 7-byte frames
        assert_eq!(sns.len(), 36);
        assert_eq!(&sns[..17], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 0, 1]);
    }

    #[test]
    fn block_size_requests_flow_control_and_st_min_paces() {
        let mut state = SendState::new(vec![0xAB; 40], classic());
        state.next_pdu();
        state.on_frame_sent();
        state.on_clear_to_send(2, Duration::from_millis(5));

        state.next_pdu();
        assert_eq!(state.on_frame_sent(), TxStep::Pace(Duration::from_millis(5)));
        assert_eq!(state.phase(), TxPhase::Pacing);
        state.pacing_elapsed();
        state.next_pdu();
        assert_eq!(state.on_frame_sent(), TxStep::AwaitFlowControl);
        assert_eq!(state.register_wait(), 1);
        assert_eq!(state.register_wait(), 2);
        state.on_clear_to_send(0, Duration::ZERO);
        assert_eq!(state.wait_count(), 0);
        state.next_pdu();
        assert_eq!(state.on_frame_sent(), TxStep::SendNext);
    }
}
