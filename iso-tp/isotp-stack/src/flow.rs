//! Flow Control decisions for both directions.

use core::time::Duration;

use crate::config::IsoTpConfig;
use crate::errors::Confirmation;
use crate::pdu::{FlowControl, FlowStatus, duration_to_st_min, st_min_to_duration};
use crate::tx::SendState;

/// Receive-side ISO-TP flow-control parameters (BS/STmin).
///
/// These values are advertised to the remote sender in FlowControl (FC) frames. Updating them at
/// runtime allows shaping the sender's rate based on backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxFlowControl {
    /// Block size (0 = unlimited).
    pub block_size: u8,
    /// Minimum separation time between consecutive frames.
    pub st_min: Duration,
}

impl RxFlowControl {
    /// Build flow-control parameters from a stack's static configuration.
    pub fn from_config(cfg: &IsoTpConfig) -> Self {
        Self {
            block_size: cfg.block_size,
            st_min: cfg.st_min,
        }
    }
}

/// Sender reaction to a Flow Control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderDirective {
    /// Continue with Consecutive Frames.
    Resume,
    /// Keep waiting for another Flow Control (N_Bs restarts).
    Wait,
    /// Abort the send.
    Abort(Confirmation),
}

/// Issues and interprets Flow Control frames.
#[derive(Debug, Clone)]
pub struct FlowControlController {
    wft_max: u8,
    rx_buffer_limit: Option<usize>,
    rx: RxFlowControl,
}

impl FlowControlController {
    /// Controller with the limits of `cfg`.
    pub fn new(cfg: &IsoTpConfig) -> Self {
        Self {
            wft_max: cfg.wft_max,
            rx_buffer_limit: cfg.rx_buffer_limit,
            rx: RxFlowControl::from_config(cfg),
        }
    }

    /// Parameters advertised to remote senders.
    pub fn rx_flow_control(&self) -> RxFlowControl {
        self.rx
    }

    /// Change the parameters advertised to remote senders.
    pub fn set_rx_flow_control(&mut self, rx: RxFlowControl) {
        self.rx = rx;
    }

    /// Interpret a Flow Control frame for an outbound transfer waiting for one.
    ///
    /// `fc` is `Err(status)` when the frame carried a reserved flow status.
    pub fn on_flow_control(
        &self,
        state: &mut SendState,
        fc: Result<FlowControl, u8>,
    ) -> SenderDirective {
        let fc = match fc {
            Ok(fc) => fc,
            Err(_) => return SenderDirective::Abort(Confirmation::InvalidFlowStatus),
        };
        match fc.status {
            FlowStatus::ClearToSend => {
                state.on_clear_to_send(fc.block_size, st_min_to_duration(fc.st_min));
                SenderDirective::Resume
            }
            FlowStatus::Wait => {
                let waits = state.register_wait();
                if self.wft_max != 0 && waits > self.wft_max {
                    SenderDirective::Abort(Confirmation::WaitFrameOverrun)
                } else {
                    SenderDirective::Wait
                }
            }
            FlowStatus::Overflow => SenderDirective::Abort(Confirmation::BufferOverflow),
        }
    }

    /// Flow status answering a First Frame (or re-evaluating a throttled reception).
    ///
    /// `reserved` is what other receptions already hold. Messages that fit get ClearToSend; a
    /// message that could fit later gets Wait up to `wft_max` times; otherwise Overflow.
    pub fn receiver_response(
        &self,
        declared_len: usize,
        reserved: usize,
        waits_sent: u8,
    ) -> FlowStatus {
        let Some(limit) = self.rx_buffer_limit else {
            return FlowStatus::ClearToSend;
        };
        if reserved.saturating_add(declared_len) <= limit {
            FlowStatus::ClearToSend
        } else if declared_len <= limit && self.wft_max != 0 && waits_sent < self.wft_max {
            FlowStatus::Wait
        } else {
            FlowStatus::Overflow
        }
    }

    /// Flow Control frame advertising the current receive parameters.
    pub fn flow_control(&self, status: FlowStatus) -> FlowControl {
        FlowControl {
            status,
            block_size: self.rx.block_size,
            st_min: duration_to_st_min(self.rx.st_min),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::FrameLayout;

    fn cfg() -> IsoTpConfig {
        IsoTpConfig {
            wft_max: 2,
            rx_buffer_limit: Some(100),
            block_size: 4,
            st_min: Duration::from_millis(2),
            ..IsoTpConfig::default()
        }
    }

    fn waiting_sender() -> SendState {
        let mut state = SendState::new(vec![0; 30], FrameLayout::new(8, 0));
        state.next_pdu();
        state.on_frame_sent();
        state
    }

    #[test]
    fn wait_frames_overrun_after_wft_max() {
        let flow = FlowControlController::new(&cfg());
        let mut state = waiting_sender();
        let wait = Ok(FlowControl {
            status: FlowStatus::Wait,
            block_size: 0,
            st_min: 0,
        });
        assert_eq!(flow.on_flow_control(&mut state, wait), SenderDirective::Wait);
        assert_eq!(flow.on_flow_control(&mut state, wait), SenderDirective::Wait);
        assert_eq!(
            flow.on_flow_control(&mut state, wait),
            SenderDirective::Abort(Confirmation::WaitFrameOverrun)
        );
    }

    #[test]
    fn clear_to_send_applies_receiver_parameters() {
        let flow = FlowControlController::new(&cfg());
        let mut state = waiting_sender();
        let cts = Ok(FlowControl {
            status: FlowStatus::ClearToSend,
            block_size: 3,
            st_min: 0xF2,
        });
        assert_eq!(flow.on_flow_control(&mut state, cts), SenderDirective::Resume);
        assert_eq!(state.block_size(), 3);
        assert_eq!(state.st_min(), Duration::from_micros(200));
    }

    #[test]
    fn overflow_and_invalid_status_abort() {
        let flow = FlowControlController::new(&cfg());
        let mut state = waiting_sender();
        let overflow = Ok(FlowControl {
            status: FlowStatus::Overflow,
            block_size: 0,
            st_min: 0,
        });
        assert_eq!(
            flow.on_flow_control(&mut state, overflow),
            SenderDirective::Abort(Confirmation::BufferOverflow)
        );
        assert_eq!(
            flow.on_flow_control(&mut state, Err(0x7)),
            SenderDirective::Abort(Confirmation::InvalidFlowStatus)
        );
    }

    #[test]
    fn receiver_waits_while_budget_is_taken() {
        let flow = FlowControlController::new(&cfg());
        assert_eq!(flow.receiver_response(60, 0, 0), FlowStatus::ClearToSend);
        assert_eq!(flow.receiver_response(60, 50, 0), FlowStatus::Wait);
        assert_eq!(flow.receiver_response(60, 50, 2), FlowStatus::Overflow);
        assert_eq!(flow.receiver_response(200, 0, 0), FlowStatus::Overflow);
        let fc = flow.flow_control(FlowStatus::ClearToSend);
        assert_eq!((fc.block_size, fc.st_min), (4, 2));
    }

    #[test]
    fn unlimited_wft_max_never_sends_wait() {
        let flow = FlowControlController::new(&IsoTpConfig {
            wft_max: 0,
            ..cfg()
        });
        assert_eq!(flow.receiver_response(60, 50, 0), FlowStatus::Overflow);
    }
}
