//! Sans-IO ISO-TP engine.
//!
//! [`IsoTpStack`] owns every piece of protocol state of one CAN channel but performs no I/O. The
//! owner feeds it:
//! - application requests ([`IsoTpStack::send`], [`IsoTpStack::reset`]),
//! - received frames ([`IsoTpStack::handle_frame`]),
//! - transport confirmations ([`IsoTpStack::on_transmit_result`]),
//! - the passage of time ([`IsoTpStack::handle_timeout`] once [`IsoTpStack::next_deadline`] is
//!   reached),
//!
//! and drains frames to transmit ([`IsoTpStack::poll_transmit`]) and application events
//! ([`IsoTpStack::poll_event`]). Each outbound frame carries a [`TxReceipt`]; the owner reports the
//! transport outcome for it, which is what moves a conversation to its next step. A conversation
//! therefore has at most one frame in flight.

use core::time::Duration;
use std::collections::VecDeque;

use embedded_can::Frame;
use tracing::{debug, trace, warn};

use crate::address::{
    AddressResolver, AddressingFormat, ConversationKey, DecodedHeader, HeaderOptions, Mapping,
    TargetAddressType,
};
use crate::config::{IsoTpConfig, UnsegmentedPolicy};
use crate::conversation::{Conversation, ConversationState, ConversationTable};
use crate::errors::{Confirmation, IsoTpError, TimeoutKind};
use crate::flow::{FlowControlController, RxFlowControl, SenderDirective};
use crate::frame::{CLASSIC_FRAME_LEN, CanFrame, raw_id};
use crate::pdu::{self, FlowControl, FlowStatus, FrameLayout, Pdu, PduError};
use crate::rx::{ReceiveState, RxOutcome, RxPhase};
use crate::timer::{Clock, Expiry, TimerService};
use crate::tx::{SendState, TxPhase, TxStep};
use crate::{Message, MessageType};

/// Per-send overrides of the configured defaults (keys without a static mapping only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    /// Send as CAN FD.
    pub fd: Option<bool>,
    /// Bit-rate switch.
    pub brs: Option<bool>,
    /// J1939 priority of 29-bit fixed identifiers.
    pub priority: Option<u8>,
}

/// Transport outcome for one outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitStatus {
    /// Frame is on the bus.
    Sent,
    /// Transport rejected the frame or did not accept it in time.
    Failed,
}

/// Ties an outbound frame to the conversation step that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    /// Conversation key.
    pub key: ConversationKey,
    /// Conversation generation; receipts of a closed conversation are ignored.
    pub conversation: u64,
    /// Timer bounding the transmission (N_As or N_Ar).
    pub kind: TimeoutKind,
}

/// A frame waiting for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFrame {
    /// Frame to transmit.
    pub frame: CanFrame,
    /// Report the outcome with [`IsoTpStack::on_transmit_result`]; `None` for frames nobody
    /// waits on.
    pub receipt: Option<TxReceipt>,
}

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// A reception ended (successfully or not), or an unformatted frame arrived.
    Received(Message),
    /// A transfer started (only with `show_pending`).
    Indication(Message),
    /// A send ended.
    Confirmed {
        /// Key of the send.
        key: ConversationKey,
        /// Result of the send.
        result: Confirmation,
    },
}

enum AfterSent {
    Finish(Confirmation),
    Arm(TimeoutKind, Duration),
    Transmit,
    Nothing,
}

/// ISO-TP engine for one CAN channel.
pub struct IsoTpStack<C: Clock> {
    cfg: IsoTpConfig,
    clock: C,
    resolver: AddressResolver,
    flow: FlowControlController,
    table: ConversationTable,
    timers: TimerService<C::Instant>,
    outbox: VecDeque<OutgoingFrame>,
    events: VecDeque<StackEvent>,
}

impl<C: Clock> IsoTpStack<C> {
    /// Build a stack; the configuration is validated.
    pub fn new(cfg: IsoTpConfig, clock: C) -> Result<Self, IsoTpError> {
        cfg.validate()?;
        Ok(Self {
            resolver: AddressResolver::new(cfg.enhanced_addressing),
            flow: FlowControlController::new(&cfg),
            table: ConversationTable::new(),
            timers: TimerService::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            clock,
            cfg,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &IsoTpConfig {
        &self.cfg
    }

    /// Current time of the stack's clock.
    pub fn now(&self) -> C::Instant {
        self.clock.now()
    }

    /// Register a static address mapping.
    pub fn add_mapping(&mut self, mapping: Mapping) -> Result<(), IsoTpError> {
        self.resolver.add_mapping(mapping)
    }

    /// Remove the mappings registered on `can_id`.
    pub fn remove_mapping(&mut self, can_id: u32) -> Result<(), IsoTpError> {
        self.resolver.remove_mapping(can_id)
    }

    /// Registered mappings.
    pub fn mappings(&self) -> &[Mapping] {
        self.resolver.mappings()
    }

    /// Receive-side flow-control parameters currently advertised.
    pub fn rx_flow_control(&self) -> RxFlowControl {
        self.flow.rx_flow_control()
    }

    /// Update receive-side flow-control parameters (applies to the next Flow Control frame).
    pub fn set_rx_flow_control(&mut self, fc: RxFlowControl) {
        self.flow.set_rx_flow_control(fc);
    }

    /// Open conversation for `key`.
    pub fn conversation(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.table.find_active(key)
    }

    /// Number of open conversations.
    pub fn active_conversations(&self) -> usize {
        self.table.len()
    }

    /// Earliest protocol deadline; call [`IsoTpStack::handle_timeout`] once it has passed.
    pub fn next_deadline(&self) -> Option<C::Instant> {
        self.timers.next_deadline()
    }

    /// Next frame to hand to the transport.
    pub fn poll_transmit(&mut self) -> Option<OutgoingFrame> {
        self.outbox.pop_front()
    }

    /// Next application event.
    pub fn poll_event(&mut self) -> Option<StackEvent> {
        self.events.pop_front()
    }

    /// Start sending `payload` to `key`.
    ///
    /// The outcome is reported later as [`StackEvent::Confirmed`]. Local rejections (empty or
    /// oversized payload, unresolvable key, segmented functional send, key busy) fail here.
    pub fn send(
        &mut self,
        key: ConversationKey,
        payload: Vec<u8>,
        options: SendOptions,
        now: C::Instant,
    ) -> Result<(), IsoTpError> {
        if payload.is_empty() {
            return Err(IsoTpError::WrongParameter("empty payload"));
        }
        if payload.len() > self.cfg.max_payload_len {
            return Err(IsoTpError::WrongParameter("payload exceeds max_payload_len"));
        }
        let header = self
            .resolver
            .encode_header(&key, &self.header_options(&options))?;
        let layout = FrameLayout::new(self.cfg.frame_len(header.id_type.fd), header.pci_offset());
        let unformatted = key.format == AddressingFormat::None;
        if unformatted && payload.len() > layout.frame_len {
            return Err(IsoTpError::WrongParameter(
                "unformatted payload exceeds frame length",
            ));
        }
        if !unformatted
            && key.target_type == TargetAddressType::Functional
            && payload.len() > layout.max_single_frame()
        {
            return Err(IsoTpError::WrongParameter(
                "functional addressing allows single frames only",
            ));
        }

        let message_type = self.resolver.message_type(&key);
        let len = payload.len();
        let state = SendState::new(payload, layout);
        let segmented = !unformatted && !state.is_single_frame();
        let can_id = raw_id(header.id);
        self.table.get_or_create(key, || {
            Conversation::new(
                key,
                ConversationState::Sending(state),
                header,
                can_id,
                header.id_type,
                message_type,
            )
        })?;
        debug!(?key, len, segmented, "send started");

        if segmented && self.cfg.show_pending {
            self.events.push_back(StackEvent::Indication(Message {
                can_id,
                key,
                id_type: header.id_type,
                message_type: MessageType::IndicationTx,
                data: Vec::new(),
                result: Confirmation::Ok,
            }));
        }
        self.transmit_next(key, now)
    }

    /// Process one received frame.
    ///
    /// Fails with [`IsoTpError::Overflow`] (frame not processed) while the event queue is full.
    pub fn handle_frame(&mut self, frame: &CanFrame, now: C::Instant) -> Result<(), IsoTpError> {
        if self.events.len() >= self.cfg.event_queue_capacity {
            warn!(
                capacity = self.cfg.event_queue_capacity,
                "event queue full, frame dropped"
            );
            return Err(IsoTpError::Overflow);
        }
        if frame.is_remote_frame() {
            trace!(id = frame.raw_id(), "remote frame ignored");
            return Ok(());
        }

        let decoded = match self.resolver.decode_header(frame) {
            Ok(decoded) => decoded,
            Err(IsoTpError::UnknownFormat(id)) => {
                if self.cfg.unsegmented == UnsegmentedPolicy::Off {
                    trace!(id, "frame matches no addressing");
                } else {
                    self.deliver_unformatted(frame, None);
                }
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let unformatted = decoded.key.format == AddressingFormat::None;
        if unformatted || self.cfg.unsegmented == UnsegmentedPolicy::AllFrames {
            self.deliver_unformatted(frame, Some(&decoded));
            if unformatted {
                return Ok(());
            }
        }

        let pdu = match pdu::decode(frame.data(), decoded.pci_offset) {
            Ok(pdu) => pdu,
            Err(PduError::InvalidFlowStatus(status)) => {
                return self.on_flow_control(&decoded, Err(status), now);
            }
            Err(err) => {
                if self.cfg.unsegmented == UnsegmentedPolicy::On {
                    self.deliver_unformatted(frame, Some(&decoded));
                } else {
                    debug!(key = ?decoded.key, %err, "malformed frame dropped");
                }
                return Ok(());
            }
        };

        match pdu {
            Pdu::SingleFrame { data } => {
                self.on_single_frame(frame, &decoded, data);
                Ok(())
            }
            Pdu::FirstFrame { len, data } => self.on_first_frame(frame, &decoded, len, data, now),
            Pdu::ConsecutiveFrame { sn, data } => {
                self.on_consecutive_frame(frame, &decoded, sn, data, now)
            }
            Pdu::FlowControl(fc) => self.on_flow_control(&decoded, Ok(fc), now),
        }
    }

    /// Report the transport outcome of a frame obtained from [`IsoTpStack::poll_transmit`].
    pub fn on_transmit_result(
        &mut self,
        receipt: TxReceipt,
        status: TransmitStatus,
        now: C::Instant,
    ) {
        let key = receipt.key;
        if self.table.find_active(&key).map(|c| c.id) != Some(receipt.conversation) {
            trace!(?key, "confirmation for a closed conversation");
            return;
        }
        if status == TransmitStatus::Failed {
            warn!(?key, kind = ?receipt.kind, "frame transmission failed");
            self.finish(key, Confirmation::TimeoutA);
            return;
        }

        let Some(conversation) = self.table.find_active_mut(&key) else {
            return;
        };
        let next = match &mut conversation.state {
            ConversationState::Sending(state) => match state.on_frame_sent() {
                TxStep::Complete => AfterSent::Finish(Confirmation::Ok),
                TxStep::AwaitFlowControl => AfterSent::Arm(TimeoutKind::NBs, self.cfg.n_bs),
                TxStep::SendNext => AfterSent::Transmit,
                TxStep::Pace(st_min) => AfterSent::Arm(TimeoutKind::NCs, st_min),
            },
            ConversationState::Receiving(state) => match state.phase() {
                RxPhase::SendingFlowControl(FlowStatus::ClearToSend) => {
                    state.await_consecutive();
                    AfterSent::Arm(TimeoutKind::NCr, self.cfg.n_cr)
                }
                RxPhase::SendingFlowControl(FlowStatus::Wait) => {
                    state.throttle();
                    AfterSent::Arm(TimeoutKind::NBr, self.cfg.n_br)
                }
                RxPhase::SendingFlowControl(FlowStatus::Overflow) => {
                    AfterSent::Finish(Confirmation::BufferOverflow)
                }
                RxPhase::AwaitingConsecutive | RxPhase::Throttled => AfterSent::Nothing,
            },
        };

        match next {
            AfterSent::Finish(result) => self.finish(key, result),
            AfterSent::Arm(kind, after) => {
                let deadline = self.clock.add(now, after);
                self.timers.arm(key, kind, deadline);
            }
            AfterSent::Transmit => {
                if let Err(err) = self.transmit_next(key, now) {
                    debug!(?key, %err, "send aborted");
                }
            }
            AfterSent::Nothing => {}
        }
    }

    /// Fire every timer due at `now`.
    ///
    /// Protocol timeouts end their conversation with the matching result; N_Cs releases the next
    /// Consecutive Frame and N_Br re-evaluates a throttled reception.
    pub fn handle_timeout(&mut self, now: C::Instant) {
        let expired = self.timers.poll_expired(now);
        if expired.is_empty() {
            return;
        }
        let (failures, scheduled): (Vec<Expiry>, Vec<Expiry>) = expired
            .into_iter()
            .partition(|expiry| expiry.kind.confirmation().is_some());

        for (conversation, result) in self.table.sweep(&failures) {
            self.report(conversation, result);
        }

        for expiry in scheduled {
            let key = expiry.key;
            let outcome = match expiry.kind {
                TimeoutKind::NCs => {
                    if let Some(Conversation {
                        state: ConversationState::Sending(state),
                        ..
                    }) = self.table.find_active_mut(&key)
                    {
                        state.pacing_elapsed();
                    }
                    self.transmit_next(key, now)
                }
                TimeoutKind::NBr => self.recheck_throttled(key, now),
                _ => Ok(()),
            };
            if let Err(err) = outcome {
                debug!(?key, %err, "timer action failed");
            }
        }
    }

    /// Abort the conversation of `key`. A pending send is confirmed with
    /// [`Confirmation::GeneralError`]. Returns `false` when nothing was open.
    pub fn reset(&mut self, key: &ConversationKey) -> bool {
        if self.table.find_active(key).is_none() {
            return false;
        }
        self.outbox
            .retain(|out| out.receipt.is_none_or(|receipt| receipt.key != *key));
        debug!(?key, "conversation reset");
        self.finish(*key, Confirmation::GeneralError);
        true
    }

    /// Abort every conversation and drop queued frames.
    pub fn reset_all(&mut self) {
        self.outbox.clear();
        self.timers.clear();
        for conversation in self.table.clear() {
            self.report(conversation, Confirmation::GeneralError);
        }
    }

    fn header_options(&self, options: &SendOptions) -> HeaderOptions {
        let fd = options.fd.unwrap_or(self.cfg.default_fd);
        HeaderOptions {
            fd,
            brs: fd && options.brs.unwrap_or(self.cfg.default_brs),
            priority: options.priority.unwrap_or(self.cfg.j1939_priority),
        }
    }

    fn transmit_next(&mut self, key: ConversationKey, now: C::Instant) -> Result<(), IsoTpError> {
        let padding = self.cfg.padding_byte();
        let Some(conversation) = self.table.find_active_mut(&key) else {
            return Ok(());
        };
        let id = conversation.id;
        let ConversationState::Sending(state) = &mut conversation.state else {
            return Ok(());
        };
        if state.phase() != TxPhase::ReadyToSend {
            trace!(?key, phase = ?state.phase(), "sender not ready");
            return Ok(());
        }
        let encoded = if key.format == AddressingFormat::None {
            pdu::encode_raw(&conversation.header, state.take_raw())
        } else {
            let frame_len = state.layout().frame_len;
            let next = state.next_pdu();
            pdu::encode(&conversation.header, &next, padding, frame_len)
        };
        self.queue_frame(key, id, TimeoutKind::NAs, encoded, now)
    }

    fn transmit_flow_control(
        &mut self,
        key: ConversationKey,
        status: FlowStatus,
        now: C::Instant,
    ) -> Result<(), IsoTpError> {
        let padding = self.cfg.padding_byte();
        let fc = self.flow.flow_control(status);
        let Some(conversation) = self.table.find_active_mut(&key) else {
            return Ok(());
        };
        let id = conversation.id;
        let ConversationState::Receiving(state) = &mut conversation.state else {
            return Ok(());
        };
        state.flow_control_sent(status, fc.block_size);
        trace!(?key, ?status, block_size = fc.block_size, "flow control");
        let encoded = pdu::encode(
            &conversation.header,
            &Pdu::FlowControl(fc),
            padding,
            CLASSIC_FRAME_LEN,
        );
        self.queue_frame(key, id, TimeoutKind::NAr, encoded, now)
    }

    fn queue_frame(
        &mut self,
        key: ConversationKey,
        conversation: u64,
        kind: TimeoutKind,
        encoded: Result<CanFrame, PduError>,
        now: C::Instant,
    ) -> Result<(), IsoTpError> {
        let frame = match encoded {
            Ok(frame) => frame,
            Err(err) => {
                warn!(?key, %err, "frame encoding failed");
                self.finish(key, Confirmation::GeneralError);
                return Err(err.into());
            }
        };
        let timeout = if kind == TimeoutKind::NAr {
            self.cfg.n_ar
        } else {
            self.cfg.n_as
        };
        let deadline = self.clock.add(now, timeout);
        self.timers.arm(key, kind, deadline);
        self.outbox.push_back(OutgoingFrame {
            frame,
            receipt: Some(TxReceipt {
                key,
                conversation,
                kind,
            }),
        });
        Ok(())
    }

    fn on_single_frame(&mut self, frame: &CanFrame, decoded: &DecodedHeader, data: &[u8]) {
        let key = decoded.key;
        if self
            .table
            .find_active(&key)
            .is_some_and(Conversation::is_receiving)
        {
            warn!(?key, "single frame interrupted an open reception");
            self.finish(key, Confirmation::UnexpectedPdu);
        }
        trace!(?key, len = data.len(), "single frame received");
        self.events.push_back(StackEvent::Received(incoming_message(
            frame,
            decoded,
            data.to_vec(),
            Confirmation::Ok,
        )));
    }

    fn on_first_frame(
        &mut self,
        frame: &CanFrame,
        decoded: &DecodedHeader,
        len: u32,
        data: &[u8],
        now: C::Instant,
    ) -> Result<(), IsoTpError> {
        let key = decoded.key;
        if key.target_type == TargetAddressType::Functional {
            debug!(?key, "first frame on a functional address ignored");
            return Ok(());
        }
        if self
            .table
            .find_active(&key)
            .is_some_and(Conversation::is_receiving)
        {
            warn!(?key, "first frame interrupted an open reception");
            self.finish(key, Confirmation::UnexpectedPdu);
        }

        let options = HeaderOptions {
            fd: decoded.id_type.fd,
            brs: decoded.id_type.brs,
            priority: decoded
                .id_type
                .priority
                .unwrap_or(self.cfg.j1939_priority),
        };
        let reply = match self.resolver.encode_header(&key.reversed(), &options) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(?key, %err, "no reply address for first frame");
                return Ok(());
            }
        };

        let declared = usize::try_from(len).unwrap_or(usize::MAX);
        let rx_dl = frame.data().len();
        let state = match ReceiveState::start(declared, data, self.cfg.max_payload_len, rx_dl) {
            Ok(state) => state,
            Err(err) => {
                warn!(?key, declared, %err, "first frame rejected");
                let fc = self.flow.flow_control(FlowStatus::Overflow);
                match pdu::encode(
                    &reply,
                    &Pdu::FlowControl(fc),
                    self.cfg.padding_byte(),
                    CLASSIC_FRAME_LEN,
                ) {
                    Ok(frame) => self.outbox.push_back(OutgoingFrame {
                        frame,
                        receipt: None,
                    }),
                    Err(err) => warn!(?key, %err, "overflow flow control not encodable"),
                }
                self.events.push_back(StackEvent::Received(incoming_message(
                    frame,
                    decoded,
                    Vec::new(),
                    Confirmation::BufferOverflow,
                )));
                return Ok(());
            }
        };

        let status = self
            .flow
            .receiver_response(declared, self.table.reserved_rx_bytes(), 0);
        let can_id = frame.raw_id();
        self.table.get_or_create(key, || {
            Conversation::new(
                key,
                ConversationState::Receiving(state),
                reply,
                can_id,
                decoded.id_type,
                decoded.message_type,
            )
        })?;
        debug!(?key, declared, ?status, "reception started");

        if self.cfg.show_pending {
            self.events.push_back(StackEvent::Indication(Message {
                message_type: MessageType::Indication,
                ..incoming_message(frame, decoded, Vec::new(), Confirmation::Ok)
            }));
        }
        self.transmit_flow_control(key, status, now)
    }

    fn on_consecutive_frame(
        &mut self,
        frame: &CanFrame,
        decoded: &DecodedHeader,
        sn: u8,
        data: &[u8],
        now: C::Instant,
    ) -> Result<(), IsoTpError> {
        let key = decoded.key;
        let frame_len = frame.data().len();
        let outcome = match self.table.find_active_mut(&key) {
            Some(Conversation {
                state: ConversationState::Receiving(state),
                ..
            }) if state.accepts_consecutive() => state.on_consecutive(sn, data, frame_len),
            _ => {
                trace!(
                    ?key,
                    sn,
                    result = %Confirmation::Ignored,
                    "consecutive frame without open reception"
                );
                return Ok(());
            }
        };

        match outcome {
            Err(result) => {
                warn!(?key, sn, %result, "reception aborted");
                self.finish(key, result);
            }
            Ok(RxOutcome::Completed) => self.finish(key, Confirmation::Ok),
            Ok(RxOutcome::SendFlowControl) => {
                self.transmit_flow_control(key, FlowStatus::ClearToSend, now)?;
            }
            Ok(RxOutcome::Malformed) => {
                debug!(?key, sn, frame_len, "short consecutive frame dropped");
            }
            Ok(RxOutcome::None) => {
                let deadline = self.clock.add(now, self.cfg.n_cr);
                self.timers.arm(key, TimeoutKind::NCr, deadline);
            }
        }
        Ok(())
    }

    fn on_flow_control(
        &mut self,
        decoded: &DecodedHeader,
        fc: Result<FlowControl, u8>,
        now: C::Instant,
    ) -> Result<(), IsoTpError> {
        let key = decoded.key.reversed();
        let directive = match self.table.find_active_mut(&key) {
            Some(Conversation {
                state: ConversationState::Sending(state),
                ..
            }) if state.phase() == TxPhase::AwaitingFlowControl => {
                self.flow.on_flow_control(state, fc)
            }
            Some(_) => {
                debug!(?key, "unexpected flow control ignored");
                return Ok(());
            }
            None => {
                trace!(
                    ?key,
                    result = %Confirmation::Ignored,
                    "flow control without open send"
                );
                return Ok(());
            }
        };

        match directive {
            SenderDirective::Resume => self.transmit_next(key, now),
            SenderDirective::Wait => {
                debug!(?key, "flow control wait");
                let deadline = self.clock.add(now, self.cfg.n_bs);
                self.timers.arm(key, TimeoutKind::NBs, deadline);
                Ok(())
            }
            SenderDirective::Abort(result) => {
                self.finish(key, result);
                Ok(())
            }
        }
    }

    fn recheck_throttled(
        &mut self,
        key: ConversationKey,
        now: C::Instant,
    ) -> Result<(), IsoTpError> {
        let (declared, waits) = match self.table.find_active(&key) {
            Some(Conversation {
                state: ConversationState::Receiving(state),
                ..
            }) if state.phase() == RxPhase::Throttled => {
                (state.expected_len(), state.waits_sent())
            }
            _ => return Ok(()),
        };
        let status = self
            .flow
            .receiver_response(declared, self.table.reserved_rx_bytes(), waits);
        debug!(?key, ?status, waits, "throttled reception re-evaluated");
        self.transmit_flow_control(key, status, now)
    }

    fn deliver_unformatted(&mut self, frame: &CanFrame, decoded: Option<&DecodedHeader>) {
        let (key, message_type) = decoded
            .map(|d| (d.key, d.message_type))
            .unwrap_or((ConversationKey::unformatted(), MessageType::Diagnostic));
        self.events.push_back(StackEvent::Received(Message {
            can_id: frame.raw_id(),
            key: ConversationKey {
                format: AddressingFormat::None,
                ..key
            },
            id_type: frame.id_type(),
            message_type,
            data: frame.data().to_vec(),
            result: Confirmation::Ok,
        }));
    }

    fn finish(&mut self, key: ConversationKey, result: Confirmation) {
        self.timers.cancel(&key);
        if let Some(conversation) = self.table.remove(&key) {
            self.report(conversation, result);
        }
    }

    fn report(&mut self, conversation: Conversation, result: Confirmation) {
        let key = conversation.key;
        if result.is_ok() {
            debug!(?key, "conversation complete");
        } else {
            warn!(?key, %result, "conversation failed");
        }
        let event = match conversation.state {
            ConversationState::Sending(_) => StackEvent::Confirmed { key, result },
            ConversationState::Receiving(state) => StackEvent::Received(Message {
                can_id: conversation.can_id,
                key,
                id_type: conversation.id_type,
                message_type: conversation.message_type,
                data: state.into_data(),
                result,
            }),
        };
        self.events.push_back(event);
    }
}

fn incoming_message(
    frame: &CanFrame,
    decoded: &DecodedHeader,
    data: Vec<u8>,
    result: Confirmation,
) -> Message {
    Message {
        can_id: frame.raw_id(),
        key: decoded.key,
        id_type: decoded.id_type,
        message_type: decoded.message_type,
        data,
        result,
    }
}
