//! Tokio front-end for [`IsoTpStack`].
//!
//! [`IsoTpAsyncStack::start`] moves the engine and a [`CanTransport`] into one background task.
//! That task is the only place where protocol state changes: application commands, received
//! frames and timer expiries are processed one at a time. Applications talk to it through cheap,
//! cloneable [`IsoTpHandle`]s and read received messages with [`IsoTpAsyncStack::recv`].

use std::collections::{HashMap, VecDeque};
use std::future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, trace, warn};

use crate::address::{ConversationKey, Mapping};
use crate::async_io::{CanTransport, TransportError};
use crate::config::IsoTpConfig;
use crate::errors::{Confirmation, IsoTpError, TimeoutKind};
use crate::flow::RxFlowControl;
use crate::stack::{IsoTpStack, SendOptions, StackEvent, TransmitStatus};
use crate::timer::TokioClock;
use crate::{Message, MessageType};

const COMMAND_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug)]
enum Command {
    Send {
        key: ConversationKey,
        payload: Vec<u8>,
        options: SendOptions,
        reply: Reply<Result<Confirmation, IsoTpError>>,
        response: Option<Reply<Message>>,
    },
    Reset {
        key: ConversationKey,
        reply: Reply<bool>,
    },
    ResetAll {
        reply: Reply<()>,
    },
    AddMapping {
        mapping: Mapping,
        reply: Reply<Result<(), IsoTpError>>,
    },
    RemoveMapping {
        can_id: u32,
        reply: Reply<Result<(), IsoTpError>>,
    },
    SetRxFlowControl {
        fc: RxFlowControl,
        reply: Reply<()>,
    },
    Shutdown,
}

struct Parts {
    stack: IsoTpStack<TokioClock>,
    commands: mpsc::Receiver<Command>,
    messages: mpsc::Sender<Message>,
}

/// ISO-TP stack running on a tokio task.
///
/// Lifecycle: [`new`](Self::new) → [`start`](Self::start) → [`shutdown`](Self::shutdown). A stack
/// starts at most once.
pub struct IsoTpAsyncStack {
    commands: mpsc::Sender<Command>,
    parts: Option<Parts>,
    messages: mpsc::Receiver<Message>,
    task: Option<JoinHandle<Result<(), IsoTpError>>>,
}

impl IsoTpAsyncStack {
    /// Build a stopped stack; the configuration is validated.
    pub fn new(cfg: IsoTpConfig) -> Result<Self, IsoTpError> {
        let capacity = cfg.event_queue_capacity;
        let stack = IsoTpStack::new(cfg, TokioClock)?;
        let (message_tx, messages) = mpsc::channel(capacity);
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        Ok(Self {
            commands,
            parts: Some(Parts {
                stack,
                commands: command_rx,
                messages: message_tx,
            }),
            messages,
            task: None,
        })
    }

    /// Spawn the event loop over `transport`. Must be called within a tokio runtime.
    pub fn start<T>(&mut self, transport: T) -> Result<(), IsoTpError>
    where
        T: CanTransport + 'static,
    {
        let Some(parts) = self.parts.take() else {
            return Err(IsoTpError::AlreadyInitialized);
        };
        let driver = Driver {
            stack: parts.stack,
            transport,
            commands: parts.commands,
            messages: parts.messages,
            backlog: VecDeque::new(),
            pending: HashMap::new(),
            responders: HashMap::new(),
        };
        self.task = Some(tokio::spawn(driver.run()));
        debug!("isotp stack started");
        Ok(())
    }

    /// `true` while the event loop runs.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Handle for issuing commands.
    pub fn handle(&self) -> Result<IsoTpHandle, IsoTpError> {
        if self.task.is_none() {
            return Err(IsoTpError::NotInitialized);
        }
        Ok(IsoTpHandle {
            commands: self.commands.clone(),
        })
    }

    /// Next received message, failed reception or pending indication.
    ///
    /// Fails with [`IsoTpError::NotInitialized`] before `start` and once the event loop stopped and
    /// every buffered message was read.
    pub async fn recv(&mut self) -> Result<Message, IsoTpError> {
        if self.parts.is_some() {
            return Err(IsoTpError::NotInitialized);
        }
        self.messages.recv().await.ok_or(IsoTpError::NotInitialized)
    }

    /// Next buffered message, without waiting.
    pub fn try_recv(&mut self) -> Result<Message, IsoTpError> {
        if self.parts.is_some() {
            return Err(IsoTpError::NotInitialized);
        }
        self.messages.try_recv().map_err(|err| match err {
            mpsc::error::TryRecvError::Empty => IsoTpError::NoMessage,
            mpsc::error::TryRecvError::Disconnected => IsoTpError::NotInitialized,
        })
    }

    /// Stop the event loop. Pending sends are confirmed with [`Confirmation::GeneralError`].
    ///
    /// Fails with [`IsoTpError::Link`] when the loop had already stopped on a transport error.
    pub async fn shutdown(&mut self) -> Result<(), IsoTpError> {
        let Some(task) = self.task.take() else {
            return Err(IsoTpError::NotInitialized);
        };
        // The loop may already be gone if the transport failed.
        let _ = self.commands.send(Command::Shutdown).await;
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "isotp event loop ended abnormally");
                Ok(())
            }
        };
        debug!("isotp stack stopped");
        outcome
    }
}

impl Drop for IsoTpAsyncStack {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Cloneable command handle of a running [`IsoTpAsyncStack`].
///
/// Every call fails with [`IsoTpError::NotInitialized`] once the stack stopped.
#[derive(Debug, Clone)]
pub struct IsoTpHandle {
    commands: mpsc::Sender<Command>,
}

impl IsoTpHandle {
    /// Send `payload` to `key` and wait for the transfer result.
    ///
    /// Local rejections are errors; protocol outcomes (including failures such as
    /// [`Confirmation::TimeoutBs`]) are returned as the `Ok` value.
    pub async fn send(
        &self,
        key: ConversationKey,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Confirmation, IsoTpError> {
        self.send_with(key, payload, SendOptions::default()).await
    }

    /// [`send`](Self::send) with per-message CAN FD and priority overrides.
    pub async fn send_with(
        &self,
        key: ConversationKey,
        payload: impl Into<Vec<u8>>,
        options: SendOptions,
    ) -> Result<Confirmation, IsoTpError> {
        let payload = payload.into();
        self.command(|reply| Command::Send {
            key,
            payload,
            options,
            reply,
            response: None,
        })
        .await?
    }

    /// Send `payload` to `key` and wait up to `wait` for the peer's answer on `key.reversed()`.
    ///
    /// The answer is handed to this call instead of [`IsoTpAsyncStack::recv`]. `Ok(None)` means
    /// nothing arrived in time; a failed send is [`IsoTpError::Transfer`].
    pub async fn request(
        &self,
        key: ConversationKey,
        payload: impl Into<Vec<u8>>,
        wait: Duration,
    ) -> Result<Option<Message>, IsoTpError> {
        let payload = payload.into();
        let (responder, response) = oneshot::channel();
        let confirmation = self
            .command(|reply| Command::Send {
                key,
                payload,
                options: SendOptions::default(),
                reply,
                response: Some(responder),
            })
            .await??;
        if !confirmation.is_ok() {
            return Err(IsoTpError::Transfer(confirmation));
        }
        match timeout(wait, response).await {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(_)) => Err(IsoTpError::NotInitialized),
            Err(_) => {
                debug!(?key, "no response before deadline");
                Ok(None)
            }
        }
    }

    /// Abort the conversation of `key`; `false` when nothing was open.
    pub async fn reset(&self, key: ConversationKey) -> Result<bool, IsoTpError> {
        self.command(|reply| Command::Reset { key, reply }).await
    }

    /// Abort every conversation.
    pub async fn reset_all(&self) -> Result<(), IsoTpError> {
        self.command(|reply| Command::ResetAll { reply }).await
    }

    /// Register a static address mapping.
    pub async fn add_mapping(&self, mapping: Mapping) -> Result<(), IsoTpError> {
        self.command(|reply| Command::AddMapping { mapping, reply }).await?
    }

    /// Remove the mappings registered on `can_id`.
    pub async fn remove_mapping(&self, can_id: u32) -> Result<(), IsoTpError> {
        self.command(|reply| Command::RemoveMapping { can_id, reply }).await?
    }

    /// Change the BS/STmin advertised to remote senders.
    pub async fn set_rx_flow_control(&self, fc: RxFlowControl) -> Result<(), IsoTpError> {
        self.command(|reply| Command::SetRxFlowControl { fc, reply }).await
    }

    async fn command<R>(
        &self,
        build: impl FnOnce(Reply<R>) -> Command,
    ) -> Result<R, IsoTpError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| IsoTpError::NotInitialized)?;
        response.await.map_err(|_| IsoTpError::NotInitialized)
    }
}

struct Driver<T> {
    stack: IsoTpStack<TokioClock>,
    transport: T,
    commands: mpsc::Receiver<Command>,
    messages: mpsc::Sender<Message>,
    /// Messages waiting for room in `messages`; frames are not read while it is non-empty.
    backlog: VecDeque<Message>,
    pending: HashMap<ConversationKey, Reply<Result<Confirmation, IsoTpError>>>,
    /// Callers of [`IsoTpHandle::request`], by the key their answer arrives on.
    responders: HashMap<ConversationKey, Reply<Message>>,
}

impl<T: CanTransport> Driver<T> {
    async fn run(mut self) -> Result<(), IsoTpError> {
        let outcome = loop {
            self.flush().await;
            self.dispatch();
            let deadline = self.stack.next_deadline();
            let draining = !self.backlog.is_empty();
            let messages = self.messages.clone();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break Ok(()),
                    Some(command) => self.execute(command),
                },
                permit = messages.reserve(), if draining => match permit {
                    Ok(permit) => {
                        if let Some(message) = self.backlog.pop_front() {
                            permit.send(message);
                        }
                    }
                    Err(_) => {
                        trace!(dropped = self.backlog.len(), "message receiver gone");
                        self.backlog.clear();
                    }
                },
                received = self.transport.receive(), if !draining => match received {
                    Ok(frame) => {
                        if let Err(err) = self.stack.handle_frame(&frame, Instant::now()) {
                            warn!(%err, "received frame not processed");
                        }
                    }
                    Err(TransportError::NoMessage) => {}
                    Err(err) => {
                        warn!(%err, "transport receive failed, stopping");
                        break Err(IsoTpError::Link(err));
                    }
                },
                () = wait_until(deadline) => self.stack.handle_timeout(Instant::now()),
            }
        };
        self.stack.reset_all();
        self.dispatch();
        while let Some(message) = self.backlog.pop_front() {
            if self.messages.try_send(message).is_err() {
                warn!(dropped = self.backlog.len() + 1, "stopping with undelivered messages");
                break;
            }
        }
        outcome
    }

    async fn flush(&mut self) {
        while let Some(out) = self.stack.poll_transmit() {
            let cfg = self.stack.config();
            let limit = match out.receipt {
                Some(receipt) if receipt.kind == TimeoutKind::NAr => cfg.n_ar,
                _ => cfg.n_as,
            };
            let status = match timeout(limit, self.transport.transmit(&out.frame)).await {
                Ok(Ok(())) => TransmitStatus::Sent,
                Ok(Err(err)) => {
                    warn!(id = out.frame.raw_id(), %err, "frame transmission failed");
                    TransmitStatus::Failed
                }
                Err(_) => {
                    warn!(id = out.frame.raw_id(), "frame transmission timed out");
                    TransmitStatus::Failed
                }
            };
            if let Some(receipt) = out.receipt {
                self.stack
                    .on_transmit_result(receipt, status, Instant::now());
            }
        }
    }

    fn dispatch(&mut self) {
        while let Some(event) = self.stack.poll_event() {
            match event {
                StackEvent::Confirmed { key, result } => {
                    if !result.is_ok() {
                        self.responders.remove(&key.reversed());
                    }
                    match self.pending.remove(&key) {
                        Some(reply) => {
                            let _ = reply.send(Ok(result));
                        }
                        None => trace!(?key, %result, "confirmation without waiting caller"),
                    }
                }
                StackEvent::Received(message) | StackEvent::Indication(message) => {
                    self.deliver(message)
                }
            }
        }
    }

    fn deliver(&mut self, message: Message) {
        let message = match self.responders.remove(&message.key) {
            Some(responder) if message.message_type != MessageType::Indication => {
                match responder.send(message) {
                    Ok(()) => return,
                    Err(message) => message,
                }
            }
            Some(responder) => {
                self.responders.insert(message.key, responder);
                message
            }
            None => message,
        };
        if !self.backlog.is_empty() {
            self.backlog.push_back(message);
            return;
        }
        match self.messages.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                trace!(key = ?message.key, "message queue full, holding back reception");
                self.backlog.push_back(message);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("message receiver gone");
            }
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Send {
                key,
                payload,
                options,
                reply,
                response,
            } => match self.stack.send(key, payload, options, Instant::now()) {
                Ok(()) => {
                    self.pending.insert(key, reply);
                    if let Some(responder) = response {
                        self.responders.retain(|_, waiting| !waiting.is_closed());
                        self.responders.insert(key.reversed(), responder);
                    }
                }
                Err(err) => {
                    debug!(?key, %err, "send rejected");
                    let _ = reply.send(Err(err));
                }
            },
            Command::Reset { key, reply } => {
                let _ = reply.send(self.stack.reset(&key));
            }
            Command::ResetAll { reply } => {
                self.stack.reset_all();
                let _ = reply.send(());
            }
            Command::AddMapping { mapping, reply } => {
                let _ = reply.send(self.stack.add_mapping(mapping));
            }
            Command::RemoveMapping { can_id, reply } => {
                let _ = reply.send(self.stack.remove_mapping(can_id));
            }
            Command::SetRxFlowControl { fc, reply } => {
                self.stack.set_rx_flow_control(fc);
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}
