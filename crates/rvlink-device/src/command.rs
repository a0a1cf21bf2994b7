//! Session-gated command execution
//!
//! Raw device commands (latch a slide-out, hold an awning motor) only make
//! sense one at a time: the bus carries a single actuator state, so the
//! runner keeps at most one running and one queued command. Queueing a new
//! command displaces the queued one; a displaced identical command resolves
//! `CanceledWithSameCommand` so the caller can tell a repeat-press from a
//! real cancellation. Opting into `cancel_current_command` additionally
//! flags the running command replaced; a replaced command resolves
//! `Canceled` before its next transmit or poll.
//!
//! Execution is gated on a control session. Activation failures that mean
//! "someone else already holds it" are treated as success; the rest map to
//! terminal results. After the raw frame goes out, an optional poll callback
//! drives a retry loop (fixed interval, hard processing cap) that can ask
//! for a resend, a bare wait, completion, or cancellation.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rvlink_core::{
    ActiveConnection, DeviceHandle, PidTransport, SessionController, SessionError, SessionType,
};

use crate::config::CommandConfig;

/// Longest raw payload one bus frame can carry.
pub const MAX_COMMAND_PAYLOAD: usize = 8;

/// One raw command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub command_byte: u8,
    pub payload: Vec<u8>,
}

impl CommandPacket {
    pub fn new(command_byte: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command_byte,
            payload: payload.into(),
        }
    }
}

impl std::fmt::Display for CommandPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cmd 0x{:02x} [{}]", self.command_byte, hex::encode(&self.payload))
    }
}

/// What the poll callback wants the runner to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandControl {
    /// Device state confirms the command took effect
    Completed,
    /// Stop processing; the command no longer applies
    Cancel,
    /// Re-send the frame, then poll again after the retry interval
    WaitAndResend,
    /// Poll again after the retry interval without re-sending
    WaitNoResend,
}

/// Terminal result of one submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Completed,
    Canceled,
    /// Displaced from the queue by a command carrying the identical frame
    CanceledWithSameCommand,
    /// The frame was rejected before it reached the bus
    ErrorQueueingCommand,
    ErrorDeviceOffline,
    /// The device is reachable only through a relay that forbids commands
    ErrorRemoteOperationNotSupported,
    /// The control session could not be acquired in time
    ErrorSessionTimeout,
    /// The device refuses commands in its current state
    ErrorCommandNotAllowed,
    /// The processing cap elapsed before the poll callback saw completion
    ErrorCommandTimeout,
    ErrorOther,
}

impl CommandResult {
    pub fn is_success(self) -> bool {
        self == CommandResult::Completed
    }
}

/// Poll callback inspecting last-known device state after a send.
pub type CommandPoll = Arc<dyn Fn() -> CommandControl + Send + Sync>;

/// Per-send options.
#[derive(Clone)]
pub struct CommandSendOptions {
    /// Session required before the frame goes out; `None` skips gating
    pub session: SessionType,
    /// Close the session on the device when this command finishes
    pub close_session_when_done: bool,
    /// Optional completion poll; without one the send is fire-and-forget
    pub poll: Option<CommandPoll>,
    /// Wait this long after each transmit before polling device state;
    /// zero polls immediately
    pub response_time_ms: u64,
    /// Skip the automatic transit-lockout clear on devices that want one
    pub suppress_lockout_clear: bool,
    /// Flag the currently running command replaced; it resolves `Canceled`
    /// before its next transmit or poll instead of running to completion
    pub cancel_current_command: bool,
}

impl Default for CommandSendOptions {
    fn default() -> Self {
        Self {
            session: SessionType::RemoteControl,
            close_session_when_done: false,
            poll: None,
            response_time_ms: 0,
            suppress_lockout_clear: false,
            cancel_current_command: false,
        }
    }
}

impl CommandSendOptions {
    pub fn with_poll(poll: CommandPoll) -> Self {
        Self {
            poll: Some(poll),
            ..Self::default()
        }
    }
}

/// Awaitable handle for one submitted command.
pub struct PendingCommand {
    rx: oneshot::Receiver<CommandResult>,
}

impl PendingCommand {
    fn resolved(result: CommandResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for PendingCommand {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender can only mean the runner went away mid-teardown.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(CommandResult::Canceled))
    }
}

struct QueuedCommand {
    packet: CommandPacket,
    options: CommandSendOptions,
    cancel: CancellationToken,
    tx: oneshot::Sender<CommandResult>,
}

struct RunningSlot {
    replaced: Arc<AtomicBool>,
}

struct RunnerState {
    queued: Option<QueuedCommand>,
    running: Option<RunningSlot>,
    worker_active: bool,
    disposed: bool,
}

/// One runner per device; all raw commands for that device funnel through it.
pub struct CommandRunner {
    device: Arc<dyn DeviceHandle>,
    transport: Arc<dyn PidTransport>,
    sessions: Arc<dyn SessionController>,
    config: CommandConfig,
    state: Mutex<RunnerState>,
    /// Session held open across commands via `activate_session`
    held_session: Mutex<Option<SessionType>>,
    shutdown: CancellationToken,
}

impl CommandRunner {
    pub fn new(
        device: Arc<dyn DeviceHandle>,
        transport: Arc<dyn PidTransport>,
        sessions: Arc<dyn SessionController>,
        config: CommandConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            transport,
            sessions,
            config,
            state: Mutex::new(RunnerState {
                queued: None,
                running: None,
                worker_active: false,
                disposed: false,
            }),
            held_session: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Acquire the control session and hold it open across commands.
    /// Commands gated on the same session type then skip the per-command
    /// deactivation until `deactivate_session` releases it. "Already held
    /// elsewhere" activation outcomes count as success.
    pub async fn activate_session(
        &self,
        session: SessionType,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        match self.activate(session, cancel).await {
            Ok(()) => {}
            Err(e) if e.is_benign() => {
                debug!(device = %self.device.device_ref(), error = %e, "session already held, proceeding");
            }
            Err(e) => return Err(e),
        }
        *self.held_session.lock() = Some(session);
        Ok(())
    }

    /// Release a session held by `activate_session`. No-op when none is held.
    pub fn deactivate_session(&self, close_session: bool) {
        if let Some(session) = self.held_session.lock().take() {
            self.sessions
                .deactivate(session, self.device.device_ref(), close_session);
        }
    }

    /// Queue a command. A queued-but-not-started predecessor is displaced;
    /// with `cancel_current_command` set the running one is flagged replaced
    /// and resolves `Canceled` at its next step. Connectivity problems fail
    /// fast without touching the transport.
    pub fn send(
        self: &Arc<Self>,
        packet: CommandPacket,
        options: CommandSendOptions,
        cancel: CancellationToken,
    ) -> PendingCommand {
        if packet.payload.len() > MAX_COMMAND_PAYLOAD {
            warn!(device = %self.device.device_ref(), %packet, "payload exceeds one frame");
            return PendingCommand::resolved(CommandResult::ErrorQueueingCommand);
        }
        match self.device.active_connection() {
            ActiveConnection::Offline => {
                return PendingCommand::resolved(CommandResult::ErrorDeviceOffline)
            }
            ActiveConnection::Remote => {
                return PendingCommand::resolved(CommandResult::ErrorRemoteOperationNotSupported)
            }
            ActiveConnection::Direct => {}
        }
        // Best-effort side effect; never awaited for correctness.
        if self.device.auto_clear_transit_lockout() && !options.suppress_lockout_clear {
            self.device.clear_transit_lockout();
        }

        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.disposed || self.shutdown.is_cancelled() {
            return PendingCommand::resolved(CommandResult::Canceled);
        }
        if let Some(displaced) = state.queued.take() {
            let result = if displaced.packet == packet {
                CommandResult::CanceledWithSameCommand
            } else {
                CommandResult::Canceled
            };
            debug!(device = %self.device.device_ref(), ?result, "queued command displaced");
            let _ = displaced.tx.send(result);
        }
        if options.cancel_current_command {
            if let Some(running) = state.running.as_ref() {
                running.replaced.store(true, Ordering::SeqCst);
            }
        }
        state.queued = Some(QueuedCommand {
            packet,
            options,
            cancel,
            tx,
        });
        if !state.worker_active {
            state.worker_active = true;
            tokio::spawn(Arc::clone(self).run());
        }
        drop(state);
        PendingCommand { rx }
    }

    /// True while a command is queued or being processed.
    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.worker_active || state.queued.is_some()
    }

    /// Cancel everything; queued and running commands resolve `Canceled`
    /// and a held session is released without closing it on the wire.
    pub fn dispose(&self) {
        self.shutdown.cancel();
        {
            let mut state = self.state.lock();
            state.disposed = true;
            if let Some(queued) = state.queued.take() {
                let _ = queued.tx.send(CommandResult::Canceled);
            }
        }
        self.deactivate_session(false);
    }

    async fn run(self: Arc<Self>) {
        loop {
            let (queued, replaced) = {
                let mut state = self.state.lock();
                match state.queued.take() {
                    Some(q) => {
                        let replaced = Arc::new(AtomicBool::new(false));
                        state.running = Some(RunningSlot {
                            replaced: replaced.clone(),
                        });
                        (q, replaced)
                    }
                    None => {
                        state.running = None;
                        state.worker_active = false;
                        return;
                    }
                }
            };
            let result = self.execute(&queued, &replaced).await;
            self.state.lock().running = None;
            info!(device = %self.device.device_ref(), packet = %queued.packet, ?result, "command finished");
            let _ = queued.tx.send(result);
        }
    }

    async fn execute(&self, queued: &QueuedCommand, replaced: &AtomicBool) -> CommandResult {
        if self.shutdown.is_cancelled() || queued.cancel.is_cancelled() {
            return CommandResult::Canceled;
        }
        // Connectivity may have changed while the command sat queued.
        match self.device.active_connection() {
            ActiveConnection::Offline => return CommandResult::ErrorDeviceOffline,
            ActiveConnection::Remote => return CommandResult::ErrorRemoteOperationNotSupported,
            ActiveConnection::Direct => {}
        }
        let device_ref = self.device.device_ref();
        if self.device.firmware_update_active() && !device_ref.device_type.firmware_gate_exempt() {
            return CommandResult::ErrorCommandNotAllowed;
        }

        let session = queued.options.session;
        if session != SessionType::None {
            if let Err(result) = self.acquire_session(session, &queued.cancel).await {
                return result;
            }
        }

        let result = self.send_and_poll(queued, replaced).await;

        // A session held via activate_session outlives individual commands.
        if session != SessionType::None && *self.held_session.lock() != Some(session) {
            self.sessions
                .deactivate(session, device_ref, queued.options.close_session_when_done);
        }
        result
    }

    /// Acquire the control session for one command. Failures map directly
    /// to terminal results; this layer never retries activation.
    async fn acquire_session(
        &self,
        session: SessionType,
        cancel: &CancellationToken,
    ) -> Result<(), CommandResult> {
        match self.activate(session, cancel).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_benign() => {
                debug!(device = %self.device.device_ref(), error = %e, "session already held, proceeding");
                Ok(())
            }
            Err(e) => Err(map_session_error(e)),
        }
    }

    async fn activate(
        &self,
        session: SessionType,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        self.sessions
            .activate(
                session,
                self.device.device_ref(),
                cancel,
                self.config.session_keep_alive_ms,
                self.config.session_get_timeout_ms,
            )
            .await
    }

    async fn send_and_poll(&self, queued: &QueuedCommand, replaced: &AtomicBool) -> CommandResult {
        let device_ref = self.device.device_ref();
        // Replacement is re-checked before every transmit so a replaced
        // command never puts another frame on the bus.
        if replaced.load(Ordering::SeqCst) {
            return CommandResult::Canceled;
        }
        if !self
            .transport
            .send_raw_command(device_ref, queued.packet.command_byte, &queued.packet.payload)
        {
            return CommandResult::ErrorQueueingCommand;
        }

        let Some(poll) = queued.options.poll.as_ref() else {
            return CommandResult::Completed;
        };

        let deadline = Instant::now() + Duration::from_millis(self.config.max_processing_time_ms);
        let retry = Duration::from_millis(self.config.retry_interval_ms);
        let response_time = Duration::from_millis(queued.options.response_time_ms);
        loop {
            // The device needs its response-time budget after a transmit
            // before its state reflects the command.
            if !response_time.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return CommandResult::Canceled,
                    _ = queued.cancel.cancelled() => return CommandResult::Canceled,
                    _ = tokio::time::sleep(response_time) => {}
                }
            }
            if self.shutdown.is_cancelled() || queued.cancel.is_cancelled() {
                return CommandResult::Canceled;
            }
            if replaced.load(Ordering::SeqCst) {
                return CommandResult::Canceled;
            }

            let control = poll();
            match control {
                CommandControl::Completed => return CommandResult::Completed,
                CommandControl::Cancel => return CommandResult::Canceled,
                CommandControl::WaitAndResend | CommandControl::WaitNoResend => {
                    if Instant::now() >= deadline {
                        warn!(device = %device_ref, packet = %queued.packet, "processing cap elapsed");
                        return CommandResult::ErrorCommandTimeout;
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return CommandResult::Canceled,
                        _ = queued.cancel.cancelled() => return CommandResult::Canceled,
                        _ = tokio::time::sleep(retry) => {}
                    }
                    if control == CommandControl::WaitAndResend {
                        if replaced.load(Ordering::SeqCst) {
                            return CommandResult::Canceled;
                        }
                        if !self.transport.send_raw_command(
                            device_ref,
                            queued.packet.command_byte,
                            &queued.packet.payload,
                        ) {
                            return CommandResult::ErrorQueueingCommand;
                        }
                    }
                }
            }
        }
    }
}

fn map_session_error(error: SessionError) -> CommandResult {
    match error {
        SessionError::DeviceOffline => CommandResult::ErrorDeviceOffline,
        SessionError::Timeout => CommandResult::ErrorSessionTimeout,
        SessionError::InTransitLockout | SessionError::NotAcceptingCommands => {
            CommandResult::ErrorCommandNotAllowed
        }
        SessionError::Canceled => CommandResult::Canceled,
        SessionError::RemoteSessionActive
        | SessionError::SessionsDisabled
        | SessionError::NotAvailable
        | SessionError::Other(_) => CommandResult::ErrorOther,
    }
}
