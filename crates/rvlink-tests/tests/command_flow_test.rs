//! Command runner integration tests
//!
//! Drive the runner through realistic actuator flows: a hold-to-run awning
//! motor (repeated identical frames), direction reversal mid-command, and
//! session gating against a controller that pushes back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rvlink_device::mock::{MockDeviceHandle, MockPidTransport, MockSessionController};
use rvlink_device::{
    CommandConfig, CommandControl, CommandPacket, CommandPoll, CommandResult, CommandRunner,
    CommandSendOptions, SessionError, SessionType,
};

const CMD_EXTEND: u8 = 0x41;
const CMD_RETRACT: u8 = 0x42;

fn harness() -> (
    Arc<CommandRunner>,
    Arc<MockPidTransport>,
    Arc<MockSessionController>,
    Arc<MockDeviceHandle>,
) {
    let device = Arc::new(MockDeviceHandle::new("awning-motor"));
    let transport = Arc::new(MockPidTransport::new());
    let sessions = Arc::new(MockSessionController::new());
    let runner = CommandRunner::new(
        device.clone(),
        transport.clone(),
        sessions.clone(),
        CommandConfig::default(),
    );
    (runner, transport, sessions, device)
}

#[tokio::test(start_paused = true)]
async fn hold_to_run_resends_until_the_poll_confirms() {
    let (runner, transport, sessions, _) = harness();

    // Motor reports "still moving" for five polls, then "in position".
    let polls = Arc::new(AtomicUsize::new(0));
    let poll: CommandPoll = {
        let polls = polls.clone();
        Arc::new(move || {
            if polls.fetch_add(1, Ordering::SeqCst) < 5 {
                CommandControl::WaitAndResend
            } else {
                CommandControl::Completed
            }
        })
    };

    let result = runner
        .send(
            CommandPacket::new(CMD_EXTEND, vec![0x01]),
            CommandSendOptions::with_poll(poll),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(result, CommandResult::Completed);
    assert_eq!(transport.raw_commands().len(), 6);
    assert!(transport
        .raw_commands()
        .iter()
        .all(|(byte, payload)| *byte == CMD_EXTEND && payload == &vec![0x01]));
    // One session for the whole retry sequence, not one per resend.
    assert_eq!(sessions.activation_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn direction_reversal_cancels_the_running_command() {
    let (runner, transport, _, _) = harness();
    let hold: CommandPoll = Arc::new(|| CommandControl::WaitAndResend);

    let extend = runner.send(
        CommandPacket::new(CMD_EXTEND, vec![0x01]),
        CommandSendOptions::with_poll(hold),
        CancellationToken::new(),
    );
    tokio::time::sleep(Duration::from_millis(120)).await;

    // User flips direction: the extend must stop before retract runs.
    let confirm: CommandPoll = Arc::new(|| CommandControl::Completed);
    let retract = runner.send(
        CommandPacket::new(CMD_RETRACT, vec![0x01]),
        CommandSendOptions {
            cancel_current_command: true,
            ..CommandSendOptions::with_poll(confirm)
        },
        CancellationToken::new(),
    );

    assert_eq!(extend.await, CommandResult::Canceled);
    assert_eq!(retract.await, CommandResult::Completed);

    // No extend frame was sent after the retract frame.
    let frames = transport.raw_commands();
    let last_extend = frames.iter().rposition(|(b, _)| *b == CMD_EXTEND);
    let first_retract = frames.iter().position(|(b, _)| *b == CMD_RETRACT);
    assert!(last_extend.unwrap() < first_retract.unwrap());
}

#[tokio::test(start_paused = true)]
async fn burst_of_sends_resolves_deterministically() {
    let (runner, _, _, _) = harness();
    let hold: CommandPoll = Arc::new(|| CommandControl::WaitNoResend);

    let first = runner.send(
        CommandPacket::new(CMD_EXTEND, vec![0x01]),
        CommandSendOptions::with_poll(hold.clone()),
        CancellationToken::new(),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Three more sends before the first finishes, each asking to replace
    // the running command: only the newest survives.
    let second = runner.send(
        CommandPacket::new(CMD_RETRACT, vec![0x01]),
        CommandSendOptions {
            cancel_current_command: true,
            ..CommandSendOptions::with_poll(hold.clone())
        },
        CancellationToken::new(),
    );
    let third = runner.send(
        CommandPacket::new(CMD_RETRACT, vec![0x01]),
        CommandSendOptions {
            cancel_current_command: true,
            ..CommandSendOptions::with_poll(hold.clone())
        },
        CancellationToken::new(),
    );
    let confirm: CommandPoll = Arc::new(|| CommandControl::Completed);
    let fourth = runner.send(
        CommandPacket::new(CMD_EXTEND, vec![0x02]),
        CommandSendOptions {
            cancel_current_command: true,
            ..CommandSendOptions::with_poll(confirm)
        },
        CancellationToken::new(),
    );

    assert_eq!(second.await, CommandResult::CanceledWithSameCommand);
    assert_eq!(third.await, CommandResult::Canceled);
    assert_eq!(first.await, CommandResult::Canceled);
    assert_eq!(fourth.await, CommandResult::Completed);
}

#[tokio::test(start_paused = true)]
async fn stuck_motor_hits_the_processing_cap() {
    let (runner, _, _, _) = harness();
    // Device state never confirms; the cap (3s) bounds the wait.
    let stuck: CommandPoll = Arc::new(|| CommandControl::WaitAndResend);
    let started = tokio::time::Instant::now();
    let result = runner
        .send(
            CommandPacket::new(CMD_EXTEND, vec![0x01]),
            CommandSendOptions::with_poll(stuck),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(result, CommandResult::ErrorCommandTimeout);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn session_denied_then_granted_across_commands() {
    let (runner, _, sessions, _) = harness();
    sessions.queue_activation_error(SessionError::NotAcceptingCommands);

    let denied = runner
        .send(
            CommandPacket::new(CMD_EXTEND, vec![0x01]),
            CommandSendOptions::default(),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(denied, CommandResult::ErrorCommandNotAllowed);

    let granted = runner
        .send(
            CommandPacket::new(CMD_EXTEND, vec![0x01]),
            CommandSendOptions::default(),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(granted, CommandResult::Completed);
}

#[tokio::test(start_paused = true)]
async fn diagnostic_session_commands_close_the_session_when_asked() {
    let (runner, _, sessions, _) = harness();
    let options = CommandSendOptions {
        session: SessionType::Diagnostic,
        close_session_when_done: true,
        ..CommandSendOptions::default()
    };
    let result = runner
        .send(
            CommandPacket::new(0x10, vec![]),
            options,
            CancellationToken::new(),
        )
        .await;
    assert_eq!(result, CommandResult::Completed);
    assert_eq!(sessions.deactivations(), vec![(SessionType::Diagnostic, true)]);
}

#[tokio::test(start_paused = true)]
async fn ungated_command_skips_the_session_controller() {
    let (runner, transport, sessions, _) = harness();
    let options = CommandSendOptions {
        session: SessionType::None,
        ..CommandSendOptions::default()
    };
    let result = runner
        .send(
            CommandPacket::new(0x05, vec![0xaa]),
            options,
            CancellationToken::new(),
        )
        .await;
    assert_eq!(result, CommandResult::Completed);
    assert_eq!(sessions.activation_count(), 0);
    assert_eq!(transport.raw_commands().len(), 1);
}
