//! Polling loop behavior against a scripted transport.
//!
//! All tests run on a paused clock, so intervals and heartbeats elapse
//! instantly and deterministically.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use smsups_bridge::config::PollPolicy;
use smsups_bridge::poller::{CommandSlot, Poller, StateUpdate};
use smsups_bridge::transport::{ConnectionState, Transport};
use smsups_bridge::TransportError;
use smsups_protocol::frame::{checksum, TERMINATOR};
use smsups_protocol::{CommandRequest, FrameDialect};

/// One scripted answer to a read.
#[derive(Clone)]
enum Reply {
    Frame(Vec<u8>),
    Timeout,
}

/// Transport that replays a fixed script and records every write.
#[derive(Clone)]
struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    recoveries: Arc<Mutex<u32>>,
    state: Arc<Mutex<ConnectionState>>,
}

impl ScriptedTransport {
    fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().collect())),
            writes: Arc::new(Mutex::new(Vec::new())),
            recoveries: Arc::new(Mutex::new(0)),
            state: Arc::new(Mutex::new(ConnectionState::Connected)),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn written_commands(&self) -> Vec<u8> {
        self.writes.lock().unwrap().iter().map(|w| w[0]).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.writes.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    async fn read_frame(&mut self, max_wait: Duration) -> Result<Vec<u8>, TransportError> {
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Reply::Frame(bytes)) => Ok(bytes),
            Some(Reply::Timeout) | None => Err(TransportError::Timeout(max_wait)),
        }
    }

    async fn recover(&mut self) {
        *self.recoveries.lock().unwrap() += 1;
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }
}

fn status_frame(vin: u32, batt: u16, flags: u8) -> Vec<u8> {
    let mut frame = vec![0x3D];
    frame.extend_from_slice(&vin.to_be_bytes());
    frame.extend_from_slice(&2201u16.to_be_bytes());
    frame.extend_from_slice(&350u16.to_be_bytes());
    frame.extend_from_slice(&600u16.to_be_bytes());
    frame.extend_from_slice(&batt.to_be_bytes());
    frame.extend_from_slice(&255u16.to_be_bytes());
    frame.push(flags);
    frame.push(checksum(&frame));
    frame.push(TERMINATOR);
    frame
}

fn policy() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_secs(10),
        heartbeat: Duration::from_secs(120),
        epsilon: 0.5,
        failure_threshold: 3,
        command_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(3),
    }
}

struct Harness {
    transport: ScriptedTransport,
    commands: CommandSlot,
    updates: Arc<Mutex<Vec<StateUpdate>>>,
    shutdown_tx: watch::Sender<bool>,
    poll_task: tokio::task::JoinHandle<()>,
    collector: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(transport: ScriptedTransport, policy: PollPolicy) -> Self {
        let commands = CommandSlot::new();
        let (updates_tx, mut updates_rx) = watch::channel(StateUpdate::Offline);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let updates: Arc<Mutex<Vec<StateUpdate>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let collector = tokio::spawn(async move {
            while updates_rx.changed().await.is_ok() {
                let update = updates_rx.borrow_and_update().clone();
                sink.lock().unwrap().push(update);
            }
        });

        let poller = Poller::new(
            transport.clone(),
            FrameDialect::Gamer,
            policy,
            commands.clone(),
            updates_tx,
        );
        let poll_task = tokio::spawn(poller.run(shutdown_rx));

        Self {
            transport,
            commands,
            updates,
            shutdown_tx,
            poll_task,
            collector,
        }
    }

    async fn run_for(&self, time: Duration) {
        tokio::time::sleep(time).await;
    }

    async fn stop(self) -> Vec<StateUpdate> {
        let _ = self.shutdown_tx.send(true);
        let _ = self.poll_task.await;
        self.collector.abort();
        let updates = self.updates.lock().unwrap().clone();
        updates
    }
}

fn online_count(updates: &[StateUpdate]) -> usize {
    updates
        .iter()
        .filter(|u| matches!(u, StateUpdate::Online(_)))
        .count()
}

fn offline_count(updates: &[StateUpdate]) -> usize {
    updates
        .iter()
        .filter(|u| matches!(u, StateUpdate::Offline))
        .count()
}

#[tokio::test(start_paused = true)]
async fn unchanged_snapshots_are_published_once() {
    let frame = status_frame(2205, 1000, 0x09);
    let transport =
        ScriptedTransport::new((0..5).map(|_| Reply::Frame(frame.clone())));

    let harness = Harness::start(transport, policy());
    harness.run_for(Duration::from_secs(45)).await;
    let updates = harness.stop().await;

    // Five polls, identical data: one publish.
    assert_eq!(online_count(&updates), 1);
    assert_eq!(offline_count(&updates), 0);
}

#[tokio::test(start_paused = true)]
async fn changed_value_beyond_epsilon_republishes() {
    let transport = ScriptedTransport::new([
        Reply::Frame(status_frame(2205, 1000, 0x09)),
        // 0.3 V move, inside epsilon: suppressed.
        Reply::Frame(status_frame(2208, 1000, 0x09)),
        // 5 V move: published.
        Reply::Frame(status_frame(2255, 1000, 0x09)),
    ]);

    let harness = Harness::start(transport, policy());
    harness.run_for(Duration::from_secs(25)).await;
    let updates = harness.stop().await;

    assert_eq!(online_count(&updates), 2);
}

#[tokio::test(start_paused = true)]
async fn flag_change_always_republishes() {
    let transport = ScriptedTransport::new([
        Reply::Frame(status_frame(2205, 1000, 0x09)),
        // Same numbers, on-battery bit raised.
        Reply::Frame(status_frame(2205, 1000, 0x89)),
    ]);

    let harness = Harness::start(transport, policy());
    harness.run_for(Duration::from_secs(15)).await;
    let updates = harness.stop().await;

    assert_eq!(online_count(&updates), 2);
    match updates.last() {
        Some(StateUpdate::Online(snapshot)) => assert!(snapshot.flags.on_battery),
        other => panic!("unexpected final update: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeat_republishes_unchanged_data() {
    let frame = status_frame(2205, 1000, 0x09);
    let transport =
        ScriptedTransport::new((0..30).map(|_| Reply::Frame(frame.clone())));

    let harness = Harness::start(transport, policy());
    // Two heartbeat windows plus slack.
    harness.run_for(Duration::from_secs(250)).await;
    let updates = harness.stop().await;

    // Initial publish plus one per elapsed heartbeat window.
    assert_eq!(online_count(&updates), 3);
}

#[tokio::test(start_paused = true)]
async fn exactly_one_offline_after_threshold() {
    let transport = ScriptedTransport::new((0..8).map(|_| Reply::Timeout));

    let harness = Harness::start(transport, policy());
    harness.run_for(Duration::from_secs(80)).await;
    let updates = harness.stop().await;

    // Eight failed polls, threshold three: a single unavailability report.
    assert_eq!(offline_count(&updates), 1);
    assert_eq!(online_count(&updates), 0);
}

#[tokio::test(start_paused = true)]
async fn degraded_link_goes_unavailable_without_waiting_for_threshold() {
    let transport = ScriptedTransport::new((0..2).map(|_| Reply::Timeout));
    transport.set_state(ConnectionState::Degraded);

    let harness = Harness::start(transport, policy());
    harness.run_for(Duration::from_secs(5)).await;
    let updates = harness.stop().await;

    // The transport already knows the link is bad; one failed poll is
    // enough to report unavailable.
    assert_eq!(offline_count(&updates), 1);
}

#[tokio::test(start_paused = true)]
async fn recovery_after_offline_publishes_again() {
    let frame = status_frame(2205, 1000, 0x09);
    let mut script: Vec<Reply> = (0..3).map(|_| Reply::Timeout).collect();
    script.push(Reply::Frame(frame.clone()));
    script.push(Reply::Frame(frame));
    let transport = ScriptedTransport::new(script);

    let harness = Harness::start(transport, policy());
    harness.run_for(Duration::from_secs(50)).await;
    let updates = harness.stop().await;

    assert_eq!(offline_count(&updates), 1);
    // Back online: the first good snapshot goes out even though nothing
    // changed since before the outage.
    assert_eq!(online_count(&updates), 1);
    assert!(matches!(updates.last(), Some(StateUpdate::Online(_))));
}

#[tokio::test(start_paused = true)]
async fn partial_frames_are_stitched_together() {
    let frame = status_frame(2205, 1000, 0x09);
    let (head, tail) = frame.split_at(9);
    let transport = ScriptedTransport::new([
        Reply::Frame(head.to_vec()),
        Reply::Frame(tail.to_vec()),
    ]);

    let harness = Harness::start(transport, policy());
    harness.run_for(Duration::from_secs(5)).await;
    let updates = harness.stop().await;

    assert_eq!(online_count(&updates), 1);
}

#[tokio::test(start_paused = true)]
async fn read_split_at_embedded_0x0d_measurement_byte_recovers() {
    // Load of 1.3% puts a 0x0D data byte at offset 8; the serial layer
    // stops reading there, so the frame arrives in two chunks with the
    // first one ending in 0x0D.
    let mut frame = vec![0x3D];
    frame.extend_from_slice(&2205u32.to_be_bytes());
    frame.extend_from_slice(&2201u16.to_be_bytes());
    frame.extend_from_slice(&13u16.to_be_bytes());
    frame.extend_from_slice(&600u16.to_be_bytes());
    frame.extend_from_slice(&1000u16.to_be_bytes());
    frame.extend_from_slice(&255u16.to_be_bytes());
    frame.push(0x09);
    frame.push(checksum(&frame));
    frame.push(TERMINATOR);
    assert_eq!(frame[8], TERMINATOR);

    let (head, tail) = frame.split_at(9);
    let transport = ScriptedTransport::new([
        Reply::Frame(head.to_vec()),
        Reply::Frame(tail.to_vec()),
    ]);

    let harness = Harness::start(transport, policy());
    harness.run_for(Duration::from_secs(5)).await;
    let updates = harness.stop().await;

    assert_eq!(offline_count(&updates), 0);
    match updates.last() {
        Some(StateUpdate::Online(snapshot)) => {
            assert_eq!(snapshot.load_percent, Some(1.3));
        }
        other => panic!("unexpected final update: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn corrupt_frame_does_not_go_offline_below_threshold() {
    let mut corrupt = status_frame(2205, 1000, 0x09);
    corrupt[16] ^= 0xFF;
    let transport = ScriptedTransport::new([
        Reply::Frame(corrupt),
        Reply::Frame(status_frame(2205, 1000, 0x09)),
    ]);

    let harness = Harness::start(transport, policy());
    harness.run_for(Duration::from_secs(15)).await;
    let updates = harness.stop().await;

    // One bad frame then a good one: never offline, one publish.
    assert_eq!(offline_count(&updates), 0);
    assert_eq!(online_count(&updates), 1);
}

#[tokio::test(start_paused = true)]
async fn pending_command_sent_before_status_poll() {
    let frame = status_frame(2205, 1000, 0x09);
    let transport = ScriptedTransport::new([
        Reply::Frame(frame.clone()),
        // Ack for the beep toggle, then the next status reply.
        Reply::Frame(vec![0x30, TERMINATOR]),
        Reply::Frame(frame),
    ]);

    let harness = Harness::start(transport, policy());
    harness.run_for(Duration::from_secs(5)).await;
    harness.commands.replace(CommandRequest::ToggleBeep).await;
    harness.run_for(Duration::from_secs(10)).await;

    let commands = harness.transport.written_commands();
    harness.stop().await;

    // Q, then M ahead of the next Q.
    assert_eq!(commands, vec![b'Q', b'M', b'Q']);
}

#[tokio::test(start_paused = true)]
async fn newer_command_overwrites_unserviced_one() {
    let slot = CommandSlot::new();
    slot.replace(CommandRequest::StartBatteryDischarge).await;
    slot.replace(CommandRequest::CancelOperation).await;

    assert_eq!(slot.take().await, Some(CommandRequest::CancelOperation));
    assert_eq!(slot.take().await, None);
}
