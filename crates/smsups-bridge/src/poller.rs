//! The polling loop.
//!
//! One task owns the serial transport and drives the request/response
//! cycle: pending control commands are serviced first, then the regular
//! status poll. Results flow out through a `watch` channel, so the MQTT
//! side only ever sees the newest publishable state and nothing is buffered
//! beyond one value while the broker is away.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use smsups_protocol::{
    decode_device_info, decode_features, decode_status, encode_command, encode_query,
    CommandRequest, DecodeError, DeviceInfoFrame, FrameDialect, Query, RatedFeatures,
    UpsStatusSnapshot,
};

use crate::config::PollPolicy;
use crate::error::BridgeError;
use crate::transport::{ConnectionState, Transport};

/// How many reads may be stitched together for one status response before
/// the frame counts as failed.
const MAX_READ_ATTEMPTS: usize = 3;

/// What the bridge should tell the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// The link is down past the failure threshold; entities go unavailable.
    Offline,
    /// A fresh snapshot worth publishing.
    Online(UpsStatusSnapshot),
}

/// Single-slot pending command cell shared between the MQTT callback task
/// and the polling loop. Most-recent-wins: UPS commands do not compose, so
/// an unserviced older command is dropped, not queued.
#[derive(Clone, Default)]
pub struct CommandSlot {
    inner: Arc<Mutex<Option<CommandRequest>>>,
}

impl CommandSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a request, overwriting any unserviced one.
    pub async fn replace(&self, request: CommandRequest) {
        let mut slot = self.inner.lock().await;
        if let Some(dropped) = slot.replace(request) {
            warn!(
                dropped = dropped.label(),
                "overwriting unserviced pending command"
            );
        }
    }

    /// Claim the pending request, if any.
    pub async fn take(&self) -> Option<CommandRequest> {
        self.inner.lock().await.take()
    }
}

/// Probe the UPS for identification data. Best effort: a device that does
/// not answer the `I` query simply keeps its configured identity.
pub async fn probe_device_info<T: Transport>(
    transport: &mut T,
    max_wait: std::time::Duration,
) -> Option<DeviceInfoFrame> {
    let query = encode_query(Query::DeviceInfo);
    if let Err(e) = transport.write_frame(&query).await {
        debug!(error = %e, "device info probe write failed");
        return None;
    }
    let raw = match transport.read_frame(max_wait).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "device info probe got no reply");
            return None;
        }
    };
    match decode_device_info(&raw) {
        Ok(info) => {
            info!(raw = %info.raw, "UPS identified itself");
            Some(info)
        }
        Err(e) => {
            debug!(error = %e, "device info reply undecodable");
            None
        }
    }
}

/// Probe the UPS for its ratings. Best effort, like the info probe.
pub async fn probe_features<T: Transport>(
    transport: &mut T,
    max_wait: std::time::Duration,
) -> Option<RatedFeatures> {
    let query = encode_query(Query::Features);
    if let Err(e) = transport.write_frame(&query).await {
        debug!(error = %e, "features probe write failed");
        return None;
    }
    let raw = match transport.read_frame(max_wait).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "features probe got no reply");
            return None;
        }
    };
    match decode_features(&raw) {
        Ok(features) => Some(features),
        Err(e) => {
            debug!(error = %e, "features reply undecodable");
            None
        }
    }
}

/// Drives the poll cycle against one transport.
pub struct Poller<T: Transport> {
    transport: T,
    dialect: FrameDialect,
    policy: PollPolicy,
    commands: CommandSlot,
    updates: watch::Sender<StateUpdate>,
}

impl<T: Transport> Poller<T> {
    pub fn new(
        transport: T,
        dialect: FrameDialect,
        policy: PollPolicy,
        commands: CommandSlot,
        updates: watch::Sender<StateUpdate>,
    ) -> Self {
        Self {
            transport,
            dialect,
            policy,
            commands,
            updates,
        }
    }

    /// Run until the shutdown signal fires. Never returns an error: every
    /// transport and protocol failure is absorbed into state transitions.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.policy.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut failures: u32 = 0;
        let mut offline_reported = false;
        let mut last_published: Option<UpsStatusSnapshot> = None;
        let mut last_publish_at = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("polling loop stopping");
                    break;
                }
            }

            // Commands jump the queue but never overlap a status read:
            // one outstanding request at a time on the shared link.
            if let Some(request) = self.commands.take().await {
                self.service_command(&request).await;
            }

            match self.poll_status().await {
                Ok(snapshot) => {
                    failures = 0;
                    offline_reported = false;

                    let heartbeat_due = last_publish_at.elapsed() >= self.policy.heartbeat;
                    let changed = last_published
                        .as_ref()
                        .map_or(true, |prev| snapshot.differs_from(prev, self.policy.epsilon));

                    if changed || heartbeat_due {
                        debug!(
                            changed,
                            heartbeat_due,
                            flags = %snapshot.flags.summary(),
                            "publishing snapshot"
                        );
                        last_published = Some(snapshot.clone());
                        last_publish_at = Instant::now();
                        let _ = self.updates.send(StateUpdate::Online(snapshot));
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %e, failures, "status poll failed");

                    // A transport that already reports its link as down
                    // (degraded or lost) is not second-guessed until the
                    // failure counter catches up.
                    let link_down = self.transport.state() != ConnectionState::Connected;
                    if (failures >= self.policy.failure_threshold || link_down)
                        && !offline_reported
                    {
                        warn!(
                            failures,
                            link = %self.transport.state(),
                            "marking UPS unavailable"
                        );
                        offline_reported = true;
                        last_published = None;
                        let _ = self.updates.send(StateUpdate::Offline);
                    }

                    // Decode errors are just a bad frame; only transport
                    // faults warrant a close-and-reopen cycle.
                    if matches!(e, BridgeError::Transport(_)) {
                        tokio::select! {
                            _ = self.transport.recover() => {}
                            _ = shutdown.changed() => {
                                info!("polling loop stopping during recovery");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// One status request/response cycle.
    async fn poll_status(&mut self) -> Result<UpsStatusSnapshot, BridgeError> {
        let query = encode_query(Query::Status);
        self.transport.write_frame(&query).await?;

        let mut buf = Vec::new();
        let mut last_err = DecodeError::Empty;
        for _ in 0..MAX_READ_ATTEMPTS {
            let chunk = self.transport.read_frame(self.policy.read_timeout).await?;
            buf.extend_from_slice(&chunk);
            match decode_status(&buf, self.dialect) {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_incomplete() => {
                    debug!(have = buf.len(), "partial status frame, reading more");
                    last_err = e;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.into())
    }

    /// Write a control frame and wait briefly for the acknowledgement. A
    /// missing ack is logged, not fatal: the next status poll shows whether
    /// the UPS acted on it.
    async fn service_command(&mut self, request: &CommandRequest) {
        let frame = encode_command(request);
        info!(
            command = request.label(),
            frame = %hex::encode(&frame),
            "sending control command"
        );

        if let Err(e) = self.transport.write_frame(&frame).await {
            warn!(error = %e, command = request.label(), "command write failed");
            return;
        }

        match self.transport.read_frame(self.policy.command_timeout).await {
            Ok(ack) => debug!(ack = %hex::encode(&ack), "command acknowledged"),
            Err(e) => warn!(
                error = %e,
                command = request.label(),
                "no command acknowledgement"
            ),
        }
    }
}
