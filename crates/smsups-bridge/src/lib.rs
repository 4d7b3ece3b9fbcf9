//! UPS-to-MQTT bridge runtime.
//!
//! Wires the pieces together: a serial [`transport`] owned by the
//! [`poller`], state flowing over a watch channel to the [`mqtt`]
//! publisher, and commands flowing back through a shared single slot.

pub mod config;
pub mod discovery;
pub mod error;
pub mod mqtt;
pub mod poller;
pub mod transport;

pub use config::{BridgeConfig, MqttConfig, PollConfig, PollPolicy, SerialConfig};
pub use discovery::{DeviceIdentity, Topics};
pub use error::{BridgeError, Result, TransportError};
pub use mqtt::MqttBridge;
pub use poller::{CommandSlot, Poller, StateUpdate};
pub use transport::{ConnectionState, SerialTransport, Transport};

use tokio::sync::watch;
use tracing::{info, warn};

/// Run the bridge until `shutdown` flips to true.
///
/// The initial serial open is allowed to fail; recovery with backoff takes
/// over, so the daemon comes up cleanly even when the UPS is plugged in
/// later. Only configuration problems abort startup.
pub async fn run(config: BridgeConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    config.validate()?;
    let policy = PollPolicy::from_config(&config);

    let mut transport = SerialTransport::new(config.serial.clone(), policy.failure_threshold);
    if let Err(e) = transport.open().await {
        warn!(error = %e, "serial port not available yet, will keep retrying");
        let mut recover_shutdown = shutdown.clone();
        tokio::select! {
            _ = transport.recover() => {}
            _ = recover_shutdown.changed() => return Ok(()),
        }
    }

    let mut identity = DeviceIdentity::from_config(&config.mqtt);
    if let Some(info) = poller::probe_device_info(&mut transport, policy.read_timeout).await {
        identity.enrich(&info);
    }
    if let Some(features) = poller::probe_features(&mut transport, policy.read_timeout).await {
        info!(raw = %features.raw, "UPS rated features");
    }
    info!(
        model = %identity.model,
        firmware = identity.firmware.as_deref().unwrap_or("unknown"),
        "bridge starting"
    );

    let commands = CommandSlot::new();
    let (updates_tx, updates_rx) = watch::channel(StateUpdate::Offline);
    let bridge = MqttBridge::connect(
        &config.mqtt,
        &identity,
        commands.clone(),
        updates_rx.clone(),
    )?;
    let poller = Poller::new(
        transport,
        config.dialect,
        policy,
        commands,
        updates_tx,
    );

    let poll_task = tokio::spawn(poller.run(shutdown.clone()));
    bridge.run(updates_rx, shutdown).await;
    let _ = poll_task.await;

    info!("bridge stopped");
    Ok(())
}
