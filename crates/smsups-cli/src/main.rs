//! Command-line interface for the SMS UPS bridge.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use smsups_bridge::config::{BridgeConfig, MqttConfig, PollConfig, SerialConfig};
use smsups_bridge::discovery::Topics;
use smsups_bridge::mqtt::parse_command;
use smsups_protocol::FrameDialect;

/// Bridge an SMS Gamer UPS to MQTT with Home Assistant discovery.
#[derive(Parser, Debug)]
#[command(name = "smsups")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Broker options shared by every subcommand.
#[derive(clap::Args, Debug)]
struct BrokerArgs {
    /// MQTT broker host.
    #[arg(long, env = "SMSUPS_MQTT_BROKER")]
    broker: String,

    /// MQTT broker port.
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    /// MQTT username.
    #[arg(long, env = "SMSUPS_MQTT_USERNAME")]
    username: Option<String>,

    /// MQTT password.
    #[arg(long, env = "SMSUPS_MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// MQTT client ID (auto-generated if omitted).
    #[arg(long)]
    client_id: Option<String>,

    /// Base topic for state, availability and commands.
    #[arg(long, default_value = "smsups/ups")]
    topic_base: String,

    /// Home Assistant discovery prefix.
    #[arg(long, default_value = "homeassistant")]
    discovery_prefix: String,

    /// Stable device identifier for discovery unique IDs.
    #[arg(long, default_value = "smsups_gamer")]
    device_id: String,
}

impl BrokerArgs {
    fn into_config(self) -> MqttConfig {
        let mut config = MqttConfig::new(self.broker).with_port(self.mqtt_port);
        if let (Some(username), Some(password)) = (self.username, self.password) {
            config = config.with_auth(username, password);
        }
        if let Some(client_id) = self.client_id {
            config = config.with_client_id(client_id);
        }
        config.topic_base = self.topic_base;
        config.discovery_prefix = self.discovery_prefix;
        config.device_id = self.device_id;
        config
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge daemon.
    Run {
        /// Serial device path.
        #[arg(long, default_value = "/dev/ttyUSB0", env = "SMSUPS_SERIAL_PORT")]
        port: String,

        /// Serial baud rate.
        #[arg(long, default_value_t = 2400)]
        baud: u32,

        /// Serial read timeout in seconds.
        #[arg(long, default_value_t = 3)]
        serial_timeout: u64,

        /// Status frame dialect (gamer or legacy).
        #[arg(long, default_value_t = FrameDialect::Gamer)]
        dialect: FrameDialect,

        /// Seconds between status polls.
        #[arg(long, default_value_t = 10)]
        interval: u64,

        /// Seconds between unconditional republishes.
        #[arg(long, default_value_t = 120)]
        heartbeat: u64,

        /// Minimum numeric change worth publishing.
        #[arg(long, default_value_t = 0.5)]
        epsilon: f32,

        /// Consecutive poll failures before reporting unavailable.
        #[arg(long, default_value_t = 3)]
        failure_threshold: u32,

        #[command(flatten)]
        broker: BrokerArgs,
    },
    /// Send one command to a running bridge through the broker and exit.
    Send {
        /// Action name: toggle_beep, battery_test, battery_discharge,
        /// cancel, shutdown_restore.
        action: String,

        /// Battery test duration in seconds.
        #[arg(long)]
        seconds: Option<u64>,

        /// Shutdown delay in seconds.
        #[arg(long)]
        delay_secs: Option<u64>,

        #[command(flatten)]
        broker: BrokerArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let json_logging = std::env::var("SMSUPS_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if args.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("smsups={default_level}")));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }

    match args.command {
        Command::Run {
            port,
            baud,
            serial_timeout,
            dialect,
            interval,
            heartbeat,
            epsilon,
            failure_threshold,
            broker,
        } => {
            let config = BridgeConfig {
                serial: SerialConfig {
                    port,
                    baud,
                    timeout_secs: serial_timeout,
                },
                mqtt: broker.into_config(),
                poll: PollConfig {
                    interval_secs: interval,
                    heartbeat_secs: heartbeat,
                    epsilon,
                    failure_threshold,
                    ..PollConfig::default()
                },
                dialect,
            };
            run_bridge(config).await
        }
        Command::Send {
            action,
            seconds,
            delay_secs,
            broker,
        } => send_command(&action, seconds, delay_secs, broker.into_config()).await,
    }
}

/// Run the daemon until SIGINT.
async fn run_bridge(config: BridgeConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "signal handler failed");
        }
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    smsups_bridge::run(config, shutdown_rx).await?;
    Ok(())
}

/// Publish one command payload to the bridge's command topic.
async fn send_command(
    action: &str,
    seconds: Option<u64>,
    delay_secs: Option<u64>,
    config: MqttConfig,
) -> Result<()> {
    let mut envelope = serde_json::json!({ "action": action });
    if let Some(seconds) = seconds {
        envelope["seconds"] = seconds.into();
    }
    if let Some(delay_secs) = delay_secs {
        envelope["delay_secs"] = delay_secs.into();
    }
    let payload = envelope.to_string();

    // Validate locally before touching the broker, so typos fail fast.
    let request = parse_command(payload.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid command: {e}"))?;

    let topics = Topics::from_config(&config);
    let mut options = rumqttc::MqttOptions::new(
        config.effective_client_id(),
        &config.broker,
        config.port,
    );
    options.set_keep_alive(Duration::from_secs(10));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    let (client, mut eventloop) = rumqttc::AsyncClient::new(options, 4);
    client
        .publish(&topics.command, rumqttc::QoS::AtLeastOnce, false, payload)
        .await?;

    // Drive the event loop until the broker acknowledges the publish.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, eventloop.poll()).await;
        match event {
            Ok(Ok(rumqttc::Event::Incoming(rumqttc::Packet::PubAck(_)))) => break,
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => anyhow::bail!("broker connection failed: {e}"),
            Err(_) => anyhow::bail!("timed out waiting for broker acknowledgement"),
        }
    }

    println!("sent {} to {}", request.label(), topics.command);
    Ok(())
}
