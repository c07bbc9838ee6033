//! xbgw-streams CLI
//!
//! Command-line client for XBee gateway data streams:
//! - Watch live data points for a device
//! - Backfill a stream's history
//! - Set radio outputs and send serial data
//! - List devices with their connection status

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use xbgw_streams::streams::{expand_template, StreamKind, TopicError};
use xbgw_streams::{
    logging, Backfill, CloudClient, Config, DataPoint, DeviceStatusMap, Dispatcher, PushChannel,
    PushEvent,
};

#[derive(Parser)]
#[command(name = "xbgw-streams")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live data streams for XBee gateway dashboards")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Dashboard backend URL, overrides the config file
    #[arg(long, global = true)]
    pub cloud_url: Option<String>,

    /// Print points as JSON lines
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    #[command(flatten)]
    Cloud(CloudCommand),
}

/// Commands that talk to the dashboard backend
#[derive(Subcommand)]
pub enum CloudCommand {
    /// Print live data points for a device
    Watch {
        /// Gateway connect id, or "!" for any gateway
        device: String,
        /// Topics to watch (e.g. "xbee.analog/[!]/AD1")
        topics: Vec<String>,
        /// Radio address for --pin topics
        #[arg(short, long)]
        radio: Option<String>,
        /// Radio pins to watch (DIO0, AD1, serial); requires --radio
        #[arg(short, long)]
        pin: Vec<String>,
        /// Backfill each topic with stored history before streaming
        #[arg(short, long)]
        backfill: bool,
    },

    /// Print stored data points for one stream
    History {
        /// Gateway connect id
        device: String,
        /// Stream topic
        topic: String,
    },

    /// List devices and their connection status
    Devices,

    /// Set an output on a radio
    Output {
        /// Gateway connect id
        device: String,
        /// Radio extended address
        ext_addr: String,
        /// Output name (e.g. DIO4)
        name: String,
        /// Value, parsed as JSON when possible (true, 1, "text")
        value: String,
    },

    /// Send serial data to a radio
    Serial {
        /// Gateway connect id
        gateway: String,
        /// Radio extended address
        node: String,
        /// Data to send
        data: String,
        /// Data is already base64 encoded
        #[arg(long)]
        encoded: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { output } => write_default_config(output.as_deref()),
        Commands::Cloud(command) => {
            let mut config = match &cli.config {
                Some(path) => Config::load_with_env(path)?,
                None => Config::load_default(),
            };
            if let Some(url) = cli.cloud_url {
                config.cloud.base_url = url;
            }

            logging::init(&config.logging)?;
            tracing::debug!("xbgw-streams v{}", env!("CARGO_PKG_VERSION"));

            run(command, &config, cli.json).await
        }
    }
}

fn write_default_config(output: Option<&Path>) -> anyhow::Result<()> {
    let config = xbgw_streams::config::generate_default_config();
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &config)?;
            println!("Config written to {:?}", path);
        }
        None => print!("{}", config),
    }
    Ok(())
}

async fn run(command: CloudCommand, config: &Config, json_output: bool) -> anyhow::Result<()> {
    let client = Arc::new(CloudClient::new(&config.cloud)?);

    match command {
        CloudCommand::Watch {
            device,
            mut topics,
            radio,
            pin,
            backfill,
        } => {
            if !pin.is_empty() {
                let Some(radio) = radio.as_deref() else {
                    bail!("--pin requires --radio");
                };
                for pin in &pin {
                    topics.push(pin_topic(radio, pin)?);
                }
            }
            if topics.is_empty() {
                bail!("Nothing to watch: pass topics or --radio with --pin");
            }

            watch(config, client, &device, &topics, backfill, json_output).await?;
        }

        CloudCommand::History { device, topic } => {
            let dispatcher = Dispatcher::new(client);
            let _sub = dispatcher.listen(&device, &topic, move |point, _raw, device, topic| {
                print_point(device, topic, point, json_output);
            });

            match dispatcher.get_initial_data(&device, &topic).await? {
                Backfill::Delivered { points, dropped } => {
                    eprintln!("{} points ({} dropped)", points, dropped);
                }
                Backfill::Cancelled => eprintln!("Cancelled"),
            }
        }

        CloudCommand::Devices => {
            let devices = client.devices().await?;
            let statuses = DeviceStatusMap::new();
            statuses.load_devices(&devices);

            for device in &devices {
                let id = device["devConnectwareId"].as_str().unwrap_or("?");
                let state = match statuses.status(id) {
                    Some(1) => "connected".to_string(),
                    Some(other) => format!("disconnected ({})", other),
                    None => "unknown".to_string(),
                };
                println!("{:<40} {}", id, state);
            }
        }

        CloudCommand::Output {
            device,
            ext_addr,
            name,
            value,
        } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            client
                .output(&device, &ext_addr, &name, value.clone())
                .await
                .context("Output failed")?;
            println!("Set {} {} = {}", ext_addr, name, value);
        }

        CloudCommand::Serial {
            gateway,
            node,
            data,
            encoded,
        } => {
            client
                .send_serial(&gateway, &node, &data, encoded)
                .await
                .context("Serial send failed")?;
            println!("Sent {} bytes to {}", data.len(), node);
        }
    }

    Ok(())
}

async fn watch(
    config: &Config,
    client: Arc<CloudClient>,
    device: &str,
    topics: &[String],
    backfill: bool,
    json_output: bool,
) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(client.clone());
    let statuses = Arc::new(DeviceStatusMap::new());

    match client.devices().await {
        Ok(devices) => {
            statuses.load_devices(&devices);
        }
        Err(e) => tracing::warn!(error = %e, "Error loading initial device connectivity status"),
    }
    if !statuses.is_connected(device) {
        tracing::warn!(device_id = %device, "Device is not connected to the cloud");
    }

    let subs: Vec<_> = topics
        .iter()
        .map(|topic| {
            dispatcher.listen(device, topic, move |point, _raw, device, topic| {
                print_point(device, topic, point, json_output);
            })
        })
        .collect();

    let cancel = CancellationToken::new();
    let push = PushChannel::connect(&config.push, cancel.clone());

    let router = dispatcher.clone();
    let status_map = Arc::clone(&statuses);
    push.on_message(move |event| match event {
        PushEvent::DeviceData(payload) => {
            router.new_data(&payload);
        }
        PushEvent::DeviceStatus(payload) => {
            if let Some((id, status)) = status_map.apply_push(&payload) {
                tracing::info!(device_id = %id, status, "Device status changed");
            }
        }
    })?;

    let mut state = push.watch_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            tracing::info!(state = %current, "Push channel");
        }
    });

    if backfill {
        for topic in topics {
            match dispatcher.get_initial_data(device, topic).await {
                Ok(result) => tracing::info!(topic = %topic, result = ?result, "Backfill finished"),
                Err(e) => tracing::warn!(topic = %topic, error = %e, "Backfill failed"),
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    cancel.cancel();
    drop(subs);
    dispatcher.clear();
    Ok(())
}

/// Topic a dashboard widget would use for one radio pin
fn pin_topic(radio: &str, pin: &str) -> Result<String, TopicError> {
    let widget = json!({"radio": radio, "pin": pin});
    expand_template(&StreamKind::for_pin(pin).template("pin"), &widget)
}

fn print_point(device: &str, topic: &str, point: &DataPoint, json_output: bool) {
    if json_output {
        let line = json!({
            "device": device,
            "topic": topic,
            "value": point.value,
            "timestamp": point.timestamp,
        });
        println!("{}", line);
        return;
    }

    let when = chrono::DateTime::from_timestamp_millis(point.timestamp)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| point.timestamp.to_string());
    println!("{} {}/{} {}", when, device, topic, point.value);
}
