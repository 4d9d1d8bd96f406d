use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use herald_core::{
    config::{load_services, Config},
    Endpoint, Event, EventBus, EventKind, Fields, Message, ServiceManager,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "herald", about = "Send and receive messages through configured services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Services file (overrides HERALD_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run every send through the pipeline without reaching a channel.
    #[arg(long, global = true, default_value_t = false)]
    suppress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered services and what they can do.
    Services,
    /// Send one message.
    Send {
        /// Service to send through; default is routing by the manager.
        #[arg(long)]
        via: Option<String>,
        /// Message field as `key=value`, repeatable.
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
        /// Extra fields as a JSON object, merged under `--field` values.
        #[arg(long)]
        json: Option<String>,
    },
    /// Receive messages and print them as JSON lines.
    Receive {
        #[arg(long)]
        via: Option<String>,
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
}

fn parse_field(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty field name in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Mirror pipeline events into the log.
fn bridge_events(bus: &EventBus) {
    for kind in [
        EventKind::AfterSend,
        EventKind::ReceiveMessage,
        EventKind::StatusCallback,
        EventKind::SessionOpened,
        EventKind::SessionClosed,
    ] {
        bus.subscribe(kind, |event| match event {
            Event::AfterSend { service, message } => debug!(
                service = %service.name(),
                id = message.id.as_deref().unwrap_or("-"),
                "after send"
            ),
            Event::ReceiveMessage { service, message } => debug!(
                service = %service.name(),
                id = message.id.as_deref().unwrap_or("-"),
                "message received"
            ),
            Event::StatusCallback { service, update } => debug!(
                service = %service.name(),
                id = %update.message_id,
                status = %update.status,
                "status callback"
            ),
            Event::SessionOpened { service } => debug!(service = %service.name(), "session opened"),
            Event::SessionClosed { service } => debug!(service = %service.name(), "session closed"),
            _ => {}
        });
    }
}

fn build_fields(pairs: Vec<(String, String)>, extra: Option<&str>) -> Result<Fields> {
    let mut fields = match extra {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("invalid --json")? {
            Value::Object(map) => map,
            _ => bail!("--json must be a JSON object"),
        },
        None => Fields::new(),
    };
    for (key, value) in pairs {
        fields.insert(key, Value::String(value));
    }
    Ok(fields)
}

fn summary(message: &Message) -> Value {
    json!({
        "id": message.id,
        "status": message.status().as_str(),
        "service": message.service().map(|s| s.name().to_string()),
        "body": message.payload.body(),
        "raw": message.raw,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    herald_core::logging::init("herald")?;

    let mut config = Config::load()?;
    if let Some(path) = cli.config {
        config.services = load_services(&path)?;
        config.config_path = path;
    }
    config.suppress_all |= cli.suppress;

    let events = EventBus::global();
    bridge_events(&events);

    let catalog = herald_drivers::builtin_catalog();
    let manager = ServiceManager::from_config("herald", &config, &catalog, events)?;
    info!(
        config = %config.config_path.display(),
        services = manager.len(),
        "loaded services"
    );

    let outcome = run(cli.command, &manager).await;

    if let Err(err) = manager.close().await {
        warn!(error = %err, "some services failed to close");
    }
    outcome
}

async fn run(command: Commands, manager: &ServiceManager) -> Result<()> {
    match command {
        Commands::Services => {
            for name in manager.names() {
                let Some(service) = manager.get(&name) else {
                    continue;
                };
                let caps = service.capabilities();
                println!(
                    "{name}\tsend={}\treceive={}\tsuppressed={}",
                    caps.can_send,
                    caps.can_receive,
                    service.is_suppressed()
                );
            }
        }
        Commands::Send { via, fields, json } => {
            let fields = build_fields(fields, json.as_deref())?;
            match manager.send(via.as_deref(), fields).await? {
                Some(message) => println!("{}", summary(&message)),
                None => eprintln!("send suppressed"),
            }
        }
        Commands::Receive { via, limit } => {
            manager
                .receive(limit, via.as_deref(), Fields::new())
                .try_for_each(|message| {
                    println!("{}", summary(&message));
                    futures::future::ready(Ok(()))
                })
                .await?;
        }
    }
    Ok(())
}
