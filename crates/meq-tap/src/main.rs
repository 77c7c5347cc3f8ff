use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use meq_core::status::format_compact;
use meq_core::wire::{
    encode_frame, FrameError, NdjsonFrameDecoder, WireEvent, WireRequest, DEFAULT_MAX_FRAME_BYTES,
};
use meq_relay::inbox::POLL_SLICE;
use meq_relay::registry::RegistryConfig;
use meq_relay::{
    channel, Address, EventRelay, InboxSender, NodeFilter, RelayConfig, Transport,
    TransportError, WaitError, WaitTimeout,
};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::thread;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_WAIT_SECONDS: &str = "30";
const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct Config {
    event_prefix: String,
    wait: WaitTimeout,
    attach_pid: Option<i64>,
    attach_host: Option<String>,
    max_node_index: Option<i64>,
    request_list: bool,
    max_frame_bytes: usize,
    debug: bool,
}

/// Feeds NDJSON kernel events from stdin through the relay and writes
/// outbound requests to stdout.
#[derive(Parser, Debug)]
#[command(name = "meq-tap")]
struct Args {
    #[arg(long, default_value = "")]
    event_prefix: String,
    /// Seconds to wait for a server, or "forever".
    #[arg(long, default_value = "")]
    wait: String,
    #[arg(long)]
    attach_pid: Option<i64>,
    #[arg(long)]
    attach_host: Option<String>,
    #[arg(long)]
    max_node_index: Option<i64>,
    /// Ask the attached server for its node list once connected.
    #[arg(long, default_value_t = false)]
    request_list: bool,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

/// Writes each request as one NDJSON line.
struct StdoutTransport {
    max_frame_bytes: usize,
}

impl Transport for StdoutTransport {
    fn send(
        &mut self,
        event_id: &str,
        payload: Value,
        destination: &Address,
    ) -> Result<(), TransportError> {
        let request = WireRequest {
            event: event_id.to_string(),
            destination: destination.to_string(),
            payload,
        };
        let frame = encode_frame(&request, self.max_frame_bytes)
            .map_err(|err| TransportError::Send(err.to_string()))?;
        let mut stdout = io::stdout().lock();
        stdout
            .write_all(&frame)
            .and_then(|_| stdout.flush())
            .map_err(|err| match err.kind() {
                io::ErrorKind::BrokenPipe => TransportError::Closed,
                _ => TransportError::Send(err.to_string()),
            })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_logging(&config);

    let (sender, mut inbox) = channel();
    let reader = spawn_stdin_reader(sender, config.max_frame_bytes)?;

    let relay_config = RelayConfig {
        event_prefix: config.event_prefix.clone(),
        registry: RegistryConfig {
            max_node_index: config.max_node_index,
        },
        ..RelayConfig::default()
    };
    let mut relay = EventRelay::new(
        relay_config,
        Box::new(StdoutTransport {
            max_frame_bytes: config.max_frame_bytes,
        }),
    );

    relay.subscribe_nodes(NodeFilter::All, |change| {
        info!(
            event = "node_change",
            node = %change.node.index,
            name = %change.node.display_name(),
            old = %format_compact(&change.old),
            new = %format_compact(&change.new),
            at = %Utc::now().to_rfc3339()
        );
        Ok(())
    });
    relay.subscribe("Relay.Connection.*", |event| {
        info!(event = "connection_change", kind = %event.name, address = %event.source);
        Ok(())
    });

    if config.attach_pid.is_some() || config.attach_host.is_some() {
        relay.auto_attach_rule(config.attach_pid, config.attach_host.clone());
    }

    info!(event = "tap_waiting", wait = %config.wait, prefix = %config.event_prefix);
    match inbox.wait_for_connection(&mut relay, config.wait).await {
        Ok(address) => {
            if relay.connections().current_address().is_none() {
                relay.attach(&address)?;
            }
            if config.request_list {
                relay.request_node_list()?;
            }
        }
        Err(WaitError::InboxClosed) => {
            warn!(event = "tap_input_closed_before_connection");
        }
        Err(err) => return Err(err).context("waiting for a server"),
    }

    loop {
        match inbox.pump(&mut relay, POLL_SLICE).await {
            Ok(_) => {}
            Err(WaitError::InboxClosed) => break,
            Err(err) => {
                error!(event = "tap_pump_failed", error = %err);
                break;
            }
        }
    }
    inbox.drain(&mut relay);

    if reader.join().is_err() {
        warn!(event = "tap_reader_panicked");
    }

    let registry = relay.registry();
    info!(
        event = "tap_finished",
        delivered = relay.delivered(),
        nodes = registry.len(),
        roots = registry.roots().len(),
        placeholders = registry.placeholder_count(),
        serial = registry.serial(),
        connections = relay.connections().len()
    );
    Ok(())
}

fn spawn_stdin_reader(
    sender: InboxSender,
    max_frame_bytes: usize,
) -> anyhow::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("meq-tap-stdin".to_string())
        .spawn(move || {
            let mut decoder = NdjsonFrameDecoder::<WireEvent>::new(max_frame_bytes);
            let mut stdin = io::stdin().lock();
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                let read = match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(read) => read,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        error!(event = "tap_stdin_error", error = %err);
                        break;
                    }
                };
                let report = decoder.push_chunk(&buf[..read]);
                if !forward(&sender, report.frames, report.errors) {
                    return;
                }
            }
            let report = decoder.finish();
            forward(&sender, report.frames, report.errors);
            debug!(event = "tap_stdin_closed");
        })
        .context("spawning stdin reader")
}

fn forward(
    sender: &InboxSender,
    frames: Vec<WireEvent>,
    errors: Vec<FrameError>,
) -> bool {
    for err in errors {
        warn!(event = "tap_bad_frame", error = %err);
    }
    for frame in frames {
        if !sender.post(frame.event, frame.payload, Address::new(frame.source)) {
            return false;
        }
    }
    true
}

fn load_config() -> anyhow::Result<Config> {
    let args = Args::parse();
    let event_prefix = resolve_setting(&args.event_prefix, "MEQ_EVENT_PREFIX")
        .unwrap_or_else(|| RelayConfig::default().event_prefix);
    let wait = resolve_setting(&args.wait, "MEQ_WAIT_SECONDS")
        .unwrap_or_else(|| DEFAULT_WAIT_SECONDS.to_string())
        .parse::<WaitTimeout>()
        .map_err(anyhow::Error::msg)
        .context("invalid wait timeout")?;
    Ok(Config {
        event_prefix,
        wait,
        attach_pid: args.attach_pid,
        attach_host: args.attach_host,
        max_node_index: args.max_node_index,
        request_list: args.request_list,
        max_frame_bytes: args.max_frame_bytes,
        debug: args.debug || env_true("MEQ_TAP_DEBUG"),
    })
}

fn resolve_setting(arg: &str, env_key: &str) -> Option<String> {
    let arg = arg.trim();
    if !arg.is_empty() {
        return Some(arg.to_string());
    }
    std::env::var(env_key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_true(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref().map(str::trim),
        Some("1" | "true" | "TRUE" | "yes" | "on")
    )
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("MEQ_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
