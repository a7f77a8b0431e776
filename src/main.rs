use std::path::PathBuf;
use std::time::Duration;

use fluux_ws::xmpp_ws::{to_xml, Connection, ConnectionEvent, ConnectionOptions, Jid, WebSocketConnector};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// How long to wait for the server to acknowledge `<close/>` on Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn print_help() {
    eprintln!("fluux-ws v{} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    eprintln!();
    eprintln!("Usage: fluux-ws --url=URL [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --url=URL         WebSocket endpoint (ws:// or wss://)");
    eprintln!("      --jid=JID         Account JID; its domain is used as the stream 'to'");
    eprintln!("      --to=DOMAIN       Stream 'to' when no JID is given");
    eprintln!("      --config=PATH     JSON connection options (camelCase keys)");
    eprintln!("      --reconnect       Reconnect automatically after transport loss");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
    eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP packet content");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform log dir)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter().find_map(|arg| arg.strip_prefix(name))
}

fn log_dir(log_file_path: Option<&str>) -> PathBuf {
    match log_file_path {
        Some(path) => PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
        None => {
            let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
            let dir = base.join("com.processone.fluux").join("logs");

            #[cfg(target_os = "macos")]
            let dir = dirs::home_dir()
                .map(|h| h.join("Library").join("Logs").join("com.processone.fluux"))
                .unwrap_or(dir);

            dir
        }
    }
}

/// Daily-rotating file log, plus stderr when asked for.
fn init_tracing(verbose_level: Option<&str>, log_file_path: Option<&str>) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir(log_file_path);
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }
    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_ws=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-ws.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || log_file_path.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("fluux_ws=debug,info")
        } else {
            EnvFilter::new("fluux_ws=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The writer thread must outlive every log call.
    std::mem::forget(guard);

    eprintln!("Log file: {}", log_dir.display());
}

fn load_options(args: &[String]) -> Result<ConnectionOptions, String> {
    let mut options = match flag_value(args, "--config=") {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config {}: {}", path, e))?;
            ConnectionOptions::from_json(&json)
                .map_err(|e| format!("Invalid config {}: {}", path, e))?
        }
        None => ConnectionOptions::default(),
    };

    if let Some(url) = flag_value(args, "--url=") {
        options.url = url.to_string();
    }
    if let Some(jid) = flag_value(args, "--jid=") {
        let jid: Jid = jid.parse().map_err(|e| format!("Invalid JID {}: {}", jid, e))?;
        options.jid = Some(jid);
    }
    if let Some(to) = flag_value(args, "--to=") {
        options.stream_to = Some(to.to_string());
    }
    if args.iter().any(|arg| arg == "--reconnect") {
        options.reconnect = true;
    }
    if options.xmlns.is_empty() {
        options.xmlns.insert(String::new(), "jabber:client".to_string());
    }
    if options.url.is_empty() {
        return Err("No WebSocket URL given (use --url=URL or a config file)".to_string());
    }
    Ok(options)
}

/// How long to wait for a reconnect after a disconnect before giving up.
///
/// Retries stop silently once the window has passed; one more delay covers
/// the attempt that was already scheduled.
fn give_up_after(options: &ConnectionOptions) -> Option<Duration> {
    if !options.reconnect {
        return None;
    }
    let policy = options.reconnect_policy();
    Some(policy.max_delay + policy.delay)
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        std::process::exit(0);
    }

    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    init_tracing(verbose_level, flag_value(&args, "--log-file="));

    let options = match load_options(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), url = %options.url, "Starting");
    let give_up_after = give_up_after(&options);
    let (conn, mut events) = Connection::open(options, WebSocketConnector::new());

    let mut shutdown_deadline: Option<tokio::time::Instant> = None;
    let mut give_up_deadline: Option<tokio::time::Instant> = None;
    let mut exit_code = 0;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if shutdown_deadline.is_none() => {
                info!("Interrupted, ending stream");
                conn.end();
                shutdown_deadline = Some(tokio::time::Instant::now() + SHUTDOWN_GRACE);
                continue;
            }
            _ = sleep_until_some(shutdown_deadline), if shutdown_deadline.is_some() => {
                warn!("Server did not close in time, exiting");
                break;
            }
            _ = sleep_until_some(give_up_deadline), if give_up_deadline.is_some() && shutdown_deadline.is_none() => {
                error!("Could not reconnect within the retry window, exiting");
                exit_code = 1;
                break;
            }
        };

        match event {
            Ok(ConnectionEvent::Connected) => {
                give_up_deadline = None;
                info!("Connected, opening stream");
                if let Err(e) = conn.start_stream() {
                    error!(error = %e, "Failed to open stream");
                    break;
                }
            }
            Ok(ConnectionEvent::Reconnect) => info!("Reconnected"),
            Ok(ConnectionEvent::StreamStart(attrs)) => {
                info!(id = ?attrs.id(), from = ?attrs.get("from"), "Stream opened by server");
            }
            Ok(ConnectionEvent::Stanza(stanza)) => match to_xml(&stanza) {
                Ok(xml) => info!(stanza = %xml, "Stanza received"),
                Err(e) => warn!(name = stanza.name(), error = %e, "Stanza received, not printable"),
            },
            Ok(ConnectionEvent::Error(e)) => warn!(error = %e, "Connection error"),
            Ok(ConnectionEvent::Disconnect) => {
                info!("Disconnected");
                if let (Some(after), None, None) = (give_up_after, shutdown_deadline, give_up_deadline) {
                    give_up_deadline = Some(tokio::time::Instant::now() + after);
                }
            }
            Ok(ConnectionEvent::End) => info!("Stream ended"),
            Ok(ConnectionEvent::Close) => {
                info!("Connection closed");
                break;
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event receiver lagged"),
            Err(RecvError::Closed) => break,
        }

        // Ended with no socket left to close: nothing more will arrive.
        if shutdown_deadline.is_some() && !conn.is_running() {
            break;
        }
    }

    conn.end();
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

async fn sleep_until_some(deadline: Option<tokio::time::Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}
