//! wsbridge: WebSocket bridge server and client
//!
//! Runs a WebSocket endpoint (or connects to one) and prints every
//! connection event as a JSON line on stdout. Logs go to stderr.
//!
//! Usage:
//!   wsbridge serve                                  # ws://127.0.0.1:7070/ws
//!   wsbridge serve --port 9000 --echo               # Echo every message back
//!   wsbridge serve --self-signed ./tls              # wss:// with a generated cert
//!   wsbridge serve --tls-cert c.pem --tls-key k.pem # wss:// with your own cert
//!   wsbridge connect ws://127.0.0.1:7070/ws --send hello

mod certs;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wsbridge_core::{Event, EventKind};
use wsbridge_hub::{ClientFacade, FnListener, ListenerResult, ServerFacade};
use wsbridge_transport::{
    ClientConfig, TlsConfig, TransportClient, TransportConfig, TransportServer,
};

#[derive(Parser, Debug)]
#[command(name = "wsbridge", version, about = "WebSocket bridge: events in, messages out")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging (every frame at debug level)
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept WebSocket connections and print their events
    Serve(ServeArgs),
    /// Connect to a WebSocket endpoint and print its events
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Maximum concurrent connections
    #[arg(long, default_value = "32")]
    max_connections: usize,

    /// Path to TLS certificate (PEM)
    #[arg(long, requires = "tls_key", conflicts_with = "self_signed")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Serve TLS with a self-signed certificate kept in this directory
    #[arg(long, value_name = "DIR")]
    self_signed: Option<PathBuf>,

    /// Send every received message back to its sender
    #[arg(long)]
    echo: bool,

    /// Enable permissive CORS on the HTTP routes
    #[arg(long)]
    cors: bool,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// ws:// or wss:// endpoint
    url: String,

    /// Text message to send after connecting (repeatable)
    #[arg(long = "send", value_name = "TEXT")]
    messages: Vec<String>,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &cli.log_file {
        Some(log_path) => {
            if let Some(parent) = log_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("failed to open log file {}", log_path.display()))?;
            let writer = std::sync::Mutex::new(file);

            if cli.log_json {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            }
            eprintln!("Logging to {}", log_path.display());
        }
        None if cli.log_json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Print each event as one JSON line on stdout.
fn print_event(event: &Event) -> ListenerResult {
    let line = serde_json::to_string(&event.to_record())?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}")?;
    out.flush()?;
    Ok(())
}

/// Reply to each message on the connection it arrived on.
fn echo(event: &Event) -> ListenerResult {
    let Some(conn) = event.connection() else {
        return Ok(());
    };
    match event.kind() {
        EventKind::TextMessage => {
            if let Some(text) = event.text() {
                conn.send_text(text)?;
            }
        }
        EventKind::BinaryMessage => {
            if let Some(data) = event.binary() {
                conn.send_binary(data.clone())?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn resolve_tls(args: &ServeArgs) -> anyhow::Result<(Option<TlsConfig>, Option<String>)> {
    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        let fingerprint = certs::fingerprint_from_pem(cert);
        let tls = TlsConfig {
            cert_path: cert.clone(),
            key_path: key.clone(),
        };
        return Ok((Some(tls), fingerprint));
    }
    if let Some(dir) = &args.self_signed {
        let material = certs::ensure_self_signed(dir)?;
        let tls = TlsConfig {
            cert_path: material.cert_path,
            key_path: material.key_path,
        };
        return Ok((Some(tls), Some(material.fingerprint)));
    }
    Ok((None, None))
}

async fn serve(args: ServeArgs, verbose: bool) -> anyhow::Result<()> {
    let (tls, fingerprint) = resolve_tls(&args)?;

    let facade = Arc::new(ServerFacade::new());
    facade.subscribe(FnListener::new("stdout", print_event));
    if args.echo {
        facade.subscribe(FnListener::new("echo", echo));
    }

    let config = TransportConfig {
        port: args.port,
        hostname: args.hostname.clone(),
        max_connections: Some(args.max_connections),
        enable_cors: args.cors,
        verbose_logging: verbose,
        tls,
        ..Default::default()
    };
    let mut server = TransportServer::start(config, facade.clone())
        .await
        .context("failed to start server")?;

    let (ws_scheme, http_scheme) = if server.is_tls() {
        ("wss", "https")
    } else {
        ("ws", "http")
    };
    let authority = format!("{}:{}", args.hostname, server.port());
    eprintln!();
    eprintln!("  WebSocket endpoint:  {ws_scheme}://{authority}/ws");
    eprintln!("  Health check:        {http_scheme}://{authority}/health");
    if let Some(fingerprint) = &fingerprint {
        eprintln!("  Certificate:         {fingerprint}");
    }
    if args.echo {
        eprintln!("  Echo:                on");
    }
    eprintln!();
    eprintln!("  Press Ctrl+C to stop.");
    eprintln!();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    shut_down(&mut server).await;
    Ok(())
}

/// Stop the server. `stop` sends every open connection a going-away close.
async fn shut_down(server: &mut TransportServer) {
    info!(
        connections = server.facade().connection_count(),
        "shutting down"
    );
    server.stop().await;
}

async fn connect(args: ConnectArgs, verbose: bool) -> anyhow::Result<()> {
    let facade = Arc::new(ClientFacade::new(args.url.clone()));
    facade.subscribe(FnListener::new("stdout", print_event));

    let config = ClientConfig {
        verbose_logging: verbose,
        ..ClientConfig::new(args.url.clone())
    };
    let mut client = TransportClient::connect(config, facade.clone())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;

    for text in &args.messages {
        facade.send_text(text)?;
    }

    let interrupted = tokio::select! {
        _ = client.wait() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        if let Err(e) = client.close() {
            warn!(error = %e, "close request failed");
        }
        client.wait().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    match cli.command {
        Command::Serve(args) => serve(args, cli.verbose).await,
        Command::Connect(args) => connect(args, cli.verbose).await,
    }
}
