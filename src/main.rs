//! tunnel-relay: expose a local HTTP service through a public relay.
//!
//! # Architecture Overview
//!
//! ```text
//!   Browser                       RELAY (server)                         CLIENT
//!   ───────                       ──────────────                         ──────
//!  GET demo.example.com ─▶ http::dispatch ─▶ server::Client ─┐
//!                                                            │ claim
//!                          server::TunnelAgent (port N) ◀────┘
//!                                    ▲
//!                                    │ max_conn TCP legs
//!                                    │
//!                          client::TunnelCluster ─▶ localhost:PORT
//!
//!  GET example.com/?new  ─▶ http::control ─▶ server::ClientManager
//! ```
//!
//! `tunnel-relay server` runs the public side, `tunnel-relay client`
//! requests a session and keeps its legs connected.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;

use tunnel_relay::client::{Tunnel, TunnelEvent, TunnelOptions};
use tunnel_relay::config::validation::{validate_client_config, validate_server_config};
use tunnel_relay::config::{load_client_config, load_server_config, ClientConfig, ConfigError, ServerConfig};
use tunnel_relay::lifecycle::Shutdown;
use tunnel_relay::net::tls::install_crypto_provider;
use tunnel_relay::observability::{logging, metrics};
use tunnel_relay::HttpServer;

#[derive(Parser)]
#[command(name = "tunnel-relay", version)]
#[command(about = "Expose a local HTTP service through a public relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the public relay server
    Server(ServerArgs),
    /// Expose a local port through a relay
    Client(ClientArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port of the public listener
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Address of the public listener
    #[arg(short, long)]
    address: Option<String>,

    /// Base domain tunnels are served under (repeatable)
    #[arg(short, long = "domain")]
    domains: Vec<String>,

    /// Advertise https:// tunnel URLs
    #[arg(long)]
    secure: bool,

    /// Where `GET /` redirects
    #[arg(long)]
    landing: Option<String>,

    /// Connections each tunnel client should open
    #[arg(long)]
    max_sockets: Option<usize>,
}

#[derive(Args)]
struct ClientArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local port to expose
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Relay server base URL
    #[arg(long)]
    host: Option<String>,

    /// Request this subdomain
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Local host to dial instead of localhost; also rewrites the Host header
    #[arg(short, long)]
    local_host: Option<String>,

    /// The local service speaks HTTPS
    #[arg(long)]
    local_https: bool,

    /// Client certificate for the local service (PEM)
    #[arg(long)]
    local_cert: Option<PathBuf>,

    /// Key for the client certificate (PEM)
    #[arg(long)]
    local_key: Option<PathBuf>,

    /// CA certificate used to verify the local service (PEM)
    #[arg(long)]
    local_ca: Option<PathBuf>,

    /// Skip certificate checks against the local service
    #[arg(long)]
    allow_invalid_cert: bool,

    /// Print each request passing through the tunnel
    #[arg(long)]
    print_requests: bool,

    /// Extra session request headers as a JSON object
    #[arg(long, value_parser = parse_headers)]
    headers: Option<HashMap<String, String>>,
}

fn parse_headers(raw: &str) -> Result<HashMap<String, String>, String> {
    serde_json::from_str(raw).map_err(|e| format!("expected a JSON object of strings: {e}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_crypto_provider();

    match Cli::parse().command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => load_server_config(path)?,
        None => ServerConfig::default(),
    };
    apply_server_args(&mut config, args)?;
    validate_server_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);
    tracing::info!("tunnel-relay v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        domains = ?config.tunnel.domains,
        max_sockets = config.tunnel.max_sockets,
        secure = config.tunnel.secure,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();

    let bind_address: SocketAddr = config.listener.bind_address.parse()?;
    let tls = config.listener.tls.clone();
    let server = HttpServer::new(config);
    match tls {
        Some(tls) => server.run_tls(bind_address, &tls, shutdown.subscribe()).await?,
        None => {
            let listener = TcpListener::bind(bind_address).await?;
            tracing::info!(address = %listener.local_addr()?, "Listening for connections");
            server.run(listener, shutdown.subscribe()).await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn apply_server_args(config: &mut ServerConfig, args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.address.is_some() || args.port.is_some() {
        let current: SocketAddr = config.listener.bind_address.parse()?;
        let ip = match args.address {
            Some(address) => address.parse()?,
            None => current.ip(),
        };
        let port = args.port.unwrap_or(current.port());
        config.listener.bind_address = SocketAddr::new(ip, port).to_string();
    }
    if !args.domains.is_empty() {
        config.tunnel.domains = args.domains;
    }
    if args.secure {
        config.tunnel.secure = true;
    }
    if let Some(landing) = args.landing {
        config.tunnel.landing = landing;
    }
    if let Some(max_sockets) = args.max_sockets {
        config.tunnel.max_sockets = max_sockets;
    }
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => load_client_config(path)?,
        None => ClientConfig::default(),
    };
    apply_client_args(&mut config, args);
    validate_client_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);

    let (tunnel, mut events) = Tunnel::open(TunnelOptions::from(&config)).await?;
    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();
    let mut stop = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = stop.recv() => {
                tracing::info!("Closing tunnel");
                tunnel.close();
            }
            event = events.recv() => match event {
                Some(event) => match on_event(event, config.print_requests, tunnel.cached_url()) {
                    Step::Continue(lines) => lines.iter().for_each(|line| println!("{line}")),
                    Step::Exit => break,
                },
                None => break,
            },
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue(Vec<String>),
    Exit,
}

/// Lines to print for one tunnel event. Leg errors are logged and the
/// tunnel keeps running; only `Closed` ends the client.
fn on_event(event: TunnelEvent, print_requests: bool, cached_url: Option<&str>) -> Step {
    match event {
        TunnelEvent::Url(url) => {
            let mut lines = vec![format!("your url is: {url}")];
            if let Some(cached) = cached_url {
                lines.push(format!("your cachedUrl is: {cached}"));
            }
            Step::Continue(lines)
        }
        TunnelEvent::Request(request) if print_requests => {
            Step::Continue(vec![format!("{} {}", request.method, request.path)])
        }
        TunnelEvent::Request(_) => Step::Continue(Vec::new()),
        TunnelEvent::Error(err) => {
            tracing::error!(error = %err, "Tunnel error");
            Step::Continue(Vec::new())
        }
        TunnelEvent::Closed => Step::Exit,
    }
}

fn apply_client_args(config: &mut ClientConfig, args: ClientArgs) {
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if args.subdomain.is_some() {
        config.subdomain = args.subdomain;
    }
    if args.local_host.is_some() {
        config.local_host = args.local_host;
    }
    if args.local_https {
        config.local_https = true;
    }
    if args.local_cert.is_some() {
        config.local_cert = args.local_cert;
    }
    if args.local_key.is_some() {
        config.local_key = args.local_key;
    }
    if args.local_ca.is_some() {
        config.local_ca = args.local_ca;
    }
    if args.allow_invalid_cert {
        config.allow_invalid_cert = true;
    }
    if args.print_requests {
        config.print_requests = true;
    }
    if let Some(headers) = args.headers {
        config.headers.extend(headers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_relay::client::{TunnelError, TunnelRequest};

    #[test]
    fn leg_error_keeps_client_running() {
        let refused = TunnelEvent::Error(TunnelError::RemoteRefused {
            addr: "127.0.0.1:1".to_string(),
        });
        assert_eq!(on_event(refused, false, None), Step::Continue(Vec::new()));

        let url = TunnelEvent::Url("http://demo.example.com".to_string());
        assert_eq!(
            on_event(url, false, None),
            Step::Continue(vec!["your url is: http://demo.example.com".to_string()])
        );
    }

    #[test]
    fn only_close_ends_client() {
        assert_eq!(on_event(TunnelEvent::Closed, false, None), Step::Exit);
    }

    #[test]
    fn prints_url_cached_url_and_requests() {
        let url = TunnelEvent::Url("http://demo.example.com".to_string());
        assert_eq!(
            on_event(url, false, Some("http://cached.example.com")),
            Step::Continue(vec![
                "your url is: http://demo.example.com".to_string(),
                "your cachedUrl is: http://cached.example.com".to_string(),
            ])
        );

        let request = || {
            TunnelEvent::Request(TunnelRequest {
                method: "GET".to_string(),
                path: "/items".to_string(),
            })
        };
        assert_eq!(on_event(request(), true, None), Step::Continue(vec!["GET /items".to_string()]));
        assert_eq!(on_event(request(), false, None), Step::Continue(Vec::new()));
    }
}
