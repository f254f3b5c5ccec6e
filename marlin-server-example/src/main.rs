//! Minimal host embedding the Marlin application server.
//!
//! Serves a hello site, a gzip-compressed data site, and a push event
//! stream that ticks once a second until the process is stopped.

use std::time::Duration;

use clap::Parser;
use marlin_server::site::SiteBuilder;
use marlin_server::{Exchange, Server, ServerConfig, ServerError};
use marlin_types::{ServerEvent, Verb};

/// Configuration of the example host.
///
/// Every option can also come from the environment.
#[derive(Parser, Debug)]
struct ExampleConfig {
    /// Port to listen on.
    #[clap(long, env = "MARLIN_EXAMPLE_PORT", default_value = "8080")]
    port: u16,

    /// Quiet interval before event streams receive a keep-alive.
    #[clap(
        long,
        env = "MARLIN_EXAMPLE_EVENT_KEEP_ALIVE",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    event_keep_alive: Duration,

    /// Interval between demo push events.
    #[clap(
        long,
        env = "MARLIN_EXAMPLE_TICK_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    tick_interval: Duration,
}

fn hello(exchange: &mut Exchange<'_>) -> Result<(), ServerError> {
    let who = exchange
        .request
        .url
        .query_value("name")
        .unwrap_or("world")
        .to_owned();
    exchange.respond_ok("text/plain", format!("hello, {who}\n"));
    Ok(())
}

fn data(exchange: &mut Exchange<'_>) -> Result<(), ServerError> {
    let payload = "0123456789abcdef".repeat(256);
    exchange.respond_ok("application/octet-stream", payload);
    Ok(())
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = ExampleConfig::parse();
    let mut config = ServerConfig::default();
    config.name = "marlin-example".to_owned();
    config.event_keep_alive = args.event_keep_alive;
    marlin_server::metrics::describe_metrics();

    let server = Server::new(config);
    server.register_site(SiteBuilder::new(args.port, "/hello/").handler(Verb::Get, hello))?;
    server.register_site(
        SiteBuilder::new(args.port, "/data/")
            .http_compression(true)
            .handler(Verb::Get, data),
    )?;
    server.register_site(SiteBuilder::new(args.port, "/events/").event_stream(true))?;
    server.run()?;
    tracing::info!("example server up on port {}", args.port);
    tracing::info!("try: curl http://localhost:{}/hello/?name=marlin", args.port);
    tracing::info!("try: curl -N http://localhost:{}/events/", args.port);

    loop {
        std::thread::sleep(args.tick_interval);
        let reached = server.send_event(
            args.port,
            "/events/",
            ServerEvent::named("tick", now_stamp()),
            None,
        );
        if reached > 0 {
            tracing::debug!("ticked {reached} event stream(s)");
        }
    }
}

fn now_stamp() -> String {
    humantime::format_rfc3339_seconds(std::time::SystemTime::now()).to_string()
}
