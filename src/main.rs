//! Request engine demo server.
//!
//! Serves an echo business service so the engine can be exercised by hand:
//!
//! ```text
//! request-engine --config engine.toml --watch
//! curl -i 'http://127.0.0.1:8080/hello?name=world'
//! curl -i http://127.0.0.1:8080/ping
//! ```
//!
//! SIGHUP re-reads the config file; SIGINT/SIGTERM shut down gracefully.

use std::path::PathBuf;

use clap::Parser;
use request_engine::config::{load_config, ConfigWatcher, ServerConfig};
use request_engine::lifecycle::{SignalEvent, Signals};
use request_engine::observability::logging::init_logging;
use request_engine::{HttpServer, RequestFacts, ResponseContext, ServiceError};

#[derive(Parser)]
#[command(name = "request-engine")]
#[command(about = "Asynchronous HTTP request engine with a bounded worker pool", long_about = None)]
struct Cli {
    /// TOML config file. Without one the server listens on 0.0.0.0:8080.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload automatically when the config file changes.
    #[arg(short, long, requires = "config")]
    watch: bool,
}

fn echo(request: &RequestFacts, ctx: &mut ResponseContext) -> Result<(), ServiceError> {
    let mut text = format!("{} {}\n", request.method, request.path);
    for (name, value) in &request.query {
        text.push_str(&format!("{name}={value}\n"));
    }
    if let Some(body) = &request.body {
        text.push_str(body);
    }
    ctx.memo("echo", format!("{} bytes", text.len()));
    ctx.set_text(text);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::with_listener("0.0.0.0", 8080),
    };
    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "request-engine starting");

    let server = HttpServer::builder(config, echo).start()?;
    for addr in server.local_addrs() {
        tracing::info!(address = %addr, "Serving");
    }

    let control = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    control.block_on(async {
        let mut signals = Signals::register()?;

        let (mut updates, _watcher) = match (&cli.config, cli.watch) {
            (Some(path), true) => {
                let (watcher, updates) = ConfigWatcher::new(path);
                (Some(updates), Some(watcher.run()?))
            }
            _ => (None, None),
        };

        loop {
            tokio::select! {
                event = signals.next() => match event {
                    SignalEvent::Shutdown => break,
                    SignalEvent::Reload => {
                        let Some(path) = &cli.config else {
                            tracing::warn!("SIGHUP ignored, no config file given");
                            continue;
                        };
                        match load_config(path) {
                            Ok(config) => {
                                if let Err(e) = server.reload(config).await {
                                    tracing::error!(error = %e, "Reload rejected, keeping current configuration");
                                }
                            }
                            Err(e) => tracing::error!(error = %e, "Failed to read config"),
                        }
                    }
                },
                Some(config) = async {
                    match updates.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending::<Option<ServerConfig>>().await,
                    }
                } => {
                    if let Err(e) = server.reload(config).await {
                        tracing::error!(error = %e, "Reload rejected, keeping current configuration");
                    }
                }
                _ = server.stopped() => break,
            }
        }
        Ok::<_, Box<dyn std::error::Error>>(())
    })?;

    server.shutdown();
    Ok(())
}
