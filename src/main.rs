//! Terminal host for a reading session.
//!
//! Responsibilities here are intentionally minimal:
//! - Parse command-line arguments.
//! - Load user configuration from `conf/config.toml`.
//! - Run one session against the reading service, reading commands from
//!   stdin and writing session events to stdout as JSON lines.

mod audio;
mod commands;

use crate::audio::SimulatedAudio;
use crate::commands::Input;
use anyhow::{Context, Result, anyhow};
use quire_core::config::load_config;
use quire_core::runtime::{SessionHandle, SessionRuntime};
use quire_core::service::HttpService;
use quire_core::session::SessionController;
use quire_core::storage::FileStore;
use std::env;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn main() {
    let reload_handle = init_tracing();
    if let Err(err) = run(&reload_handle) {
        error!("{err:?}");
        std::process::exit(1);
    }
}

fn run(reload_handle: &ReloadHandle) -> Result<()> {
    let book_id = parse_args()?;
    let config = load_config(Path::new("conf/config.toml"));
    set_log_level(reload_handle, config.log_level.as_filter_str());
    info!(
        book_id = %book_id,
        service = %config.service_url,
        level = %config.log_level,
        "Starting reading session"
    );

    let service = HttpService::new(&config.service_url, config.request_timeout())
        .context("Failed to build the service client")?;
    let store = FileStore::new(&config.cache_dir);
    let controller = SessionController::new(book_id, config, Box::new(store));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(serve(controller, service))
}

async fn serve(controller: SessionController, service: HttpService) -> Result<()> {
    let (session, handle, mut events) =
        SessionRuntime::new(controller, Arc::new(service), SimulatedAudio::default());
    let session = tokio::spawn(session.run());

    let interrupt = handle.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupted; closing session");
        interrupt.shutdown();
    })
    .context("Failed to install the Ctrl-C handler")?;
    spawn_stdin_reader(handle);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!("Failed to encode session event: {err}"),
            }
        }
    });

    session.await.context("Session task failed")?;
    printer.await.context("Event printer failed")?;
    Ok(())
}

fn spawn_stdin_reader(handle: SessionHandle) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match commands::parse_line(&line) {
                Ok(None) => {}
                Ok(Some(Input::Quit)) => break,
                Ok(Some(Input::Command(command))) => {
                    if !handle.send(command) {
                        break;
                    }
                }
                Err(err) => eprintln!("{err:#}"),
            }
        }
        handle.shutdown();
    });
}

fn parse_args() -> Result<String> {
    let mut args = env::args().skip(1);
    let book_id = args
        .next()
        .ok_or_else(|| anyhow!("Usage: quire <book-id>"))?;
    if book_id.trim().is_empty() {
        return Err(anyhow!("Book id must not be empty"));
    }
    Ok(book_id)
}

fn init_tracing() -> ReloadHandle {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter_layer),
        )
        .init();
    warn!("Logging initialized; override level with config.log_level or RUST_LOG");
    handle
}

fn set_log_level(handle: &ReloadHandle, level: &str) {
    let parsed = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|_| EnvFilter::new("debug"));
    if let Err(err) = handle.modify(|filter| *filter = parsed.clone()) {
        warn!(%level, "Failed to update log level from config: {err}");
    } else {
        info!(%level, "Applied log level from config");
    }
}
