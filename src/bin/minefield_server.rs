//! Minefield Server - Unix socket server for the graph engine
//!
//! Provides a MessagePack-based protocol for ingestion, caching, queries and
//! leaderboards. Multiple clients can connect and share the same graph.
//!
//! Usage:
//!   minefield-server [<db-path>] [--socket /tmp/minefield.sock] [--help]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]

use std::io::{self, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{RecvTimeoutError, Sender};

use minefield::config::ServerConfig;
use minefield::service::{read_message, write_message, Service};
use minefield::storage::{MemoryStorage, SledStorage, Storage};
use minefield::{CancelToken, GraphEngine};

/// Accept-loop and idle-client poll interval
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Client Connection Handler
// ============================================================================

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Wait for the next frame, polling the shutdown flag while the client is
/// idle. Only the wait for the first byte times out, so a slow sender never
/// loses part of a frame. `Ok(None)` means stop serving this client.
fn next_frame(stream: &mut UnixStream, service: &Service) -> io::Result<Option<Vec<u8>>> {
    let mut first = [0u8; 1];
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    loop {
        match stream.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if is_timeout(&e) => {
                if service.is_shutting_down() {
                    return Ok(None);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    stream.set_read_timeout(None)?;
    let mut frame = (&first[..]).chain(&mut *stream);
    read_message(&mut frame)
}

/// Serve one client until it disconnects or the server shuts down.
/// `_alive` is dropped on return, which the shutdown drain waits for.
fn handle_client(mut stream: UnixStream, service: Arc<Service>, client_id: usize, _alive: Sender<()>) {
    tracing::info!("Client {} connected", client_id);

    loop {
        let msg = match next_frame(&mut stream, &service) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::info!("Client {} disconnected", client_id);
                break;
            }
            Err(e) => {
                tracing::warn!("Client {} read error: {}", client_id, e);
                break;
            }
        };

        let reply = service.handle_frame(&msg);

        if let Err(e) = write_message(&mut stream, &reply) {
            tracing::warn!("Client {} write error: {}", client_id, e);
            break;
        }

        if service.is_shutting_down() {
            break;
        }
    }
}

// ============================================================================
// Main
// ============================================================================

fn open_storage(config: &ServerConfig) -> anyhow::Result<(Arc<dyn Storage>, Option<Arc<SledStorage>>)> {
    match &config.db_path {
        Some(path) => {
            tracing::info!("Opening database: {:?}", path);
            let sled = Arc::new(
                SledStorage::open(path).with_context(|| format!("failed to open database {:?}", path))?,
            );
            let storage: Arc<dyn Storage> = sled.clone();
            Ok((storage, Some(sled)))
        }
        None => {
            tracing::info!("No database path, using in-memory storage");
            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
            Ok((storage, None))
        }
    }
}

/// Wait for every client thread to drop its sender, up to `grace`
fn drain(alive: crossbeam_channel::Receiver<()>, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match alive.recv_deadline(deadline) {
            Ok(()) => continue,
            Err(RecvTimeoutError::Disconnected) => return true,
            Err(RecvTimeoutError::Timeout) => return false,
        }
    }
}

fn run(config: ServerConfig) -> anyhow::Result<()> {
    let (storage, sled) = open_storage(&config)?;
    let engine = Arc::new(GraphEngine::new(storage));
    tracing::info!(
        "Database opened: {} nodes, cache {}",
        engine.storage().get_all_keys()?.len(),
        if engine.is_coherent()? { "coherent" } else { "stale" }
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("failed to register SIGTERM handler")?;

    let cancel = CancelToken::new();
    let service = Arc::new(Service::new(
        Arc::clone(&engine),
        config.concurrency,
        cancel.clone(),
        Arc::clone(&shutdown),
    ));

    // Remove stale socket file
    let _ = std::fs::remove_file(&config.socket_path);
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind {:?}", config.socket_path))?;
    listener.set_nonblocking(true)?;
    tracing::info!(
        "Listening on {:?} (leaderboard concurrency {})",
        config.socket_path,
        config.concurrency
    );

    let (alive_tx, alive_rx) = crossbeam_channel::unbounded::<()>();
    let mut client_id = 0;

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::warn!("Dropping client: {}", e);
                    continue;
                }
                client_id += 1;
                let service = Arc::clone(&service);
                let alive = alive_tx.clone();
                let id = client_id;
                thread::Builder::new()
                    .name(format!("client-{}", id))
                    .spawn(move || handle_client(stream, service, id, alive))?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => tracing::warn!("Accept error: {}", e),
        }
    }

    tracing::info!("Shutting down, draining clients for up to {:?}", config.grace_period());
    drop(listener);
    drop(alive_tx);

    if !drain(alive_rx, config.grace_period()) {
        tracing::warn!("Grace period elapsed, cancelling in-flight operations");
        cancel.cancel();
    }

    if let Some(sled) = sled {
        match sled.flush() {
            Ok(()) => tracing::info!("Flush complete"),
            Err(e) => tracing::error!("Flush failed: {}", e),
        }
    }

    let _ = std::fs::remove_file(&config.socket_path);
    tracing::info!("Exiting");
    Ok(())
}

fn main() {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(config) {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
