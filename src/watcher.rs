//! The watch loop: bridges filesystem notifications to the supervisor.
//!
//! A notify backend thread pushes raw events into a channel; the main task
//! filters them, debounces per path, waits a short settle delay for the
//! editor to finish writing, then locates the scene class and restarts the
//! render. Ctrl+C tears down the active job and exits cleanly.

use crate::config::WatchConfig;
use crate::debounce::Debouncer;
use crate::scene;
use crate::supervisor::RenderSupervisor;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// File name of the legacy script this watcher replaces. Trees that still
/// carry it should not trigger renders when it changes.
const LEGACY_WATCHER_SCRIPT: &str = "watch_manim.py";

/// Errors that can occur while setting up the filesystem subscription.
#[derive(Debug)]
pub enum WatchError {
    /// Failed to create or register the filesystem watcher.
    Subscribe { source: notify::Error },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Subscribe { source } => {
                write!(f, "failed to subscribe to filesystem events: {}", source)
            }
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Subscribe { source } => Some(source),
        }
    }
}

/// Watch `config.root` recursively until `shutdown` resolves.
///
/// `main` passes Ctrl+C here; tests pass their own trigger.
pub async fn run(
    config: WatchConfig,
    supervisor: Arc<RenderSupervisor>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), WatchError> {
    if config.startup_sweep {
        supervisor.sweep_strays().await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            // The receiver only closes on shutdown; drop late events.
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )
    .map_err(|e| WatchError::Subscribe { source: e })?;
    watcher
        .watch(&config.root, RecursiveMode::Recursive)
        .map_err(|e| WatchError::Subscribe { source: e })?;

    info!(root = %config.root.display(), "watching for changes, Ctrl+C to stop");

    let mut debouncer = Debouncer::new(config.debounce_window);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("interrupt received, shutting down");
                break;
            }
            event = rx.recv() => match event {
                Some(Ok(event)) => {
                    process_event(&config, &supervisor, &mut debouncer, &event).await;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "filesystem watch error");
                }
                // Backend dropped its sender; nothing left to watch.
                None => break,
            },
        }
    }

    drop(watcher);
    if let Err(e) = supervisor.stop_current().await {
        warn!(error = %e, "failed to stop render during shutdown");
    }
    info!("watch stopped");
    Ok(())
}

async fn process_event(
    config: &WatchConfig,
    supervisor: &RenderSupervisor,
    debouncer: &mut Debouncer,
    event: &Event,
) {
    for path in relevant_paths(event) {
        if !debouncer.accept(path, Instant::now()) {
            continue;
        }
        info!(path = %path.display(), "file modified");
        handle_accepted(config, supervisor, path).await;
    }
}

/// Paths worth acting on: modification events on watchable files.
fn relevant_paths(event: &Event) -> Vec<&Path> {
    if !matches!(event.kind, EventKind::Modify(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .map(|p| p.as_path())
        .filter(|p| is_watchable(p))
        .collect()
}

/// Python sources only; directories and the legacy watcher script are skipped.
fn is_watchable(path: &Path) -> bool {
    if path.is_dir() {
        return false;
    }
    if path.extension().and_then(|e| e.to_str()) != Some("py") {
        return false;
    }
    path.file_name().and_then(|n| n.to_str()) != Some(LEGACY_WATCHER_SCRIPT)
}

/// Settle, locate the scene class, restart the render.
async fn handle_accepted(config: &WatchConfig, supervisor: &RenderSupervisor, path: &Path) {
    // Let the editor finish writing before reading the file.
    tokio::time::sleep(config.settle_delay).await;

    let Some(scene) = scene::find_scene_class(path) else {
        warn!(path = %path.display(), "no scene class found, skipping");
        return;
    };
    if let Err(e) = supervisor.restart(path, &scene).await {
        error!(error = %e, path = %path.display(), "failed to restart render");
    }
}
