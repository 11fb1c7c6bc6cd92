//! Segment discovery: filesystem events plus a periodic fallback poll.
//!
//! Both paths feed the same idempotent progress tracker on the session, so
//! whichever observes a new maximum first wins and the other is a no-op.
//! The fallback poll exists because create-event delivery is not reliable
//! on every platform/filesystem combination.

use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SessionShared;

/// Extract the sequence number from a deterministic segment file name,
/// `segment<N>.aac`.
pub fn parse_segment_number(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("segment")?
        .strip_suffix(".aac")?
        .parse()
        .ok()
}

/// Highest segment number currently on disk, if any.
pub fn scan_max_segment(dir: &Path) -> Option<u64> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| parse_segment_number(e.file_name().to_str()?))
        .max()
}

/// React to segment files as the filesystem reports their creation.  The
/// watcher callback runs on notify's own thread; numbers are forwarded to
/// the async side over an unbounded channel.
pub fn spawn_segment_watcher(
    dir: PathBuf,
    session: Arc<SessionShared>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();

        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Create(_)) {
                return;
            }
            for path in &event.paths {
                if let Some(number) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_segment_number)
                {
                    let _ = tx.send(number);
                }
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!("segment watcher init failed, poller only: {}", e);
                return;
            }
        };

        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!("cannot watch {:?}, poller only: {}", dir, e);
            return;
        }
        debug!("segment watcher active for {:?}", dir);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                number = rx.recv() => match number {
                    Some(n) => {
                        let size = segment_size(&dir, n).await;
                        session.observe(n, size).await;
                    }
                    None => break,
                },
            }
        }
        debug!("segment watcher for {:?} stopped", dir);
    })
}

/// Independently recount segments on disk; reaches the same readiness
/// conclusion as the event path without double-counting.
pub fn spawn_fallback_poller(
    dir: PathBuf,
    session: Arc<SessionShared>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(max) = scan_max_segment(&dir) {
                        let size = segment_size(&dir, max).await;
                        session.observe(max, size).await;
                    }
                }
            }
        }
        debug!("fallback poller for {:?} stopped", dir);
    })
}

async fn segment_size(dir: &Path, number: u64) -> u64 {
    tokio::fs::metadata(dir.join(format!("segment{}.aac", number)))
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}
