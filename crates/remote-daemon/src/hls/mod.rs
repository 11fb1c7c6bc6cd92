//! Segment-based transcode orchestrator.
//!
//! One session per instance: an exclusive output directory, one ffmpeg
//! child writing fixed-duration AAC segments plus an HLS manifest, and
//! three concurrent watchers (filesystem events, fallback poll, encoder
//! exit monitor), all bound to the session's cancellation token.
//!
//! Readiness is monotonic: once enough segments exist the session stays
//! ready until it is torn down.  Out-of-order or duplicate segment
//! observations are ignored by a single maximum-seen tracker shared by both
//! discovery paths.

mod probe;
mod watch;

pub use probe::{probe_audio_params, AudioParams};
pub use watch::parse_segment_number;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use remote_proto::config::HlsConfig;
use remote_proto::platform;
use remote_proto::protocol::{SegmentInfo, StreamEvent, StreamStatus};

use crate::error::{DaemonError, Result};
use crate::events::EventHub;

/// How long a cancelled encoder gets to quit gracefully before being killed.
const ENCODER_KILL_GRACE: Duration = Duration::from_secs(10);

// ── session state ─────────────────────────────────────────────────────────────

struct Progress {
    max_seen: Option<u64>,
    ready: bool,
}

/// State shared between the two discovery paths and the service.  `observe`
/// is the single idempotent update point: whichever path reports a higher
/// segment number first wins, the other becomes a no-op.
pub struct SessionShared {
    instance_id: String,
    min_segments_for_ready: u64,
    progress: Mutex<Progress>,
    hub: Arc<EventHub>,
}

impl SessionShared {
    fn new(instance_id: String, min_segments_for_ready: u64, hub: Arc<EventHub>) -> Self {
        Self {
            instance_id,
            min_segments_for_ready,
            progress: Mutex::new(Progress {
                max_seen: None,
                ready: false,
            }),
            hub,
        }
    }

    /// Record one observed segment.  Numbers at or below the last seen are
    /// ignored; the ready flag flips false→true at most once, when the
    /// segment count first exceeds the configured minimum.
    pub async fn observe(&self, number: u64, size: u64) {
        let events = {
            let mut progress = self.progress.lock().await;
            if progress.max_seen.is_some_and(|seen| number <= seen) {
                return;
            }
            progress.max_seen = Some(number);

            let name = format!("segment{}.aac", number);
            let mut events = vec![StreamEvent::Segment {
                segment: SegmentInfo {
                    url: format!("/api/instances/{}/hls/{}", self.instance_id, name),
                    name,
                    number,
                    size,
                    instance_id: self.instance_id.clone(),
                },
            }];

            if !progress.ready && number + 1 > self.min_segments_for_ready {
                progress.ready = true;
                events.push(StreamEvent::Ready);
                info!(instance = %self.instance_id, segments = number + 1, "stream ready");
            }
            events
        };

        for event in events {
            self.hub.publish(&self.instance_id, event).await;
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.progress.lock().await.ready
    }

    pub async fn segment_count(&self) -> u64 {
        self.progress
            .lock()
            .await
            .max_seen
            .map(|n| n + 1)
            .unwrap_or(0)
    }
}

struct StreamSession {
    media_file: String,
    output_dir: PathBuf,
    playlist_path: PathBuf,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    encoder_done: Option<oneshot::Receiver<()>>,
}

// ── service ───────────────────────────────────────────────────────────────────

pub struct HlsService {
    sessions: Mutex<HashMap<String, StreamSession>>,
    hub: Arc<EventHub>,
    config: HlsConfig,
}

impl HlsService {
    pub fn new(config: HlsConfig, hub: Arc<EventHub>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            hub,
            config,
        }
    }

    /// Start a transcode session for an instance.  Fails immediately when a
    /// session already exists; encoder spawn failure cleans up the
    /// partially created directory before surfacing.
    pub async fn start_stream(&self, instance_id: &str, media_file: &str) -> Result<()> {
        // Probing is best-effort and slow — keep it outside the lock.
        let params = probe_audio_params(media_file).await;

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(instance_id) {
            return Err(DaemonError::StreamAlreadyActive(instance_id.to_string()));
        }

        let output_dir = self.config.output_root.join(instance_id);
        let playlist_path = output_dir.join("playlist.m3u8");
        tokio::fs::create_dir_all(&output_dir).await?;

        info!(
            instance = %instance_id,
            "starting HLS stream for {} in {:?} ({} Hz, {} ch)",
            media_file, output_dir, params.sample_rate, params.channels
        );

        let mut child = match self.spawn_encoder(instance_id, media_file, &output_dir, &playlist_path, params) {
            Ok(child) => child,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&output_dir).await {
                    warn!("failed to clean up {:?}: {}", output_dir, cleanup);
                }
                return Err(e);
            }
        };

        let shared = Arc::new(SessionShared::new(
            instance_id.to_string(),
            self.config.min_segments_for_ready,
            Arc::clone(&self.hub),
        ));
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_encoder_stderr(instance_id.to_string(), stderr));
        }

        watch::spawn_segment_watcher(output_dir.clone(), Arc::clone(&shared), cancel.clone());
        watch::spawn_fallback_poller(
            output_dir.clone(),
            Arc::clone(&shared),
            Duration::from_millis(self.config.poll_interval_ms),
            cancel.clone(),
        );
        tokio::spawn(monitor_encoder(
            instance_id.to_string(),
            child,
            cancel.clone(),
            done_tx,
        ));

        sessions.insert(
            instance_id.to_string(),
            StreamSession {
                media_file: media_file.to_string(),
                output_dir,
                playlist_path,
                shared,
                cancel,
                encoder_done: Some(done_rx),
            },
        );
        Ok(())
    }

    /// Output parameters are pinned explicitly — codec, bitrate, sample
    /// rate, channel count — so every segment in a session is homogeneous.
    fn spawn_encoder(
        &self,
        instance_id: &str,
        media_file: &str,
        output_dir: &std::path::Path,
        playlist_path: &std::path::Path,
        params: AudioParams,
    ) -> Result<tokio::process::Child> {
        let binary = platform::find_ffmpeg_binary().ok_or_else(|| {
            DaemonError::EncoderSpawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "ffmpeg binary not found",
            ))
        })?;

        let mut cmd = tokio::process::Command::new(binary);
        cmd.arg("-i")
            .arg(media_file)
            .arg("-map")
            .arg("0:a:0")
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg(&self.config.bitrate)
            .arg("-profile:a")
            .arg("aac_low")
            .arg("-ar")
            .arg(params.sample_rate.to_string())
            .arg("-ac")
            .arg(params.channels.to_string())
            .arg("-avoid_negative_ts")
            .arg("make_zero")
            .arg("-f")
            .arg("hls")
            .arg("-hls_time")
            .arg(self.config.segment_secs.to_string())
            .arg("-hls_list_size")
            .arg("0")
            .arg("-hls_flags")
            .arg("independent_segments")
            .arg("-hls_segment_filename")
            .arg(output_dir.join("segment%d.aac"))
            .arg("-hls_base_url")
            .arg(format!("/api/instances/{}/hls/", instance_id))
            .arg("-y")
            .arg(playlist_path);

        // stdin stays open as the graceful-quit channel ('q')
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());

        debug!("spawning ffmpeg: {:?}", cmd);
        cmd.spawn().map_err(DaemonError::EncoderSpawn)
    }

    /// Tear down the session for an instance: cancel the watchers, stop the
    /// encoder, delete the output directory, clear subscriber state.  Safe
    /// to call when no session exists.
    pub async fn stop_stream(&self, instance_id: &str) {
        let session = self.sessions.lock().await.remove(instance_id);
        let Some(mut session) = session else {
            debug!(instance = %instance_id, "stop_stream: no active session");
            return;
        };

        info!(instance = %instance_id, "stopping HLS stream for {}", session.media_file);

        // Watchers and poller stop before the directory disappears, so none
        // of them observes the deletion as churn.
        session.cancel.cancel();
        if let Some(done) = session.encoder_done.take() {
            if tokio::time::timeout(ENCODER_KILL_GRACE + Duration::from_secs(5), done)
                .await
                .is_err()
            {
                warn!(instance = %instance_id, "encoder did not confirm shutdown in time");
            }
        }

        match tokio::fs::remove_dir_all(&session.output_dir).await {
            Ok(()) => info!("removed HLS output directory {:?}", session.output_dir),
            Err(e) => warn!("error removing {:?}: {}", session.output_dir, e),
        }

        self.hub.clear(instance_id).await;
    }

    pub async fn stream_status(&self, instance_id: &str) -> StreamStatus {
        let sessions = self.sessions.lock().await;
        match sessions.get(instance_id) {
            None => StreamStatus::NotFound,
            Some(session) => {
                if session.shared.is_ready().await {
                    StreamStatus::Ready
                } else {
                    StreamStatus::Generating
                }
            }
        }
    }

    pub async fn segment_count(&self, instance_id: &str) -> u64 {
        let sessions = self.sessions.lock().await;
        match sessions.get(instance_id) {
            Some(session) => session.shared.segment_count().await,
            None => 0,
        }
    }

    pub async fn playlist_path(&self, instance_id: &str) -> Option<PathBuf> {
        let path = {
            let sessions = self.sessions.lock().await;
            sessions.get(instance_id)?.playlist_path.clone()
        };
        tokio::fs::try_exists(&path).await.ok()?.then_some(path)
    }

    pub async fn segment_path(&self, instance_id: &str, number: u64) -> Option<PathBuf> {
        let path = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(instance_id)?
                .output_dir
                .join(format!("segment{}.aac", number))
        };
        tokio::fs::try_exists(&path).await.ok()?.then_some(path)
    }

    /// Stop every active session.  Used on daemon shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_stream(&id).await;
        }
    }
}

// ── encoder tasks ─────────────────────────────────────────────────────────────

/// Owns the encoder child.  On natural exit it only logs — cleanup stays
/// explicit, via `stop_stream`.  On cancellation it asks ffmpeg to quit
/// ('q' on stdin), waits a bounded grace period, then kills.
async fn monitor_encoder(
    instance_id: String,
    mut child: tokio::process::Child,
    cancel: CancellationToken,
    done_tx: oneshot::Sender<()>,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(s) if s.success() => info!(instance = %instance_id, "HLS encoding completed"),
            Ok(s) => warn!(instance = %instance_id, "HLS encoding failed with {}", s),
            Err(e) => warn!(instance = %instance_id, "encoder wait failed: {}", e),
        },
        _ = cancel.cancelled() => {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(b"q").await;
                let _ = stdin.shutdown().await;
            }
            match tokio::time::timeout(ENCODER_KILL_GRACE, child.wait()).await {
                Ok(_) => debug!(instance = %instance_id, "encoder quit gracefully"),
                Err(_) => {
                    warn!(instance = %instance_id, "encoder unresponsive, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
    let _ = done_tx.send(());
}

/// Forward encoder diagnostics into the log, skipping the per-frame
/// progress spam.
async fn log_encoder_stderr(instance_id: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() || line.starts_with("frame=") || line.contains("time=") {
            continue;
        }
        info!(instance = %instance_id, "ffmpeg: {}", line);
    }
}
