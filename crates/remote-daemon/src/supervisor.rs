//! Instance supervisor: spawns mpv processes, tracks lifecycle state,
//! verifies IPC readiness and reaps process exit.
//!
//! The registry is the single owner of all instance records.  Structural
//! mutation (insert/remove) and state transitions go through the `RwLock`;
//! IPC itself happens outside the lock so one slow mpv never stalls
//! unrelated instances.
//!
//! Each instance carries a `CancellationToken` as its kill switch: the exit
//! monitor task owns the `Child` and waits on exit or the token, whichever
//! fires first, and performs the Stopped transition exactly once.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use remote_proto::config::MpvConfig;
use remote_proto::platform;
use remote_proto::protocol::{
    InstanceInfo, InstanceState, MpvResponse, RemoteCommand, TrackInfo, TrackSelection,
};

use crate::command;
use crate::error::{DaemonError, Result};
use crate::ipc::IpcEndpoint;

struct Instance {
    socket_name: String,
    state: InstanceState,
    last_seen: DateTime<Utc>,
    client_name: Option<String>,
    kill: CancellationToken,
}

pub struct Supervisor {
    instances: RwLock<HashMap<String, Instance>>,
    config: MpvConfig,
}

impl Supervisor {
    pub fn new(config: MpvConfig) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn ipc_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.ipc_timeout_secs)
    }

    // ── creation ──────────────────────────────────────────────────────────────

    /// Spawn a new mpv process and verify its IPC endpoint.  Returns the
    /// instance id once the post-spawn probe has succeeded; any failure
    /// leaves the record in `Error` and surfaces `InstanceStart`.
    ///
    /// `stream_audio` mutes local output (`--ao=null`) so the only audible
    /// path is the transcoded stream.
    pub async fn create_instance(
        self: &Arc<Self>,
        media_file: Option<&str>,
        stream_audio: bool,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let socket_name = platform::mpv_socket_name(&id);
        let kill = CancellationToken::new();

        info!(instance = %id, socket = %socket_name, "creating mpv instance");

        {
            let mut map = self.instances.write().await;
            map.insert(
                id.clone(),
                Instance {
                    socket_name: socket_name.clone(),
                    state: InstanceState::Starting,
                    last_seen: Utc::now(),
                    client_name: None,
                    kill: kill.clone(),
                },
            );
        }

        // Stale socket from a previous run with the same name would make
        // mpv fail to bind.
        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&socket_name).await;

        let child = match self.spawn_mpv(&socket_name, media_file, stream_audio) {
            Ok(child) => child,
            Err(e) => {
                self.set_state(&id, InstanceState::Error).await;
                return Err(e);
            }
        };

        tokio::spawn(Arc::clone(self).monitor_process(id.clone(), child, kill));

        tokio::time::sleep(Duration::from_secs_f64(self.config.settle_secs)).await;

        // Harmless probe; Starting is a valid state for this one command.
        match self
            .send_command(&id, &[json!("get_property"), json!("mpv-version")], true)
            .await
        {
            Ok(resp) if resp.is_success() => {
                self.set_state(&id, InstanceState::Running).await;
                info!(instance = %id, "mpv instance is running");
                Ok(id)
            }
            Ok(resp) => {
                self.set_state(&id, InstanceState::Error).await;
                Err(DaemonError::InstanceStart(format!(
                    "mpv started but probe returned '{}'",
                    resp.error
                )))
            }
            Err(e) => {
                self.set_state(&id, InstanceState::Error).await;
                Err(DaemonError::InstanceStart(format!(
                    "mpv started but IPC probe failed: {}",
                    e
                )))
            }
        }
    }

    fn spawn_mpv(
        &self,
        socket_name: &str,
        media_file: Option<&str>,
        stream_audio: bool,
    ) -> Result<tokio::process::Child> {
        let binary = platform::find_mpv_binary()
            .ok_or_else(|| DaemonError::InstanceStart("mpv binary not found".into()))?;

        let mut cmd = tokio::process::Command::new(binary);
        cmd.arg("--player-operation-mode=pseudo-gui")
            .arg("--idle=yes")
            .arg("--force-window=yes")
            .arg("--sub-auto=fuzzy")
            .arg("--slang=en,eng")
            .arg(platform::mpv_socket_arg(socket_name));

        if stream_audio {
            cmd.arg("--ao=null");
        }
        for extra in &self.config.extra_args {
            cmd.arg(extra);
        }
        if let Some(file) = media_file {
            cmd.arg(file);
        }

        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        debug!("spawning mpv: {:?}", cmd);
        cmd.spawn()
            .map_err(|e| DaemonError::InstanceStart(format!("failed to spawn mpv: {}", e)))
    }

    /// Waits on the child process; owns it for the instance's whole life.
    /// Transitions to Stopped exactly once on exit, from any prior state
    /// except an earlier Stopped.  The kill token doubles as the forceful
    /// path for `stop_instance`.
    async fn monitor_process(
        self: Arc<Self>,
        id: String,
        mut child: tokio::process::Child,
        kill: CancellationToken,
    ) {
        tokio::select! {
            status = child.wait() => match status {
                Ok(s) => info!(instance = %id, "mpv exited with {}", s),
                Err(e) => warn!(instance = %id, "mpv wait failed: {}", e),
            },
            _ = kill.cancelled() => {
                debug!(instance = %id, "kill requested, terminating mpv");
                if let Err(e) = child.kill().await {
                    warn!(instance = %id, "mpv kill failed: {}", e);
                }
            }
        }
        self.mark_stopped(&id).await;
    }

    async fn mark_stopped(&self, id: &str) {
        let mut map = self.instances.write().await;
        if let Some(inst) = map.get_mut(id) {
            if inst.state != InstanceState::Stopped {
                inst.state = InstanceState::Stopped;
                info!(instance = %id, "instance stopped");
            }
        }
    }

    async fn set_state(&self, id: &str, state: InstanceState) {
        let mut map = self.instances.write().await;
        if let Some(inst) = map.get_mut(id) {
            debug!(instance = %id, "state {} -> {}", inst.state, state);
            inst.state = state;
        }
    }

    // ── commands ──────────────────────────────────────────────────────────────

    /// Send a native frame to the instance's IPC endpoint.  State gating
    /// happens before any connection is opened; `allow_starting` widens the
    /// valid set for the post-spawn probe only.
    pub async fn send_command(
        &self,
        id: &str,
        frame: &[Value],
        allow_starting: bool,
    ) -> Result<MpvResponse> {
        let socket_name = {
            let map = self.instances.read().await;
            let inst = map
                .get(id)
                .ok_or_else(|| DaemonError::InstanceNotFound(id.to_string()))?;
            let valid = match inst.state {
                InstanceState::Running => true,
                InstanceState::Starting => allow_starting,
                _ => false,
            };
            if !valid {
                return Err(DaemonError::InvalidState {
                    id: id.to_string(),
                    state: inst.state,
                });
            }
            inst.socket_name.clone()
        };

        let response = IpcEndpoint::new(socket_name)
            .send_command(frame, self.ipc_timeout())
            .await?;
        self.touch(id).await;
        Ok(response)
    }

    /// Translate and execute one high-level remote command.  Validation
    /// failures surface before any IPC is attempted.
    pub async fn execute_remote(&self, id: &str, cmd: &RemoteCommand) -> Result<MpvResponse> {
        let frame = command::translate(cmd)?;
        info!(instance = %id, "executing remote command {:?}", cmd.action);
        self.send_command(id, &frame, false).await
    }

    /// Load new media into a running instance, replacing the current file.
    pub async fn load_file(&self, id: &str, file: &str) -> Result<MpvResponse> {
        self.send_command(id, &[json!("loadfile"), json!(file), json!("replace")], false)
            .await
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    /// Best-effort graceful quit, falling back to a forced kill via the
    /// exit monitor's token.  Always ends with the instance Stopped.
    pub async fn stop_instance(&self, id: &str) -> Result<()> {
        let kill = {
            let map = self.instances.read().await;
            let inst = map
                .get(id)
                .ok_or_else(|| DaemonError::InstanceNotFound(id.to_string()))?;
            inst.kill.clone()
        };

        match self.send_command(id, &[json!("quit")], false).await {
            Ok(_) => debug!(instance = %id, "quit command accepted"),
            Err(e) => {
                warn!(instance = %id, "quit command failed ({}), killing process", e);
                kill.cancel();
            }
        }

        self.mark_stopped(id).await;
        Ok(())
    }

    /// Maintenance sweep: drop instances in Error state or idle for longer
    /// than `idle_threshold`.  Processes of removed instances are killed via
    /// their tokens.  Never runs inside a request path.
    pub async fn reap_idle_instances(&self, idle_threshold: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let mut map = self.instances.write().await;
        let before = map.len();
        map.retain(|id, inst| {
            let dead = inst.state == InstanceState::Error || inst.last_seen < cutoff;
            if dead {
                info!(instance = %id, state = %inst.state, "reaping idle instance");
                inst.kill.cancel();
            }
            !dead
        });
        before - map.len()
    }

    async fn touch(&self, id: &str) {
        let mut map = self.instances.write().await;
        if let Some(inst) = map.get_mut(id) {
            inst.last_seen = Utc::now();
        }
    }

    // ── queries ───────────────────────────────────────────────────────────────

    pub async fn state_of(&self, id: &str) -> Option<InstanceState> {
        self.instances.read().await.get(id).map(|i| i.state)
    }

    /// First instance currently in Running state, if any.  Used by the HTTP
    /// layer's single-instance reuse policy.
    pub async fn running_instance(&self) -> Option<String> {
        self.instances
            .read()
            .await
            .iter()
            .find(|(_, inst)| inst.state == InstanceState::Running)
            .map(|(id, _)| id.clone())
    }

    /// Snapshot of one instance, refreshing the lazily resolved client
    /// name.  Resolution failures are logged and leave the cached value.
    pub async fn get_instance(&self, id: &str) -> Option<InstanceInfo> {
        self.refresh_client_name(id).await;
        let map = self.instances.read().await;
        map.get(id).map(|inst| snapshot(id, inst))
    }

    pub async fn list_instances(&self) -> Vec<InstanceInfo> {
        let ids: Vec<String> = self.instances.read().await.keys().cloned().collect();
        for id in &ids {
            self.refresh_client_name(id).await;
        }
        let map = self.instances.read().await;
        ids.iter()
            .filter_map(|id| map.get(id).map(|inst| snapshot(id, inst)))
            .collect()
    }

    async fn refresh_client_name(&self, id: &str) {
        match self.send_command(id, &[json!("client_name")], false).await {
            Ok(resp) => {
                let name = resp.data.and_then(|d| d.as_str().map(str::to_string));
                let mut map = self.instances.write().await;
                if let Some(inst) = map.get_mut(id) {
                    inst.client_name = name;
                }
            }
            Err(e) => debug!(instance = %id, "client name unavailable: {}", e),
        }
    }

    // ── track inspection ──────────────────────────────────────────────────────

    /// Audio and subtitle tracks of the loaded file plus the currently
    /// selected ids, read from mpv's `track-list` / `aid` / `sid`.
    pub async fn get_tracks(&self, id: &str) -> Result<TrackSelection> {
        let tracks = self
            .send_command(id, &[json!("get_property"), json!("track-list")], false)
            .await?;
        let list = tracks
            .data
            .as_ref()
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let audio_track = self
            .send_command(id, &[json!("get_property"), json!("aid")], false)
            .await?
            .data;
        let subtitle_track = self
            .send_command(id, &[json!("get_property"), json!("sid")], false)
            .await?
            .data;

        Ok(TrackSelection {
            audio_tracks: filter_tracks(&list, "audio", "Audio Track"),
            subtitle_tracks: filter_tracks(&list, "sub", "Subtitle"),
            audio_track,
            subtitle_track,
        })
    }

    /// Select a track by mpv track id.  `kind` is "audio" or "subtitle".
    pub async fn set_track(&self, id: &str, kind: &str, track_id: &Value) -> Result<MpvResponse> {
        let property = match kind {
            "audio" => "aid",
            "subtitle" => "sid",
            other => {
                return Err(DaemonError::Validation(format!(
                    "invalid track type '{}'",
                    other
                )))
            }
        };
        self.send_command(
            id,
            &[json!("set_property"), json!(property), track_id.clone()],
            false,
        )
        .await
    }

    // ── test support ──────────────────────────────────────────────────────────

    #[cfg(test)]
    async fn insert_test_instance(&self, id: &str, state: InstanceState, last_seen: DateTime<Utc>) {
        let mut map = self.instances.write().await;
        map.insert(
            id.to_string(),
            Instance {
                socket_name: platform::mpv_socket_name(id),
                state,
                last_seen,
                client_name: None,
                kill: CancellationToken::new(),
            },
        );
    }
}

fn snapshot(id: &str, inst: &Instance) -> InstanceInfo {
    InstanceInfo {
        id: id.to_string(),
        status: inst.state,
        last_seen: inst.last_seen,
        client_name: inst.client_name.clone(),
    }
}

fn filter_tracks(list: &[Value], kind: &str, fallback_title: &str) -> Vec<TrackInfo> {
    list.iter()
        .filter(|t| t.get("type").and_then(Value::as_str) == Some(kind))
        .map(|t| {
            let id = t.get("id").and_then(Value::as_i64).unwrap_or(-1);
            TrackInfo {
                id,
                title: t
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{} {}", fallback_title, id)),
                lang: t
                    .get("lang")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string(),
                codec: t
                    .get("codec")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string(),
                default: t.get("default").and_then(Value::as_bool).unwrap_or(false),
                selected: t.get("selected").and_then(Value::as_bool).unwrap_or(false),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn supervisor() -> Supervisor {
        Supervisor::new(MpvConfig::default())
    }

    #[tokio::test]
    async fn send_command_to_unknown_instance_fails() {
        let sup = supervisor();
        let err = sup
            .send_command("nope", &[json!("stop")], false)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn send_command_gates_on_state_before_ipc() {
        let sup = supervisor();
        // No mpv process exists behind these records — if gating were
        // skipped the call would fail with a connection error instead.
        for state in [InstanceState::Stopped, InstanceState::Error] {
            sup.insert_test_instance("i", state, Utc::now()).await;
            let err = sup
                .send_command("i", &[json!("stop")], false)
                .await
                .unwrap_err();
            assert!(matches!(err, DaemonError::InvalidState { .. }));
        }
    }

    #[tokio::test]
    async fn starting_requires_allow_starting() {
        let sup = supervisor();
        sup.insert_test_instance("i", InstanceState::Starting, Utc::now())
            .await;
        let err = sup
            .send_command("i", &[json!("stop")], false)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::InvalidState { .. }));
        // With allow_starting the gate passes and the call proceeds to the
        // (nonexistent) socket.
        let err = sup
            .send_command("i", &[json!("stop")], true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Connection(_) | DaemonError::Timeout
        ));
    }

    #[tokio::test]
    async fn mark_stopped_is_idempotent() {
        let sup = supervisor();
        sup.insert_test_instance("i", InstanceState::Running, Utc::now())
            .await;
        sup.mark_stopped("i").await;
        sup.mark_stopped("i").await;
        assert_eq!(sup.state_of("i").await, Some(InstanceState::Stopped));
    }

    #[tokio::test]
    async fn reaper_removes_error_and_stale_instances() {
        let sup = supervisor();
        sup.insert_test_instance("errored", InstanceState::Error, Utc::now())
            .await;
        sup.insert_test_instance(
            "stale",
            InstanceState::Running,
            Utc::now() - chrono::Duration::seconds(600),
        )
        .await;
        sup.insert_test_instance("fresh", InstanceState::Running, Utc::now())
            .await;

        let removed = sup.reap_idle_instances(Duration::from_secs(300)).await;
        assert_eq!(removed, 2);
        assert!(sup.state_of("errored").await.is_none());
        assert!(sup.state_of("stale").await.is_none());
        assert_eq!(sup.state_of("fresh").await, Some(InstanceState::Running));
    }

    #[tokio::test]
    async fn running_instance_ignores_terminal_states() {
        let sup = supervisor();
        sup.insert_test_instance("dead", InstanceState::Stopped, Utc::now())
            .await;
        assert!(sup.running_instance().await.is_none());
        sup.insert_test_instance("live", InstanceState::Running, Utc::now())
            .await;
        assert_eq!(sup.running_instance().await.as_deref(), Some("live"));
    }

    // Full create_instance lifecycle with a fake mpv binary: the probe
    // outcome alone decides Starting -> Running vs Starting -> Error.
    #[cfg(unix)]
    mod lifecycle {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::UnixListener;

        fn write_fake_mpv(tag: &str, body: &str) -> std::path::PathBuf {
            let path = std::env::temp_dir().join(format!(
                "fake-mpv-{}-{}",
                tag,
                std::process::id()
            ));
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        /// Speaks just enough of the IPC protocol: one request frame per
        /// connection, answered with success and the echoed request id.
        async fn fake_mpv_ipc(listener: UnixListener) {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    let Ok(text) = std::str::from_utf8(&buf[..n]) else {
                        return;
                    };
                    let Ok(frame) = serde_json::from_str::<Value>(text.trim()) else {
                        return;
                    };
                    let Some(req_id) = frame["request_id"].as_u64() else {
                        return;
                    };
                    let reply = format!(
                        "{{\"error\":\"success\",\"data\":\"0.40.0\",\"request_id\":{}}}\n",
                        req_id
                    );
                    let _ = stream.write_all(reply.as_bytes()).await;
                    let _ = stream.read(&mut buf).await;
                });
            }
        }

        #[tokio::test]
        async fn probe_outcome_decides_running_or_error() {
            // success path: the fake mpv symlinks its --input-ipc-server
            // path to the scripted peer's socket
            let peer_path =
                std::env::temp_dir().join(format!("fake-mpv-peer-{}", std::process::id()));
            let _ = std::fs::remove_file(&peer_path);
            let listener = UnixListener::bind(&peer_path).unwrap();
            let server = tokio::spawn(fake_mpv_ipc(listener));

            let script = format!(
                "#!/bin/sh\n\
                 for arg in \"$@\"; do\n\
                   case \"$arg\" in\n\
                     --input-ipc-server=*) ln -sf {} \"${{arg#--input-ipc-server=}}\" ;;\n\
                   esac\n\
                 done\n\
                 sleep 5\n",
                peer_path.display()
            );
            let good = write_fake_mpv("good", &script);
            std::env::set_var("MPV_PATH", &good);

            let sup = Arc::new(Supervisor::new(MpvConfig {
                settle_secs: 0.2,
                ipc_timeout_secs: 2.0,
                extra_args: Vec::new(),
            }));
            let id = sup.create_instance(None, false).await.unwrap();
            assert_eq!(sup.state_of(&id).await, Some(InstanceState::Running));
            sup.stop_instance(&id).await.unwrap();
            assert_eq!(sup.state_of(&id).await, Some(InstanceState::Stopped));

            // failure path: mpv starts but never opens its IPC endpoint
            let bad = write_fake_mpv("bad", "#!/bin/sh\nsleep 2\n");
            std::env::set_var("MPV_PATH", &bad);

            let sup = Arc::new(Supervisor::new(MpvConfig {
                settle_secs: 0.1,
                ipc_timeout_secs: 0.3,
                extra_args: Vec::new(),
            }));
            let err = sup.create_instance(None, false).await.unwrap_err();
            assert!(matches!(err, DaemonError::InstanceStart(_)));
            assert!(sup.running_instance().await.is_none());
            let instances = sup.list_instances().await;
            assert_eq!(instances.len(), 1);
            assert_eq!(instances[0].status, InstanceState::Error);

            server.abort();
            std::env::remove_var("MPV_PATH");
            let _ = std::fs::remove_file(&peer_path);
            let _ = std::fs::remove_file(&good);
            let _ = std::fs::remove_file(&bad);
        }
    }

    #[test]
    fn track_filtering_maps_mpv_track_list() {
        let list = vec![
            json!({"id": 1, "type": "audio", "title": "English", "lang": "en", "codec": "aac", "default": true, "selected": true}),
            json!({"id": 2, "type": "sub", "lang": "de"}),
            json!({"id": 3, "type": "video"}),
        ];
        let audio = filter_tracks(&list, "audio", "Audio Track");
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].title, "English");
        assert!(audio[0].selected);

        let subs = filter_tracks(&list, "sub", "Subtitle");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].title, "Subtitle 2");
        assert_eq!(subs[0].lang, "de");
    }
}
