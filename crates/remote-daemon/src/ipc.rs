//! mpv JSON-line IPC: transport plus command correlator.
//!
//! ```text
//!   IpcEndpoint::send_command(cmd, timeout)
//!         │
//!         ├── connect()            fresh connection per command
//!         ├── write frame          {"command":[...],"request_id":N}\n
//!         └── read lines in a loop
//!                ├── malformed JSON        → skipped (logged)
//!                ├── event / other req_id  → skipped
//!                └── request_id == N       → returned
//! ```
//!
//! One connection per command is the only discipline that is safe on every
//! platform transport: Windows named pipes do not multiplex concurrent
//! readers from independent openers, and mpv accepts any number of
//! short-lived IPC clients.  Unsolicited event frames that arrive on the
//! connection are discarded at this layer.
//!
//! Platform notes:
//! - Unix:    Unix domain sockets
//! - Windows: named pipes  \\.\pipe\<name>

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

#[cfg(windows)]
use remote_proto::platform;
use remote_proto::protocol::MpvResponse;

use crate::error::{DaemonError, Result};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed)
}

// ── endpoint ──────────────────────────────────────────────────────────────────

/// One mpv IPC endpoint, identified by its platform socket name.
#[derive(Debug, Clone)]
pub struct IpcEndpoint {
    socket_name: String,
}

impl IpcEndpoint {
    pub fn new(socket_name: impl Into<String>) -> Self {
        Self {
            socket_name: socket_name.into(),
        }
    }

    #[cfg(unix)]
    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_name)
            .await
            .map_err(DaemonError::Connection)
    }

    #[cfg(windows)]
    async fn connect(&self) -> Result<tokio::net::windows::named_pipe::NamedPipeClient> {
        let addr = platform::mpv_socket_address(&self.socket_name);
        ClientOptions::new()
            .open(&addr)
            .map_err(DaemonError::Connection)
    }

    /// Send one native command frame and wait for the response whose
    /// `request_id` matches.  Interleaved event frames and responses for
    /// other requests are skipped; only the hard timeout terminates an
    /// unmatched wait.
    pub async fn send_command(&self, command: &[Value], timeout: Duration) -> Result<MpvResponse> {
        let req_id = next_request_id();
        let frame = json!({ "command": command, "request_id": req_id });
        let mut payload = serde_json::to_string(&frame)
            .map_err(|e| DaemonError::Protocol(e.to_string()))?;
        payload.push('\n');

        debug!(socket = %self.socket_name, req_id, "ipc: send {}", payload.trim());

        let stream = self.connect().await?;
        exchange(stream, &payload, req_id, timeout).await
    }
}

// ── correlator loop ───────────────────────────────────────────────────────────

async fn exchange<S>(
    mut stream: S,
    payload: &str,
    req_id: u64,
    timeout: Duration,
) -> Result<MpvResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(payload.as_bytes())
        .await
        .map_err(DaemonError::Connection)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        line.clear();
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(DaemonError::Timeout);
        }

        let n = tokio::time::timeout(remaining, reader.read_line(&mut line))
            .await
            .map_err(|_| DaemonError::Timeout)?
            .map_err(DaemonError::Connection)?;

        if n == 0 {
            return Err(DaemonError::ConnectionClosed);
        }

        if let Some(response) = match_line(line.trim(), req_id) {
            debug!(req_id, "ipc: matched response");
            return Ok(response);
        }
    }
}

/// Parse one incoming line against the pending request id.  Returns `None`
/// for blank lines, malformed JSON (logged and skipped — a single bad line
/// must not abort correlation) and frames that belong to other requests or
/// are unsolicited events.
fn match_line(line: &str, req_id: u64) -> Option<MpvResponse> {
    if line.is_empty() {
        return None;
    }
    let val: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("ipc: skipping malformed line '{}': {}", line, e);
            return None;
        }
    };
    if val.get("request_id").and_then(Value::as_u64) != Some(req_id) {
        debug!("ipc: skipping unmatched frame {}", line);
        return None;
    }
    match serde_json::from_value::<MpvResponse>(val) {
        Ok(r) => Some(r),
        Err(e) => {
            debug!("ipc: response frame with bad shape '{}': {}", line, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_only_the_requested_id() {
        assert!(match_line(r#"{"error":"success","request_id":3}"#, 3).is_some());
        assert!(match_line(r#"{"error":"success","request_id":4}"#, 3).is_none());
    }

    #[test]
    fn skips_events_and_malformed_lines() {
        // unsolicited property-change event — no request_id
        assert!(match_line(r#"{"event":"property-change","id":1,"data":42}"#, 3).is_none());
        assert!(match_line("not json at all {", 3).is_none());
        assert!(match_line("", 3).is_none());
    }

    #[test]
    fn preserves_opaque_data_payload() {
        let res = match_line(
            r#"{"error":"success","data":{"tracks":[1,2]},"request_id":9}"#,
            9,
        )
        .unwrap();
        assert!(res.is_success());
        assert_eq!(res.data.unwrap()["tracks"][0], 1);
    }

    #[test]
    fn request_ids_strictly_increase() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }

    // Correlation against a live socket, with a scripted peer standing in
    // for mpv.
    #[cfg(unix)]
    mod unix_socket {
        use super::super::*;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::UnixListener;

        fn scratch_socket(tag: &str) -> String {
            std::env::temp_dir()
                .join(format!("mpv-ipc-test-{}-{}", tag, std::process::id()))
                .to_string_lossy()
                .into_owned()
        }

        /// Accept one connection, parse the request id out of the incoming
        /// frame, then send each reply line with `{id}` substituted.
        async fn scripted_peer(listener: UnixListener, replies: Vec<String>) {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer expected a request frame");

            let text = std::str::from_utf8(&buf[..n]).unwrap();
            let frame: Value = serde_json::from_str(text.trim()).unwrap();
            let req_id = frame["request_id"].as_u64().unwrap();

            for line in replies {
                let line = line.replace("{id}", &req_id.to_string());
                stream.write_all(line.as_bytes()).await.unwrap();
                stream.write_all(b"\n").await.unwrap();
            }
            // keep the connection open until the client is done
            let _ = stream.read(&mut buf).await;
        }

        #[tokio::test]
        async fn returns_the_matching_response_despite_noise() {
            let path = scratch_socket("noise");
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path).unwrap();

            let replies = vec![
                r#"{"event":"property-change","name":"volume","data":50}"#.to_string(),
                "garbage not json {".to_string(),
                r#"{"error":"success","request_id":18446744073709551000}"#.to_string(),
                r#"{"error":"success","data":"0.40.0","request_id":{id}}"#.to_string(),
            ];
            let peer = tokio::spawn(scripted_peer(listener, replies));

            let endpoint = IpcEndpoint::new(&path);
            let res = endpoint
                .send_command(
                    &[json!("get_property"), json!("mpv-version")],
                    Duration::from_secs(5),
                )
                .await
                .unwrap();
            assert!(res.is_success());
            assert_eq!(res.data, Some(json!("0.40.0")));

            peer.abort();
            let _ = std::fs::remove_file(&path);
        }

        #[tokio::test]
        async fn closed_connection_is_not_a_timeout() {
            let path = scratch_socket("closed");
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path).unwrap();

            let peer = tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 1024];
                let _ = stream.read(&mut buf).await;
                // drop without replying
            });

            let endpoint = IpcEndpoint::new(&path);
            let err = endpoint
                .send_command(&[json!("stop")], Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, DaemonError::ConnectionClosed));

            peer.abort();
            let _ = std::fs::remove_file(&path);
        }

        #[tokio::test]
        async fn unmatched_frames_until_deadline_time_out() {
            let path = scratch_socket("deadline");
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path).unwrap();

            let replies =
                vec![r#"{"event":"playback-restart"}"#.to_string(); 3];
            let peer = tokio::spawn(scripted_peer(listener, replies));

            let endpoint = IpcEndpoint::new(&path);
            let err = endpoint
                .send_command(&[json!("get_property"), json!("volume")], Duration::from_millis(200))
                .await
                .unwrap_err();
            assert!(matches!(err, DaemonError::Timeout));

            peer.abort();
            let _ = std::fs::remove_file(&path);
        }
    }
}
