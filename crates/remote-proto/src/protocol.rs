use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Lifecycle state of one supervised mpv process.
///
/// Transitions:
///   Starting -> Running   (post-spawn IPC probe succeeded)
///   Starting -> Error     (probe failed or timed out)
///   Running  -> Stopped   (clean quit or process exit)
///   any      -> Error     (unrecoverable spawn failure)
///
/// `Stopped` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Running,
    Error,
    Stopped,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Error)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Error => "error",
            InstanceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Public snapshot of an instance, as returned by the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: String,
    pub status: InstanceState,
    pub last_seen: DateTime<Utc>,
    pub client_name: Option<String>,
}

/// High-level playback actions accepted on the command endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteAction {
    Play,
    Pause,
    Stop,
    Loadfile,
    Seek,
    Volume,
    GetProperty,
    SetProperty,
}

/// One remote command as submitted by a client.  `params` values are opaque
/// JSON payloads — property values round-trip through the wire format
/// unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub action: RemoteAction,
    #[serde(default)]
    pub params: Option<HashMap<String, Value>>,
}

impl RemoteCommand {
    pub fn new(action: RemoteAction) -> Self {
        Self {
            action,
            params: None,
        }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|p| p.get(key))
    }
}

/// Response frame read back from the mpv IPC connection.  `request_id` is
/// used solely for correlation; unsolicited event frames carry none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

impl MpvResponse {
    pub fn is_success(&self) -> bool {
        self.error == "success"
    }
}

/// One track as reported by mpv's `track-list` property.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub id: i64,
    pub title: String,
    pub lang: String,
    pub codec: String,
    pub default: bool,
    pub selected: bool,
}

/// Audio/subtitle track listing plus the currently selected ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSelection {
    pub audio_tracks: Vec<TrackInfo>,
    pub subtitle_tracks: Vec<TrackInfo>,
    pub audio_track: Option<Value>,
    pub subtitle_track: Option<Value>,
}

/// Readiness snapshot for a transcode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// No session exists for the instance.
    NotFound,
    /// Encoder running, not enough segments buffered yet.
    Generating,
    /// Enough segments exist for playback to start.
    Ready,
}

/// One encoded segment as observed on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentInfo {
    pub name: String,
    pub url: String,
    pub number: u64,
    pub size: u64,
    pub instance_id: String,
}

/// Events fanned out to stream subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Segment { segment: SegmentInfo },
    Ready,
}
