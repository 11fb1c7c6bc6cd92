//! Best-effort media probing via ffprobe.  Probe failures never abort a
//! stream start — the encoder falls back to fixed defaults instead.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use remote_proto::platform;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Audio characteristics the encoder pins explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
        }
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    // ffprobe reports sample_rate as a string
    sample_rate: Option<String>,
    channels: Option<u32>,
}

/// Probe the first audio stream of `media_file`.  Any failure — missing
/// binary, non-zero exit, timeout, malformed JSON, no audio stream — is
/// logged and degrades to the defaults.
pub async fn probe_audio_params(media_file: &str) -> AudioParams {
    let Some(binary) = platform::find_ffprobe_binary() else {
        warn!("ffprobe not found on PATH, using default audio params");
        return AudioParams::default();
    };

    let output = tokio::process::Command::new(binary)
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg(media_file)
        .stdin(std::process::Stdio::null())
        .output();

    let output = match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            warn!("ffprobe failed to run for {}: {}", media_file, e);
            return AudioParams::default();
        }
        Err(_) => {
            warn!("ffprobe timed out for {}", media_file);
            return AudioParams::default();
        }
    };

    if !output.status.success() {
        warn!("ffprobe exited with {} for {}", output.status, media_file);
        return AudioParams::default();
    }

    match parse_probe_output(&output.stdout) {
        Some(params) => params,
        None => {
            warn!("no usable audio stream info for {}, using defaults", media_file);
            AudioParams::default()
        }
    }
}

fn parse_probe_output(stdout: &[u8]) -> Option<AudioParams> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout).ok()?;
    let audio = parsed
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))?;

    debug!(
        "source audio: {}, {:?} Hz, {:?} channels",
        audio.codec_name.as_deref().unwrap_or("unknown"),
        audio.sample_rate,
        audio.channels
    );

    let defaults = AudioParams::default();
    Some(AudioParams {
        sample_rate: audio
            .sample_rate
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.sample_rate),
        channels: audio.channels.unwrap_or(defaults.channels),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_audio_stream() {
        let json = br#"{"streams":[
            {"codec_type":"video","codec_name":"h264"},
            {"codec_type":"audio","codec_name":"dts","sample_rate":"44100","channels":6},
            {"codec_type":"audio","codec_name":"aac","sample_rate":"22050","channels":1}
        ]}"#;
        let params = parse_probe_output(json).unwrap();
        assert_eq!(params.sample_rate, 44100);
        assert_eq!(params.channels, 6);
    }

    #[test]
    fn missing_fields_fall_back_per_field() {
        let json = br#"{"streams":[{"codec_type":"audio","codec_name":"flac"}]}"#;
        let params = parse_probe_output(json).unwrap();
        assert_eq!(params, AudioParams::default());
    }

    #[test]
    fn no_audio_stream_yields_none() {
        assert!(parse_probe_output(br#"{"streams":[{"codec_type":"video"}]}"#).is_none());
        assert!(parse_probe_output(br#"{"streams":[]}"#).is_none());
        assert!(parse_probe_output(b"not json").is_none());
    }
}
