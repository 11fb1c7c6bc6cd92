//! Remote command translation: high-level playback actions into native mpv
//! command frames.  Pure mapping — validation happens here, before any IPC
//! connection is opened.

use serde_json::{json, Value};

use remote_proto::protocol::{RemoteAction, RemoteCommand};

use crate::error::{DaemonError, Result};

/// Translate one remote command into a native mpv frame (the argument list
/// without the `request_id`, which the correlator adds).
pub fn translate(cmd: &RemoteCommand) -> Result<Vec<Value>> {
    match cmd.action {
        // play and pause both toggle — mpv has a single pause property
        RemoteAction::Play | RemoteAction::Pause => Ok(vec![json!("cycle"), json!("pause")]),

        RemoteAction::Stop => Ok(vec![json!("stop")]),

        RemoteAction::Loadfile => {
            let file = required_str(cmd, "file", "loadfile")?;
            let mode = optional_str(cmd, "mode")?.unwrap_or_else(|| "replace".to_string());
            Ok(vec![json!("loadfile"), json!(file), json!(mode)])
        }

        RemoteAction::Seek => {
            let time = required_scalar(cmd, "time", "seek")?;
            let seek_type = optional_str(cmd, "type")?.unwrap_or_else(|| "absolute".to_string());
            Ok(vec![json!("seek"), json!(time), json!(seek_type)])
        }

        RemoteAction::Volume => match cmd.param("level") {
            Some(_) => {
                let level = required_scalar(cmd, "level", "volume")?;
                Ok(vec![json!("set_property"), json!("volume"), json!(level)])
            }
            None => Ok(vec![json!("get_property"), json!("volume")]),
        },

        RemoteAction::GetProperty => {
            let property = required_str(cmd, "property", "get_property")?;
            Ok(vec![json!("get_property"), json!(property)])
        }

        RemoteAction::SetProperty => {
            let property = required_str(cmd, "property", "set_property")?;
            // The value is an opaque payload — it round-trips through the
            // wire format unchanged.
            let value = cmd
                .param("value")
                .ok_or_else(|| missing("value", "set_property"))?
                .clone();
            Ok(vec![json!("set_property"), json!(property), value])
        }
    }
}

fn missing(key: &str, action: &str) -> DaemonError {
    DaemonError::Validation(format!("'{}' is required for {} command", key, action))
}

fn required_str(cmd: &RemoteCommand, key: &str, action: &str) -> Result<String> {
    match cmd.param(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(other) => Err(DaemonError::Validation(format!(
            "'{}' for {} must be a string, got {}",
            key, action, other
        ))),
        None => Err(missing(key, action)),
    }
}

fn optional_str(cmd: &RemoteCommand, key: &str) -> Result<Option<String>> {
    match cmd.param(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(DaemonError::Validation(format!(
            "'{}' must be a string, got {}",
            key, other
        ))),
    }
}

/// Numbers and strings are both accepted where mpv expects a stringly-typed
/// scalar (seek times, volume levels).
fn required_scalar(cmd: &RemoteCommand, key: &str, action: &str) -> Result<String> {
    match cmd.param(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(DaemonError::Validation(format!(
            "'{}' for {} must be a number or string, got {}",
            key, action, other
        ))),
        None => Err(missing(key, action)),
    }
}
