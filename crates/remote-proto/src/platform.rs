use std::path::PathBuf;

/// IPC endpoint name for one mpv instance.  Unix: socket path under the
/// system temp dir.  Windows: bare pipe name (the `\\.\pipe\` prefix is
/// added where the address is built).
#[cfg(unix)]
pub fn mpv_socket_name(instance_id: &str) -> String {
    format!(
        "{}/mpvsocket_{}",
        std::env::temp_dir().display(),
        instance_id
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(instance_id: &str) -> String {
    format!("mpvsocket_{}", instance_id)
}

/// Full IPC address as mpv expects it on `--input-ipc-server`.
#[cfg(unix)]
pub fn mpv_socket_address(socket_name: &str) -> String {
    socket_name.to_string()
}

#[cfg(windows)]
pub fn mpv_socket_address(socket_name: &str) -> String {
    format!(r"\\.\pipe\{}", socket_name)
}

pub fn mpv_socket_arg(socket_name: &str) -> String {
    format!("--input-ipc-server={}", mpv_socket_address(socket_name))
}

pub fn data_dir() -> PathBuf {
    // Use XDG-style paths on all unixes for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("mpv-remote")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mpv-remote")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("mpv-remote")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mpv-remote")
    }
}

/// Root for transient HLS session directories.  Each session gets
/// `<hls_root>/<instance_id>`, deleted in full when the session stops.
pub fn hls_root() -> PathBuf {
    std::env::temp_dir().join("mpv-remote-hls")
}

#[cfg(unix)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv"]
}

#[cfg(windows)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv.exe", "mpv"]
}

#[cfg(unix)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg"]
}

#[cfg(windows)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg.exe", "ffmpeg"]
}

#[cfg(unix)]
fn ffprobe_binary_names() -> &'static [&'static str] {
    &["ffprobe"]
}

#[cfg(windows)]
fn ffprobe_binary_names() -> &'static [&'static str] {
    &["ffprobe.exe", "ffprobe"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    for dir in path.split(sep) {
        for name in names {
            let p = PathBuf::from(dir).join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Find the mpv binary: MPV_PATH env override, beside the current exe, PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("MPV_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    if let Some(p) = find_beside_exe(mpv_binary_names()) {
        return Some(p);
    }
    find_on_path(mpv_binary_names())
}

/// Find ffmpeg for segment encoding: FFMPEG_PATH env override, beside the
/// current exe, PATH.
pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("FFMPEG_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    if let Some(p) = find_beside_exe(ffmpeg_binary_names()) {
        return Some(p);
    }
    find_on_path(ffmpeg_binary_names())
}

/// Find ffprobe for media probing.
pub fn find_ffprobe_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("FFPROBE_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    if let Some(p) = find_beside_exe(ffprobe_binary_names()) {
        return Some(p);
    }
    find_on_path(ffprobe_binary_names())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_names_embed_instance_id() {
        let name = mpv_socket_name("abc-123");
        assert!(name.contains("mpvsocket_abc-123"));
        let arg = mpv_socket_arg(&name);
        assert!(arg.starts_with("--input-ipc-server="));
    }
}
