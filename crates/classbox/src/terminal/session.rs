//! Session descriptors and the shell snippets run inside containers.

use classbox_protocol::TerminalSessionInfo;
use serde::{Deserialize, Serialize};

use super::TerminalConfig;

const MARKER_PREFIX: &str = "cbx-";

/// Shared, serializable half of a terminal session. Safe to read from any
/// worker; the live stream stays with the worker that owns the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub connection_id: String,
    pub project_id: String,
    pub actor: String,
    /// Container the shell runs in.
    pub container: String,
    pub exec_id: String,
    /// Tag exported into the shell's environment; never shown to callers.
    pub session_marker: String,
    /// Worker owning the live stream.
    pub worker_id: String,
    pub created_at_ms: i64,
}

impl SessionMetadata {
    pub fn info(&self) -> TerminalSessionInfo {
        TerminalSessionInfo {
            connection_id: self.connection_id.clone(),
            project_id: self.project_id.clone(),
            actor: self.actor.clone(),
            created_at_ms: self.created_at_ms,
        }
    }
}

pub fn new_session_marker() -> String {
    format!("{}{}", MARKER_PREFIX, uuid::Uuid::new_v4().simple())
}

/// Markers are embedded in shell scripts, so only `cbx-[a-z0-9]+` is accepted.
pub fn is_valid_marker(marker: &str) -> bool {
    marker
        .strip_prefix(MARKER_PREFIX)
        .is_some_and(|rest| {
            !rest.is_empty()
                && rest
                    .chars()
                    .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        })
}

/// Interactive shell that tags itself with `marker` and logs out after the
/// configured idle time.
pub fn shell_command(config: &TerminalConfig, marker: &str) -> Vec<String> {
    let mut script = format!("export {}={}; ", config.marker_env, marker);
    if config.idle_timeout_secs > 0 {
        script.push_str(&format!("export TMOUT={}; ", config.idle_timeout_secs));
    }
    script.push_str(&format!("exec {} -i", config.shell));
    vec![config.shell.clone(), "-c".to_string(), script]
}

/// Kill every process whose environment carries exactly `VAR=marker` and
/// print the killed pids. Finding nothing is not an error.
pub fn sweep_command(marker_env: &str, marker: &str) -> Vec<String> {
    let script = format!(
        r#"for p in /proc/[0-9]*; do
  pid=${{p#/proc/}}
  [ "$pid" = "$$" ] && continue
  if tr '\0' '\n' < "$p/environ" 2>/dev/null | grep -qx '{var}={marker}'; then
    kill -9 "$pid" 2>/dev/null && echo "$pid"
  fi
done
exit 0"#,
        var = marker_env,
        marker = marker,
    );
    vec!["sh".to_string(), "-c".to_string(), script]
}

/// Pids reported by [`sweep_command`]. Anything that is not a pid is noise.
pub fn swept_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Turns raw output chunks into text without splitting multi-byte
/// characters that straddle chunk boundaries.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left when the stream ends.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
