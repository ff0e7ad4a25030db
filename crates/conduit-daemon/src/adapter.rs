use std::process::Stdio;

use async_trait::async_trait;
use conduit_core::config::AdapterCommandConfig;
use conduit_core::{SourceId, SourceKind, SyncResult};
use conduit_scheduler::{AdapterError, SourceAdapter};
use tokio::process::Command;
use tracing::debug;

const MAX_CAPTURED_CHARS: usize = 2_000;

/// Runs an external program to pull one source.
///
/// The program is called as `command [args..] <source-id>`. A zero exit is a
/// successful sync; if stdout is a JSON object it is read as the sync result
/// (`records` plus any detail), otherwise the raw output is kept as detail.
/// The child is killed when the scheduler's execution window elapses.
pub struct CommandAdapter {
    kind: SourceKind,
    command: String,
    args: Vec<String>,
}

impl CommandAdapter {
    pub fn new(kind: SourceKind, config: &AdapterCommandConfig) -> Self {
        Self {
            kind,
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

#[async_trait]
impl SourceAdapter for CommandAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn sync_data(&self, source_id: &SourceId) -> Result<SyncResult, AdapterError> {
        debug!(kind = %self.kind, %source_id, command = %self.command, "running sync command");
        let output = Command::new(&self.command)
            .args(&self.args)
            .arg(source_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AdapterError::Unavailable(format!("{}: {e}", self.command)))?;

        if !output.status.success() {
            let stderr = captured(&output.stderr);
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(AdapterError::Failed(format!("exit {code}: {stderr}")));
        }
        Ok(parse_result(&output.stdout))
    }
}

fn captured(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX_CAPTURED_CHARS) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

fn parse_result(stdout: &[u8]) -> SyncResult {
    match serde_json::from_slice::<serde_json::Value>(stdout) {
        Ok(serde_json::Value::Object(mut fields)) => {
            let records = fields
                .remove("records")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            SyncResult::new(records).with_detail(serde_json::Value::Object(fields))
        }
        _ => SyncResult::new(0).with_detail(serde_json::json!({ "stdout": captured(stdout) })),
    }
}
