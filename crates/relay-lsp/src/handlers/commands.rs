//! `workspace/executeCommand` handlers.

use serde_json::Value;
use tower_lsp::lsp_types::ExecuteCommandParams;
use tracing::warn;

use crate::relay::RelayHandle;

pub const STATUS_COMMAND: &str = "relay-lsp.status";

pub async fn execute_command(relay: &RelayHandle, params: ExecuteCommandParams) -> Option<Value> {
    match params.command.as_str() {
        STATUS_COMMAND => {
            let status = relay.status().await?;
            serde_json::to_value(status)
                .map_err(|err| warn!("Failed to serialize relay status: {err}"))
                .ok()
        }
        other => {
            warn!("Unknown command: {other}");
            None
        }
    }
}
