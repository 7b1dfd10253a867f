//! Terminal commands

use super::AppState;
use crate::error::CoreError;

impl AppState {
    /// Open a shell; output arrives on the terminal event stream under the returned id.
    pub async fn terminal_create(
        &self,
        connection_id: &str,
        session_id: Option<String>,
    ) -> Result<String, CoreError> {
        self.ensure_connected(connection_id).await?;
        self.terminals.create(connection_id, session_id).await
    }

    pub async fn terminal_write(&self, session_id: &str, data: Vec<u8>) -> Result<(), CoreError> {
        self.terminals.write(session_id, data).await
    }

    /// Zero-sized viewports are not forwarded; returns whether the PTY was resized.
    pub async fn terminal_resize(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<bool, CoreError> {
        self.terminals.resize(session_id, cols, rows).await
    }

    pub fn terminal_stop(&self, session_id: &str) {
        self.terminals.stop(session_id);
    }
}
