//! Process commands

use super::AppState;
use crate::error::CoreError;
use crate::process::ProcessTable;

impl AppState {
    /// Raw `ps` output, header included
    pub async fn process_list(&self, connection_id: &str) -> Result<String, CoreError> {
        self.ensure_connected(connection_id).await?;
        self.processes.list_raw(connection_id).await
    }

    /// Decoded rows plus the lines that could not be decoded
    pub async fn process_list_parsed(&self, connection_id: &str) -> Result<ProcessTable, CoreError> {
        self.ensure_connected(connection_id).await?;
        self.processes.list(connection_id).await
    }

    pub async fn process_kill(&self, connection_id: &str, pid: u32) -> Result<(), CoreError> {
        self.ensure_connected(connection_id).await?;
        self.processes.kill(connection_id, pid).await
    }
}

#[cfg(test)]
mod tests {
    use crate::commands::tests::{harness, saved_host};

    #[tokio::test]
    async fn test_process_list_parsed() {
        let h = harness().await;
        let id = saved_host(&h.state, "app").await;
        h.connector.scripts().set(
            "ps -eo",
            "PID USER %CPU %MEM COMMAND\n1 root 0.1 0.2 /sbin/init\n",
            0,
        );

        let raw = h.state.process_list(&id).await.unwrap();
        assert!(raw.contains("/sbin/init"));
        let table = h.state.process_list_parsed(&id).await.unwrap();
        assert_eq!(table.rows[0].user, "root");
        assert!(table.skipped.is_empty());
    }
}
