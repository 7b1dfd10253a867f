//! Process service: one-shot exec for listing and killing remote processes

use std::sync::Arc;

use tracing::{debug, info};

use super::parser::{decode_process_table, ProcessTable};
use crate::error::CoreError;
use crate::mux::ChannelMultiplexer;
use crate::ssh::{ExecOutput, TransportManager};

const LIST_COMMAND: &str = "ps -eo pid,user,pcpu,pmem,args --sort=-pcpu";

pub struct ProcessService {
    transports: Arc<TransportManager>,
    mux: Arc<ChannelMultiplexer>,
}

impl ProcessService {
    pub fn new(transports: Arc<TransportManager>, mux: Arc<ChannelMultiplexer>) -> Self {
        Self { transports, mux }
    }

    async fn exec(&self, connection_id: &str, command: &str) -> Result<ExecOutput, CoreError> {
        let transport = self.transports.acquire(connection_id)?;
        let output = self.mux.exec(&transport, command).await?;
        if output.success() {
            return Ok(output);
        }

        let stderr = output.stderr_text();
        let detail = stderr.trim();
        Err(CoreError::Channel(if detail.is_empty() {
            format!("`{}` exited with {:?}", command, output.exit_status)
        } else {
            detail.to_string()
        }))
    }

    /// Raw `ps` table, header line included
    pub async fn list_raw(&self, connection_id: &str) -> Result<String, CoreError> {
        let output = self.exec(connection_id, LIST_COMMAND).await?;
        Ok(output.stdout_text())
    }

    pub async fn list(&self, connection_id: &str) -> Result<ProcessTable, CoreError> {
        let table = decode_process_table(&self.list_raw(connection_id).await?);
        debug!(
            "Decoded {} processes on {} ({} lines skipped)",
            table.rows.len(),
            connection_id,
            table.skipped.len()
        );
        Ok(table)
    }

    /// Send SIGTERM to `pid`
    pub async fn kill(&self, connection_id: &str, pid: u32) -> Result<(), CoreError> {
        if pid == 0 {
            return Err(CoreError::Channel("invalid pid 0".to_string()));
        }
        self.exec(connection_id, &format!("kill {}", pid)).await?;
        info!("Killed process {} on {}", pid, connection_id);
        Ok(())
    }
}
