//! In-memory stand-ins for the wire, used by unit tests.
//!
//! `FakeConnector` hands out `FakeLink`s that share one scripted command
//! table and one in-memory SFTP tree, so a "host" keeps its files across
//! reconnects.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::{AuthKind, ConnectionProfile, CoreSettings, MemorySecretStore, SecretStore};
use crate::mux::ChannelMultiplexer;
use crate::sftp::{FileEntry, SftpBackend, SftpError, SftpWriter};
use crate::ssh::{
    Connector, ExecOutput, Link, LinkHealth, SessionCommand, ShellIo, SshConfig, SshError,
    TransportManager, TransportRef,
};

pub fn password_profile(id: &str) -> ConnectionProfile {
    let mut profile = ConnectionProfile::new(id, "10.0.0.1", "root", AuthKind::Password);
    profile.id = id.to_string();
    profile
}

/// A live fake link plus a transport reference to it
pub fn connected_transport(connection_id: &str) -> (Arc<FakeLink>, TransportRef) {
    let link = Arc::new(FakeLink::new(
        Arc::new(ExecScripts::default()),
        Arc::new(MemorySftp::new()),
    ));
    let dyn_link: Arc<dyn Link> = link.clone();
    let transport = TransportRef::new(
        connection_id.to_string(),
        Arc::downgrade(&dyn_link),
        CancellationToken::new(),
        Arc::new(LinkHealth::new(3)),
    );
    (link, transport)
}

/// A manager with `connection_id` already connected over a `FakeConnector`
pub async fn connected_manager(
    connection_id: &str,
) -> (Arc<FakeConnector>, Arc<TransportManager>, Arc<ChannelMultiplexer>) {
    let connector = Arc::new(FakeConnector::new());
    let secrets = Arc::new(MemorySecretStore::new());
    secrets.set(connection_id, "pw").unwrap();
    let settings = CoreSettings::default();
    let mux = Arc::new(ChannelMultiplexer::new(Duration::from_secs(
        settings.operation_timeout_secs,
    )));
    let transports = Arc::new(TransportManager::new(
        connector.clone(),
        secrets,
        mux.clone(),
        settings,
    ));
    transports
        .connect(&password_profile(connection_id))
        .await
        .unwrap();
    (connector, transports, mux)
}

fn copy_error(err: &SshError) -> SshError {
    match err {
        SshError::ConnectionFailed(m) => SshError::ConnectionFailed(m.clone()),
        SshError::AuthenticationFailed(m) => SshError::AuthenticationFailed(m.clone()),
        SshError::ChannelError(m) => SshError::ChannelError(m.clone()),
        SshError::IoError(e) => SshError::ConnectionFailed(e.to_string()),
        SshError::ProtocolError(m) => SshError::ProtocolError(m.clone()),
        SshError::KeyError(m) => SshError::KeyError(m.clone()),
        SshError::HostKeyRejected(m) => SshError::HostKeyRejected(m.clone()),
        SshError::Timeout(m) => SshError::Timeout(m.clone()),
        SshError::Disconnected => SshError::Disconnected,
    }
}

/// Scripted exec replies, matched by substring of the command
#[derive(Default)]
pub struct ExecScripts {
    replies: Mutex<Vec<(String, ExecOutput)>>,
}

impl ExecScripts {
    pub fn set(&self, pattern: &str, stdout: &str, exit_status: u32) {
        self.set_output(
            pattern,
            ExecOutput {
                stdout: stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
                exit_status: Some(exit_status),
            },
        );
    }

    pub fn set_output(&self, pattern: &str, output: ExecOutput) {
        let mut replies = self.replies.lock();
        replies.retain(|(p, _)| p != pattern);
        replies.push((pattern.to_string(), output));
    }

    fn reply(&self, command: &str) -> ExecOutput {
        self.replies
            .lock()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| ExecOutput {
                stdout: Vec::new(),
                stderr: b"command not found".to_vec(),
                exit_status: Some(127),
            })
    }
}

#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    failure: Mutex<Option<SshError>>,
    links: Mutex<Vec<Arc<FakeLink>>>,
    scripts: Arc<ExecScripts>,
    sftp: Arc<MemorySftp>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        let connector = Self::new();
        *connector.delay.lock() = Some(delay);
        connector
    }

    pub fn fail_with(&self, err: SshError) {
        *self.failure.lock() = Some(err);
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().clone()
    }

    pub fn last_link(&self) -> Arc<FakeLink> {
        self.links.lock().last().cloned().expect("no link created yet")
    }

    pub fn scripts(&self) -> &ExecScripts {
        &self.scripts
    }

    pub fn sftp(&self) -> &Arc<MemorySftp> {
        &self.sftp
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _connection_id: &str,
        _config: SshConfig,
    ) -> Result<Arc<dyn Link>, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failure.lock().as_ref() {
            return Err(copy_error(err));
        }

        let link = Arc::new(FakeLink::new(self.scripts.clone(), self.sftp.clone()));
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

/// What the fake remote shell saw
pub struct FakeShell {
    pub input: Arc<Mutex<Vec<u8>>>,
    pub resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    output_tx: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl FakeShell {
    /// Produce remote output on this shell
    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.output_tx.lock().as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// The remote side ends the channel
    pub fn hang_up(&self) {
        self.output_tx.lock().take();
    }

    pub fn input_text(&self) -> String {
        String::from_utf8_lossy(&self.input.lock()).into_owned()
    }
}

pub struct FakeLink {
    connected: AtomicBool,
    disconnect_tx: broadcast::Sender<()>,
    scripts: Arc<ExecScripts>,
    exec_calls: Mutex<Vec<String>>,
    exec_blocked: AtomicBool,
    exec_delay: Mutex<Option<Duration>>,
    exec_started: Notify,
    echo: AtomicBool,
    shells: Mutex<Vec<Arc<FakeShell>>>,
    sftp: Arc<MemorySftp>,
    sftp_opens: AtomicUsize,
}

impl FakeLink {
    pub fn new(scripts: Arc<ExecScripts>, sftp: Arc<MemorySftp>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            connected: AtomicBool::new(true),
            disconnect_tx,
            scripts,
            exec_calls: Mutex::new(Vec::new()),
            exec_blocked: AtomicBool::new(false),
            exec_delay: Mutex::new(None),
            exec_started: Notify::new(),
            echo: AtomicBool::new(false),
            shells: Mutex::new(Vec::new()),
            sftp,
            sftp_opens: AtomicUsize::new(0),
        }
    }

    pub fn script_exec(&self, pattern: &str, stdout: &str, exit_status: u32) {
        self.scripts.set(pattern, stdout, exit_status);
    }

    /// Exec calls never complete
    pub fn block_exec(&self) {
        self.exec_blocked.store(true, Ordering::SeqCst);
    }

    pub fn set_exec_delay(&self, delay: Option<Duration>) {
        *self.exec_delay.lock() = delay;
    }

    pub async fn wait_exec_started(&self) {
        self.exec_started.notified().await;
    }

    pub fn exec_calls(&self) -> Vec<String> {
        self.exec_calls.lock().clone()
    }

    /// Shells echo their input back as output
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    pub fn shells(&self) -> Vec<Arc<FakeShell>> {
        self.shells.lock().clone()
    }

    pub fn sftp_opens(&self) -> usize {
        self.sftp_opens.load(Ordering::SeqCst)
    }

    /// The network drops the connection
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.disconnect_tx.send(());
    }

    fn ensure_connected(&self) -> Result<(), SshError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SshError::Disconnected)
        }
    }
}

#[async_trait]
impl Link for FakeLink {
    async fn open_shell(
        &self,
        _cols: u32,
        _rows: u32,
        cancel: CancellationToken,
    ) -> Result<ShellIo, SshError> {
        self.ensure_connected()?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(1024);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let shell = Arc::new(FakeShell {
            input: Arc::new(Mutex::new(Vec::new())),
            resizes: Arc::new(Mutex::new(Vec::new())),
            output_tx: Arc::new(Mutex::new(Some(output_tx))),
        });
        self.shells.lock().push(shell.clone());

        let echo = self.echo.load(Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(SessionCommand::Data(data)) => {
                            shell.input.lock().extend_from_slice(&data);
                            if echo {
                                shell.emit(&data);
                            }
                        }
                        Some(SessionCommand::Resize(cols, rows)) => {
                            shell.resizes.lock().push((cols, rows));
                        }
                        Some(SessionCommand::Close) | None => break,
                    },
                }
            }
            shell.hang_up();
        });

        Ok(ShellIo { cmd_tx, output_rx })
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        self.ensure_connected()?;
        self.exec_calls.lock().push(command.to_string());
        self.exec_started.notify_one();

        if self.exec_blocked.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = *self.exec_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.scripts.reply(command))
    }

    async fn open_sftp(&self) -> Result<Arc<dyn SftpBackend>, SshError> {
        self.ensure_connected()?;
        self.sftp_opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.sftp.clone())
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.disconnect_tx.send(());
        }
    }
}

enum Node {
    Dir,
    File(Vec<u8>),
}

/// In-memory SFTP tree rooted at `/`
pub struct MemorySftp {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
    denied: Mutex<HashSet<String>>,
    write_delay: Mutex<Option<Duration>>,
    chunk_delay: Mutex<Option<Duration>>,
    chunk_writes: Arc<AtomicUsize>,
    write_started: Notify,
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl Default for MemorySftp {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySftp {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
            denied: Mutex::new(HashSet::new()),
            write_delay: Mutex::new(None),
            chunk_delay: Mutex::new(None),
            chunk_writes: Arc::new(AtomicUsize::new(0)),
            write_started: Notify::new(),
        }
    }

    pub fn add_dir(&self, path: &str) {
        self.nodes.lock().insert(path.to_string(), Node::Dir);
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.nodes
            .lock()
            .insert(path.to_string(), Node::File(content.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn deny(&self, path: &str) {
        self.denied.lock().insert(path.to_string());
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Delay applied to every streamed chunk
    pub fn set_chunk_delay(&self, delay: Option<Duration>) {
        *self.chunk_delay.lock() = delay;
    }

    pub fn chunk_writes(&self) -> usize {
        self.chunk_writes.load(Ordering::SeqCst)
    }

    pub async fn wait_write_started(&self) {
        self.write_started.notified().await;
    }

    fn check_allowed(&self, path: &str) -> Result<(), SftpError> {
        if self.denied.lock().contains(path) {
            return Err(SftpError::PermissionDenied(path.to_string()));
        }
        Ok(())
    }

    fn check_parent_dir(&self, path: &str) -> Result<(), SftpError> {
        match self.nodes.lock().get(parent_of(path)) {
            Some(Node::Dir) => Ok(()),
            _ => Err(SftpError::FileNotFound(parent_of(path).to_string())),
        }
    }
}

#[async_trait]
impl SftpBackend for MemorySftp {
    async fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>, SftpError> {
        self.check_allowed(path)?;
        let nodes = self.nodes.lock();
        match nodes.get(path) {
            Some(Node::Dir) => {}
            _ => return Err(SftpError::FileNotFound(path.to_string())),
        }

        let mut entries = vec![FileEntry::new(".", true), FileEntry::new("..", true)];
        entries.extend(
            nodes
                .iter()
                .filter(|(p, _)| p.as_str() != "/" && parent_of(p) == path)
                .map(|(p, node)| FileEntry::new(base_name(p), matches!(node, Node::Dir))),
        );
        Ok(entries)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        self.check_allowed(path)?;
        self.file(path)
            .ok_or_else(|| SftpError::FileNotFound(path.to_string()))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), SftpError> {
        self.check_allowed(path)?;
        self.check_parent_dir(path)?;
        self.write_started.notify_one();

        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.add_file(path, content);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.check_allowed(path)?;
        self.check_parent_dir(path)?;
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(path) {
            return Err(SftpError::Remote(format!("{}: File exists", path)));
        }
        nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn create(&self, path: &str) -> Result<Box<dyn SftpWriter>, SftpError> {
        self.check_allowed(path)?;
        self.check_parent_dir(path)?;
        self.add_file(path, b"");
        Ok(Box::new(MemoryWriter {
            nodes: self.nodes.clone(),
            path: path.to_string(),
            content: Vec::new(),
            delay: *self.chunk_delay.lock(),
            chunk_writes: self.chunk_writes.clone(),
        }))
    }
}

struct MemoryWriter {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
    path: String,
    content: Vec<u8>,
    delay: Option<Duration>,
    chunk_writes: Arc<AtomicUsize>,
}

#[async_trait]
impl SftpWriter for MemoryWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SftpError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.content.extend_from_slice(chunk);
        self.nodes
            .lock()
            .insert(self.path.clone(), Node::File(self.content.clone()));
        self.chunk_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SftpError> {
        Ok(())
    }
}
