//! SSH transport
//!
//! The executor only ever needs two primitives from a remote host: run a
//! shell command and write a file. [`Connector`] opens a [`RemoteSession`]
//! offering exactly those; [`SshConnector`] implements it over libssh2.

use async_trait::async_trait;
use skein_common::{ConnectionParams, Credentials, Error, Result};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Mode of uploaded files; rendered configs carry private keys
const UPLOAD_MODE: i32 = 0o600;

/// Pause between polls of a command with no output ready
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An open, exclusive session to one host
#[async_trait]
pub trait RemoteSession: Send {
    /// Run a shell command and collect its output
    async fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    /// Write `content` to `remote_path`, replacing any existing file
    async fn upload(&mut self, content: &[u8], remote_path: &str) -> Result<()>;

    /// Release the session
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions to hosts
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn RemoteSession>>;
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

// ============================================================================
// libssh2 implementation
// ============================================================================

/// Connector backed by the `ssh2` crate
#[derive(Debug, Clone, Default)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

fn connection_error(params: &ConnectionParams, reason: impl ToString) -> Error {
    Error::Connection {
        host: params.address(),
        reason: reason.to_string(),
    }
}

fn open_session(params: &ConnectionParams) -> Result<ssh2::Session> {
    let tcp = TcpStream::connect(params.address()).map_err(|e| connection_error(params, e))?;

    let mut session = ssh2::Session::new().map_err(|e| connection_error(params, e))?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| connection_error(params, e))?;

    match params.credentials()? {
        Credentials::Password(password) => session.userauth_password(&params.user, password),
        Credentials::PrivateKey(key) => {
            session.userauth_pubkey_memory(&params.user, None, key, None)
        }
    }
    .map_err(|e| connection_error(params, format!("authentication failed: {}", e)))?;

    if !session.authenticated() {
        return Err(connection_error(params, "authentication rejected"));
    }

    Ok(session)
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn RemoteSession>> {
        params.validate()?;
        let owned = params.clone();
        let session = tokio::task::spawn_blocking(move || open_session(&owned))
            .await
            .map_err(|e| Error::Internal(format!("ssh connect task failed: {}", e)))??;

        debug!("Opened SSH session to {}", params.address());
        Ok(Box::new(SshSession {
            session,
            host: params.address(),
        }))
    }
}

/// Both output streams of a running command
trait CommandStreams {
    fn read_stdout(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn eof(&self) -> bool;
}

impl CommandStreams for ssh2::Channel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stderr().read(buf)
    }

    fn eof(&self) -> bool {
        ssh2::Channel::eof(self)
    }
}

fn read_available(
    read: impl FnOnce(&mut [u8]) -> std::io::Result<usize>,
    buf: &mut [u8],
    sink: &mut Vec<u8>,
) -> std::io::Result<usize> {
    match read(buf) {
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

/// Read stdout and stderr in turns until the remote side closes both.
///
/// The streams share one flow-control window, so a command blocked on a
/// full stderr never finishes stdout; neither stream is read to the end
/// before the other. Expects non-blocking reads.
fn drain<S: CommandStreams>(streams: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let out = read_available(|b| streams.read_stdout(b), &mut buf, &mut stdout)?;
        let err = read_available(|b| streams.read_stderr(b), &mut buf, &mut stderr)?;
        if out + err == 0 {
            if streams.eof() {
                return Ok((stdout, stderr));
            }
            std::thread::sleep(DRAIN_POLL);
        }
    }
}

/// Session over libssh2; blocking calls run on the blocking pool
pub struct SshSession {
    session: ssh2::Session,
    host: String,
}

impl SshSession {
    fn transport_error(host: &str, e: impl ToString) -> Error {
        Error::Connection {
            host: host.to_string(),
            reason: e.to_string(),
        }
    }

    fn exec_blocking(session: &ssh2::Session, host: &str, command: &str) -> Result<CommandOutput> {
        let err = |e: ssh2::Error| Self::transport_error(host, e);
        let io_err = |e: std::io::Error| Self::transport_error(host, e);

        let mut channel = session.channel_session().map_err(err)?;
        channel.exec(command).map_err(err)?;

        session.set_blocking(false);
        let drained = drain(&mut channel);
        session.set_blocking(true);
        let (stdout, stderr) = drained.map_err(io_err)?;

        channel.wait_close().map_err(err)?;
        let exit_code = channel.exit_status().map_err(err)?;

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn upload_blocking(session: &ssh2::Session, host: &str, content: &[u8], remote_path: &str) -> Result<()> {
        let err = |e: ssh2::Error| Self::transport_error(host, e);

        let mut channel = session
            .scp_send(Path::new(remote_path), UPLOAD_MODE, content.len() as u64, None)
            .map_err(err)?;
        channel
            .write_all(content)
            .map_err(|e| Self::transport_error(host, e))?;
        channel.send_eof().map_err(err)?;
        channel.wait_eof().map_err(err)?;
        channel.close().map_err(err)?;
        channel.wait_close().map_err(err)?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(ssh2::Session, String) -> Result<T> + Send + 'static,
    {
        let session = self.session.clone();
        let host = self.host.clone();
        tokio::task::spawn_blocking(move || f(session, host))
            .await
            .map_err(|e| Error::Internal(format!("ssh task failed: {}", e)))?
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let command = command.to_string();
        self.blocking(move |session, host| Self::exec_blocking(&session, &host, &command))
            .await
    }

    async fn upload(&mut self, content: &[u8], remote_path: &str) -> Result<()> {
        let content = content.to_vec();
        let remote_path = remote_path.to_string();
        self.blocking(move |session, host| {
            Self::upload_blocking(&session, &host, &content, &remote_path)
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        self.blocking(|session, host| {
            session
                .disconnect(None, "session closed", None)
                .map_err(|e| Self::transport_error(&host, e))
        })
        .await?;
        debug!("Closed SSH session to {}", self.host);
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[cfg(any(test, feature = "test-util"))]
pub use memory::{CommandHandler, MemoryConnector};

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::Arc;

    /// Answers a command, or `None` to fall through to the default
    pub type CommandHandler = Arc<dyn Fn(&str) -> Option<CommandOutput> + Send + Sync>;

    #[derive(Default)]
    struct HostState {
        files: BTreeMap<String, String>,
        commands: Vec<String>,
    }

    #[derive(Default)]
    struct State {
        hosts: HashMap<String, HostState>,
        failures: Vec<(String, CommandOutput)>,
        handlers: Vec<CommandHandler>,
        unreachable: HashSet<String>,
        connections: usize,
        open_sessions: usize,
    }

    /// Simulated fleet of hosts keyed by `host:port`.
    ///
    /// Commands succeed unless scripted otherwise; `rm -f` removes
    /// uploaded files so teardown can be observed.
    #[derive(Clone, Default)]
    pub struct MemoryConnector {
        state: Arc<Mutex<State>>,
    }

    impl MemoryConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Any command containing `pattern` exits with `exit_code`
        pub fn fail_command(&self, pattern: &str, exit_code: i32, stderr: &str) {
            self.state
                .lock()
                .failures
                .push((pattern.to_string(), CommandOutput::failed(exit_code, stderr)));
        }

        pub fn clear_failures(&self) {
            self.state.lock().failures.clear();
        }

        pub fn add_handler(&self, handler: CommandHandler) {
            self.state.lock().handlers.push(handler);
        }

        pub fn set_unreachable(&self, address: &str, unreachable: bool) {
            let mut state = self.state.lock();
            if unreachable {
                state.unreachable.insert(address.to_string());
            } else {
                state.unreachable.remove(address);
            }
        }

        pub fn files(&self, address: &str) -> BTreeMap<String, String> {
            self.state
                .lock()
                .hosts
                .get(address)
                .map(|h| h.files.clone())
                .unwrap_or_default()
        }

        pub fn file(&self, address: &str, path: &str) -> Option<String> {
            self.files(address).get(path).cloned()
        }

        pub fn commands(&self, address: &str) -> Vec<String> {
            self.state
                .lock()
                .hosts
                .get(address)
                .map(|h| h.commands.clone())
                .unwrap_or_default()
        }

        pub fn connections(&self) -> usize {
            self.state.lock().connections
        }

        pub fn open_sessions(&self) -> usize {
            self.state.lock().open_sessions
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn RemoteSession>> {
            params.validate()?;
            let address = params.address();
            let mut state = self.state.lock();
            if state.unreachable.contains(&address) {
                return Err(Error::Connection {
                    host: address,
                    reason: "host unreachable".into(),
                });
            }
            state.connections += 1;
            state.open_sessions += 1;
            state.hosts.entry(address.clone()).or_default();
            Ok(Box::new(MemorySession {
                state: self.state.clone(),
                address,
                open: true,
            }))
        }
    }

    struct MemorySession {
        state: Arc<Mutex<State>>,
        address: String,
        open: bool,
    }

    impl MemorySession {
        fn release(&mut self) {
            if self.open {
                self.open = false;
                self.state.lock().open_sessions -= 1;
            }
        }
    }

    impl Drop for MemorySession {
        fn drop(&mut self) {
            self.release();
        }
    }

    fn unquote(value: &str) -> String {
        value.trim().trim_matches('\'').to_string()
    }

    #[async_trait]
    impl RemoteSession for MemorySession {
        async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
            let (failure, handlers) = {
                let mut state = self.state.lock();
                if let Some(host) = state.hosts.get_mut(&self.address) {
                    host.commands.push(command.to_string());
                }
                let failure = state
                    .failures
                    .iter()
                    .find(|(pattern, _)| command.contains(pattern.as_str()))
                    .map(|(_, output)| output.clone());
                (failure, state.handlers.clone())
            };

            if let Some(output) = failure {
                return Ok(output);
            }
            for handler in handlers {
                if let Some(output) = handler(command) {
                    return Ok(output);
                }
            }

            if let Some(path) = command.strip_prefix("rm -f ") {
                let mut state = self.state.lock();
                if let Some(host) = state.hosts.get_mut(&self.address) {
                    host.files.remove(&unquote(path));
                }
            }
            Ok(CommandOutput::ok(""))
        }

        async fn upload(&mut self, content: &[u8], remote_path: &str) -> Result<()> {
            let mut state = self.state.lock();
            let host = state.hosts.entry(self.address.clone()).or_default();
            host.files.insert(
                remote_path.to_string(),
                String::from_utf8_lossy(content).into_owned(),
            );
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.release();
            Ok(())
        }
    }
}
