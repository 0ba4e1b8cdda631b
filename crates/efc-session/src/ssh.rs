//! SSH session implementation on top of `ssh2`
//!
//! The libssh2 session is blocking, so it lives on its own actor thread. The
//! async facade sends requests over a channel and awaits oneshot replies.
//! When no request arrives within the keepalive interval the actor emits an
//! application-level keepalive instead, which keeps stateful middleboxes from
//! dropping the connection during long idle stretches.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, Session};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use efc_common::{BackupError, Result};

use crate::{check_exit, CommandOutput, RemoteSession, KEEPALIVE_INTERVAL};

// libssh2 error codes that indicate the transport itself gave out
const TRANSIENT_CODES: &[i32] = &[
    -7,  // LIBSSH2_ERROR_SOCKET_SEND
    -9,  // LIBSSH2_ERROR_TIMEOUT
    -13, // LIBSSH2_ERROR_SOCKET_DISCONNECT
    -30, // LIBSSH2_ERROR_SOCKET_TIMEOUT
    -43, // LIBSSH2_ERROR_SOCKET_RECV
];

const AUTH_CODES: &[i32] = &[
    -16, // LIBSSH2_ERROR_PASSWORD_EXPIRED
    -18, // LIBSSH2_ERROR_AUTHENTICATION_FAILED
    -19, // LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED
];

/// Connection parameters for one client
#[derive(Clone)]
pub struct SshConfig {
    /// Hostname or IP address
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Username
    pub username: String,
    /// Password. Never logged.
    pub secret: String,
    /// TCP connect + handshake deadline
    pub connect_timeout: Duration,
    /// Optional OpenSSH known-hosts file to verify the host key against
    pub known_hosts_file: Option<PathBuf>,
}

impl SshConfig {
    /// Config with the default 30 s connect deadline and no host-key pinning
    pub fn new(host: &str, port: u16, username: &str, secret: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            secret: secret.to_string(),
            connect_timeout: Duration::from_secs(30),
            known_hosts_file: None,
        }
    }
}

// keep the password out of any log rendering
impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"********")
            .field("connect_timeout", &self.connect_timeout)
            .field("known_hosts_file", &self.known_hosts_file)
            .finish()
    }
}

enum Request {
    Run {
        cmd: String,
        timeout: Duration,
        acceptable: (i32, i32),
        reply: oneshot::Sender<Result<CommandOutput>>,
    },
    DownloadFile {
        remote: String,
        local: PathBuf,
        reply: oneshot::Sender<Result<u64>>,
    },
    DownloadDir {
        remote: String,
        local: PathBuf,
        reply: oneshot::Sender<Result<(u64, u64)>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// A live SSH session to one client
#[derive(Debug)]
pub struct SshSession {
    tx: Sender<Request>,
    host: String,
}

impl SshSession {
    /// Connect, handshake, verify the host key and authenticate.
    ///
    /// Connection timeouts, DNS failures and refusals surface as
    /// [`BackupError::TransportUnreachable`]; bad credentials as
    /// [`BackupError::AuthenticationFailed`]; a key that contradicts the
    /// known-hosts entry as [`BackupError::HostKeyMismatch`].
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let host = config.host.clone();
        debug!("🔧 Connecting to {}:{}", config.host, config.port);

        let (tx, rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_host = host.clone();
        std::thread::Builder::new()
            .name(format!("ssh-{host}"))
            .spawn(move || actor_main(config, rx, ready_tx))
            .map_err(BackupError::LocalIo)?;

        match ready_rx.await {
            Ok(Ok(())) => {
                info!("✅ SSH session established to {}", thread_host);
                Ok(Self { tx, host })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackupError::transport(format!(
                "session thread for {thread_host} died during connect"
            ))),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
        deadline: Duration,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| BackupError::transport(format!("session to {} is closed", self.host)))?;
        // The actor enforces the libssh2 timeout; this outer deadline only
        // catches a wedged thread.
        match tokio::time::timeout(deadline + Duration::from_secs(15), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BackupError::transport(format!(
                "session to {} dropped mid-operation",
                self.host
            ))),
            Err(_) => Err(BackupError::transport(format!(
                "operation on {} exceeded its deadline",
                self.host
            ))),
        }
    }
}

#[async_trait::async_trait]
impl RemoteSession for SshSession {
    async fn run_with_exit_range(
        &self,
        cmd: &str,
        timeout: Duration,
        acceptable: (i32, i32),
    ) -> Result<CommandOutput> {
        let cmd = cmd.to_string();
        self.request(
            move |reply| Request::Run { cmd, timeout, acceptable, reply },
            timeout,
        )
        .await
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<u64> {
        let remote = remote.to_string();
        let local = local.to_path_buf();
        // Transfers run as long as data keeps flowing; the outer deadline is
        // refreshed by the actor finishing, not by throughput.
        self.request(
            move |reply| Request::DownloadFile { remote, local, reply },
            Duration::from_secs(24 * 3600),
        )
        .await
    }

    async fn download_dir(&self, remote: &str, local: &Path) -> Result<(u64, u64)> {
        let remote = remote.to_string();
        let local = local.to_path_buf();
        self.request(
            move |reply| Request::DownloadDir { remote, local, reply },
            Duration::from_secs(24 * 3600),
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Request::Close { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
        Ok(())
    }
}

fn actor_main(config: SshConfig, rx: Receiver<Request>, ready: oneshot::Sender<Result<()>>) {
    let session = match open_session(&config) {
        Ok(session) => {
            let _ = ready.send(Ok(()));
            session
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    loop {
        match rx.recv_timeout(KEEPALIVE_INTERVAL) {
            Ok(Request::Run { cmd, timeout, acceptable, reply }) => {
                let result = exec_command(&session, &config.host, &cmd, timeout)
                    .and_then(|out| check_exit(out, acceptable));
                let _ = reply.send(result);
            }
            Ok(Request::DownloadFile { remote, local, reply }) => {
                let _ = reply.send(sftp_download_file(&session, &config.host, &remote, &local));
            }
            Ok(Request::DownloadDir { remote, local, reply }) => {
                let _ = reply.send(sftp_download_dir(&session, &config.host, &remote, &local));
            }
            Ok(Request::Close { reply }) => {
                let _ = session.disconnect(None, "backup finished", None);
                let _ = reply.send(());
                debug!("🔧 SSH session to {} closed", config.host);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = session.keepalive_send() {
                    warn!("Keepalive to {} failed: {}", config.host, e);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Facade dropped without an explicit close
                let _ = session.disconnect(None, "session dropped", None);
                return;
            }
        }
    }
}

fn open_session(config: &SshConfig) -> Result<Session> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| {
            BackupError::transport(format!("DNS lookup for {} failed: {e}", config.host))
        })?
        .next()
        .ok_or_else(|| {
            BackupError::transport(format!("DNS lookup for {} returned no address", config.host))
        })?;

    let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|e| {
        BackupError::transport(format!("connect to {}:{} failed: {e}", config.host, config.port))
    })?;

    let mut session = Session::new()
        .map_err(|e| BackupError::internal(format!("libssh2 init failed: {e}")))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(config.connect_timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| map_ssh_error(&config.host, e))?;

    verify_host_key(&session, config)?;

    session
        .userauth_password(&config.username, &config.secret)
        .map_err(|e| match classify_code(&e) {
            ErrorClass::Transient => map_ssh_error(&config.host, e),
            _ => BackupError::AuthenticationFailed(format!(
                "password rejected for {}@{}",
                config.username, config.host
            )),
        })?;
    if !session.authenticated() {
        return Err(BackupError::AuthenticationFailed(format!(
            "password rejected for {}@{}",
            config.username, config.host
        )));
    }

    // libssh2 tracks the interval; the actor loop decides when to send.
    session.set_keepalive(true, KEEPALIVE_INTERVAL.as_secs() as u32);
    Ok(session)
}

fn verify_host_key(session: &Session, config: &SshConfig) -> Result<()> {
    let Some(path) = &config.known_hosts_file else {
        return Ok(());
    };
    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| BackupError::internal(format!("known-hosts init failed: {e}")))?;
    if path.exists() {
        known_hosts
            .read_file(path, KnownHostFileKind::OpenSSH)
            .map_err(|e| BackupError::internal(format!("known-hosts read failed: {e}")))?;
    }
    let (key, _key_type) = session
        .host_key()
        .ok_or_else(|| BackupError::internal("remote offered no host key"))?;
    match known_hosts.check_port(&config.host, config.port, key) {
        CheckResult::Match => Ok(()),
        // First contact: nothing to contradict
        CheckResult::NotFound => {
            debug!("🔧 No known-hosts entry for {}, accepting key", config.host);
            Ok(())
        }
        CheckResult::Mismatch => Err(BackupError::HostKeyMismatch(config.host.clone())),
        CheckResult::Failure => {
            Err(BackupError::internal(format!("host key check failed for {}", config.host)))
        }
    }
}

fn exec_command(
    session: &Session,
    host: &str,
    cmd: &str,
    timeout: Duration,
) -> Result<CommandOutput> {
    session.set_timeout(timeout.as_millis() as u32);
    let mut channel = session
        .channel_session()
        .map_err(|e| map_ssh_error(host, e))?;
    channel.exec(cmd).map_err(|e| map_ssh_error(host, e))?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| BackupError::transport(format!("reading stdout from {host} failed: {e}")))?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| BackupError::transport(format!("reading stderr from {host} failed: {e}")))?;

    channel.wait_close().map_err(|e| map_ssh_error(host, e))?;
    let exit_code = channel.exit_status().map_err(|e| map_ssh_error(host, e))?;
    Ok(CommandOutput { stdout, stderr, exit_code })
}

fn sftp_download_file(session: &Session, host: &str, remote: &str, local: &Path) -> Result<u64> {
    // Streamed copy: each read must make progress within the libssh2 timeout,
    // the transfer as a whole has no deadline.
    session.set_timeout(30_000);
    let sftp = session.sftp().map_err(|e| map_ssh_error(host, e))?;
    let mut remote_file = sftp
        .open(Path::new(remote))
        .map_err(|e| map_ssh_error(host, e))?;
    if let Some(parent) = local.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut local_file = std::fs::File::create(local)?;
    let bytes = std::io::copy(&mut remote_file, &mut local_file)
        .map_err(|e| BackupError::transport(format!("SFTP download from {host} failed: {e}")))?;
    Ok(bytes)
}

fn sftp_download_dir(
    session: &Session,
    host: &str,
    remote: &str,
    local: &Path,
) -> Result<(u64, u64)> {
    session.set_timeout(30_000);
    let sftp = session.sftp().map_err(|e| map_ssh_error(host, e))?;
    let mut files = 0u64;
    let mut bytes = 0u64;
    download_tree(&sftp, host, Path::new(remote), local, &mut files, &mut bytes)?;
    Ok((files, bytes))
}

fn download_tree(
    sftp: &ssh2::Sftp,
    host: &str,
    remote: &Path,
    local: &Path,
    files: &mut u64,
    bytes: &mut u64,
) -> Result<()> {
    std::fs::create_dir_all(local)?;
    let entries = sftp
        .readdir(remote)
        .map_err(|e| map_ssh_error(host, e))?;
    for (remote_path, stat) in entries {
        let name = match remote_path.file_name() {
            Some(name) => name.to_owned(),
            None => continue,
        };
        let target = local.join(&name);
        if stat.is_dir() {
            download_tree(sftp, host, &remote_path, &target, files, bytes)?;
        } else if stat.is_file() {
            let mut remote_file = sftp
                .open(&remote_path)
                .map_err(|e| map_ssh_error(host, e))?;
            let mut local_file = std::fs::File::create(&target)?;
            let copied = std::io::copy(&mut remote_file, &mut local_file).map_err(|e| {
                BackupError::transport(format!("SFTP download from {host} failed: {e}"))
            })?;
            *files += 1;
            *bytes += copied;
        }
        // symlinks and specials are skipped
    }
    Ok(())
}

enum ErrorClass {
    Transient,
    Auth,
    Other,
}

fn classify_code(err: &ssh2::Error) -> ErrorClass {
    match err.code() {
        ErrorCode::Session(code) if TRANSIENT_CODES.contains(&code) => ErrorClass::Transient,
        ErrorCode::Session(code) if AUTH_CODES.contains(&code) => ErrorClass::Auth,
        _ => ErrorClass::Other,
    }
}

fn map_ssh_error(host: &str, err: ssh2::Error) -> BackupError {
    match classify_code(&err) {
        ErrorClass::Transient => {
            BackupError::transport(format!("SSH transport to {host} failed: {err}"))
        }
        ErrorClass::Auth => {
            BackupError::AuthenticationFailed(format!("authentication to {host} failed: {err}"))
        }
        ErrorClass::Other => {
            BackupError::transport(format!("SSH operation on {host} failed: {err}"))
        }
    }
}
