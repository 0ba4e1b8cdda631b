//! Scripted fake session for tests
//!
//! Answers each command through a caller-supplied responder and records the
//! full command history, so driver tests can assert on the exact remote
//! command sequence without a live host.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use efc_common::Result;

use crate::{check_exit, CommandOutput, RemoteSession};

type Responder = Box<dyn Fn(&str) -> Result<CommandOutput> + Send + Sync>;

/// Fake [`RemoteSession`] driven by a responder closure
pub struct ScriptedSession {
    responder: Responder,
    commands: Mutex<Vec<String>>,
    downloads: Mutex<Vec<String>>,
    download_payload: Vec<u8>,
    closed: AtomicBool,
}

impl ScriptedSession {
    /// Session answering every command through `responder`
    pub fn new(responder: impl Fn(&str) -> Result<CommandOutput> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            commands: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
            download_payload: b"scripted archive payload".to_vec(),
            closed: AtomicBool::new(false),
        }
    }

    /// Session that answers every command with exit 0 and the given stdout
    pub fn always(stdout: &str) -> Self {
        let stdout = stdout.to_string();
        Self::new(move |_| Ok(CommandOutput { stdout: stdout.clone(), ..Default::default() }))
    }

    /// Bytes written by `download_file`/`download_dir`
    pub fn with_download_payload(mut self, payload: Vec<u8>) -> Self {
        self.download_payload = payload;
        self
    }

    /// Every command run so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Every remote path downloaded so far, in order
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Convenience: an exit-0 output with the given stdout
pub fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput { stdout: stdout.to_string(), stderr: String::new(), exit_code: 0 }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn run_with_exit_range(
        &self,
        cmd: &str,
        _timeout: Duration,
        acceptable: (i32, i32),
    ) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(cmd.to_string());
        let output = (self.responder)(cmd)?;
        check_exit(output, acceptable)
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<u64> {
        self.downloads.lock().unwrap().push(remote.to_string());
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, &self.download_payload)?;
        Ok(self.download_payload.len() as u64)
    }

    async fn download_dir(&self, remote: &str, local: &Path) -> Result<(u64, u64)> {
        self.downloads.lock().unwrap().push(remote.to_string());
        std::fs::create_dir_all(local)?;
        std::fs::write(local.join("payload.bin"), &self.download_payload)?;
        Ok((1, self.download_payload.len() as u64))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
