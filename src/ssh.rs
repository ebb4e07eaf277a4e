// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use core::time;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Instant;

use thiserror;

/// Exit status used by the OpenSSH client to report its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// Messages the OpenSSH client prints when it cannot reach or log into a host.
const SSH_CLIENT_ERRORS: &[&str] = &[
    "ssh:",
    "Connection refused",
    "Connection timed out",
    "Connection closed by",
    "Connection reset by",
    "Permission denied",
    "Host key verification failed",
    "kex_exchange_identification",
    "No route to host",
    "Could not resolve hostname",
];

const WAIT_POLL_INTERVAL: time::Duration = time::Duration::from_millis(100);

/// Outcome of a command executed on a remote host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    pub return_code: i32,
    pub stdout: Vec<String>,
    pub stderr: String,
}

impl CommandResult {
    pub fn new(return_code: i32, stdout: &[&str], stderr: &str) -> Self {
        Self {
            return_code,
            stdout: stdout.iter().map(|l| l.to_string()).collect(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    /// Returns stdout lines joined back into a single string.
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }
}

/// Describes a command to be run on a remote host.
#[derive(Debug, Clone, PartialEq)]
pub struct SshCommand {
    pub command: String,
    pub hostname: String,
    /// Limit on the whole command execution.
    pub timeout: Option<time::Duration>,
    /// Limit on establishing the connection.
    pub connection_timeout: Option<time::Duration>,
}

/// Builds a remote command description.
pub struct SshCommandBuilder<'a> {
    command: &'a str,
    hostname: &'a str,
    timeout: Option<time::Duration>,
    connection_timeout: Option<time::Duration>,
}

impl<'a> SshCommandBuilder<'a> {
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            hostname: "",
            timeout: None,
            connection_timeout: None,
        }
    }

    pub fn on(mut self, hostname: &'a str) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<time::Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Option<time::Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn build(self) -> SshCommand {
        SshCommand {
            command: self.command.to_string(),
            hostname: self.hostname.to_string(),
            timeout: self.timeout,
            connection_timeout: self.connection_timeout,
        }
    }
}

/// Wraps transport level errors.
#[derive(thiserror::Error, Debug)]
pub enum SshError {
    #[error("cannot start ssh: {0}")]
    Start(io::Error),
    #[error("cannot connect to {host}: {detail}")]
    Connection { host: String, detail: String },
    #[error("command did not finish within {0:?}")]
    Timeout(time::Duration),
    #[error("cannot collect command output: {0}")]
    Io(io::Error),
}

impl PartialEq for SshError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

/// A way to execute commands on remote hosts.
pub trait SshExecutor {
    /// Runs a command, returning its result. A non-zero exit status of the
    /// remote command is not an error.
    fn execute(&mut self, cmd: &SshCommand) -> Result<CommandResult, SshError>;
}

impl<E> SshExecutor for &mut E
where
    E: SshExecutor + ?Sized,
{
    fn execute(&mut self, cmd: &SshCommand) -> Result<CommandResult, SshError> {
        (**self).execute(cmd)
    }
}

impl<E> SshExecutor for Box<E>
where
    E: SshExecutor + ?Sized,
{
    fn execute(&mut self, cmd: &SshCommand) -> Result<CommandResult, SshError> {
        (**self).execute(cmd)
    }
}

/// Executor backed by the OpenSSH client binary.
///
/// The client reports its own failures with exit status 255, which a remote
/// command may use too. Status 255 is taken as a transport failure only when
/// the command produced no output and stderr carries a client error message,
/// otherwise it is passed through as the remote command's status.
#[derive(Debug, Clone)]
pub struct OpenSshExecutor {
    user: String,
    port: u16,
    identity_file: Option<PathBuf>,
}

impl OpenSshExecutor {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            port: 22,
            identity_file: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, identity_file: Option<PathBuf>) -> Self {
        self.identity_file = identity_file;
        self
    }

    fn build(&self, sshcmd: &SshCommand) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
        ]);
        if let Some(timeout) = sshcmd.connection_timeout {
            cmd.arg("-o");
            cmd.arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }
        cmd.arg("-p");
        cmd.arg(self.port.to_string());
        if let Some(key) = &self.identity_file {
            cmd.arg("-i");
            cmd.arg(key);
        }
        cmd.arg(format!("{}@{}", self.user, sshcmd.hostname));
        cmd.arg("--");
        cmd.arg(&sshcmd.command);
        cmd
    }
}

fn is_client_failure(return_code: i32, stdout: &str, stderr: &str) -> bool {
    return_code == SSH_CLIENT_FAILURE
        && stdout.trim().is_empty()
        && SSH_CLIENT_ERRORS.iter().any(|m| stderr.contains(m))
}

fn drain<R>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

fn collect(handle: thread::JoinHandle<io::Result<String>>) -> Result<String, SshError> {
    handle
        .join()
        .map_err(|_| SshError::Io(io::Error::other("output reader panicked")))?
        .map_err(SshError::Io)
}

fn wait_with_deadline(child: &mut Child, timeout: time::Duration) -> Result<ExitStatus, SshError> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(SshError::Io)? {
            return Ok(status);
        }
        if start.elapsed() > timeout {
            log::debug!("command timed out, killing ssh");
            let _ = child.kill();
            let _ = child.wait();
            return Err(SshError::Timeout(timeout));
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

impl SshExecutor for OpenSshExecutor {
    fn execute(&mut self, sshcmd: &SshCommand) -> Result<CommandResult, SshError> {
        let mut cmd = self.build(sshcmd);

        log::trace!(
            "running ssh with: {:?}",
            cmd.get_args()
                .by_ref()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
        );

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SshError::Start)?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match sshcmd.timeout {
            Some(timeout) => wait_with_deadline(&mut child, timeout)?,
            None => child.wait().map_err(SshError::Io)?,
        };

        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?.trim().to_string();
        let return_code = status.code().unwrap_or(SSH_CLIENT_FAILURE);

        if is_client_failure(return_code, &stdout, &stderr) {
            return Err(SshError::Connection {
                host: sshcmd.hostname.clone(),
                detail: stderr,
            });
        }

        Ok(CommandResult {
            return_code,
            stdout: stdout.lines().map(|l| l.to_string()).collect(),
            stderr,
        })
    }
}
