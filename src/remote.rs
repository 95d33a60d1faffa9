// src/remote.rs
//! Remote execution seam.
//!
//! The lifecycle controller and the setup routines talk to the database host only
//! through [`RemoteExec`]: run a shell command (blocking, bounded by a timeout) and
//! read/write a text file. [`SshRemote`] is the production transport; [`LocalShell`]
//! runs the same commands on the current machine, which is how the one-time setup
//! actions are executed on the database host itself.

use anyhow::{bail, Context, Result};
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::SshConfig;
use crate::constants;
use crate::error::HarnessError;

/// Result of one blocking command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    /// The command did not finish before its deadline
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == 0
    }

    /// Human-readable reason for a failed command
    pub fn failure_reason(&self, command: &str) -> String {
        if self.timed_out {
            format!("timed out: {}", command)
        } else {
            format!(
                "exit {}: {}\nStderr: {}",
                self.status,
                command,
                self.stderr.trim()
            )
        }
    }
}

pub trait RemoteExec {
    /// Host name used in log lines and error messages
    fn host(&self) -> &str;

    /// Run `command` through the remote shell, waiting at most `timeout`.
    /// Transport failures are errors; a non-zero exit is reported in the output.
    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    fn read_file(&self, remote: &Path) -> Result<String>;

    fn write_file(&self, remote: &Path, contents: &str) -> Result<()>;

    /// Run and fail with `RemoteIo` unless the command succeeds. Returns stdout.
    fn run_checked(&self, command: &str, timeout: Duration) -> Result<String> {
        let out = self.run(command, timeout)?;
        if !out.success() {
            return Err(HarnessError::remote(self.host(), out.failure_reason(command)).into());
        }
        Ok(out.stdout.trim().to_string())
    }
}

/// SSH session to the database host
pub struct SshRemote {
    session: Session,
    host: String,
}

impl SshRemote {
    /// Connect and authenticate with a private key
    pub fn connect(host: &str, ssh_config: &SshConfig) -> Result<Self> {
        let user = ssh_config.user.clone().unwrap_or_else(|| {
            std::env::var("USER").unwrap_or_else(|_| "postgres".to_string())
        });

        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{}:22", host)
        };

        info!("Connecting to {}@{}", user, addr);

        let sock = addr
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}", addr))?
            .next()
            .with_context(|| format!("No address for {}", addr))?;
        let tcp = TcpStream::connect_timeout(&sock, Duration::from_secs(ssh_config.timeout))
            .map_err(|e| HarnessError::remote(&addr, format!("connect failed: {}", e)))?;

        let mut sess = Session::new()?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout((ssh_config.timeout * 1000) as u32);
        sess.handshake()
            .map_err(|e| HarnessError::remote(&addr, format!("handshake failed: {}", e)))?;

        let key_path = ssh_config.key_path.as_deref().unwrap_or("~/.ssh/id_rsa");
        let expanded_key = shellexpand::tilde(key_path);
        let key_file = Path::new(expanded_key.as_ref());

        if !key_file.exists() {
            bail!("SSH key not found: {}", key_file.display());
        }

        debug!("Authenticating with key: {}", key_file.display());
        sess.userauth_pubkey_file(&user, None, key_file, None)
            .map_err(|e| HarnessError::remote(&addr, format!("authentication failed: {}", e)))?;

        if !sess.authenticated() {
            bail!("SSH authentication failed for {}@{}", user, addr);
        }

        Ok(SshRemote {
            session: sess,
            host: addr,
        })
    }

    fn io_err(&self, what: &str, e: impl std::fmt::Display) -> anyhow::Error {
        HarnessError::remote(&self.host, format!("{}: {}", what, e)).into()
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

impl RemoteExec for SshRemote {
    fn host(&self) -> &str {
        &self.host
    }

    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("SSH exec on {}: {}", self.host, command);

        self.session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| self.io_err("open channel", e))?;
        channel.exec(command).map_err(|e| self.io_err("exec", e))?;

        let mut stdout = String::new();
        if let Err(e) = channel.read_to_string(&mut stdout) {
            if is_timeout(&e) {
                let _ = channel.close();
                return Ok(CommandOutput {
                    status: -1,
                    stdout,
                    stderr: String::new(),
                    timed_out: true,
                });
            }
            return Err(self.io_err("read stdout", e));
        }

        let mut stderr = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr);

        channel.wait_close().map_err(|e| self.io_err("close channel", e))?;
        let status = channel.exit_status().map_err(|e| self.io_err("exit status", e))?;

        Ok(CommandOutput {
            status,
            stdout,
            stderr,
            timed_out: false,
        })
    }

    fn read_file(&self, remote: &Path) -> Result<String> {
        debug!("SCP fetch {}:{}", self.host, remote.display());
        let (mut channel, _stat) = self
            .session
            .scp_recv(remote)
            .map_err(|e| self.io_err(&format!("fetch {}", remote.display()), e))?;
        let mut contents = String::new();
        channel
            .read_to_string(&mut contents)
            .map_err(|e| self.io_err(&format!("fetch {}", remote.display()), e))?;
        channel.send_eof()?;
        channel.wait_eof()?;
        channel.close()?;
        channel.wait_close()?;
        Ok(contents)
    }

    fn write_file(&self, remote: &Path, contents: &str) -> Result<()> {
        debug!("SCP push {}:{}", self.host, remote.display());
        let bytes = contents.as_bytes();
        let mut channel = self
            .session
            .scp_send(remote, 0o600, bytes.len() as u64, None)
            .map_err(|e| self.io_err(&format!("store {}", remote.display()), e))?;
        channel
            .write_all(bytes)
            .map_err(|e| self.io_err(&format!("store {}", remote.display()), e))?;
        channel.send_eof()?;
        channel.wait_eof()?;
        channel.close()?;
        channel.wait_close()?;
        Ok(())
    }
}

/// Runs commands on the current host through `sh -c`
#[derive(Debug, Clone, Default)]
pub struct LocalShell;

impl RemoteExec for LocalShell {
    fn host(&self) -> &str {
        "localhost"
    }

    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("Local exec: {}", command);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", command))?;

        // Drain pipes on helper threads so a chatty child cannot block on a full pipe
        let mut out_pipe = child.stdout.take().context("Failed to capture stdout")?;
        let mut err_pipe = child.stderr.take().context("Failed to capture stderr")?;
        let out_reader = std::thread::spawn(move || {
            let mut s = String::new();
            let _ = out_pipe.read_to_string(&mut s);
            s
        });
        let err_reader = std::thread::spawn(move || {
            let mut s = String::new();
            let _ = err_pipe.read_to_string(&mut s);
            s
        });

        let deadline = Instant::now() + timeout;
        let (status, timed_out) = loop {
            if let Some(status) = child.try_wait()? {
                break (status.code().unwrap_or(-1), false);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                break (-1, true);
            }
            std::thread::sleep(constants::LOCAL_POLL_INTERVAL);
        };

        Ok(CommandOutput {
            status,
            stdout: out_reader.join().unwrap_or_default(),
            stderr: err_reader.join().unwrap_or_default(),
            timed_out,
        })
    }

    fn read_file(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map_err(|e| HarnessError::remote("localhost", format!("read {}: {}", path.display(), e)).into())
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        std::fs::write(path, contents)
            .map_err(|e| HarnessError::remote("localhost", format!("write {}: {}", path.display(), e)).into())
    }
}

/// Quote a path or argument for a POSIX shell command line
pub fn shell_quote(arg: impl AsRef<str>) -> String {
    let arg = arg.as_ref();
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:,+@".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/pg_tpch_sf10_blksz8"), "/data/pg_tpch_sf10_blksz8");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_local_shell_status_and_output() {
        let sh = LocalShell;
        let out = sh.run("echo hello; exit 3", Duration::from_secs(10)).unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.success());
        assert!(sh.run_checked("true", Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_local_shell_timeout() {
        let out = LocalShell.run("sleep 5", Duration::from_millis(200)).unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn test_run_checked_maps_to_remote_io() {
        let err = LocalShell.run_checked("exit 1", Duration::from_secs(10)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::RemoteIo { .. })
        ));
    }
}
