//! Blocking child-process execution with bounded captured output.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// One captured output stream: the bytes kept plus how many were dropped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: u64,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Exit status and captured streams of a finished child.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Both streams, labelled, as written to a task log file.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        for (name, stream) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            buf.push_str(&format!("=== {name} ===\n"));
            buf.push_str(&stream.text());
            if stream.truncated > 0 {
                buf.push_str(&format!(
                    "\n[{label} {name} truncated {} bytes]",
                    stream.truncated
                ));
            }
            buf.push('\n');
        }
        buf
    }
}

/// Run `cmd` to completion with stdin closed.
///
/// Both pipes are drained on reader threads while the child runs; at most
/// `output_limit_bytes` per stream is kept. With `timeout == None` this waits
/// as long as the child takes. On expiry the child is killed and the output
/// is returned with `timed_out` set.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = cmd.spawn().map_err(|err| {
        error!(%err, "failed to spawn command");
        anyhow::Error::new(err).context("spawn command")
    })?;

    let limit = u64::try_from(output_limit_bytes).unwrap_or(u64::MAX);
    let stdout = spawn_reader(child.stdout.take(), limit).context("stdout")?;
    let stderr = spawn_reader(child.stderr.take(), limit).context("stderr")?;

    let (status, timed_out) = wait_child(&mut child, timeout)?;
    let stdout = collect(stdout).context("join stdout")?;
    let stderr = collect(stderr).context("join stderr")?;

    if stdout.truncated > 0 || stderr.truncated > 0 {
        warn!(
            stdout_truncated = stdout.truncated,
            stderr_truncated = stderr.truncated,
            "output truncated"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn wait_child(child: &mut Child, timeout: Option<Duration>) -> Result<(ExitStatus, bool)> {
    let Some(limit) = timeout else {
        return Ok((child.wait().context("wait for command")?, false));
    };
    if let Some(status) = child.wait_timeout(limit).context("wait for command")? {
        return Ok((status, false));
    }
    warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
    child.kill().context("kill command")?;
    let status = child.wait().context("wait for command after kill")?;
    Ok((status, true))
}

type Reader = JoinHandle<io::Result<Captured>>;

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>, limit: u64) -> Result<Reader> {
    let mut pipe = pipe.ok_or_else(|| anyhow!("stream was not piped"))?;
    Ok(thread::spawn(move || {
        let mut bytes = Vec::new();
        (&mut pipe).take(limit).read_to_end(&mut bytes)?;
        // Keep draining so the child never blocks on a full pipe.
        let truncated = io::copy(&mut pipe, &mut io::sink())?;
        Ok(Captured { bytes, truncated })
    }))
}

fn collect(reader: Reader) -> Result<Captured> {
    reader
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
        .context("read output")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_status_and_streams() {
        let output = run_command(sh("echo out; echo err >&2; exit 3"), None, 1024).expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout.text(), "out\n");
        assert_eq!(output.stderr.text(), "err\n");
        assert!(!output.timed_out);
        assert!(!output.succeeded());
    }

    #[test]
    fn truncates_beyond_limit() {
        let output = run_command(sh("printf 0123456789"), None, 4).expect("run");
        assert_eq!(output.stdout.bytes, b"0123");
        assert_eq!(output.stdout.truncated, 6);
        assert!(output.succeeded());
        assert!(output.render_log("makemap").contains("[makemap stdout truncated 6 bytes]"));
    }

    #[test]
    fn kills_on_timeout() {
        let output =
            run_command(sh("exec sleep 5"), Some(Duration::from_millis(100)), 1024).expect("run");
        assert!(output.timed_out);
        assert!(!output.succeeded());
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let err = run_command(Command::new("/nonexistent/skyloop-tool"), None, 16)
            .expect_err("spawn fails");
        assert!(format!("{err:#}").contains("spawn command"));
    }
}
