use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Output from a shell command.
#[derive(Debug)]
pub struct CmdOutput {
    /// Whether the command exited with status 0.
    pub success: bool,
    /// Exit code, absent when the process died to a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum CmdError {
    /// The command outlived its deadline and was killed.
    TimedOut(Duration),
    Io(std::io::Error),
}

impl fmt::Display for CmdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut(limit) => write!(f, "command timed out after {}s", limit.as_secs()),
            Self::Io(e) => write!(f, "command failed: {e}"),
        }
    }
}

impl std::error::Error for CmdError {}

impl From<std::io::Error> for CmdError {
    fn from(e: std::io::Error) -> Self {
        CmdError::Io(e)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Run a shell command via `sh -c` in `dir`, killing it at the deadline.
pub fn run_cmd(cmd: &str, dir: &Path, timeout: Duration) -> Result<CmdOutput, CmdError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait()?.is_some() {
            break;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CmdError::TimedOut(timeout));
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let output = child.wait_with_output()?;
    Ok(CmdOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
