//! Running the external bridge tool with a hard timeout

use std::io::{ErrorKind, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError};
use tracing::{debug, trace};

use crate::error::BridgeError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs one bridge-tool invocation and returns its trimmed stdout.
pub trait CommandRunner: Send + Sync {
    fn run(&self, args: &[&str]) -> Result<String, BridgeError>;
}

/// Subprocess runner for the real tool (`adb` by default)
pub struct ToolCommand {
    program: String,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

/// Read a pipe to EOF on its own thread. The result arrives on the channel.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = flume::bounded(1);
    thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut out);
        }
        let _ = tx.send(out);
    });
    rx
}

/// Wait for drained output until `deadline`. A descendant that inherited the
/// pipe can hold it open after the child exits, so EOF is not guaranteed.
fn collect(
    rx: &Receiver<String>,
    deadline: Instant,
    timeout: Duration,
) -> Result<String, BridgeError> {
    match rx.recv_deadline(deadline) {
        Ok(out) => Ok(out),
        Err(RecvTimeoutError::Disconnected) => Ok(String::new()),
        Err(RecvTimeoutError::Timeout) => Err(BridgeError::Timeout(timeout)),
    }
}

impl CommandRunner for ToolCommand {
    fn run(&self, args: &[&str]) -> Result<String, BridgeError> {
        trace!(program = %self.program, ?args, "running bridge command");
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => BridgeError::ToolMissing(self.program.clone()),
                _ => BridgeError::Io(e),
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                debug!(?args, "bridge command timed out");
                return Err(BridgeError::Timeout(self.timeout));
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = collect(&stdout, deadline, self.timeout).map_err(|e| {
            debug!(?args, "bridge command exited but its output stayed open");
            e
        })?;
        if status.success() {
            Ok(stdout.trim().to_string())
        } else {
            let stderr = collect(&stderr, deadline, self.timeout)?;
            Err(BridgeError::NonZeroExit {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_is_reported() {
        let cmd = ToolCommand::new("phonecam-no-such-tool", Duration::from_secs(1));
        assert!(matches!(cmd.run(&["version"]), Err(BridgeError::ToolMissing(_))));
    }

    #[test]
    fn stdout_is_trimmed() {
        let cmd = ToolCommand::new("sh", Duration::from_secs(5));
        assert_eq!(cmd.run(&["-c", "echo '  hello  '"]).unwrap(), "hello");
    }

    #[test]
    fn non_zero_exit_carries_stderr() {
        let cmd = ToolCommand::new("sh", Duration::from_secs(5));
        match cmd.run(&["-c", "echo nope >&2; exit 3"]) {
            Err(BridgeError::NonZeroExit { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn slow_command_times_out() {
        let cmd = ToolCommand::new("sleep", Duration::from_millis(100));
        let started = Instant::now();
        assert!(matches!(cmd.run(&["5"]), Err(BridgeError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn background_child_holding_stdout_still_times_out() {
        let cmd = ToolCommand::new("sh", Duration::from_secs(1));
        let started = Instant::now();
        let result = cmd.run(&["-c", "sleep 6 & echo hi"]);
        assert!(matches!(result, Err(BridgeError::Timeout(_))), "{:?}", result);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
