//! External tool invocation (modprobe, mkswap, swapon, swapoff)

use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Short human description of a failed run, preferring stderr
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs external programs on behalf of the kernel-facing components.
///
/// A timed-out run returns an `io::Error` of kind `TimedOut` after the child
/// has been killed and reaped.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> io::Result<CommandOutput>;
}

/// Runs programs through `std::process::Command`
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner {
    poll_interval: Duration,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> io::Result<CommandOutput> {
        debug!("exec: {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Pipes are drained on their own threads while the child runs
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match timeout {
            Some(limit) => {
                let deadline = Instant::now() + limit;
                let poll = if self.poll_interval.is_zero() {
                    Duration::from_millis(50)
                } else {
                    self.poll_interval
                };

                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("{} did not finish within {:?}", program, limit),
                        ));
                    }
                    thread::sleep(poll);
                }
            }
            None => child.wait()?,
        };

        Ok(CommandOutput {
            success: status.success(),
            code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_message_prefers_stderr() {
        let out = CommandOutput {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: "swapon: /dev/zram0: swapon failed: Device or resource busy\n".to_string(),
        };
        assert_eq!(
            out.failure_message(),
            "swapon: /dev/zram0: swapon failed: Device or resource busy"
        );
    }

    #[test]
    fn test_failure_message_falls_back_to_status() {
        let out = CommandOutput {
            success: false,
            code: Some(255),
            ..Default::default()
        };
        assert_eq!(out.failure_message(), "exited with status 255");

        let killed = CommandOutput::default();
        assert_eq!(killed.failure_message(), "terminated by signal");
    }

    #[test]
    fn test_run_true() {
        let runner = SystemCommandRunner::new();
        let out = runner.run("true", &[], None).unwrap();
        assert!(out.success);
        assert_eq!(out.code, Some(0));
    }

    #[test]
    fn test_run_captures_stdout() {
        let runner = SystemCommandRunner::new();
        let out = runner
            .run("echo", &["zram".to_string()], Some(Duration::from_secs(5)))
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "zram");
    }

    #[test]
    fn test_run_timeout_kills_child() {
        let runner = SystemCommandRunner::new();
        let err = runner
            .run("sleep", &["5".to_string()], Some(Duration::from_millis(100)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_run_missing_program() {
        let runner = SystemCommandRunner::new();
        assert!(runner
            .run("zramkit-no-such-program", &[], None)
            .is_err());
    }

    #[test]
    fn test_run_large_output_within_timeout() {
        let runner = SystemCommandRunner::new();
        let out = runner
            .run(
                "head",
                &["-c".to_string(), "1048576".to_string(), "/dev/zero".to_string()],
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.len(), 1048576);
    }
}
