//! External command execution with retries.
//!
//! LVM tools fail transiently under concurrent device-mapper activity, so
//! every invocation goes through a [`RetryPolicy`]. Stdout and stderr share
//! one pipe, so output keeps the order the tool wrote it in; it is trimmed
//! and nothing else is interpreted here.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use lvmsnap_common::CommandError;
use rustix::pipe::{PipeFlags, pipe_with};

/// How often and how fast to retry a failing command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Policy that runs each command exactly once.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Runs external commands.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning its trimmed combined output.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt when every attempt failed.
    fn run(&self, program: &str, args: &[String]) -> Result<String, CommandError>;

    /// Like [`run`](Self::run), but a failure whose exit status is listed in
    /// `settled` is returned at once instead of retried.
    ///
    /// # Errors
    ///
    /// Returns the first settled failure or the error of the last attempt.
    fn run_settled(
        &self,
        program: &str,
        args: &[String],
        settled: &[i32],
    ) -> Result<String, CommandError> {
        let _ = settled;
        self.run(program, args)
    }
}

/// Runs commands on the host.
///
/// Each child gets its own process group and is sent `SIGTERM` when this
/// process dies, so tool invocations never outlive the daemon.
#[derive(Debug, Clone, Default)]
pub struct HostRunner {
    policy: RetryPolicy,
}

impl HostRunner {
    /// Create a runner with the given retry policy.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The retry policy in use.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn run_once(program: &str, args: &[String]) -> Result<String, CommandError> {
        let spawn_error = |source: io::Error| CommandError::Spawn {
            program: program.to_string(),
            source,
        };

        let (reader, writer) = pipe_with(PipeFlags::CLOEXEC).map_err(|e| spawn_error(e.into()))?;
        let stderr = writer.try_clone().map_err(spawn_error)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        // SAFETY: prctl is async-signal-safe and touches no state shared with
        // the parent.
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(spawn_error)?;
        // The write ends must close here or the read never sees EOF.
        drop(command);

        let mut raw = Vec::new();
        let read = File::from(reader).read_to_end(&mut raw);
        let status = child.wait().map_err(spawn_error)?;
        read.map_err(spawn_error)?;
        let combined = String::from_utf8_lossy(&raw).trim().to_string();

        if status.success() {
            Ok(combined)
        } else {
            Err(CommandError::Failed {
                command: render(program, args),
                code: status.code(),
                output: combined,
            })
        }
    }
}

impl CommandRunner for HostRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, CommandError> {
        self.run_settled(program, args, &[])
    }

    fn run_settled(
        &self,
        program: &str,
        args: &[String],
        settled: &[i32],
    ) -> Result<String, CommandError> {
        tracing::debug!(program, ?args, "Running command");

        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::run_once(program, args) {
                Ok(output) => return Ok(output),
                // A missing binary will not appear between attempts.
                Err(err @ CommandError::Spawn { .. }) => return Err(err),
                Err(err) if err.exit_code().is_some_and(|code| settled.contains(&code)) => {
                    return Err(err);
                }
                Err(err) if attempt >= attempts => {
                    tracing::debug!(program, attempts, error = %err, "Command failed, giving up");
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(program, attempt, error = %err, "Command failed, retrying");
                    std::thread::sleep(self.policy.backoff);
                    attempt += 1;
                }
            }
        }
    }
}

/// Render a command line for error messages.
pub(crate) fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted runner for driver tests.

    use parking_lot::Mutex;

    use super::{CommandRunner, render};
    use lvmsnap_common::CommandError;

    type Responder = dyn Fn(&[String]) -> Result<String, CommandError> + Send + Sync;

    /// Records every command line and answers through a closure.
    pub(crate) struct FakeRunner {
        calls: Mutex<Vec<Vec<String>>>,
        settled: Mutex<Vec<String>>,
        responder: Box<Responder>,
    }

    impl FakeRunner {
        /// Runner where every command succeeds with empty output.
        pub(crate) fn succeeding() -> Self {
            Self::new(|_| Ok(String::new()))
        }

        /// Runner answering through `responder`; the slice starts with the program.
        pub(crate) fn new(
            responder: impl Fn(&[String]) -> Result<String, CommandError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                settled: Mutex::new(Vec::new()),
                responder: Box::new(responder),
            }
        }

        /// Command lines seen so far, joined with spaces.
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().iter().map(|argv| argv.join(" ")).collect()
        }

        /// Command lines that were run without retrying `settled` codes.
        pub(crate) fn settled_calls(&self) -> Vec<String> {
            self.settled.lock().clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<String, CommandError> {
            let mut argv = vec![program.to_string()];
            argv.extend(args.iter().cloned());
            self.calls.lock().push(argv.clone());
            (self.responder)(&argv)
        }

        fn run_settled(
            &self,
            program: &str,
            args: &[String],
            settled: &[i32],
        ) -> Result<String, CommandError> {
            if !settled.is_empty() {
                self.settled.lock().push(render(program, args));
            }
            self.run(program, args)
        }
    }

    /// A failed command with the given exit code.
    pub(crate) fn failure(argv: &[String], code: i32, output: &str) -> CommandError {
        CommandError::Failed {
            command: render(&argv[0], &argv[1..]),
            code: Some(code),
            output: output.to_string(),
        }
    }
}
