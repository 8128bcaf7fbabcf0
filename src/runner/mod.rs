//! Runner module - interactive program execution
//!
//! A [`RunningProgram`] is a child process whose stdin, stdout and stderr are
//! attached to one pseudo-terminal. All output goes into an append-only log
//! that stays readable after the program ended, was killed, or timed out.
//!
//! The runner module does NOT:
//! - Decide about pass or fail
//! - Sandbox the program beyond its own process group

mod pattern;
mod pty;

pub use pattern::Pattern;

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use encoding_rs::Encoding;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::config::get_config;
use crate::core::JobError;
use pty::PtyMaster;

const READ_CHUNK: usize = 4096;

/// Everything needed to start a program
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    /// Program name; `./name` is looked up in the working directory
    pub name: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    /// Applies to each single wait, not to the whole lifetime
    pub timeout: Duration,
    /// Output encoding; `None` treats output as raw bytes
    pub encoding: Option<&'static Encoding>,
}

impl ProgramSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            work_dir: PathBuf::from("."),
            timeout: get_config().run_timeout,
            encoding: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Unknown labels leave the output as raw bytes
    pub fn with_encoding(mut self, label: &str) -> Self {
        self.encoding = Encoding::for_label(label.trim().as_bytes());
        if self.encoding.is_none() {
            warn!("Unknown output encoding '{}', using raw bytes", label);
        }
        self
    }

    /// Program and arguments as they are executed
    fn command_line(&self) -> (PathBuf, Vec<String>) {
        let (program, args) = if self.args.is_empty() && self.name.trim().contains(' ') {
            let mut parts = self.name.split_whitespace().map(str::to_string);
            let program = parts.next().unwrap_or_default();
            (program, parts.collect())
        } else {
            (self.name.clone(), self.args.clone())
        };

        let program = match program.strip_prefix("./") {
            Some(local) => self.work_dir.join(local),
            None => PathBuf::from(program),
        };
        (program, args)
    }
}

/// A spawned program that can be talked to
pub struct RunningProgram {
    name: String,
    args: Vec<String>,
    work_dir: PathBuf,
    timeout: Duration,
    encoding: Option<&'static Encoding>,
    child: Child,
    pty: PtyMaster,
    log: Vec<u8>,
    /// Start of the output not consumed by `expect_output` yet
    cursor: usize,
    eof: bool,
    exit: Option<ExitStatus>,
}

impl RunningProgram {
    /// Start the program. Must be called from within a tokio runtime.
    pub fn spawn(spec: ProgramSpec) -> Result<Self, JobError> {
        let (program, args) = spec.command_line();
        debug!(
            "Spawning '{}' in {:?} with arguments {:?}",
            program.display(),
            spec.work_dir,
            args
        );

        let spawn_failure = |source: io::Error| JobError::SpawnFailure {
            program: spec.name.clone(),
            source,
            output: String::new(),
        };

        let (pty, slave) = pty::open().map_err(spawn_failure)?;
        let stdin = slave.try_clone().map_err(spawn_failure)?;
        let stdout = slave.try_clone().map_err(spawn_failure)?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&spec.work_dir)
            .env("LD_LIBRARY_PATH", &spec.work_dir)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(slave))
            .process_group(0)
            .kill_on_drop(true);

        let child = command.spawn().map_err(spawn_failure)?;
        // Our copies of the slave side must be closed, or EOF is never seen
        drop(command);

        Ok(Self {
            name: spec.name,
            args,
            work_dir: spec.work_dir,
            timeout: spec.timeout,
            encoding: spec.encoding,
            child,
            pty,
            log: Vec::new(),
            cursor: 0,
            eof: false,
            exit: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Exit code once the program has been reaped
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|status| status.code())
    }

    /// Everything the program printed so far
    pub fn output(&self) -> String {
        match self.encoding {
            Some(encoding) => encoding
                .decode_without_bom_handling(&self.log)
                .0
                .into_owned(),
            None => String::from_utf8_lossy(&self.log).into_owned(),
        }
    }

    /// Send `text` followed by a newline
    pub async fn send_line(&mut self, text: &str) -> Result<(), JobError> {
        debug!("Sending input '{}' to '{}'", text, self.name);

        if self.has_exited() {
            return Err(self.terminated());
        }

        let mut line = match self.encoding {
            Some(encoding) => encoding.encode(text).0.into_owned(),
            None => text.as_bytes().to_vec(),
        };
        line.push(b'\n');

        let deadline = Instant::now() + self.timeout;
        let written = timeout_at(deadline, self.pty.write_all(&line)).await;
        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if pty::is_hangup(&e) => Err(self.terminated()),
            Ok(Err(e)) => Err(self.failure(e)),
            Err(_) => Err(self.timed_out()),
        }
    }

    /// Wait until the unread output matches `pattern`.
    ///
    /// Returns the index of the matching alternative, 0 for a single pattern.
    /// Output up to the end of the match counts as read afterwards.
    pub async fn expect_output(
        &mut self,
        pattern: impl Into<Pattern>,
        timeout: Option<Duration>,
    ) -> Result<usize, JobError> {
        let pattern = pattern.into();
        debug!("Expecting output {} from '{}'", pattern, self.name);

        let matcher = pattern.compile(self.encoding)?;
        let deadline = Instant::now() + timeout.unwrap_or(self.timeout);

        loop {
            if let Some((index, end)) = matcher.find(&self.log[self.cursor..]) {
                self.cursor += end;
                return Ok(index);
            }
            if self.eof {
                debug!("'{}' ended before printing {}", self.name, pattern);
                return Err(self.terminated());
            }
            self.fill(deadline).await?;
        }
    }

    /// Read all remaining output and reap the program.
    ///
    /// Returns the exit code (`None` if killed by a signal) and the full output.
    pub async fn wait_for_end(&mut self) -> Result<(Option<i32>, String), JobError> {
        debug!("Waiting for termination of '{}'", self.name);
        let deadline = Instant::now() + self.timeout;

        while !self.eof {
            self.fill(deadline).await?;
        }

        let status = match self.exit {
            Some(status) => status,
            None => {
                let waited = timeout_at(deadline, self.child.wait()).await;
                match waited {
                    Ok(Ok(status)) => status,
                    Ok(Err(e)) => return Err(self.failure(e)),
                    Err(_) => return Err(self.timed_out()),
                }
            }
        };
        self.exit = Some(status);
        self.cursor = self.log.len();

        debug!("'{}' finished with {}", self.name, status);
        Ok((status.code(), self.output()))
    }

    /// Wait for the end and require the given exit code.
    ///
    /// Returns the full output on success.
    pub async fn expect_exit_status(&mut self, expected: i32) -> Result<String, JobError> {
        let (code, output) = self.wait_for_end().await?;

        if code == Some(expected) {
            Ok(output)
        } else {
            Err(JobError::WrongExitStatus {
                program: self.name.clone(),
                expected,
                got: code,
                output,
            })
        }
    }

    /// Read one chunk of output into the log
    async fn fill(&mut self, deadline: Instant) -> Result<(), JobError> {
        let mut buf = [0u8; READ_CHUNK];
        let read = timeout_at(deadline, self.pty.read(&mut buf)).await;

        match read {
            Ok(Ok(0)) => {
                self.eof = true;
                Ok(())
            }
            Ok(Ok(n)) => {
                self.log.extend_from_slice(&buf[..n]);
                Ok(())
            }
            Ok(Err(e)) => Err(self.failure(e)),
            Err(_) => Err(self.timed_out()),
        }
    }

    fn has_exited(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                true
            }
            _ => false,
        }
    }

    /// Kill the whole process group of the program
    fn kill(&mut self) {
        if let Some(pid) = self.child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!("Failed to kill process group of '{}': {}", self.name, e);
            }
        }
        let _ = self.child.start_kill();
    }

    fn timed_out(&mut self) -> JobError {
        debug!("'{}' timed out, killing it", self.name);
        self.kill();
        JobError::ProcessTimeout {
            program: self.name.clone(),
            output: self.output(),
        }
    }

    fn terminated(&self) -> JobError {
        JobError::ProcessTerminated {
            program: self.name.clone(),
            output: self.output(),
        }
    }

    fn failure(&self, source: io::Error) -> JobError {
        JobError::SpawnFailure {
            program: self.name.clone(),
            source,
            output: self.output(),
        }
    }
}

impl Drop for RunningProgram {
    fn drop(&mut self) {
        if self.exit.is_none() {
            self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, dir: &Path) -> RunningProgram {
        RunningProgram::spawn(
            ProgramSpec::new("sh")
                .with_args(["-c", script])
                .with_work_dir(dir)
                .with_timeout(Duration::from_secs(5)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_interaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut prog = sh("echo 'Your name?'; read name; echo \"Hello $name\"", dir.path());

        assert_eq!(prog.expect_output("name?", None).await.unwrap(), 0);
        prog.send_line("Ada").await.unwrap();
        prog.expect_output(Pattern::regex("Hello A[a-z]+"), None)
            .await
            .unwrap();

        let (code, output) = prog.wait_for_end().await.unwrap();
        assert_eq!(code, Some(0));
        assert!(output.contains("Hello Ada"));
        assert!(!output.contains("\r\n"));
    }

    #[tokio::test]
    async fn test_expect_consumes_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut prog = sh("echo one; echo two", dir.path());

        prog.expect_output("one", None).await.unwrap();
        prog.expect_output("two", None).await.unwrap();
        let err = prog.expect_output("one", None).await.unwrap_err();
        assert!(matches!(err, JobError::ProcessTerminated { .. }));
    }

    #[tokio::test]
    async fn test_regex_matches_decoded_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut prog = RunningProgram::spawn(
            ProgramSpec::new("sh")
                .with_args(["-c", "printf 'Gr\\374\\337e\\nTsch\\374ss\\n'"])
                .with_work_dir(dir.path())
                .with_timeout(Duration::from_secs(5))
                .with_encoding("windows-1252"),
        )
        .unwrap();

        prog.expect_output(Pattern::regex("Gr..e"), None).await.unwrap();
        prog.expect_output(Pattern::regex("Tschü"), None).await.unwrap();
        // The first line was consumed by the first match
        let err = prog
            .expect_output(Pattern::regex("Grü"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ProcessTerminated { .. }));
        assert_eq!(prog.output(), "Grüße\nTschüss\n");
    }

    #[tokio::test]
    async fn test_any_returns_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut prog = sh("echo 'result: 42'", dir.path());

        let pattern = Pattern::Any(vec![Pattern::literal("error"), Pattern::regex("result: \\d+")]);
        assert_eq!(prog.expect_output(pattern, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timeout_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut prog = sh("sleep 10", dir.path());

        let err = prog
            .expect_output("anything", Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ProcessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_termination_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut prog = sh("echo partial", dir.path());

        let err = prog.expect_output("never", None).await.unwrap_err();
        match err {
            JobError::ProcessTerminated { program, output } => {
                assert_eq!(program, "sh");
                assert!(output.contains("partial"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut prog = sh("echo failing; exit 3", dir.path());

        let err = prog.expect_exit_status(0).await.unwrap_err();
        match err {
            JobError::WrongExitStatus {
                expected,
                got,
                output,
                ..
            } => {
                assert_eq!(expected, 0);
                assert_eq!(got, Some(3));
                assert!(output.contains("failing"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expected_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut prog = sh("exit 3", dir.path());
        prog.expect_exit_status(3).await.unwrap();
        assert_eq!(prog.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_missing_local_program() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunningProgram::spawn(ProgramSpec::new("./a.out").with_work_dir(dir.path()))
            .err()
            .unwrap();
        match err {
            JobError::SpawnFailure { program, .. } => assert_eq!(program, "./a.out"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_program_and_library_path() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("show.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"libs=$LD_LIBRARY_PATH\"\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut prog =
            RunningProgram::spawn(ProgramSpec::new("./show.sh").with_work_dir(dir.path())).unwrap();
        let output = prog.expect_exit_status(0).await.unwrap();
        assert!(output.contains(&format!("libs={}", dir.path().display())));
    }

    #[tokio::test]
    async fn test_name_with_arguments_is_split() {
        let dir = tempfile::tempdir().unwrap();
        let mut prog =
            RunningProgram::spawn(ProgramSpec::new("echo hello world").with_work_dir(dir.path()))
                .unwrap();
        assert_eq!(prog.args(), ["hello", "world"]);
        let (_, output) = prog.wait_for_end().await.unwrap();
        assert!(output.contains("hello world"));
    }

    #[tokio::test]
    async fn test_send_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut prog = sh("exit 0", dir.path());
        prog.wait_for_end().await.unwrap();

        let err = prog.send_line("late").await.unwrap_err();
        assert!(matches!(err, JobError::ProcessTerminated { .. }));
    }
}
