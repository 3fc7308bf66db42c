//! Run a child process while tee'ing its output.
//!
//! Each output stream gets one forwarder thread that appends to its own buffer
//! and echoes the same bytes to a local sink, flushing after every write.
//! Text mode forwards line by line, binary mode in fixed-size chunks.
//!
//! The runner returns only after both forwarders have seen end-of-stream, on
//! success, on non-zero exit and on timeout alike. On timeout the child is
//! killed first, then drained, so the error carries every byte written before
//! the kill.

use crate::run::result::{Captured, ProcessResult, RunError};
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const CHUNK_BYTES: usize = 8192;
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Data fed to the child's stdin, which is closed right after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Text(String),
    Bytes(Vec<u8>),
}

impl Input {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Input::Text(s) => s.as_bytes(),
            Input::Bytes(b) => b,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Fail with `RunError::NonZeroExit` on a non-zero exit code.
    pub check: bool,
    pub timeout: Option<Duration>,
    pub input: Option<Input>,
    /// Line-wise forwarding and `Captured::Text` results; otherwise chunks and bytes.
    pub text: bool,
    /// Extra variables layered over the inherited environment.
    pub env: Option<BTreeMap<String, String>>,
    pub cwd: Option<PathBuf>,
    /// Run `sh -c "<argv joined by spaces>"`.
    pub shell: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            check: false,
            timeout: None,
            input: None,
            text: true,
            env: None,
            cwd: None,
            shell: false,
        }
    }
}

impl RunOptions {
    pub fn checked(mut self) -> Self {
        self.check = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_input(mut self, input: Input) -> Self {
        self.input = Some(input);
        self
    }

    pub fn binary(mut self) -> Self {
        self.text = false;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn in_shell(mut self) -> Self {
        self.shell = true;
        self
    }
}

/// Run `argv`, echoing to this process's stdout and stderr.
pub fn run_with_tee(argv: &[String], options: &RunOptions) -> Result<ProcessResult, RunError> {
    run_with_sinks(argv, options, io::stdout(), io::stderr())
}

/// Run `argv`, echoing to the given sinks.
pub fn run_with_sinks<O, E>(
    argv: &[String],
    options: &RunOptions,
    out_sink: O,
    err_sink: E,
) -> Result<ProcessResult, RunError>
where
    O: Write + Send,
    E: Write + Send,
{
    let program = argv.first().ok_or(RunError::EmptyCommand)?.clone();
    let mut command = build_command(argv, options);
    debug!(?argv, shell = options.shell, timeout = ?options.timeout, "spawning");

    let mut child = command.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();
    let text = options.text;

    let (waited, out_buf, err_buf) = thread::scope(|scope| {
        let out_reader = scope.spawn(move || forward(stdout, out_sink, text));
        let err_reader = scope.spawn(move || forward(stderr, err_sink, text));
        if let (Some(stdin), Some(input)) = (stdin, options.input.as_ref()) {
            scope.spawn(move || feed(stdin, input));
        }

        let waited = wait_for(&mut child, options.timeout);
        let waited = reap_on_error(&mut child, waited, options.timeout.is_some());

        let out_buf = out_reader.join().unwrap_or_else(|_| {
            warn!("stdout forwarder panicked");
            Vec::new()
        });
        let err_buf = err_reader.join().unwrap_or_else(|_| {
            warn!("stderr forwarder panicked");
            Vec::new()
        });
        (waited, out_buf, err_buf)
    });

    let (status, timed_out) = waited.map_err(|source| RunError::Io {
        program: program.clone(),
        source,
    })?;

    let result = ProcessResult {
        argv: argv.to_vec(),
        exit_code: exit_code(status),
        stdout: Captured::from_buffer(out_buf, text),
        stderr: Captured::from_buffer(err_buf, text),
        timed_out,
    };

    if timed_out {
        let timeout = options.timeout.unwrap_or_default();
        warn!(%program, ?timeout, "command timed out, killed");
        return Err(RunError::Timeout {
            timeout,
            partial: Box::new(result),
        });
    }
    if options.check && result.exit_code != 0 {
        return Err(RunError::NonZeroExit {
            result: Box::new(result),
        });
    }
    debug!(%program, exit_code = result.exit_code, "command finished");
    Ok(result)
}

fn build_command(argv: &[String], options: &RunOptions) -> Command {
    let mut command = if options.shell {
        let mut c = Command::new("sh");
        c.arg("-c").arg(argv.join(" "));
        c
    } else {
        let mut c = Command::new(&argv[0]);
        c.args(&argv[1..]);
        c
    };

    if let Some(env) = &options.env {
        command.envs(env);
    }
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if options.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

    // A killable child gets its own process group so the kill also reaches
    // grandchildren that hold the pipes open.
    #[cfg(unix)]
    if options.timeout.is_some() {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command
}

/// Copy `src` into a buffer and `sink` until end-of-stream.
///
/// Sink errors stop the echo but not the capture.
fn forward<R: Read, W: Write>(src: Option<R>, mut sink: W, text: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(src) = src else {
        return buf;
    };
    let mut echo = true;
    let mut reader = BufReader::new(src);

    loop {
        let start = buf.len();
        let read = if text {
            reader.read_until(b'\n', &mut buf)
        } else {
            buf.resize(start + CHUNK_BYTES, 0);
            let n = reader.read(&mut buf[start..]);
            buf.truncate(start + *n.as_ref().unwrap_or(&0));
            n
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                if echo && let Err(e) = sink.write_all(&buf[start..]).and_then(|_| sink.flush()) {
                    debug!(error = %e, "echo sink closed, capturing only");
                    echo = false;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "read from child failed");
                break;
            }
        }
    }
    buf
}

/// Write all input, then drop (close) stdin.
fn feed<W: Write>(mut stdin: W, input: &Input) {
    match stdin.write_all(input.as_bytes()).and_then(|_| stdin.flush()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("child closed stdin before reading all input");
        }
        Err(e) => warn!(error = %e, "writing child stdin failed"),
    }
}

/// Wait for exit, killing the child when `timeout` expires. Returns the status
/// and whether the child was killed.
fn wait_for(child: &mut Child, timeout: Option<Duration>) -> io::Result<(ExitStatus, bool)> {
    let Some(timeout) = timeout else {
        return Ok((child.wait()?, false));
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        let now = Instant::now();
        if now >= deadline {
            kill(child, true);
            let status = child.wait()?;
            return Ok((status, true));
        }
        thread::sleep(WAIT_POLL.min(deadline - now));
    }
}

/// A failed wait must not leave the child running: the forwarders only
/// finish once its pipes close.
fn reap_on_error(
    child: &mut Child,
    waited: io::Result<(ExitStatus, bool)>,
    group: bool,
) -> io::Result<(ExitStatus, bool)> {
    if let Err(e) = &waited {
        warn!(pid = child.id(), error = %e, "wait failed, killing child");
        kill(child, group);
        let _ = child.wait();
    }
    waited
}

/// SIGKILL the child, or its whole process group when it leads one.
#[cfg(unix)]
fn kill(child: &mut Child, group: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if group {
        let pgid = Pid::from_raw(child.id() as i32);
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => return,
            Err(e) => debug!(%pgid, error = %e, "killpg failed, killing child only"),
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill(child: &mut Child, _group: bool) {
    let _ = child.kill();
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
