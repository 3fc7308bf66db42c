//! Job log watcher.
//!
//! Resolving -> Waiting -> Following -> Done. Resolution is one scheduler
//! query. Waiting polls for the output file, rewriting a single progress line.
//! Following streams the file from byte 0 and keeps streaming appended bytes
//! until the token is cancelled, which is the only way to reach Done. On the
//! way out it prints a `tail -f` command that reattaches to the same file.

use crate::job::cancel::CancelToken;
use crate::job::scheduler::{JobHandle, Scheduler, resolve};
use anyhow::Context;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Resolving,
    Waiting,
    Following,
    Done,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    pub follow_interval: Duration,
    /// Line count used in the printed resume command.
    pub tail_lines: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            follow_interval: Duration::from_millis(250),
            tail_lines: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Cancelled { signal: i32 },
}

impl WatchOutcome {
    /// Conventional `128 + signal` exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            WatchOutcome::Cancelled { signal } => 128 + signal,
        }
    }
}

pub struct Watcher<'a, W: Write> {
    scheduler: &'a dyn Scheduler,
    job_id: String,
    options: WatchOptions,
    token: CancelToken,
    sink: W,
    state: WatchState,
    handle: Option<JobHandle>,
    offset: u64,
}

impl<'a, W: Write> Watcher<'a, W> {
    pub fn new(
        scheduler: &'a dyn Scheduler,
        job_id: &str,
        options: WatchOptions,
        token: CancelToken,
        sink: W,
    ) -> Self {
        Self {
            scheduler,
            job_id: job_id.to_string(),
            options,
            token,
            sink,
            state: WatchState::Resolving,
            handle: None,
            offset: 0,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Bytes of the output file already streamed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.handle.as_ref().and_then(|h| h.output_path.as_deref())
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// The command that reattaches to the job's output.
    pub fn resume_command(&self) -> Option<String> {
        self.output_path().map(|path| {
            format!("tail -n {} -f {}", self.options.tail_lines, path.display())
        })
    }

    /// Perform one transition or one follow read.
    pub fn step(&mut self) -> anyhow::Result<WatchState> {
        match self.state {
            WatchState::Resolving => {
                self.handle = Some(resolve(self.scheduler, &self.job_id)?);
                self.state = WatchState::Waiting;
            }
            WatchState::Waiting => {
                let path = self.require_path()?;
                if path.exists() {
                    info!(job_id = %self.job_id, path = %path.display(), "job output appeared");
                    self.sink.write_all(b"\n\n")?;
                    self.sink.flush()?;
                    self.offset = 0;
                    self.state = WatchState::Following;
                } else {
                    write!(self.sink, "\rWaiting for job {} to be started.", self.job_id)?;
                    self.sink.flush()?;
                }
            }
            WatchState::Following => {
                let path = self.require_path()?;
                self.follow_once(&path)?;
            }
            WatchState::Done => {}
        }
        Ok(self.state)
    }

    /// Step until cancelled.
    pub fn run(&mut self) -> anyhow::Result<WatchOutcome> {
        loop {
            if let Some(signal) = self.token.signal() {
                return self.finish(signal);
            }
            let pause = match self.step()? {
                WatchState::Resolving => Duration::ZERO,
                WatchState::Waiting => self.options.poll_interval,
                WatchState::Following => self.options.follow_interval,
                WatchState::Done => Duration::ZERO,
            };
            self.token.sleep(pause);
        }
    }

    fn finish(&mut self, signal: i32) -> anyhow::Result<WatchOutcome> {
        debug!(job_id = %self.job_id, signal, "watch cancelled");
        if let Some(cmd) = self.resume_command() {
            writeln!(self.sink, "\n\n{}", cmd)?;
            self.sink.flush()?;
        }
        self.state = WatchState::Done;
        Ok(WatchOutcome::Cancelled { signal })
    }

    fn require_path(&self) -> anyhow::Result<PathBuf> {
        self.output_path()
            .map(Path::to_path_buf)
            .with_context(|| format!("job {} has no output path", self.job_id))
    }

    /// Stream whatever was appended since the last read.
    fn follow_once(&mut self, path: &Path) -> anyhow::Result<()> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "output file vanished");
                self.offset = 0;
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("open {}", path.display()));
            }
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            debug!(path = %path.display(), "output file truncated, restarting");
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(());
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.sink.write_all(&buf[..n])?;
            self.offset += n as u64;
        }
        self.sink.flush()?;
        Ok(())
    }
}
