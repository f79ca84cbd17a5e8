//! The subprocess control object
//!
//! [`Subprocess`] wraps one native child process behind a uniform surface:
//! await it for a whole [`CommandResult`], iterate it (or its stdout/stderr)
//! for lazy lines, or compose it into a pipeline with
//! [`pipe`](Subprocess::pipe). The object is created synchronously, settles
//! exactly once, and its settled value is memoized.

use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_process::Stdio;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, Stream, StreamExt};

use crate::command::{Command, StdinSource};
use crate::driver::{self, Ctx, Init};
use crate::error::{ConfigError, SubprocessError};
use crate::output::{Dispatch, LineStream, OutputChunk, OutputSource};

/// The settled value of a subprocess: its result or its uniform error.
pub type Settled = Result<CommandResult, SubprocessError>;

pub(crate) type SharedDriver = Shared<BoxFuture<'static, Settled>>;

/// Everything a successfully completed subprocess produced.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// The program and its arguments as a single rendered line.
    pub command: String,
    /// Time from subprocess creation to settlement.
    pub duration: Duration,
    /// Captured stdout, trimmed of at most one trailing newline.
    pub stdout: String,
    /// Captured stderr, trimmed of at most one trailing newline.
    pub stderr: String,
    /// Combined output: stdout and stderr joined with a newline when both
    /// are non-empty.
    pub output: String,
    /// Settled result of the upstream pipeline stage, when this process was
    /// produced by [`Subprocess::pipe`] and the upstream settled first.
    pub piped_from: Option<Arc<Settled>>,
}

/// An awaitable, streamable handle to one spawned process.
///
/// Spawning never fails synchronously: spawn errors and configuration errors
/// settle the handle immediately and surface when it is awaited. Awaiting
/// after settlement returns the memoized value again.
///
/// ```no_run
/// # futures_lite::future::block_on(async {
/// use process_pipeline::Command;
///
/// let result = Command::builder("echo")
///     .arg("hello")
///     .spawn()
///     .join()
///     .await
///     .unwrap();
/// assert_eq!(result.stdout, "hello");
/// # });
/// ```
pub struct Subprocess {
    pub(crate) ctx: Arc<Ctx>,
    pub(crate) driver: SharedDriver,
    /// Lazily claimed merged line stream, for the `Stream` impl.
    merged: Option<LineStream>,
}

impl Subprocess {
    /// Spawn a command, returning its control handle.
    pub(crate) fn spawn(command: Command) -> Subprocess {
        Self::spawn_with_upstream(command, None)
    }

    pub(crate) fn spawn_with_upstream(
        command: Command,
        upstream: Option<SharedDriver>,
    ) -> Subprocess {
        let line = command.display_line();
        let started = Instant::now();
        if command.get_program().is_empty() {
            return Self::settled_config(line, ConfigError::new("empty program name"));
        }

        let mut prepared = command.prepare();
        prepared.stdout(Stdio::piped());
        prepared.stderr(Stdio::piped());
        prepared.stdin(match &command.stdin {
            StdinSource::Inherit => Stdio::inherit(),
            StdinSource::Null => Stdio::null(),
            _ => Stdio::piped(),
        });
        let spawned = prepared.spawn();
        let pid = spawned.as_ref().ok().map(|child| child.id());

        let stdout_overridden = command.stdout_sink.is_some();
        let ctx = Arc::new(Ctx::new(
            line,
            started,
            pid,
            slot_for(command.stdout_sink),
            slot_for(command.stderr_sink),
            stdout_overridden,
        ));
        let init = Init {
            child: spawned,
            stdin: command.stdin,
            timeout: command.timeout,
            cancel: command.cancel,
        };
        let driver = driver::drive(Arc::clone(&ctx), init, upstream)
            .boxed()
            .shared();
        Subprocess {
            ctx,
            driver,
            merged: None,
        }
    }

    /// A handle that settled with a configuration error before any spawn.
    pub(crate) fn settled_config(command: String, error: ConfigError) -> Subprocess {
        let err = SubprocessError::early(&command, Arc::new(error), Duration::ZERO);
        let ctx = Arc::new(Ctx::closed(command));
        let driver: SharedDriver = futures::future::ready(Err(err)).boxed().shared();
        Subprocess {
            ctx,
            driver,
            merged: None,
        }
    }

    /// The program and its arguments as a single rendered line.
    pub fn command(&self) -> &str {
        &self.ctx.command
    }

    /// OS process id of the child, when the spawn succeeded.
    ///
    /// The native handle itself stays exclusively owned by this object; the
    /// pid is the identity exposed for advanced interop.
    pub fn pid(&self) -> Option<u32> {
        self.ctx.pid
    }

    /// Wait for the process to settle and return the memoized result.
    ///
    /// Repeated calls after settlement resolve immediately with the same
    /// value. `(&subprocess).await` is equivalent.
    pub async fn join(&self) -> Settled {
        self.driver.clone().await
    }

    /// Lazy stream of stdout lines.
    ///
    /// Claiming a stream is exclusive with whole-result capture: lines
    /// consumed here never reappear in the awaited result, which keeps only
    /// unconsumed trailing data. Each stream can be claimed at most once.
    pub fn stdout(&self) -> LineStream {
        self.claim_one(OutputSource::Stdout)
    }

    /// Lazy stream of stderr lines; same exclusivity rules as
    /// [`stdout`](Subprocess::stdout).
    pub fn stderr(&self) -> LineStream {
        self.claim_one(OutputSource::Stderr)
    }

    /// Lazy stream of stdout and stderr lines merged in arrival order.
    ///
    /// Claims both streams at once; iterating the [`Subprocess`] itself does
    /// the same thing.
    pub fn lines(&self) -> LineStream {
        let (tx, rx) = async_channel::unbounded();
        let mut out = self.ctx.stdout.lock().unwrap();
        let mut err = self.ctx.stderr.lock().unwrap();
        match (&mut *out, &mut *err) {
            (Dispatch::Buffer(out_buf), Dispatch::Buffer(err_buf)) => {
                send_pending(&tx, OutputSource::Stdout, std::mem::take(out_buf));
                send_pending(&tx, OutputSource::Stderr, std::mem::take(err_buf));
                *out = Dispatch::Stream(tx.clone());
                *err = Dispatch::Stream(tx);
                LineStream::new(Some(rx), self.driver.clone())
            }
            (Dispatch::Closed, Dispatch::Closed) => LineStream::new(None, self.driver.clone()),
            _ => LineStream::failed(self.claim_conflict(), self.driver.clone()),
        }
    }

    fn claim_one(&self, source: OutputSource) -> LineStream {
        let slot = match source {
            OutputSource::Stdout => &self.ctx.stdout,
            OutputSource::Stderr => &self.ctx.stderr,
        };
        let mut dispatch = slot.lock().unwrap();
        match &mut *dispatch {
            Dispatch::Buffer(buf) => {
                let (tx, rx) = async_channel::unbounded();
                send_pending(&tx, source, std::mem::take(buf));
                *dispatch = Dispatch::Stream(tx);
                LineStream::new(Some(rx), self.driver.clone())
            }
            Dispatch::Closed => LineStream::new(None, self.driver.clone()),
            Dispatch::Stream(_) | Dispatch::Pipe { .. } => {
                drop(dispatch);
                LineStream::failed(self.claim_conflict(), self.driver.clone())
            }
        }
    }

    fn claim_conflict(&self) -> SubprocessError {
        SubprocessError::early(
            &self.ctx.command,
            Arc::new(ConfigError::new("output is already being consumed")),
            Duration::ZERO,
        )
    }
}

fn slot_for(sink: Option<async_channel::Sender<Vec<u8>>>) -> Dispatch {
    match sink {
        Some(tx) => Dispatch::Pipe {
            txs: vec![tx],
            buf: Vec::new(),
        },
        None => Dispatch::Buffer(Vec::new()),
    }
}

/// Flush output buffered before a claim into the freshly claimed channel.
fn send_pending(tx: &async_channel::Sender<OutputChunk>, source: OutputSource, data: Vec<u8>) {
    if !data.is_empty() {
        let _ = tx.try_send(OutputChunk { source, data });
    }
}

impl<'a> IntoFuture for &'a Subprocess {
    type Output = Settled;
    type IntoFuture = Shared<BoxFuture<'static, Settled>>;

    fn into_future(self) -> Self::IntoFuture {
        self.driver.clone()
    }
}

impl Stream for Subprocess {
    type Item = Result<String, SubprocessError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.merged.is_none() {
            let stream = this.lines();
            this.merged = Some(stream);
        }
        match this.merged.as_mut() {
            Some(stream) => stream.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}
