//! Internal event pump: one driver future per subprocess
//!
//! The driver multiplexes stdin feeding, stdout/stderr pumping, the exit
//! status, the timeout timer, and the cancellation token into a single
//! future. Wrapped in [`futures::future::Shared`] by the control object, it
//! doubles as the single-assignment settlement cell: the first completion is
//! the value every consumer observes, and later failure signals are
//! discarded.

use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use async_io::Timer;
use async_process::{Child, ChildStdin};
use futures::future::{self, Either};
use futures::{FutureExt, pin_mut, select};
use futures_lite::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::command::StdinSource;
use crate::error::{Cancelled, Cause, SubprocessError};
use crate::output::{self, Dispatch, OutputChunk, OutputSource};
use crate::process::{CommandResult, Settled, SharedDriver};

/// State shared between a [`Subprocess`](crate::Subprocess) and its driver.
pub(crate) struct Ctx {
    pub(crate) command: String,
    pub(crate) started: Instant,
    pub(crate) pid: Option<u32>,
    pub(crate) stdout: Mutex<Dispatch>,
    pub(crate) stderr: Mutex<Dispatch>,
    /// Set when the caller redirected stdout at spawn time; such a
    /// subprocess cannot be used as a pipeline source.
    pub(crate) stdout_overridden: bool,
    /// First stream failure observed; later ones are discarded.
    failure: Mutex<Option<Arc<io::Error>>>,
}

impl Ctx {
    pub(crate) fn new(
        command: String,
        started: Instant,
        pid: Option<u32>,
        stdout: Dispatch,
        stderr: Dispatch,
        stdout_overridden: bool,
    ) -> Self {
        Self {
            command,
            started,
            pid,
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            stdout_overridden,
            failure: Mutex::new(None),
        }
    }

    /// Context for a subprocess that settled before anything was spawned.
    pub(crate) fn closed(command: String) -> Self {
        Self::new(
            command,
            Instant::now(),
            None,
            Dispatch::Closed,
            Dispatch::Closed,
            false,
        )
    }

    fn slot(&self, source: OutputSource) -> &Mutex<Dispatch> {
        match source {
            OutputSource::Stdout => &self.stdout,
            OutputSource::Stderr => &self.stderr,
        }
    }
}

/// Everything the driver takes exclusive ownership of at creation.
pub(crate) struct Init {
    pub(crate) child: io::Result<Child>,
    pub(crate) stdin: StdinSource,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancelToken>,
}

/// Drive one subprocess to settlement, co-driving its upstream stage when it
/// was produced by `pipe()`.
pub(crate) async fn drive(ctx: Arc<Ctx>, init: Init, upstream: Option<SharedDriver>) -> Settled {
    let own = drive_child(ctx, init);
    pin_mut!(own);

    let mut settled = match &upstream {
        Some(up) => {
            // The upstream driver pumps the bytes this stage reads on stdin,
            // so poll it alongside our own work. Our settlement does not wait
            // for the upstream's.
            let co = up.clone().map(|_| ());
            pin_mut!(co);
            match future::select(own, co).await {
                Either::Left((settled, _)) => settled,
                Either::Right(((), own_rest)) => own_rest.await,
            }
        }
        None => own.await,
    };

    // Arrival-order rule: the back-reference is only attached when the
    // upstream had already settled by the time this stage did.
    if let Some(up) = upstream {
        if let Some(source) = up.peek() {
            let link = Some(Arc::new(source.clone()));
            match &mut settled {
                Ok(result) => result.piped_from = link,
                Err(err) => err.piped_from = link,
            }
        }
    }
    settled
}

async fn drive_child(ctx: Arc<Ctx>, init: Init) -> Settled {
    let Init {
        child,
        stdin: stdin_source,
        timeout,
        cancel,
    } = init;

    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            debug!(command = %ctx.command, error = %err, "failed to spawn process");
            // Drop any iteration or pipe senders so consumers of the streams
            // observe end-of-stream and surface this error instead of waiting.
            close_slot(&ctx.stdout);
            close_slot(&ctx.stderr);
            return Err(SubprocessError::early(
                &ctx.command,
                Arc::new(err),
                ctx.started.elapsed(),
            ));
        }
    };
    let pid = child.id();
    debug!(command = %ctx.command, pid, "process spawned");

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let feeder = feed_stdin(&ctx, stdin, stdin_source);

    let supervise = async {
        let exit = child.status().fuse();
        let deadline = match timeout {
            Some(timeout) => Timer::after(timeout),
            None => Timer::never(),
        }
        .fuse();
        let cancelled = cancel_wait(cancel).fuse();
        pin_mut!(exit, deadline, cancelled);

        let mut cancel_reason = None;
        let status = loop {
            select! {
                status = exit => break status,
                _ = deadline => {
                    debug!(command = %ctx.command, pid, "timeout elapsed, sending SIGTERM");
                    terminate(&ctx, pid);
                }
                reason = cancelled => {
                    debug!(command = %ctx.command, pid, reason = %reason, "cancellation requested, sending SIGTERM");
                    cancel_reason = Some(reason);
                    terminate(&ctx, pid);
                }
            }
        };
        (status, cancel_reason)
    };

    let until_exit = async {
        let ((), (), outcome) = futures::join!(
            pump(&ctx, stdout, OutputSource::Stdout),
            pump(&ctx, stderr, OutputSource::Stderr),
            supervise,
        );
        outcome
    };

    // The child owes us an exit and both output streams an EOF; the stdin
    // feeder owes us nothing. A child may exit while its stdin channel is
    // still open, so feeding is abandoned once everything else is done.
    // Dropping the feeder also closes the child's stdin writer.
    pin_mut!(feeder, until_exit);
    let (status, cancel_reason) = match future::select(until_exit, feeder).await {
        Either::Left((outcome, _)) => outcome,
        Either::Right(((), until_exit)) => until_exit.await,
    };

    // Close the dispatch slots: this drops any iteration or pipe senders so
    // downstream consumers see end-of-stream, and collects what was buffered.
    let stdout_text = output::into_text(close_slot(&ctx.stdout));
    let stderr_text = output::into_text(close_slot(&ctx.stderr));
    let output_text = output::combined(&stdout_text, &stderr_text);
    let duration = ctx.started.elapsed();

    // A stream failure recorded while pumping wins over the exit status.
    let stream_failure = ctx.failure.lock().unwrap().take();
    if let Some(err) = stream_failure {
        debug!(command = %ctx.command, pid, "settled with stream failure");
        let cause: Cause = err;
        return Err(SubprocessError::normalized(
            &ctx.command,
            None,
            None,
            stdout_text,
            stderr_text,
            output_text,
            Some(cause),
            duration,
        ));
    }

    let status = match status {
        Ok(status) => status,
        Err(err) => {
            let cause: Cause = Arc::new(err);
            return Err(SubprocessError::normalized(
                &ctx.command,
                None,
                None,
                stdout_text,
                stderr_text,
                output_text,
                Some(cause),
                duration,
            ));
        }
    };

    if status.success() {
        debug!(command = %ctx.command, pid, ?duration, "process completed");
        return Ok(CommandResult {
            command: ctx.command.clone(),
            duration,
            stdout: stdout_text,
            stderr: stderr_text,
            output: output_text,
            piped_from: None,
        });
    }

    if let Some(signal) = signal_name(&status) {
        debug!(command = %ctx.command, pid, signal = %signal, "process terminated by signal");
        let cause = cancel_reason.map(|reason| Arc::new(Cancelled { reason }) as Cause);
        return Err(SubprocessError::normalized(
            &ctx.command,
            None,
            Some(signal),
            stdout_text,
            stderr_text,
            output_text,
            cause,
            duration,
        ));
    }

    let code = status.code();
    debug!(command = %ctx.command, pid, code = ?code, "process exited with failure");
    Err(SubprocessError::normalized(
        &ctx.command,
        code,
        None,
        stdout_text,
        stderr_text,
        output_text,
        None,
        duration,
    ))
}

/// Resolve with the cancellation reason, or never.
async fn cancel_wait(token: Option<CancelToken>) -> String {
    if let Some(token) = token {
        if let Some(reason) = token.fired().await {
            return reason;
        }
    }
    future::pending().await
}

/// Read one stdio stream to EOF, routing each chunk through its dispatch slot.
async fn pump<R>(ctx: &Ctx, reader: Option<R>, source: OutputSource)
where
    R: futures_lite::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else { return };
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => dispatch_chunk(ctx, source, buf[..n].to_vec()).await,
            Err(err) => {
                record_stream_failure(ctx, err);
                break;
            }
        }
    }
}

async fn dispatch_chunk(ctx: &Ctx, source: OutputSource, data: Vec<u8>) {
    enum Route {
        Done,
        Stream(Sender<OutputChunk>),
        Fanout(Vec<Sender<Vec<u8>>>),
    }

    // Snapshot the route under the lock, send outside it.
    let route = {
        let mut dispatch = ctx.slot(source).lock().unwrap();
        match &mut *dispatch {
            Dispatch::Buffer(buf) => {
                buf.extend_from_slice(&data);
                Route::Done
            }
            Dispatch::Stream(tx) => Route::Stream(tx.clone()),
            Dispatch::Pipe { txs, buf } => {
                buf.extend_from_slice(&data);
                Route::Fanout(txs.clone())
            }
            Dispatch::Closed => Route::Done,
        }
    };
    match route {
        Route::Done => {}
        Route::Stream(tx) => {
            let _ = tx.send(OutputChunk { source, data }).await;
        }
        Route::Fanout(txs) => {
            // Every destination observes the same byte sequence; bounded
            // channels provide the back-pressure.
            for tx in &txs {
                let _ = tx.send(data.clone()).await;
            }
        }
    }
}

/// Feed the child's stdin from the configured source, then close it.
async fn feed_stdin(ctx: &Ctx, stdin: Option<ChildStdin>, source: StdinSource) {
    let Some(mut stdin) = stdin else { return };
    match source {
        StdinSource::Null | StdinSource::Inherit => {}
        StdinSource::Bytes(data) => {
            write_chunk(ctx, &mut stdin, &data).await;
        }
        StdinSource::Lines(rx) => {
            while let Ok(line) = rx.recv().await {
                if !write_chunk(ctx, &mut stdin, line.as_bytes()).await
                    || !write_chunk(ctx, &mut stdin, b"\n").await
                {
                    drain(&rx).await;
                    break;
                }
            }
        }
        StdinSource::Chunks(rx) => {
            while let Ok(chunk) = rx.recv().await {
                if !write_chunk(ctx, &mut stdin, &chunk).await {
                    drain(&rx).await;
                    break;
                }
            }
        }
    }
    // Dropping the writer closes the child's stdin.
}

/// Discard everything a closed-off consumer leaves behind, keeping the
/// producer side unblocked.
async fn drain<T>(rx: &Receiver<T>) {
    while rx.recv().await.is_ok() {}
}

/// Write and flush one chunk. Returns false when feeding should stop.
async fn write_chunk(ctx: &Ctx, stdin: &mut ChildStdin, data: &[u8]) -> bool {
    let outcome = async {
        stdin.write_all(data).await?;
        stdin.flush().await
    }
    .await;
    match outcome {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            debug!(command = %ctx.command, "stdin closed by child, abandoning remaining input");
            false
        }
        Err(err) => {
            record_stream_failure(ctx, err);
            false
        }
    }
}

fn record_stream_failure(ctx: &Ctx, err: io::Error) {
    let mut slot = ctx.failure.lock().unwrap();
    if slot.is_none() {
        *slot = Some(Arc::new(err));
    } else {
        warn!(command = %ctx.command, error = %err, "discarding stream failure observed after the first");
    }
}

fn close_slot(slot: &Mutex<Dispatch>) -> Vec<u8> {
    match std::mem::replace(&mut *slot.lock().unwrap(), Dispatch::Closed) {
        Dispatch::Buffer(buf) | Dispatch::Pipe { buf, .. } => buf,
        Dispatch::Stream(_) | Dispatch::Closed => Vec::new(),
    }
}

fn terminate(ctx: &Ctx, pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(command = %ctx.command, pid, error = %err, "failed to deliver SIGTERM");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (ctx, pid);
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status
        .signal()
        .map(|raw| match nix::sys::signal::Signal::try_from(raw) {
            Ok(signal) => signal.as_str().to_string(),
            Err(_) => format!("signal {raw}"),
        })
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}
