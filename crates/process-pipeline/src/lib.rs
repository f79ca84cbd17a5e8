//! Awaitable, streamable subprocess handles with pipeline composition
//!
//! This crate wraps the event-driven child-process primitive behind a single
//! uniform handle, the [`Subprocess`]: await it for a whole [`CommandResult`],
//! iterate it (or its stdout/stderr) for lazy lines of output, or chain
//! handles into pipelines with [`Subprocess::pipe`]. Every failure - spawn
//! error, non-zero exit, signal, broken stream, timeout, cancellation, bad
//! configuration - surfaces as one uniform [`SubprocessError`].
//!
//! It is runtime-agnostic: processes are spawned via `async-process` and
//! nothing here assumes a particular executor.
//!
//! ```no_run
//! # futures_lite::future::block_on(async {
//! use process_pipeline::Command;
//!
//! // Await a whole result.
//! let result = Command::builder("echo").arg("hello").spawn().join().await.unwrap();
//! assert_eq!(result.stdout, "hello");
//!
//! // Or build a pipeline and await its terminal stage.
//! let source = Command::builder("printf").arg("foo\n").spawn();
//! let upper = source.pipe(
//!     Command::builder("tr").arg("[:lower:]").arg("[:upper:]").build(),
//! );
//! let result = upper.join().await.unwrap();
//! assert_eq!(result.stdout, "FOO");
//! # });
//! ```

#![warn(missing_docs)]

pub mod cancel;
pub mod command;
pub mod error;
pub mod output;
pub mod process;

mod driver;
mod pipe;

pub use cancel::{CancelHandle, CancelToken, cancellation};
pub use command::{Command, CommandBuilder};
pub use error::{Cancelled, Cause, ConfigError, SubprocessError};
pub use output::{LineStream, OutputSource};
pub use process::{CommandResult, Settled, Subprocess};

/// Spawn a command, returning its control handle.
///
/// This never fails synchronously: spawn and configuration errors settle the
/// returned handle immediately and surface when it is awaited.
pub fn spawn(command: Command) -> Subprocess {
    Subprocess::spawn(command)
}
