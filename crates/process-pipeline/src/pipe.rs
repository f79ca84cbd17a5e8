//! Pipeline composition: connect one subprocess's stdout to another's stdin
//!
//! `source.pipe(command)` spawns a new process reading the source's stdout
//! and returns its control handle. Repeated calls on the same source fan
//! out: every destination observes the same byte sequence. Configuration
//! errors are rejected before anything is spawned, surfacing as an
//! already-settled handle.

use crate::command::{Command, StdinSource};
use crate::error::ConfigError;
use crate::output::Dispatch;
use crate::process::Subprocess;

impl Subprocess {
    /// Spawn `command` with its stdin connected to this subprocess's stdout.
    ///
    /// The returned handle is independent: awaiting or iterating it never
    /// affects this stage, and each stage's own failure is surfaced from
    /// that stage. Once both have settled, the destination's result or error
    /// carries `piped_from` referencing this stage's settled value, provided
    /// this stage settled first.
    ///
    /// A destination exiting before consuming all of its stdin is not a
    /// pipeline failure; leftover upstream output is drained and discarded.
    pub fn pipe(&self, command: Command) -> Subprocess {
        let line = command.display_line();
        if !matches!(command.stdin, StdinSource::Null) {
            return Subprocess::settled_config(
                line,
                ConfigError::new("stdin can only be set on the first command of a pipeline"),
            );
        }
        if self.ctx.stdout_overridden {
            return Subprocess::settled_config(
                line,
                ConfigError::new("stdout can only be redirected on the last command of a pipeline"),
            );
        }

        // Bounded so that slow destinations apply back-pressure to the source.
        let (tx, rx) = async_channel::bounded(32);
        {
            let mut dispatch = self.ctx.stdout.lock().unwrap();
            match &mut *dispatch {
                Dispatch::Buffer(buf) => {
                    let pending = std::mem::take(buf);
                    if !pending.is_empty() {
                        let _ = tx.try_send(pending.clone());
                    }
                    // The pipe buffer keeps accumulating for the source's own
                    // result and lets later fan-out destinations catch up.
                    *dispatch = Dispatch::Pipe {
                        txs: vec![tx],
                        buf: pending,
                    };
                }
                Dispatch::Pipe { txs, buf } => {
                    if !buf.is_empty() {
                        let _ = tx.try_send(buf.clone());
                    }
                    txs.push(tx);
                }
                Dispatch::Stream(_) => {
                    return Subprocess::settled_config(
                        line,
                        ConfigError::new(
                            "the source's stdout is already claimed for iteration",
                        ),
                    );
                }
                // Source already settled: the destination reads an
                // immediate EOF (`tx` is dropped here).
                Dispatch::Closed => {}
            }
        }

        let mut command = command;
        command.stdin = StdinSource::Chunks(rx);
        Subprocess::spawn_with_upstream(command, Some(self.driver.clone()))
    }
}
