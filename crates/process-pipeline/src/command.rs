//! Command type for building spawnable commands
//!
//! This is a builder for the program, its arguments, and the spawn options
//! recognized by this crate. Unlike `async_process::Command`, this type is
//! `Clone` and can be reused for multiple spawns; it is converted to the
//! native command at spawn time.

use async_process::Command as AsyncCommand;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::time::Duration;

use async_channel::{Receiver, Sender};

use crate::cancel::CancelToken;
use crate::process::Subprocess;

/// Where a subprocess's stdin comes from.
#[derive(Debug, Clone, Default)]
pub(crate) enum StdinSource {
    /// No stdin; the child sees an immediate EOF.
    #[default]
    Null,
    /// Inherit the parent's stdin.
    Inherit,
    /// A fixed byte payload, written then closed.
    Bytes(Vec<u8>),
    /// Lines received over a channel, each terminated with a newline.
    Lines(Receiver<String>),
    /// Raw chunks received over a channel; also used internally by pipelines.
    Chunks(Receiver<Vec<u8>>),
}

/// A command to be spawned as a [`Subprocess`].
#[derive(Debug, Clone)]
pub struct Command {
    /// The program to execute
    program: OsString,
    /// The arguments to pass to the program
    args: Vec<OsString>,
    /// Environment variables to set
    env: HashMap<OsString, OsString>,
    /// Working directory for the command
    current_dir: Option<PathBuf>,
    /// Whether to clear the environment before setting our vars
    env_clear: bool,
    pub(crate) stdin: StdinSource,
    pub(crate) stdout_sink: Option<Sender<Vec<u8>>>,
    pub(crate) stderr_sink: Option<Sender<Vec<u8>>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancelToken>,
}

impl Command {
    /// Create a new command for the given program
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            env: HashMap::new(),
            current_dir: None,
            env_clear: false,
            stdin: StdinSource::Null,
            stdout_sink: None,
            stderr_sink: None,
            timeout: None,
            cancel: None,
        }
    }

    /// Add an argument to the command
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Add multiple arguments to the command
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Set an environment variable
    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env
            .insert(key.as_ref().to_owned(), val.as_ref().to_owned());
        self
    }

    /// Set multiple environment variables
    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, val) in vars {
            self.env(key, val);
        }
        self
    }

    /// Clear all environment variables (except those explicitly set)
    pub fn env_clear(&mut self) -> &mut Self {
        self.env_clear = true;
        self
    }

    /// Set the working directory for the command
    pub fn current_dir<P: AsRef<std::path::Path>>(&mut self, dir: P) -> &mut Self {
        self.current_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Inherit the parent's stdin instead of the default closed stdin
    pub fn stdin_inherit(&mut self) -> &mut Self {
        self.stdin = StdinSource::Inherit;
        self
    }

    /// Feed a fixed byte payload to the child's stdin, then close it
    pub fn stdin_bytes(&mut self, data: impl Into<Vec<u8>>) -> &mut Self {
        self.stdin = StdinSource::Bytes(data.into());
        self
    }

    /// Feed stdin line by line from a channel; each line gets a trailing newline
    pub fn stdin_lines(&mut self, receiver: Receiver<String>) -> &mut Self {
        self.stdin = StdinSource::Lines(receiver);
        self
    }

    /// Feed stdin from a channel of raw byte chunks
    pub fn stdin_chunks(&mut self, receiver: Receiver<Vec<u8>>) -> &mut Self {
        self.stdin = StdinSource::Chunks(receiver);
        self
    }

    /// Forward stdout chunks to a channel as they arrive.
    ///
    /// A command with a stdout sink cannot be used as a pipeline source.
    pub fn stdout_sink(&mut self, sender: Sender<Vec<u8>>) -> &mut Self {
        self.stdout_sink = Some(sender);
        self
    }

    /// Forward stderr chunks to a channel as they arrive
    pub fn stderr_sink(&mut self, sender: Sender<Vec<u8>>) -> &mut Self {
        self.stderr_sink = Some(sender);
        self
    }

    /// Send SIGTERM if the process is still running after `timeout`
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token; firing it sends SIGTERM and settles the
    /// subprocess with the cancellation reason as the error cause
    pub fn cancel_token(&mut self, token: CancelToken) -> &mut Self {
        self.cancel = Some(token);
        self
    }

    /// Get the program name
    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    /// Get the arguments
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Get the environment variables
    pub fn get_envs(&self) -> &HashMap<OsString, OsString> {
        &self.env
    }

    /// Get the current directory
    pub fn get_current_dir(&self) -> Option<&std::path::Path> {
        self.current_dir.as_deref()
    }

    /// Render the program and arguments as a single display line
    pub fn display_line(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Prepare this command for execution by converting to an `async_process::Command`
    pub(crate) fn prepare(&self) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.program);
        cmd.args(&self.args);
        if self.env_clear {
            cmd.env_clear();
        }
        for (key, val) in &self.env {
            cmd.env(key, val);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Spawn this command, returning its control handle
    pub fn spawn(self) -> Subprocess {
        Subprocess::spawn(self)
    }

    /// Create a builder for this command (for chaining)
    pub fn builder<S: AsRef<OsStr>>(program: S) -> CommandBuilder {
        CommandBuilder(Command::new(program))
    }
}

/// Builder wrapper for more ergonomic command construction
pub struct CommandBuilder(Command);

impl CommandBuilder {
    /// Add an argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.0.arg(arg);
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.0.args(args);
        self
    }

    /// Set an environment variable
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.0.env(key, val);
        self
    }

    /// Set multiple environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.0.envs(vars);
        self
    }

    /// Clear all environment variables (except those explicitly set)
    pub fn env_clear(mut self) -> Self {
        self.0.env_clear();
        self
    }

    /// Set the working directory
    pub fn current_dir<P: AsRef<std::path::Path>>(mut self, dir: P) -> Self {
        self.0.current_dir(dir);
        self
    }

    /// Inherit the parent's stdin instead of the default closed stdin
    pub fn stdin_inherit(mut self) -> Self {
        self.0.stdin_inherit();
        self
    }

    /// Feed a fixed byte payload to stdin
    pub fn stdin_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.0.stdin_bytes(data);
        self
    }

    /// Feed stdin line by line from a channel
    pub fn stdin_lines(mut self, receiver: Receiver<String>) -> Self {
        self.0.stdin_lines(receiver);
        self
    }

    /// Feed stdin from a channel of raw byte chunks
    pub fn stdin_chunks(mut self, receiver: Receiver<Vec<u8>>) -> Self {
        self.0.stdin_chunks(receiver);
        self
    }

    /// Forward stdout chunks to a channel
    pub fn stdout_sink(mut self, sender: Sender<Vec<u8>>) -> Self {
        self.0.stdout_sink(sender);
        self
    }

    /// Forward stderr chunks to a channel
    pub fn stderr_sink(mut self, sender: Sender<Vec<u8>>) -> Self {
        self.0.stderr_sink(sender);
        self
    }

    /// Send SIGTERM if still running after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.0.timeout(timeout);
        self
    }

    /// Attach a cancellation token
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.0.cancel_token(token);
        self
    }

    /// Build the command
    pub fn build(self) -> Command {
        self.0
    }

    /// Build and spawn in one step
    pub fn spawn(self) -> Subprocess {
        self.0.spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_creation() {
        let cmd = Command::new("echo");
        assert_eq!(cmd.get_program(), "echo");
        assert_eq!(cmd.get_args().len(), 0);
    }

    #[test]
    fn test_command_with_args() {
        let mut cmd = Command::new("ls");
        cmd.arg("-la").arg("/tmp");

        assert_eq!(cmd.get_args().len(), 2);
        assert_eq!(cmd.get_args()[0], "-la");
        assert_eq!(cmd.get_args()[1], "/tmp");
    }

    #[test]
    fn test_command_builder() {
        let cmd = Command::builder("echo")
            .arg("hello")
            .arg("world")
            .env("TEST_VAR", "test_value")
            .current_dir("/tmp")
            .build();

        assert_eq!(cmd.get_program(), "echo");
        assert_eq!(cmd.get_args().len(), 2);
        assert_eq!(
            cmd.get_envs().get(OsStr::new("TEST_VAR")),
            Some(&OsString::from("test_value"))
        );
        assert_eq!(cmd.get_current_dir(), Some(std::path::Path::new("/tmp")));
    }

    #[test]
    fn test_builder_covers_every_option() {
        let (_line_tx, line_rx) = async_channel::unbounded::<String>();
        let (err_tx, _err_rx) = async_channel::unbounded::<Vec<u8>>();

        let cmd = Command::builder("env")
            .envs([("A", "1"), ("B", "2")])
            .env_clear()
            .stdin_lines(line_rx)
            .stderr_sink(err_tx)
            .build();

        assert!(cmd.env_clear);
        assert_eq!(cmd.get_envs().len(), 2);
        assert!(matches!(cmd.stdin, StdinSource::Lines(_)));
        assert!(cmd.stderr_sink.is_some());

        let (_chunk_tx, chunk_rx) = async_channel::unbounded::<Vec<u8>>();
        let chunked = Command::builder("cat").stdin_chunks(chunk_rx).build();
        assert!(matches!(chunked.stdin, StdinSource::Chunks(_)));

        let inherited = Command::builder("cat").stdin_inherit().build();
        assert!(matches!(inherited.stdin, StdinSource::Inherit));
    }

    #[test]
    fn test_display_line() {
        let cmd = Command::builder("echo").arg("hello").arg("world").build();
        assert_eq!(cmd.display_line(), "echo hello world");

        let bare = Command::new("true");
        assert_eq!(bare.display_line(), "true");
    }

    #[test]
    fn test_command_clone_keeps_options() {
        let cmd1 = Command::builder("test")
            .arg("arg1")
            .env("KEY", "VALUE")
            .timeout(Duration::from_secs(5))
            .build();

        let cmd2 = cmd1.clone();

        assert_eq!(cmd1.get_program(), cmd2.get_program());
        assert_eq!(cmd1.get_args(), cmd2.get_args());
        assert_eq!(cmd1.get_envs(), cmd2.get_envs());
        assert_eq!(cmd2.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_command_prepare() {
        let cmd = Command::builder("echo").arg("hello").arg("world").build();

        let _async_cmd = cmd.prepare();
        // We can't easily test the AsyncCommand internals, but we can ensure it's created
    }
}
