//! Command execution.
//!
//! A [`Command`] is built from raw environment definitions and an argument
//! vector, then run exactly once, either with piped standard streams
//! ([`Command::run`]) or attached to a pseudo-terminal
//! ([`Command::run_on_tty`]). Both modes return once the process is started
//! and wired; a background task waits for it, runs the post-exec hooks and
//! reports the outcome through the completion callback.
//!
//! Every failure before the process starts is returned to the caller *and*
//! reported through the callback, so the callback fires exactly once per run
//! call on every path.

mod outcome;

pub use outcome::{ExitOutcome, ExitReporter, INTERRUPTED_EXIT_CODE};

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdin;

use crate::config::ExecConfig;
use crate::env::{EnvVarStore, RawEnv};
use crate::error::{ExecError, INTERNAL_ERROR_EXIT_CODE};
use crate::pty::{output_reader, PtyProcess, PtySpawn, TtySlot};
use crate::relay::{self, shared_sink, StreamRelay};
use crate::resize::{
    ControllingTerminal, DimensionSource, ResizeBridge, ResizeNotifier, ResizeTarget,
};

/// One single-use execution.
pub struct Command {
    program: String,
    args: Vec<String>,
    store: Arc<EnvVarStore>,
    env: Vec<(String, String)>,
    config: ExecConfig,
    cwd: PathBuf,
    pid: Option<u32>,
    started: bool,
    tty: Arc<TtySlot>,
    resize: Option<ResizeNotifier>,
    dimensions: Arc<dyn DimensionSource>,
}

impl Command {
    /// Builds a command with the default configuration.
    pub fn new(raw: &RawEnv, args: Vec<String>) -> Result<Self, ExecError> {
        Self::with_config(ExecConfig::default(), raw, args)
    }

    /// Builds a command, decoding `raw` into its environment store.
    pub fn with_config(
        config: ExecConfig,
        raw: &RawEnv,
        args: Vec<String>,
    ) -> Result<Self, ExecError> {
        if args.is_empty() {
            return Err(ExecError::EmptyArgs);
        }
        config.validate()?;
        let store = EnvVarStore::from_raw(raw, &config.envfs.dir)?;
        Self::build(config, store, args)
    }

    /// Builds a command around an already populated store.
    ///
    /// `$KEY` references in the arguments after the executable are
    /// substituted from the store; the executable is used as given. The
    /// child sees the store entries followed by `PATH`; nothing else is
    /// inherited.
    pub fn from_store(
        config: ExecConfig,
        store: EnvVarStore,
        args: Vec<String>,
    ) -> Result<Self, ExecError> {
        config.validate()?;
        Self::build(config, store, args)
    }

    fn build(
        config: ExecConfig,
        store: EnvVarStore,
        args: Vec<String>,
    ) -> Result<Self, ExecError> {
        let mut args = args.into_iter();
        let program = args.next().ok_or(ExecError::EmptyArgs)?;
        let rest: Vec<String> = args.collect();
        let args = store.expand_args(&rest)?;

        let mut env = store.to_key_values();
        if store.get("PATH").is_none() {
            if let Some(path) = config.child_path() {
                env.push(("PATH".to_string(), path));
            }
        }

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

        Ok(Self {
            program,
            args,
            store: Arc::new(store),
            env,
            config,
            cwd,
            pid: None,
            started: false,
            tty: Arc::new(TtySlot::default()),
            resize: None,
            dimensions: Arc::new(ControllingTerminal),
        })
    }

    /// Sets the working directory of the process.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Sets where interactive sessions read their terminal size from.
    pub fn with_dimension_source(mut self, source: Arc<dyn DimensionSource>) -> Self {
        self.dimensions = source;
        self
    }

    /// The executable, as given.
    pub fn main_cmd(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Process id, once a run operation has started the process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The child environment as `KEY=VALUE` strings.
    pub fn environ(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Resize handle of the interactive session, once it is running.
    pub fn resize_notifier(&self) -> Option<ResizeNotifier> {
        self.resize.clone()
    }

    fn begin(&mut self) -> Result<(), ExecError> {
        if self.started {
            return Err(ExecError::AlreadyStarted);
        }
        self.started = true;
        Ok(())
    }

    fn search_path(&self) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.as_str())
    }

    /// Runs the command with piped standard streams.
    ///
    /// `stdin` is fed to the process on a background task and its input is
    /// then closed; this call does not wait for the process to consume it. A
    /// write fault other than a broken pipe is reported through the callback
    /// with the internal-error sentinel.
    /// Standard output and standard error are both relayed into `sink`; the
    /// two channels are not ordered relative to each other. The callback may
    /// fire before the relays have delivered their final bytes.
    pub async fn run<W, F>(
        &mut self,
        sink: W,
        stdin: &[u8],
        on_exec_end: F,
    ) -> Result<(), ExecError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        F: FnOnce(i32, String) + Send + 'static,
    {
        let reporter = ExitReporter::new(on_exec_end);
        if let Err(e) = self.begin() {
            return Err(fail(reporter, e));
        }

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Err(e) = self.store.on_pre_exec() {
            tracing::warn!(command = %self.program, error = %e, "pre-exec hook failed");
            return Err(fail(reporter, ExecError::PreExec(e)));
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.store.on_post_exec();
                return Err(fail(reporter, ExecError::spawn(&self.program, e)));
            }
        };
        self.pid = child.id();
        tracing::info!(pid = ?self.pid, command = %self.program, "command started");

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(input), Some(stdout), Some(stderr)) = pipes else {
            if let Err(e) = child.start_kill() {
                tracing::warn!(pid = ?self.pid, error = %e, "failed to kill command");
            }
            let _ = child.wait().await;
            self.store.on_post_exec();
            return Err(fail(reporter, ExecError::Pipe("stdio")));
        };

        let sink = shared_sink(sink);
        let buffer_size = self.config.exec.relay_buffer_size;
        StreamRelay::new("stdout", stdout)
            .with_buffer_size(buffer_size)
            .spawn(Arc::clone(&sink), self.pid);
        StreamRelay::new("stderr", stderr)
            .with_buffer_size(buffer_size)
            .spawn(sink, self.pid);

        let pid = self.pid;
        let feed = tokio::spawn(feed_input(input, Bytes::copy_from_slice(stdin), pid));

        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let waited = child.wait().await;
            let outcome = match feed.await {
                Ok(Err(e)) => ExitOutcome::new(
                    INTERNAL_ERROR_EXIT_CODE,
                    format!("failed executing command, err={}", ExecError::Stdin(e)),
                ),
                Err(e) => ExitOutcome::new(
                    INTERNAL_ERROR_EXIT_CODE,
                    format!("failed executing command, err=input task failed: {e}"),
                ),
                Ok(Ok(())) => ExitOutcome::from_pipe_wait(waited),
            };
            tracing::info!(pid = ?pid, exit_code = outcome.exit_code, "command exited");
            store.on_post_exec();
            reporter.report_outcome(outcome);
        });

        Ok(())
    }

    /// Runs the command attached to a fresh pseudo-terminal.
    ///
    /// Output is relayed into `sink`; input goes through [`Command::write_tty`].
    /// Must be called from within a Tokio runtime.
    pub fn run_on_tty<W, F>(&mut self, sink: W, on_exec_end: F) -> Result<(), ExecError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        F: FnOnce(i32, String) + Send + 'static,
    {
        let reporter = ExitReporter::new(on_exec_end);
        if let Err(e) = self.begin() {
            return Err(fail(reporter, e));
        }

        if let Err(e) = self.store.on_pre_exec() {
            tracing::warn!(command = %self.program, error = %e, "pre-exec hook failed");
            return Err(fail(reporter, ExecError::PreExec(e)));
        }

        let size = self.dimensions.dimensions().unwrap_or_default();
        let spawned = PtyProcess::spawn(&PtySpawn {
            program: &self.program,
            args: &self.args,
            env: &self.env,
            cwd: &self.cwd,
            search_path: self.search_path(),
            size,
        });
        let PtyProcess {
            handle,
            mut child,
            reader,
            pid,
        } = match spawned {
            Ok(process) => process,
            Err(e) => {
                self.store.on_post_exec();
                return Err(fail(reporter, e));
            }
        };
        self.pid = pid;
        self.tty.attach(handle);
        tracing::info!(pid = ?pid, command = %self.program, "command started on tty");

        let target: Arc<dyn ResizeTarget> = self.tty.clone();
        let bridge = ResizeBridge::subscribe(
            target,
            Arc::clone(&self.dimensions),
            self.config.exec.forward_sigwinch,
        );
        self.resize = Some(bridge.notifier());

        let relay = StreamRelay::new("tty", output_reader(reader))
            .with_buffer_size(self.config.exec.relay_buffer_size);
        let tty = Arc::clone(&self.tty);
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let sink = shared_sink(sink);
            let relayed = relay.run(&sink).await;
            drop(sink);
            relay::log_outcome("tty", pid, &relayed);

            let outcome = match tokio::task::spawn_blocking(move || child.wait()).await {
                Ok(waited) => ExitOutcome::from_tty_wait(waited),
                Err(e) => ExitOutcome::from_tty_wait(Err(e)),
            };
            tracing::info!(pid = ?pid, exit_code = outcome.exit_code, "command exited");

            tty.release();
            bridge.stop().await;
            store.on_post_exec();
            reporter.report_outcome(outcome);
        });

        Ok(())
    }

    /// Writes `data` to the pseudo-terminal input.
    ///
    /// Returns `Ok(0)` when no pseudo-terminal was ever allocated and
    /// [`ExecError::TtyClosed`] once the session has been torn down.
    pub fn write_tty(&self, data: &[u8]) -> Result<usize, ExecError> {
        self.tty.write(data)
    }
}

/// Writes `data` to the process input, then closes it.
///
/// A broken pipe means the process exited without reading its input and is
/// not a fault.
async fn feed_input(mut input: ChildStdin, data: Bytes, pid: Option<u32>) -> io::Result<()> {
    let written = input.write_all(&data).await;
    drop(input);
    match written {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!(pid = ?pid, "command exited without reading its input");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(pid = ?pid, error = %e, "failed writing command input");
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}

/// Reports a pre-start failure through the callback and hands the error back.
fn fail(reporter: ExitReporter, err: ExecError) -> ExecError {
    reporter.report(err.exit_code(), format!("failed starting command: {err}"));
    err
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("pid", &self.pid)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvVar;
    use crate::config::ConfigError;
    use crate::error::EnvError;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::Value;
    use std::sync::Mutex;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn raw(entries: &[(&str, &str)]) -> RawEnv {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(STANDARD.encode(v))))
            .collect()
    }

    fn config_with_path(path: &str) -> ExecConfig {
        let mut config = ExecConfig::default();
        config.exec.path = Some(path.to_string());
        config
    }

    #[test]
    fn test_empty_args_rejected() {
        let err = Command::new(&RawEnv::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, ExecError::EmptyArgs));
    }

    #[test]
    fn test_malformed_env_rejected() {
        let mut env = RawEnv::new();
        env.insert("envvar:TOKEN".to_string(), Value::Bool(true));
        let err = Command::new(&env, args(&["true"])).unwrap_err();
        assert!(matches!(err, ExecError::Env(EnvError::Malformed { .. })));
    }

    #[test]
    fn test_args_are_expanded() {
        let env = raw(&[("envvar:GREETING", "hello"), ("TARGET", "world")]);
        let cmd = Command::new(&env, args(&["echo", "$GREETING", "${TARGET}!"])).unwrap();

        assert_eq!(cmd.main_cmd(), "echo");
        assert_eq!(cmd.args(), &["hello".to_string(), "world!".to_string()]);
        assert_eq!(cmd.to_string(), "echo hello world!");
    }

    #[test]
    fn test_program_is_not_expanded() {
        let env = raw(&[("envvar:T", "echo")]);
        let cmd = Command::new(&env, args(&["$T", "$T"])).unwrap();
        assert_eq!(cmd.main_cmd(), "$T");
        assert_eq!(cmd.args(), &["echo".to_string()]);

        let cmd = Command::new(&RawEnv::new(), args(&["/opt/$TOOL/bin/run", "x"])).unwrap();
        assert_eq!(cmd.main_cmd(), "/opt/$TOOL/bin/run");
        assert_eq!(cmd.to_string(), "/opt/$TOOL/bin/run x");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ExecConfig::default();
        config.exec.relay_buffer_size = 0;
        let err = Command::with_config(config, &RawEnv::new(), args(&["true"])).unwrap_err();
        assert!(matches!(
            err,
            ExecError::Config(ConfigError::InvalidRelayBufferSize(0))
        ));

        let mut config = ExecConfig::default();
        config.envfs.dir = PathBuf::from("relative/envfs");
        let err = Command::from_store(config, EnvVarStore::new(), args(&["true"])).unwrap_err();
        assert!(matches!(err, ExecError::Config(ConfigError::InvalidEnvfsDir(_))));
    }

    #[test]
    fn test_undefined_reference_rejected() {
        let err = Command::new(&RawEnv::new(), args(&["echo", "$MISSING"])).unwrap_err();
        assert!(matches!(err, ExecError::Env(EnvError::Expansion(name)) if name == "MISSING"));
    }

    #[test]
    fn test_environ_appends_path_last() {
        let env = raw(&[("envvar:B", "2"), ("envvar:A", "1")]);
        let cmd = Command::with_config(config_with_path("/opt/bin"), &env, args(&["true"]))
            .unwrap();

        assert_eq!(cmd.environ(), vec!["A=1", "B=2", "PATH=/opt/bin"]);
    }

    #[test]
    fn test_store_path_is_not_overridden() {
        let env = raw(&[("envvar:PATH", "/custom")]);
        let cmd = Command::with_config(config_with_path("/opt/bin"), &env, args(&["true"]))
            .unwrap();

        assert_eq!(cmd.environ(), vec!["PATH=/custom"]);
    }

    #[test]
    fn test_fresh_command_state() {
        let cmd = Command::new(&RawEnv::new(), args(&["cat"])).unwrap();

        assert_eq!(cmd.pid(), None);
        assert!(cmd.resize_notifier().is_none());
        assert_eq!(cmd.write_tty(b"ignored").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_runs_in_configured_cwd() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut cmd = Command::new(&RawEnv::new(), args(&["pwd"]))
            .unwrap()
            .with_cwd(temp_dir.path());
        assert_eq!(cmd.cwd(), temp_dir.path());

        let (writer, mut reader) = tokio::io::duplex(4096);
        let (tx, rx) = tokio::sync::oneshot::channel();
        cmd.run(writer, b"", move |code, _| {
            let _ = tx.send(code);
        })
        .await
        .unwrap();

        let mut output = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut output)
            .await
            .unwrap();
        let expected = temp_dir.path().canonicalize().unwrap();
        assert_eq!(output.trim_end(), expected.to_string_lossy());
        assert_eq!(rx.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let mut cmd = Command::new(&RawEnv::new(), args(&["true"])).unwrap();
        cmd.run(tokio::io::sink(), b"", |_, _| {}).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let err = cmd
            .run(tokio::io::sink(), b"", move |code, _| record.lock().unwrap().push(code))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::AlreadyStarted));
        assert_eq!(*seen.lock().unwrap(), vec![INTERNAL_ERROR_EXIT_CODE]);
    }

    #[tokio::test]
    async fn test_pre_exec_failure_skips_spawn_and_post_exec() {
        let post_exec_calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&post_exec_calls);

        let mut store = EnvVarStore::new();
        store
            .push(
                EnvVar::new("TOKEN", "x")
                    .with_pre_exec(|| -> anyhow::Result<()> { anyhow::bail!("vault sealed") })
                    .with_post_exec(move || -> anyhow::Result<()> {
                        *counter.lock().unwrap() += 1;
                        Ok(())
                    }),
            )
            .unwrap();
        let mut cmd = Command::from_store(ExecConfig::default(), store, args(&["true"])).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let err = cmd
            .run_on_tty(tokio::io::sink(), move |code, msg| {
                record.lock().unwrap().push((code, msg))
            })
            .unwrap_err();

        assert!(matches!(err, ExecError::PreExec(_)));
        assert_eq!(cmd.pid(), None);
        assert_eq!(*post_exec_calls.lock().unwrap(), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, INTERNAL_ERROR_EXIT_CODE);
        assert!(seen[0].1.contains("vault sealed"));
    }
}
