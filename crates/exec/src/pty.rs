//! Pseudo-terminal allocation and I/O.
//!
//! This module spawns a process attached to a fresh PTY and exposes the
//! pieces an interactive execution needs: the master handle (resize and
//! input), the child (wait), and an async reader over the PTY output.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use crate::error::ExecError;
use crate::resize::{ResizeTarget, TermSize};

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the blocking reader and the relay.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Async view of the PTY output.
pub type PtyOutput = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// What a caller needs to launch a process on a PTY.
#[derive(Debug, Clone)]
pub struct PtySpawn<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub env: &'a [(String, String)],
    pub cwd: &'a Path,
    pub search_path: Option<&'a str>,
    pub size: TermSize,
}

type PtyWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Master side of an allocated PTY.
///
/// The writer has its own lock so a blocked write never holds up a resize.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: PtyWriter,
}

/// A process running on a PTY, before its pieces are handed out.
pub struct PtyProcess {
    pub handle: PtyHandle,
    pub child: Box<dyn Child + Send + Sync>,
    pub reader: Box<dyn Read + Send>,
    pub pid: Option<u32>,
}

impl PtyProcess {
    /// Allocates a PTY and starts `req.program` on it.
    ///
    /// The executable is resolved first so a missing program is reported as
    /// [`ExecError::NotFound`] without allocating anything.
    pub fn spawn(req: &PtySpawn<'_>) -> Result<Self, ExecError> {
        let search_path = req
            .search_path
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"));
        which::which_in(req.program, search_path, req.cwd).map_err(|_| {
            ExecError::NotFound {
                program: req.program.to_string(),
            }
        })?;

        let pair = native_pty_system()
            .openpty(PtySize::from(req.size))
            .map_err(|e| ExecError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(req.program);
        cmd.args(req.args);
        cmd.cwd(req.cwd);
        cmd.env_clear();
        for (key, value) in req.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ExecError::Pty(e.to_string()))?;
        // The master only sees end-of-input once every slave descriptor is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let master = pair.master;
        let io = master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                if let Err(kill_err) = child.kill() {
                    tracing::warn!(
                        pid = ?pid,
                        error = %kill_err,
                        "failed to kill orphaned pty child"
                    );
                }
                return Err(ExecError::Pty(e.to_string()));
            }
        };

        Ok(Self {
            handle: PtyHandle {
                master,
                writer: Arc::new(Mutex::new(writer)),
            },
            child,
            reader,
            pid,
        })
    }
}

/// Shared slot holding a command's PTY.
///
/// The slot starts vacant, holds the handle while the process runs, and is
/// released exactly once by teardown. Dropping the handle closes the master.
#[derive(Default)]
pub struct TtySlot {
    state: Mutex<TtyState>,
}

#[derive(Default)]
enum TtyState {
    #[default]
    Vacant,
    Attached(PtyHandle),
    Released,
}

impl TtySlot {
    fn lock(&self) -> MutexGuard<'_, TtyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, handle: PtyHandle) {
        *self.lock() = TtyState::Attached(handle);
    }

    /// Closes the PTY. Returns `false` if it was not attached.
    pub fn release(&self) -> bool {
        let previous = std::mem::replace(&mut *self.lock(), TtyState::Released);
        matches!(previous, TtyState::Attached(_))
    }

    pub fn is_attached(&self) -> bool {
        matches!(*self.lock(), TtyState::Attached(_))
    }

    /// Writes `data` to the PTY input.
    ///
    /// A slot that never held a PTY accepts nothing and reports zero bytes.
    /// The write may block while the process is not draining its input; the
    /// slot itself stays unlocked meanwhile.
    pub fn write(&self, data: &[u8]) -> Result<usize, ExecError> {
        let writer = match &*self.lock() {
            TtyState::Vacant => return Ok(0),
            TtyState::Released => return Err(ExecError::TtyClosed),
            TtyState::Attached(handle) => Arc::clone(&handle.writer),
        };
        let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data).map_err(ExecError::TtyWrite)?;
        writer.flush().map_err(ExecError::TtyWrite)?;
        Ok(data.len())
    }
}

impl ResizeTarget for TtySlot {
    fn resize(&self, size: TermSize) -> Result<(), ExecError> {
        match &*self.lock() {
            TtyState::Attached(handle) => handle
                .master
                .resize(size.into())
                .map_err(|e| ExecError::Resize(e.to_string())),
            _ => Err(ExecError::TtyClosed),
        }
    }
}

/// Pumps the blocking PTY reader into an async stream.
///
/// Once the process exits Linux reports `EIO` on the master instead of a
/// zero-length read; both end the stream cleanly.
pub fn output_reader(mut reader: Box<dyn Read + Send>) -> PtyOutput {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(OUTPUT_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buffer[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_closed_pty(&e) => break,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
        tracing::trace!("pty reader finished");
    });

    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    StreamReader::new(chunks.boxed())
}

fn is_closed_pty(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
}
