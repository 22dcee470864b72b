//! Provisioning hooks attached to environment entries.
//!
//! A hook is a single fallible operation run either right before the process
//! starts (materialize a credential) or after it exits (clean it up). The
//! built-in provisioners cover the file-backed variables the gateway ships
//! with; secret back-ends plug in by implementing [`ExecHook`].

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

/// A side effect tied to one environment entry.
pub trait ExecHook: Send + Sync {
    /// Runs the hook.
    fn call(&self) -> Result<()>;
}

impl<F> ExecHook for F
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn call(&self) -> Result<()> {
        self()
    }
}

/// Built-in provisioners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provision {
    /// Write `contents` to `path`, readable by the owner only.
    WriteFile {
        /// Destination file.
        path: PathBuf,
        /// Decoded secret material.
        contents: Vec<u8>,
    },
    /// Remove `path`; a file that is already gone is not an error.
    RemoveFile {
        /// File to remove.
        path: PathBuf,
    },
}

impl ExecHook for Provision {
    fn call(&self) -> Result<()> {
        match self {
            Provision::WriteFile { path, contents } => {
                let mut file = owner_only()
                    .open(path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                file.write_all(contents)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                Ok(())
            }
            Provision::RemoveFile { path } => match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
            },
        }
    }
}

#[cfg(unix)]
fn owner_only() -> fs::OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o600);
    options
}

#[cfg(not(unix))]
fn owner_only() -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    options
}
