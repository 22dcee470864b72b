//! # Gateway Exec Library
//!
//! This crate provides the execution core of the gateway: it launches a
//! subprocess on behalf of a remote peer, streams its I/O and reports a
//! single exit outcome.
//!
//! ## Overview
//!
//! - **Environment Store**: Decode raw variable definitions, run provisioning
//!   hooks around the process lifetime, expand `$KEY` references in arguments
//! - **Pipe Mode**: Run with piped standard streams and buffered input
//! - **Interactive Mode**: Run on a pseudo-terminal with per-session resize
//!   propagation
//! - **Exit Reporting**: One completion callback per run, with a fixed exit
//!   code table
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Command                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌───────────────┐   ┌───────────────┐   ┌───────────────┐  │
//! │  │  EnvVarStore  │   │  StreamRelay  │   │ ResizeBridge  │  │
//! │  │  (pre/post)   │   │ (out/err/tty) │   │  (tty only)   │  │
//! │  └───────────────┘   └───────────────┘   └───────────────┘  │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │        ExitReporter (callback fires exactly once)      │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exec::{Command, RawEnv};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut cmd = Command::new(&RawEnv::new(), vec!["echo".into(), "hello".into()])?;
//!
//!     let (tx, rx) = tokio::sync::oneshot::channel();
//!     cmd.run(tokio::io::stdout(), b"", move |code, msg| {
//!         let _ = tx.send((code, msg));
//!     })
//!     .await?;
//!
//!     let (code, _msg) = rx.await?;
//!     println!("exited with {code}");
//!     Ok(())
//! }
//! ```
//!
//! ## Exit codes
//!
//! | Situation | Code |
//! |-----------|------|
//! | Exited normally | the process status |
//! | Executable not found | [`NOT_FOUND_EXIT_CODE`] (127) |
//! | Gateway fault, or pipe-mode process without a status | [`INTERNAL_ERROR_EXIT_CODE`] (254) |
//! | Interactive process without a status | [`INTERRUPTED_EXIT_CODE`] (1) |
//!
//! ## Modules
//!
//! - [`command`]: Command construction and the two run modes
//! - [`env`]: Environment store, hooks, argument expansion
//! - [`relay`]: Byte relay from process output to the caller's sink
//! - [`resize`]: Per-session terminal resize propagation
//! - [`pty`]: Pseudo-terminal allocation and I/O
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing subscriber setup

pub mod command;
pub mod config;
pub mod env;
pub mod error;
pub mod logging;
pub mod pty;
pub mod relay;
pub mod resize;

// Re-export command types for convenience
pub use command::{Command, ExitOutcome, ExitReporter, INTERRUPTED_EXIT_CODE};

// Re-export config types for convenience
pub use config::ExecConfig;

// Re-export environment types for convenience
pub use env::{EnvKind, EnvVar, EnvVarStore, ExecHook, Provision, RawEnv};

// Re-export error types for convenience
pub use error::{EnvError, ExecError, INTERNAL_ERROR_EXIT_CODE, NOT_FOUND_EXIT_CODE};

// Re-export stream types for convenience
pub use relay::{RelayError, StreamRelay};
pub use resize::{
    ControllingTerminal, DimensionSource, FixedDimensions, ResizeBridge, ResizeEvent,
    ResizeNotifier, TermSize,
};
