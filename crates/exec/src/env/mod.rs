//! Environment definitions for a command.
//!
//! The gateway hands over a raw mapping of variable definitions; this module
//! resolves it into an ordered [`EnvVarStore`], attaches provisioning hooks to
//! entries that need materializing, and expands references in arguments.

pub mod expand;
pub mod hook;
pub mod store;

pub use expand::expand;
pub use hook::{ExecHook, Provision};
pub use store::{EnvKind, EnvVar, EnvVarStore, RawEnv};
