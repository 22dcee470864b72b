//! Ordered environment store.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use uuid::Uuid;

use super::expand::expand;
use super::hook::{ExecHook, Provision};
use crate::error::EnvError;

/// Raw environment definitions as received from the gateway.
///
/// Names take the form `<kind>:<KEY>` and values are base64 strings.
/// `BTreeMap` iteration order is the store order.
pub type RawEnv = BTreeMap<String, Value>;

/// Suffix of files materialized for `filesystem:` entries.
const ENVFS_SUFFIX: &str = "envfs";

/// How an entry's value reaches the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKind {
    /// The decoded value is exported as-is.
    Var,
    /// The decoded value is written to a file; the variable holds its path.
    Filesystem,
}

impl EnvKind {
    fn parse(name: &str) -> Result<(Self, &str), EnvError> {
        let Some((kind, key)) = name.split_once(':') else {
            return Ok((EnvKind::Var, name));
        };
        match kind {
            "envvar" => Ok((EnvKind::Var, key)),
            "filesystem" => Ok((EnvKind::Filesystem, key)),
            other => Err(EnvError::UnknownKind {
                name: name.to_string(),
                kind: other.to_string(),
            }),
        }
    }
}

/// One resolved environment entry.
#[derive(Clone)]
pub struct EnvVar {
    key: String,
    value: String,
    pre_exec: Option<Arc<dyn ExecHook>>,
    post_exec: Option<Arc<dyn ExecHook>>,
}

impl EnvVar {
    /// Creates a plain entry with no hooks.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            pre_exec: None,
            post_exec: None,
        }
    }

    /// Attaches a hook run before the process starts.
    pub fn with_pre_exec(mut self, hook: impl ExecHook + 'static) -> Self {
        self.pre_exec = Some(Arc::new(hook));
        self
    }

    /// Attaches a hook run after the process exits.
    pub fn with_post_exec(mut self, hook: impl ExecHook + 'static) -> Self {
        self.post_exec = Some(Arc::new(hook));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn has_pre_exec(&self) -> bool {
        self.pre_exec.is_some()
    }

    pub fn has_post_exec(&self) -> bool {
        self.post_exec.is_some()
    }
}

impl fmt::Debug for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values may be secrets.
        f.debug_struct("EnvVar")
            .field("key", &self.key)
            .field("pre_exec", &self.pre_exec.is_some())
            .field("post_exec", &self.post_exec.is_some())
            .finish_non_exhaustive()
    }
}

/// Ordered set of environment entries; order is hook invocation order.
#[derive(Debug, Clone, Default)]
pub struct EnvVarStore {
    entries: Vec<EnvVar>,
}

impl EnvVarStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from raw definitions.
    ///
    /// `filesystem:` entries are materialized under `envfs_dir` by their
    /// pre-exec hook and removed again by their post-exec hook.
    pub fn from_raw(raw: &RawEnv, envfs_dir: &Path) -> Result<Self, EnvError> {
        let mut store = Self::new();
        for (name, raw_value) in raw {
            let (kind, key) = EnvKind::parse(name)?;
            if key.is_empty() {
                return Err(EnvError::Malformed {
                    name: name.clone(),
                    reason: "empty variable name".to_string(),
                });
            }
            let decoded = decode_value(name, raw_value)?;

            let var = match kind {
                EnvKind::Var => {
                    let value = String::from_utf8(decoded).map_err(|_| EnvError::Malformed {
                        name: name.clone(),
                        reason: "value is not valid UTF-8".to_string(),
                    })?;
                    EnvVar::new(key, value)
                }
                EnvKind::Filesystem => {
                    let path = envfs_dir.join(format!("{}.{}", Uuid::new_v4(), ENVFS_SUFFIX));
                    EnvVar::new(key, path.to_string_lossy())
                        .with_pre_exec(Provision::WriteFile {
                            path: path.clone(),
                            contents: decoded,
                        })
                        .with_post_exec(Provision::RemoveFile { path })
                }
            };
            store.push(var)?;
        }
        Ok(store)
    }

    /// Appends an entry; keys must be unique.
    pub fn push(&mut self, var: EnvVar) -> Result<(), EnvError> {
        if self.get(&var.key).is_some() {
            return Err(EnvError::Duplicate(var.key));
        }
        self.entries.push(var);
        Ok(())
    }

    /// Looks up the resolved value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvVar> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key/value pairs in store order, ready to hand to a process builder.
    pub fn to_key_values(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    /// Substitutes `$KEY` / `${KEY}` references in `args` from this store.
    pub fn expand_args(&self, args: &[String]) -> Result<Vec<String>, EnvError> {
        args.iter()
            .map(|arg| expand(arg, |key| self.get(key)))
            .collect()
    }

    /// Runs pre-exec hooks in store order, stopping at the first failure.
    pub fn on_pre_exec(&self) -> Result<(), EnvError> {
        for entry in &self.entries {
            let Some(hook) = &entry.pre_exec else {
                continue;
            };
            hook.call().map_err(|source| EnvError::Hook {
                key: entry.key.clone(),
                source,
            })?;
            tracing::trace!(key = %entry.key, "pre-exec hook completed");
        }
        Ok(())
    }

    /// Runs every post-exec hook in store order.
    ///
    /// Failures are logged and never stop the remaining hooks. Returns the
    /// number of hooks that failed.
    pub fn on_post_exec(&self) -> usize {
        let mut failed = 0;
        for entry in &self.entries {
            let Some(hook) = &entry.post_exec else {
                continue;
            };
            if let Err(e) = hook.call() {
                failed += 1;
                let error = format!("{e:#}");
                tracing::warn!(
                    key = %entry.key,
                    error = %error,
                    "failed executing post execution command"
                );
            }
        }
        failed
    }
}

fn decode_value(name: &str, value: &Value) -> Result<Vec<u8>, EnvError> {
    let Value::String(encoded) = value else {
        return Err(EnvError::Malformed {
            name: name.to_string(),
            reason: "value must be a base64 string".to_string(),
        });
    };
    STANDARD.decode(encoded).map_err(|e| EnvError::Malformed {
        name: name.to_string(),
        reason: format!("invalid base64: {e}"),
    })
}
