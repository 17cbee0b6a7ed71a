//! Propagation and per-call run options

use crate::error::TxError;
use crate::isolation::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a call to `run` relates to transactions already open in its context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    /// Join the context's root transaction, or start one if there is none.
    /// Only the last participant to finish performs the real commit.
    #[default]
    Required,
    /// Always run in a separate physical transaction
    RequiresNew,
}

impl Propagation {
    /// Stable numeric code, as stored in configuration
    pub fn code(&self) -> u8 {
        match self {
            Propagation::Required => 0,
            Propagation::RequiresNew => 1,
        }
    }
}

impl TryFrom<u8> for Propagation {
    type Error = TxError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Propagation::Required),
            1 => Ok(Propagation::RequiresNew),
            other => Err(TxError::PropagationConfig(other.to_string())),
        }
    }
}

impl FromStr for Propagation {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "required" | "join" => Ok(Propagation::Required),
            "requires_new" | "new" | "isolated" => Ok(Propagation::RequiresNew),
            _ => Err(TxError::PropagationConfig(s.to_string())),
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Propagation::Required => f.write_str("required"),
            Propagation::RequiresNew => f.write_str("requires_new"),
        }
    }
}

/// Options for a single `run` call
///
/// `isolation_level` and `read_only` only take effect when the call opens a
/// new physical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOptions {
    pub propagation: Propagation,
    pub isolation_level: IsolationLevel,
    pub read_only: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the surrounding transaction
    pub fn required() -> Self {
        Self::default()
    }

    /// Run in a dedicated physical transaction
    pub fn requires_new() -> Self {
        Self {
            propagation: Propagation::RequiresNew,
            ..Default::default()
        }
    }

    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub(crate) fn begin_options(&self) -> crate::backends::BeginOptions {
        crate::backends::BeginOptions {
            isolation_level: self.isolation_level,
            read_only: self.read_only,
        }
    }
}
