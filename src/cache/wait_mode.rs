//! Wait Mode Module
//!
//! Caller-side policy for what to do when another caller is already
//! downloading the requested URL.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// == Wait Mode ==
/// How long a caller is willing to wait on someone else's download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Never wait. Return whatever is cached right now, which may be nothing
    /// at all if the URL has never been tried before.
    Never,
    /// Return the previous cached object or error immediately, but wait if
    /// the URL has not produced either yet.
    #[default]
    Initial,
    /// Always wait for the in-progress download and return its result.
    Latest,
}

impl WaitMode {
    // == Waits ==
    /// Whether a caller in this mode waits on a download, given whether the
    /// entry already holds an object or an error.
    pub fn waits(self, has_cached_state: bool) -> bool {
        match self {
            WaitMode::Never => false,
            WaitMode::Initial => !has_cached_state,
            WaitMode::Latest => true,
        }
    }

    // == As Str ==
    /// The lowercase name used in configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            WaitMode::Never => "never",
            WaitMode::Initial => "initial",
            WaitMode::Latest => "latest",
        }
    }
}

impl fmt::Display for WaitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(WaitMode::Never),
            "initial" => Ok(WaitMode::Initial),
            "latest" => Ok(WaitMode::Latest),
            other => Err(format!("unknown wait mode '{}'", other)),
        }
    }
}
