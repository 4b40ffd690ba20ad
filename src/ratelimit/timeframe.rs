//! Window policy: the granularity a limit is expressed in.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::RatewallError;

/// Time window a request limit applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    /// Requests per second
    #[default]
    Rps,
    /// Requests per minute
    Rpm,
}

impl Timeframe {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::Rps => Duration::from_secs(1),
            Timeframe::Rpm => Duration::from_secs(60),
        }
    }

    /// The configuration name of this timeframe.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Rps => "RPS",
            Timeframe::Rpm => "RPM",
        }
    }
}

impl FromStr for Timeframe {
    type Err = RatewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RPS" => Ok(Timeframe::Rps),
            "RPM" => Ok(Timeframe::Rpm),
            other => Err(RatewallError::Config(format!(
                "unknown timeframe '{}', expected RPS or RPM",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = RatewallError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(timeframe: Timeframe) -> Self {
        timeframe.as_str().to_string()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
