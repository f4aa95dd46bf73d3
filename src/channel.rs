//! Channel identifiers of the form `sim://<generator>(<arg>,<arg>,...)`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scheme prefix for simulated channels.
pub const SIM_SCHEME: &str = "sim://";

/// Generator serving the rotating `0..size` float64 array.
pub const SINEWAVE_SIMPLE: &str = "sinewavesimple";

/// Parsed channel descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelId {
    generator: String,
    args: Vec<f64>,
}

impl ChannelId {
    /// Create a channel for an arbitrary simulated generator.
    pub fn new(generator: impl Into<String>, args: Vec<f64>) -> Self {
        Self {
            generator: generator.into(),
            args,
        }
    }

    /// `sim://sinewavesimple(<size>,<update_interval>)`
    pub fn sinewave_simple(size: usize, update_interval: f64) -> Self {
        Self::new(SINEWAVE_SIMPLE, vec![size as f64, update_interval])
    }

    /// Generator name, e.g. `sinewavesimple`.
    pub fn generator(&self) -> &str {
        &self.generator
    }

    /// Numeric generator arguments in declaration order.
    pub fn args(&self) -> &[f64] {
        &self.args
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SIM_SCHEME}{}", self.generator)?;
        if self.args.is_empty() {
            return Ok(());
        }
        f.write_str("(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            // f64 Display prints 10 as "10" and 0.1 as "0.1"
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// Error returned when a channel string cannot be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid channel id '{input}': {reason}")]
pub struct ParseChannelError {
    input: String,
    reason: &'static str,
}

impl FromStr for ChannelId {
    type Err = ParseChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason| ParseChannelError {
            input: s.to_string(),
            reason,
        };

        let body = s.strip_prefix(SIM_SCHEME).ok_or_else(|| fail("missing sim:// scheme"))?;

        let Some((generator, rest)) = body.split_once('(') else {
            if body.is_empty() {
                return Err(fail("empty generator name"));
            }
            return Ok(Self::new(body, Vec::new()));
        };

        if generator.is_empty() {
            return Err(fail("empty generator name"));
        }
        let params = rest.strip_suffix(')').ok_or_else(|| fail("missing closing bracket"))?;
        let args = params
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| fail("non-numeric argument"))?;

        Ok(Self::new(generator, args))
    }
}
