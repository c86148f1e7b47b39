//! Controller settings block.
//!
//! Controllers exchange their runtime settings as `key=value` lines separated by
//! CR and/or LF:
//!
//! ```text
//! maxchan=8
//! AdFrequency=1000
//! ipaddr_0=10.0.0.1
//! ipaddr_1=10.0.0.2
//! ```
//!
//! Keys are case-insensitive. Every `ipaddr_*` key appends to the address list in
//! the order it appears. Unknown keys are ignored.

use crate::error::{StationError, StationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const IPADDR_PREFIX: &str = "ipaddr_";

/// Parsed controller settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Channel count (`maxchan`).
    pub max_channels: Option<u32>,
    /// Transaction-timer period in ms (`transtimer`).
    pub transaction_timer_ms: Option<u32>,
    /// Control-timer period in ms (`ctrltimer`).
    pub control_timer_ms: Option<u32>,
    /// Log frequency in Hz (`logfrequency`).
    pub log_frequency: Option<f64>,
    /// AD sampling frequency in Hz (`adfrequency`).
    pub ad_frequency: Option<f64>,
    /// Controller addresses (`ipaddr_N`), in order of appearance.
    pub ip_addrs: Vec<String>,
}

fn parse_number<T: FromStr>(key: &str, value: &str, line: usize) -> StationResult<T> {
    value.parse().map_err(|_| {
        StationError::Configuration(format!(
            "settings line {line}: '{key}' expects a number, got '{value}'"
        ))
    })
}

impl ControllerSettings {
    /// Parses a settings block.
    pub fn parse(text: &str) -> StationResult<Self> {
        let mut settings = Self::default();
        for (index, raw) in text.split(['\r', '\n']).enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                StationError::Configuration(format!(
                    "settings line {}: expected key=value, got '{line}'",
                    index + 1
                ))
            })?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            let line_no = index + 1;

            match key.as_str() {
                "maxchan" => settings.max_channels = Some(parse_number(&key, value, line_no)?),
                "transtimer" => {
                    settings.transaction_timer_ms = Some(parse_number(&key, value, line_no)?)
                }
                "ctrltimer" => settings.control_timer_ms = Some(parse_number(&key, value, line_no)?),
                "logfrequency" => settings.log_frequency = Some(parse_number(&key, value, line_no)?),
                "adfrequency" => settings.ad_frequency = Some(parse_number(&key, value, line_no)?),
                k if k.starts_with(IPADDR_PREFIX) => settings.ip_addrs.push(value.to_string()),
                _ => {}
            }
        }
        Ok(settings)
    }

    /// Serializes to `key=value` lines joined with CRLF.
    pub fn to_text(&self) -> String {
        let mut lines = Vec::new();
        if let Some(v) = self.max_channels {
            lines.push(format!("maxchan={v}"));
        }
        if let Some(v) = self.transaction_timer_ms {
            lines.push(format!("TransTimer={v}"));
        }
        if let Some(v) = self.control_timer_ms {
            lines.push(format!("CtrlTimer={v}"));
        }
        if let Some(v) = self.log_frequency {
            lines.push(format!("LogFrequency={v}"));
        }
        if let Some(v) = self.ad_frequency {
            lines.push(format!("AdFrequency={v}"));
        }
        for (i, addr) in self.ip_addrs.iter().enumerate() {
            lines.push(format!("ipaddr_{i}={addr}"));
        }
        lines.join("\r\n")
    }
}

impl FromStr for ControllerSettings {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ControllerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}
