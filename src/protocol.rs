//! Line-oriented wire format between the server and its single consumer.
//!
//! Each message is one line: a prefix (`Stats:`, `Differences:` or `Anomalies:`), a space,
//! and a JSON payload. A round publishes `Stats` and `Differences` back to back, followed by
//! `Anomalies` only if something was flagged.

use std::io::BufRead;

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    analysis::{AnomalyReport, RoundAnalysis, RoundStats, StatDifference},
    Error, Result,
};

pub const STATS_PREFIX: &str = "Stats:";
pub const DIFFERENCES_PREFIX: &str = "Differences:";
pub const ANOMALIES_PREFIX: &str = "Anomalies:";

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Stats(RoundStats),
    Differences(StatDifference),
    Anomalies(AnomalyReport),
}

impl Message {
    pub fn prefix(&self) -> &'static str {
        match self {
            Message::Stats(_) => STATS_PREFIX,
            Message::Differences(_) => DIFFERENCES_PREFIX,
            Message::Anomalies(_) => ANOMALIES_PREFIX,
        }
    }

    /// Render as a single newline-terminated line
    pub fn encode(&self) -> Result<String> {
        let payload = match self {
            Message::Stats(s) => serde_json::to_string(s)?,
            Message::Differences(d) => serde_json::to_string(d)?,
            Message::Anomalies(a) => serde_json::to_string(a)?,
        };
        Ok(format!("{} {}\n", self.prefix(), payload))
    }

    /// Parse one line. Blank lines are `Ok(None)`, unknown prefixes and bad payloads are errors.
    pub fn decode(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let msg = if let Some(payload) = line.strip_prefix(STATS_PREFIX) {
            Message::Stats(serde_json::from_str(payload.trim())?)
        } else if let Some(payload) = line.strip_prefix(DIFFERENCES_PREFIX) {
            Message::Differences(serde_json::from_str(payload.trim())?)
        } else if let Some(payload) = line.strip_prefix(ANOMALIES_PREFIX) {
            Message::Anomalies(serde_json::from_str(payload.trim())?)
        } else {
            return Err(Error::Protocol(format!("unknown line: {line}")));
        };
        Ok(Some(msg))
    }
}

/// The messages one round publishes, in order. The second element is only present
/// when anomalies were flagged.
pub fn round_messages(analysis: &RoundAnalysis) -> Result<(String, Option<String>)> {
    let report = Message::Stats(analysis.stats.clone()).encode()?
        + &Message::Differences(analysis.differences.clone()).encode()?;
    let anomalies = if analysis.anomalies.is_empty() {
        None
    } else {
        Some(Message::Anomalies(analysis.anomalies.clone()).encode()?)
    };
    Ok((report, anomalies))
}

/// What a consumer has reassembled from the wire
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    #[serde(rename = "Stats")]
    pub stats: Option<RoundStats>,
    #[serde(rename = "Differences")]
    pub differences: Option<StatDifference>,
    #[serde(rename = "Anomalies")]
    pub anomalies: Option<AnomalyReport>,
}

impl Telemetry {
    pub fn apply(&mut self, msg: Message) {
        match msg {
            Message::Stats(s) => self.stats = Some(s),
            Message::Differences(d) => self.differences = Some(d),
            Message::Anomalies(a) => self.anomalies = Some(a),
        }
    }

    /// Tolerant parse of a received buffer. Unknown lines are skipped, and a malformed
    /// payload clears the field it was meant for.
    pub fn from_lines(buf: &str) -> Self {
        let mut telemetry = Self::default();
        for line in buf.lines() {
            telemetry.ingest(line);
        }
        telemetry
    }

    /// Read lines until the server closes the connection
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut telemetry = Self::default();
        for line in reader.lines() {
            telemetry.ingest(&line?);
        }
        Ok(telemetry)
    }

    fn ingest(&mut self, line: &str) {
        match Message::decode(line) {
            Ok(Some(msg)) => self.apply(msg),
            Ok(None) => {}
            Err(e) => {
                let line = line.trim();
                if line.starts_with(STATS_PREFIX) {
                    self.stats = None;
                } else if line.starts_with(DIFFERENCES_PREFIX) {
                    self.differences = None;
                } else if line.starts_with(ANOMALIES_PREFIX) {
                    self.anomalies = None;
                } else {
                    info!("Skipping unrecognized line: {line}");
                    return;
                }
                warn!("Discarding malformed message: {e}");
            }
        }
    }

    /// Whether the last round flagged anything
    pub fn anomalies_present(&self) -> bool {
        self.anomalies.as_ref().map_or(false, |a| !a.is_empty())
    }
}
