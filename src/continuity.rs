//! Round-over-round consistency.
//!
//! The capture the previous round called "new" should be the one this round calls "old",
//! so their statistics must match exactly. A mismatch means rotation picked the wrong file.

use std::fmt;

use crate::analysis::{Channel, FileStats, Metric, RoundStats};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContinuityMismatch {
    pub channel: Channel,
    pub metric: Metric,
    pub previous_new: f64,
    pub current_old: f64,
}

impl fmt::Display for ContinuityMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {}: {} != {}",
            self.metric, self.channel, self.current_old, self.previous_new
        )
    }
}

#[derive(Debug, Default, Clone)]
pub struct ContinuityChecker {
    previous_new: Option<FileStats>,
}

impl ContinuityChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous(&self) -> Option<&FileStats> {
        self.previous_new.as_ref()
    }

    /// Compare this round's old stats against last round's new stats, then remember
    /// this round's new stats for next time. The first round never mismatches.
    pub fn check(&mut self, stats: &RoundStats) -> Vec<ContinuityMismatch> {
        let mismatches = match &self.previous_new {
            Some(previous) => previous
                .iter()
                .flat_map(|(channel, prev)| {
                    let old = stats.old.get(channel);
                    Metric::ALL.into_iter().filter_map(move |metric| {
                        let (previous_new, current_old) = (prev.get(metric), old.get(metric));
                        (previous_new != current_old).then_some(ContinuityMismatch {
                            channel,
                            metric,
                            previous_new,
                            current_old,
                        })
                    })
                })
                .collect(),
            None => Vec::new(),
        };
        self.previous_new = Some(stats.new.clone());
        mismatches
    }
}
