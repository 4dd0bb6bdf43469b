//! Per-channel statistics, spectra and anomaly detection for a pair of captures.
//!
//! Every round compares the newest capture ("New File") against the one before it
//! ("Old File"). Only the first two rows of each matrix are analyzed.

use std::{collections::BTreeMap, fmt, sync::Arc};

use num_traits::AsPrimitive;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::{matrix::SampleMatrix, SAMPLES};

// A metric is anomalous when it moves by more than this many old standard deviations
pub const ANOMALY_SIGMAS: f64 = 2.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    #[serde(rename = "Channel 1")]
    One,
    #[serde(rename = "Channel 2")]
    Two,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::One, Channel::Two];

    /// Row of the sample matrix this channel lives in
    pub fn row(self) -> usize {
        match self {
            Channel::One => 0,
            Channel::Two => 1,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel {}", self.row() + 1)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    Mean,
    Median,
    #[serde(rename = "Std Dev")]
    StdDev,
    Variance,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Mean, Metric::Median, Metric::StdDev, Metric::Variance];
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::Mean => "Mean",
            Metric::Median => "Median",
            Metric::StdDev => "Std Dev",
            Metric::Variance => "Variance",
        })
    }
}

/// One value per analyzed channel
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PerChannel<T> {
    #[serde(rename = "Channel 1")]
    pub channel_1: T,
    #[serde(rename = "Channel 2")]
    pub channel_2: T,
}

impl<T> PerChannel<T> {
    pub fn from_fn(mut f: impl FnMut(Channel) -> T) -> Self {
        Self {
            channel_1: f(Channel::One),
            channel_2: f(Channel::Two),
        }
    }

    pub fn get(&self, channel: Channel) -> &T {
        match channel {
            Channel::One => &self.channel_1,
            Channel::Two => &self.channel_2,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, &T)> {
        Channel::ALL.into_iter().map(move |c| (c, self.get(c)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ChannelStats {
    #[serde(rename = "Mean")]
    pub mean: f64,
    #[serde(rename = "Median")]
    pub median: f64,
    #[serde(rename = "Std Dev")]
    pub std_dev: f64,
    #[serde(rename = "Variance")]
    pub variance: f64,
}

impl ChannelStats {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Mean => self.mean,
            Metric::Median => self.median,
            Metric::StdDev => self.std_dev,
            Metric::Variance => self.variance,
        }
    }
}

pub type FileStats = PerChannel<ChannelStats>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RoundStats {
    #[serde(rename = "New File")]
    pub new: FileStats,
    #[serde(rename = "Old File")]
    pub old: FileStats,
}

/// (old, new) value pairs keyed by metric
pub type Changes = BTreeMap<Metric, (f64, f64)>;
pub type StatDifference = PerChannel<Changes>;
pub type AnomalyReport = PerChannel<Changes>;

impl PerChannel<Changes> {
    pub fn is_empty(&self) -> bool {
        self.channel_1.is_empty() && self.channel_2.is_empty()
    }
}

/// Mean, median, population standard deviation and population variance.
/// An empty slice yields NaN everywhere.
pub fn channel_stats<T: AsPrimitive<f64>>(samples: &[T]) -> ChannelStats {
    let n = samples.len() as f64;
    let mean = samples.iter().map(|s| s.as_()).sum::<f64>() / n;
    let variance = samples
        .iter()
        .map(|s| {
            let d = s.as_() - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    ChannelStats {
        mean,
        median: median(samples),
        std_dev: variance.sqrt(),
        variance,
    }
}

fn median<T: AsPrimitive<f64>>(samples: &[T]) -> f64 {
    let mut sorted: Vec<f64> = samples.iter().map(|s| s.as_()).collect();
    sorted.sort_unstable_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    match sorted.len() {
        0 => f64::NAN,
        n if n % 2 == 0 => (sorted[mid - 1] + sorted[mid]) / 2.0,
        _ => sorted[mid],
    }
}

pub fn file_stats(matrix: &SampleMatrix) -> FileStats {
    PerChannel::from_fn(|c| channel_stats(matrix.channel(c.row())))
}

pub fn round_stats(new: &SampleMatrix, old: &SampleMatrix) -> RoundStats {
    RoundStats {
        new: file_stats(new),
        old: file_stats(old),
    }
}

/// Every metric whose new value isn't exactly equal to its old value.
/// There is deliberately no tolerance here, so real sensor data differs almost everywhere.
pub fn diff(stats: &RoundStats) -> StatDifference {
    PerChannel::from_fn(|c| {
        let (old, new) = (stats.old.get(c), stats.new.get(c));
        Metric::ALL
            .into_iter()
            .map(|m| (m, (old.get(m), new.get(m))))
            .filter(|(_, (o, n))| o != n)
            .collect()
    })
}

/// Flag metrics that moved by more than `ANOMALY_SIGMAS` old standard deviations.
/// With a zero old standard deviation any change at all is flagged.
pub fn detect_anomalies(stats: &RoundStats) -> AnomalyReport {
    PerChannel::from_fn(|c| {
        let (old, new) = (stats.old.get(c), stats.new.get(c));
        let threshold = ANOMALY_SIGMAS * old.std_dev;
        Metric::ALL
            .into_iter()
            .map(|m| (m, (old.get(m), new.get(m))))
            .filter(|(_, (o, n))| (n - o).abs() > threshold)
            .collect()
    })
}

/// Sample frequencies for an `n` point FFT with unit sample spacing.
/// Positive frequencies first, then the negative ones in increasing order.
pub fn fft_frequencies(n: usize) -> Vec<f64> {
    let split = (n + 1) / 2;
    (0..n)
        .map(|i| {
            let k = if i < split {
                i as f64
            } else {
                i as f64 - n as f64
            };
            k / n as f64
        })
        .collect()
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChannelSpectrum {
    pub frequencies: Vec<f64>,
    pub amplitudes: Vec<f64>,
}

impl ChannelSpectrum {
    /// Strongest non-DC bin as (frequency, amplitude)
    pub fn peak(&self) -> Option<(f64, f64)> {
        self.frequencies
            .iter()
            .zip(&self.amplitudes)
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(&f, &a)| (f, a))
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SpectrumPair {
    pub new: ChannelSpectrum,
    pub old: ChannelSpectrum,
}

pub type SpectrumResult = PerChannel<SpectrumPair>;

/// Amplitude spectra over a fixed number of samples, reusing one FFT plan
#[derive(Clone)]
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f64>>,
    frequencies: Vec<f64>,
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("len", &self.frequencies.len())
            .finish()
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::with_size(SAMPLES)
    }
}

impl SpectrumAnalyzer {
    pub fn with_size(len: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(len),
            frequencies: fft_frequencies(len),
        }
    }

    /// Magnitude of the complex FFT of a real sequence
    pub fn channel<T: AsPrimitive<f64>>(&self, samples: &[T]) -> ChannelSpectrum {
        assert_eq!(
            samples.len(),
            self.frequencies.len(),
            "Sample count must match the planned FFT size"
        );
        let mut buffer: Vec<Complex<f64>> = samples
            .iter()
            .map(|s| Complex::new(s.as_(), 0.0))
            .collect();
        self.fft.process(&mut buffer);
        ChannelSpectrum {
            frequencies: self.frequencies.clone(),
            amplitudes: buffer.iter().map(|c| c.norm()).collect(),
        }
    }

    /// Independent spectra of both channels of both captures
    pub fn spectrum(&self, new: &SampleMatrix, old: &SampleMatrix) -> SpectrumResult {
        PerChannel::from_fn(|c| SpectrumPair {
            new: self.channel(new.channel(c.row())),
            old: self.channel(old.channel(c.row())),
        })
    }
}

/// Everything computed for one round
#[derive(Debug, Clone)]
pub struct RoundAnalysis {
    pub stats: RoundStats,
    pub differences: StatDifference,
    pub spectrum: SpectrumResult,
    pub anomalies: AnomalyReport,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisEngine {
    spectra: SpectrumAnalyzer,
}

impl AnalysisEngine {
    pub fn analyze(&self, new: &SampleMatrix, old: &SampleMatrix) -> RoundAnalysis {
        let stats = round_stats(new, old);
        RoundAnalysis {
            differences: diff(&stats),
            spectrum: self.spectra.spectrum(new, old),
            anomalies: detect_anomalies(&stats),
            stats,
        }
    }
}
