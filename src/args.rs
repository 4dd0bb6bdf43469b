//! Argument parsing for running from the command line

use std::{path::PathBuf, time::Duration};

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Port to publish round results on (all interfaces)
    #[clap(short, long, default_value_t = 12345)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,
    /// Directory the capture program writes its artifacts into (wiped on start and exit)
    #[clap(short = 'd', long, default_value = "./tests_iot")]
    pub capture_dir: PathBuf,
    /// Capture program to run every round
    #[clap(long, default_value = "./shm_project")]
    pub program: PathBuf,
    /// FPGA binary image handed to the capture program
    #[clap(short = 'x', long, default_value = "shm.xclbin")]
    pub xclbin: String,
    /// Test profile handed to the capture program
    #[clap(short, long, default_value = "simple")]
    pub test: String,
    /// Batches per capture
    #[clap(short, long, default_value_t = 1)]
    pub batches: u32,
    /// Channel count handed to the capture program
    #[clap(short = 'C', long, default_value_t = 1)]
    pub channels: u32,
    /// Seconds to pause between rounds
    #[clap(short, long, default_value_t = 10)]
    pub interval: u64,
    /// Seconds to let the capture program run before killing it
    #[clap(long, default_value_t = 60)]
    pub capture_timeout: u64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

impl Args {
    /// Arguments for the capture program, in the order it expects them
    pub fn capture_args(&self) -> Vec<String> {
        vec![
            "-x".to_owned(),
            self.xclbin.clone(),
            "-t".to_owned(),
            self.test.clone(),
            "-b".to_owned(),
            self.batches.to_string(),
            "-P".to_owned(),
            self.capture_dir.display().to_string(),
            "-C".to_owned(),
            self.channels.to_string(),
        ]
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout)
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}
