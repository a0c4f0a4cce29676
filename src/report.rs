// Benchmark Report - console summary and JSON rendering

use chrono::{DateTime, Utc};
use colored::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::BenchConfig;
use crate::statistics::StatisticsAccumulator;

const MIB: f64 = 1024.0 * 1024.0;

/// Aggregate results of one run, reported in microseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: u64,
    /// None until at least one sample was taken
    pub min_us: Option<f64>,
    pub max_us: Option<f64>,
    pub mean_us: Option<f64>,
    /// None (JSON null) when fewer than two samples were taken
    pub stddev_us: Option<f64>,
    pub cv_percent: Option<f64>,
    /// size x inner loops x iterations
    pub total_bytes: u64,
    pub total_time_ns: u64,
    pub throughput_mib_s: Option<f64>,
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

impl Summary {
    pub fn from_accumulator(
        stats: &StatisticsAccumulator,
        total_bytes: u64,
        total_time: Duration,
    ) -> Self {
        let us = |ns: Option<f64>| ns.map(|v| v / 1000.0);
        let seconds = total_time.as_secs_f64();
        Self {
            count: stats.count(),
            min_us: us(stats.min()),
            max_us: us(stats.max()),
            mean_us: us(stats.mean()),
            stddev_us: finite(stats.stddev() / 1000.0),
            cv_percent: finite(stats.coefficient_of_variation()),
            total_bytes,
            total_time_ns: total_time.as_nanos() as u64,
            throughput_mib_s: (seconds > 0.0).then(|| total_bytes as f64 / seconds / MIB),
        }
    }

    /// `Done. min=…μs max=…μs mean=…μs stddev=…μs (cv …%) (… MiB/s)`
    pub fn done_line(&self) -> String {
        let mut line = format!(
            "Done. min={}μs max={}μs mean={}μs stddev={}μs",
            format_g(self.min_us.unwrap_or(f64::NAN)),
            format_g(self.max_us.unwrap_or(f64::NAN)),
            format_g(self.mean_us.unwrap_or(f64::NAN)),
            format_g(self.stddev_us.unwrap_or(f64::NAN)),
        );
        if let Some(cv) = self.cv_percent {
            line.push_str(&format!(" (cv {}%)", format_g(cv)));
        }
        if let Some(mib) = self.throughput_mib_s {
            line.push_str(&format!(" ({} MiB/s)", format_g(mib)));
        }
        line
    }
}

/// `Starting test: <MODE>, <en|de>crypt, keysize=<K> bits, size=<S> bytes, loops=<N>`
pub fn start_line(config: &BenchConfig) -> String {
    format!(
        "Starting test: {}, size={} bytes, loops={}",
        config.cipher_config(),
        config.buffer_size,
        config.outer_iterations
    )
}

/// Six significant digits with trailing zeros removed, like printf's %g
pub fn format_g(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    fn trim(s: &str) -> &str {
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.')
        } else {
            s
        }
    }

    // exponent of the value after rounding to six significant digits
    let sci = format!("{:.5e}", value);
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or(0);

    if !(-4..6).contains(&exp) {
        format!(
            "{}e{}{:02}",
            trim(mantissa),
            if exp < 0 { '-' } else { '+' },
            exp.abs()
        )
    } else {
        let decimals = (5 - exp) as usize;
        trim(&format!("{:.*}", decimals, value)).to_string()
    }
}

/// Full record of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub timestamp: DateTime<Utc>,
    pub transport: String,
    /// Key and IV overrides are replaced by a marker
    pub config: BenchConfig,
    pub clock_resolution_ns: Option<u64>,
    pub summary: Summary,
}

impl BenchmarkReport {
    pub fn new(
        transport: &str,
        config: &BenchConfig,
        clock_resolution: Option<Duration>,
        summary: Summary,
    ) -> Self {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<configured>".to_string());
        let config = BenchConfig {
            key_hex: redact(&config.key_hex),
            iv_hex: redact(&config.iv_hex),
            ..config.clone()
        };
        Self {
            timestamp: Utc::now(),
            transport: transport.to_string(),
            config,
            clock_resolution_ns: clock_resolution.map(|d| d.as_nanos() as u64),
            summary,
        }
    }

    pub fn print_summary(&self) {
        println!("{}", self.summary.done_line());
    }

    /// Detailed block shown with -v
    pub fn print_details(&self) {
        println!(
            "\n{}",
            "═══════════════════════════════════════════════════════".bright_blue()
        );
        println!(
            "{} AES benchmark over {} transport",
            "ℹ".bright_blue(),
            self.transport.bright_white().bold()
        );
        println!(
            "{}",
            "═══════════════════════════════════════════════════════".bright_blue()
        );
        println!("Configuration:     {}", self.config.cipher_config());
        println!(
            "Layout:            {}",
            if self.config.in_place {
                "in-place"
            } else {
                "separate"
            }
        );
        println!("Input:             {}", self.config.input_mode);
        println!("Iterations:        {}", self.summary.count);
        println!("Inner loops:       {}", self.config.inner_loops);
        println!("Bytes processed:   {}", self.summary.total_bytes);
        println!(
            "Measured time:     {:.3} ms",
            self.summary.total_time_ns as f64 / 1e6
        );
        if let Some(mib) = self.summary.throughput_mib_s {
            println!("Throughput:        {} MiB/s", format!("{:.2}", mib).green().bold());
        }
        println!();
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
