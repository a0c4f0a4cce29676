// AES Perf Binary - times AES Process commands against the cipher service
// Runs in-process by default, or against tee_cipher_service with --socket

use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::process;
use tee_aes_perf::benchmark::BenchmarkRunner;
use tee_aes_perf::clock;
use tee_aes_perf::config::BenchConfig;
use tee_aes_perf::logging;
use tee_aes_perf::report::{self, BenchmarkReport};
use tee_aes_perf::shared_memory::SharedMemoryPool;
use tee_aes_perf::tee::TeeError;
use tee_aes_perf::tee_service::{CipherSession, LocalTransport, SocketTransport, TeeTransport};
use tee_aes_perf::types::{CipherMode, Direction, InputMode, KeySize};

#[derive(Parser, Debug)]
#[command(name = "aes_perf")]
#[command(about = "AES throughput and latency benchmark for the isolated cipher service", long_about = None)]
struct Args {
    /// Decrypt instead of encrypt
    #[arg(short = 'd', long)]
    decrypt: bool,

    /// Key size in bits: 128, 192 or 256
    #[arg(short = 'k', long = "key-size")]
    key_size: Option<KeySize>,

    /// Inner loops: cipher passes per Process command
    #[arg(short = 'l', long = "inner-loops")]
    inner_loops: Option<u32>,

    /// Mode: ECB, CBC, CTR or XTS
    #[arg(short = 'm', long)]
    mode: Option<CipherMode>,

    /// Outer loops: timed Process commands
    #[arg(short = 'n', long)]
    iterations: Option<u32>,

    /// Buffer size in bytes
    #[arg(short = 's', long)]
    size: Option<usize>,

    /// Refill the input with random bytes before each iteration
    #[arg(short = 'r', long)]
    random: bool,

    /// Use one inout buffer
    #[arg(short = 'i', long = "in-place")]
    in_place: bool,

    /// Untimed iterations before measurement
    #[arg(short = 'w', long)]
    warmup: Option<u32>,

    /// Key material, hex (in-process service only)
    #[arg(long, conflicts_with = "socket")]
    key: Option<String>,

    /// IV / XTS tweak, 16 bytes hex (in-process service only)
    #[arg(long, conflicts_with = "socket")]
    iv: Option<String>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reach tee_cipher_service at this socket path
    #[arg(long)]
    socket: Option<String>,

    /// Write the report as JSON to this path
    #[arg(long)]
    json: Option<PathBuf>,

    /// Verbosity (-v details and debug logs, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, config: &mut BenchConfig) {
        if self.decrypt {
            config.direction = Direction::Decrypt;
        }
        if let Some(key_size) = self.key_size {
            config.key_size = key_size;
        }
        if let Some(inner_loops) = self.inner_loops {
            config.inner_loops = inner_loops;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(iterations) = self.iterations {
            config.outer_iterations = iterations;
        }
        if let Some(size) = self.size {
            config.buffer_size = size;
        }
        if self.random {
            config.input_mode = InputMode::Random;
        }
        if self.in_place {
            config.in_place = true;
        }
        if let Some(warmup) = self.warmup {
            config.warmup_iterations = warmup;
        }
        if self.key.is_some() {
            config.key_hex = self.key.clone();
        }
        if self.iv.is_some() {
            config.iv_hex = self.iv.clone();
        }
        if self.socket.is_some() {
            config.socket_path = self.socket.clone();
        }
    }
}

fn fail(context: &str, e: &TeeError) -> ! {
    eprintln!(
        "{}: 0x{:08x} (origin {:#x})",
        context,
        e.code().value(),
        e.origin().code()
    );
    eprintln!("{} {}", "✗".red().bold(), e);
    process::exit(1);
}

fn load_config(args: &Args) -> BenchConfig {
    let mut config = match &args.config {
        Some(path) => BenchConfig::from_file(path).unwrap_or_else(|e| {
            eprintln!("{} {}", "✗".red().bold(), e);
            process::exit(1);
        }),
        None => BenchConfig::default(),
    };
    if let Err(e) = config.apply_env() {
        eprintln!("{} {}", "✗".red().bold(), e);
        process::exit(1);
    }
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("{} {}", "✗".red().bold(), e);
        process::exit(1);
    }
    config
}

fn run<T: TeeTransport>(transport: T, config: &BenchConfig) -> BenchmarkReport {
    let pool = SharedMemoryPool::new(config.pool_capacity);
    let mut session = CipherSession::open(transport, pool)
        .unwrap_or_else(|e| fail("open session", &e));

    let report = BenchmarkRunner::new(&mut session, config.clone())
        .run()
        .unwrap_or_else(|e| fail("benchmark", &e));

    if let Err(e) = session.close() {
        fail("close session", &e);
    }
    report
}

fn main() {
    let args = Args::parse();
    logging::init(args.verbose);
    let config = load_config(&args);

    if let Some(note) = clock::resolution_note() {
        println!("{}", note);
    }
    println!("{}", report::start_line(&config));

    let report = match &config.socket_path {
        Some(path) => run(SocketTransport::new(path), &config),
        None => {
            let service_config = config.service_config().unwrap_or_else(|e| {
                eprintln!("{} {}", "✗".red().bold(), e);
                process::exit(1);
            });
            run(LocalTransport::new(service_config), &config)
        }
    };

    if args.verbose > 0 {
        report.print_details();
    }
    report.print_summary();

    if let Some(path) = &args.json {
        match report.write_json(path) {
            Ok(()) => println!("{} Report written to {}", "✓".green(), path.display()),
            Err(e) => {
                eprintln!("{} Failed to write report: {}", "✗".red(), e);
                process::exit(1);
            }
        }
    }
}
