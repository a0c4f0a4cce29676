// TEE Cipher Service Binary - standalone isolated cipher service
// Hosts one CipherService per connection behind a Unix domain socket

use clap::Parser;
use colored::*;
use std::process;
use tee_aes_perf::config::BenchConfig;
use tee_aes_perf::logging;
use tee_aes_perf::tee_service::TeeServiceServer;

const DEFAULT_SOCKET_PATH: &str = "/tmp/tee_cipher_service.sock";

#[derive(Parser, Debug)]
#[command(name = "tee_cipher_service")]
#[command(about = "Isolated AES cipher service reachable over a Unix socket", long_about = None)]
struct Args {
    /// Socket path to listen on
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: String,

    /// Key material, hex (two keys for XTS)
    #[arg(long)]
    key: Option<String>,

    /// IV / XTS tweak, 16 bytes hex
    #[arg(long)]
    iv: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = BenchConfig {
        key_hex: args.key,
        iv_hex: args.iv,
        ..Default::default()
    };
    let service_config = match config.service_config() {
        Ok(service_config) => service_config,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            process::exit(1);
        }
    };

    let server = TeeServiceServer::new(args.socket, service_config);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{} Shutting down cipher service...", "→".yellow());
            process::exit(0);
        }
    });

    if let Err(e) = server.run().await {
        eprintln!("{} Cipher service error: {}", "✗".red().bold(), e);
        process::exit(1);
    }
}
