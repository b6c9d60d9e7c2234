//! Genbench CLI - quantized text-generation latency benchmark
//!
//! # Examples
//!
//! ```text
//! genbench --weight-only-quantization --weight-dtype INT4 --output-dir ./saved_results
//! genbench --benchmark --weight-only-quantization --token-latency --greedy --input-tokens 1024
//! genbench --benchmark --int8 --prompt "Once upon a time" --num-iter 20 --num-warmup 5
//! ```

use clap::Parser;
use genbench::cli::{self, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(e) = cli::entrypoint(cli) {
        eprintln!("[ERROR] {e}");
        std::process::exit(cli::exit_code(&e));
    }
}
