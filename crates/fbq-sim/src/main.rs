//! Host simulator for the framebuffer RPC queues.
//!
//! Runs one queue backend over an in-memory shared region, with a simulated
//! remote module producing requests and consuming messages on the other side.

mod error;
mod handler;
mod host;
mod sim;
mod transport;

use std::process;

use clap::Parser;

use sim::{Backend, Settings};

#[derive(Parser)]
#[command(name = "fbq-sim")]
#[command(about = "Exercise the framebuffer RPC queues against a simulated remote module", long_about = None)]
#[command(version)]
struct Cli {
    /// Queue backend to run
    #[arg(short, long, value_enum, default_value_t = Backend::Heap)]
    backend: Backend,

    /// Requests the remote module sends
    #[arg(short, long, default_value = "64")]
    requests: usize,

    /// Elements per ring
    #[arg(long, default_value = "8")]
    elements: u32,

    /// Bytes per ring element (multiple of 16)
    #[arg(long, default_value = "64")]
    element_size: u32,

    /// Seed for routing, request sizes and payloads
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Suppress progress output (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging (suppressed if --quiet)
    if !cli.quiet {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let settings = Settings {
        backend: cli.backend,
        requests: cli.requests,
        elements: cli.elements,
        element_size: cli.element_size,
        seed: cli.seed,
    };

    match sim::run(&settings) {
        Ok(summary) => {
            if summary.rejected_tail_writes > 0 {
                log::warn!("{} unprivileged tail writes were dropped", summary.rejected_tail_writes);
            }
            if !cli.quiet {
                eprintln!(
                    "Success: {:?} backend answered {} of {} requests in {} rounds ({} acks, {} responses, {} deferred sweeps, {} flushes)",
                    settings.backend,
                    summary.completed,
                    summary.sent,
                    summary.rounds,
                    summary.acks,
                    summary.responses,
                    summary.deferred_sweeps,
                    summary.flushes
                );
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
