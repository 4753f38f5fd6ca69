//! Helper process entry point
//!
//! Spawned by the session manager with the two peer sockets in the
//! environment; `-d` is the only accepted invocation.

use anyhow::Result;
use clap::Parser;
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rdp_gfx_helper::{GpuContext, HelperConfig, Relay};

/// Command-line arguments for rdp-gfx-helper
#[derive(Parser, Debug)]
#[command(name = "rdp-gfx-helper")]
#[command(version, about = "GPU encode helper for RDP sessions", long_about = None)]
struct Args {
    /// Run as the session's helper daemon
    #[arg(short = 'd')]
    daemon: bool,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// the GPU context pins everything to one thread anyway
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    if !args.daemon {
        println!("usage: rdp-gfx-helper -d");
        return Ok(());
    }

    init_logging(&args);
    info!("rdp-gfx-helper v{} startup", env!("CARGO_PKG_VERSION"));

    // a dying peer must surface as a write error, not kill the process
    // SAFETY: installing SIG_IGN for SIGPIPE is async-signal safe.
    unsafe {
        signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }

    let config = HelperConfig::from_env()?;
    let gpu = GpuContext::init(&config)?;
    let mut relay = Relay::new(&config, gpu)?;

    match relay.run().await {
        Ok(()) => info!("relay loop ended"),
        Err(e) => {
            // a broken link is the normal way a session ends; the RDP
            // server reconnects with a fresh helper
            tracing::error!(error = %e, "relay loop down");
        }
    }
    Ok(())
}

fn init_logging(args: &Args) {
    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("rdp_gfx_helper={log_level},warn"))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}
