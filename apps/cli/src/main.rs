use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ezusb_core::session::{NotifierConfig, NotifierSession};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "EZ-USB firmware loader and bulk loop-back notifier",
    long_about = None
)]
struct Args {
    /// Vendor ID of the raw part (decimal)
    vendor_id: Option<u16>,

    /// Product ID of the raw part (decimal)
    product_id: Option<u16>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the firmware image (Intel HEX)
    #[arg(long)]
    firmware: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<NotifierConfig> {
    let mut config = match &args.config {
        Some(path) => NotifierConfig::load_from_file(path)?,
        None => NotifierConfig::default(),
    };
    if let Some(vendor_id) = args.vendor_id {
        config.vendor_id = vendor_id;
    }
    if let Some(product_id) = args.product_id {
        config.product_id = product_id;
    }
    if let Some(firmware) = &args.firmware {
        config.firmware_path = Some(firmware.clone());
    }
    Ok(config)
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stdout)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting ezusb-notify (nusb backend)...");

    let result = build_config(&args).and_then(|config| NotifierSession::new(config).run());
    match result {
        Ok(summary) => {
            info!(
                raw = summary.raw.devices_seen,
                tested = summary.tested.devices_seen,
                passed = summary.tests_passed,
                failed = summary.tests_failed,
                "Stopped ({:?})",
                summary.exit
            );
        }
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(-1);
        }
    }
}
