// src/main.rs
use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use tokio::sync::mpsc;

use tv_pair::{Config, InterfaceAddresses, PairingOrchestrator};

const DEFAULT_QR_PATH: &str = "pairing-qr.png";

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run().await {
        eprintln!("pairing failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::load();
    let qr_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_QR_PATH.into());

    let (key_tx, mut key_rx) = mpsc::unbounded_channel();
    let orchestrator = PairingOrchestrator::new(config, Arc::new(InterfaceAddresses), key_tx);

    let display = orchestrator.start_with_retry().await?;
    if let Err(e) = display.qr.save(&qr_path) {
        error!("could not write {qr_path}: {e}");
    } else {
        info!("pairing code written to {qr_path}");
    }
    eprintln!("Open {} on your phone (or scan {qr_path})", display.url);

    tokio::select! {
        key = key_rx.recv() => match key {
            Some(key) => println!("{key}"),
            None => error!("pairing ended without a key"),
        },
        _ = tokio::signal::ctrl_c() => info!("pairing cancelled"),
    }

    orchestrator.shutdown().await;
    Ok(())
}
