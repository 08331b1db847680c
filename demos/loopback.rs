// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Loopback example: write a pattern to card memory through H2C0, read it
//! back through C2H0 and compare.
//!
//! Run with: `cargo run --example loopback`
//!
//! By default the simulated card is used. On Linux, pass `--hw` to use the
//! first 10ee:9038 function bound to `uio_pci_generic`.

use std::sync::Arc;
use std::time::Duration;
use xdma_rust::host::sim::{SimCard, SimHost};
use xdma_rust::perf::{self, PerfConfig};
use xdma_rust::{
    get_last_err, Device, Direction, DmaOptions, InterruptResult, Xdma, XdmaError,
};

const VENDOR_ID: u16 = 0x10EE;
const DEVICE_ID: u16 = 0x9038;
const TRANSFER_BYTES: usize = 256 * 1024;

fn init(hardware: bool) -> Result<Xdma, XdmaError> {
    if hardware {
        #[cfg(target_os = "linux")]
        return Xdma::init_linux();
        #[cfg(not(target_os = "linux"))]
        return Err(XdmaError::InvalidParameter(
            "hardware access needs Linux".into(),
        ));
    }
    let card = SimCard::new(VENDOR_ID, DEVICE_ID)
        .with_channels(2)
        .card_memory(4 << 20);
    Xdma::init(Arc::new(SimHost::new(card)))
}

fn run(device: &Device) -> Result<(), XdmaError> {
    println!("Engines:");
    for e in device.engines().iter().filter(|e| e.enabled) {
        println!(
            "  {} irq mask {:#04x}{}",
            e.id,
            e.irq_mask,
            if e.streaming { " (stream)" } else { "" }
        );
    }
    println!();

    let int_type = device.int_enable(Arc::new(|_: &Device, res: &InterruptResult| {
        println!(
            "  interrupt: {} status {:#x}, {} descriptors",
            res.engine,
            res.dma_status.bits(),
            res.completed_descs
        );
    }))?;
    println!("Interrupts enabled ({int_type})");

    let mut h2c = device.dma_open(&DmaOptions::new(Direction::ToDevice, 0, TRANSFER_BYTES))?;
    let mut c2h = device.dma_open(&DmaOptions::new(Direction::CardToHost, 0, TRANSFER_BYTES))?;

    perf::fill_pattern(h2c.buffer_mut(), 0xC0DE_0000);
    h2c.transfer_start()?;
    h2c.wait_completion(Duration::from_secs(1))?;
    c2h.transfer_start()?;
    c2h.wait_completion(Duration::from_secs(1))?;

    let matches = h2c.buffer() == c2h.buffer();
    println!("Loopback of {TRANSFER_BYTES} bytes: {}", if matches { "OK" } else { "MISMATCH" });
    println!("{}", perf::buffer_dump(c2h.buffer(), 32));
    h2c.close()?;
    c2h.close()?;
    println!();

    println!("Bidirectional run (H2C0 / C2H1, 64 KiB, 1 s):");
    let config = PerfConfig::new(64 * 1024, Duration::from_secs(1));
    let (tx, rx) = perf::run_bidirectional(device, 0, 1, &config)?;
    println!("  {tx}");
    println!("  {rx}");

    device.int_disable()?;
    Ok(())
}

fn main() {
    println!("Xilinx XDMA Loopback Example");
    println!("============================\n");

    let hardware = std::env::args().any(|a| a == "--hw");
    let xdma = match init(hardware) {
        Ok(x) => x,
        Err(e) => {
            println!("Init failed: {e}");
            return;
        }
    };
    let device = match xdma.device_open(VENDOR_ID, DEVICE_ID) {
        Ok(d) => d,
        Err(e) => {
            println!("Error {:#010x} - {}", e.code(), get_last_err());
            return;
        }
    };
    println!("Opened {VENDOR_ID:04x}:{DEVICE_ID:04x}, XDMA registers in BAR {}", device.config_bar());

    if let Err(e) = run(&device) {
        println!("Error {:#010x} - {}", e.code(), get_last_err());
    }
    if let Err(e) = device.close() {
        println!("Close failed: {e}");
    }
}
