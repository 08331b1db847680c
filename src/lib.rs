// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # Xilinx XDMA Rust Bindings
//!
//! This crate is a user-mode driver for the Xilinx PCI Express DMA/Bridge
//! Subsystem (XDMA) engines: up to four host-to-card (H2C) and four
//! card-to-host (C2H) scatter/gather engines behind one PCIe function.
//!
//! ## Supported Operations
//!
//! - Device discovery and engine enumeration
//! - DMA sessions on pinned, page-aligned host buffers
//! - Completion by polling the write-back word or by interrupt
//! - Scatter/gather transactions for buffers of any size
//! - User interrupts and plug-and-play/power events
//! - A transfer and throughput harness ([`perf`])
//!
//! ## Platform Support
//!
//! All register access, pinning and interrupt routing goes through the
//! host-DMA service traits in [`host`].
//!
//! | Backend | Platform | Notes |
//! |---------|----------|-------|
//! | [`host::sim::SimHost`] | all | in-process card model, used by the tests |
//! | `host::linux::LinuxHost` | Linux | sysfs BARs, pagemap pinning, UIO interrupts |
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use xdma_rust::{Device, Direction, DmaOptions, InterruptResult, Xdma, XdmaError};
//!
//! fn main() -> Result<(), XdmaError> {
//!     let xdma = Xdma::init_linux()?;
//!     let device = xdma.device_open(0x10EE, 0x9038)?;
//!     device.int_enable(Arc::new(|_: &Device, res: &InterruptResult| {
//!         println!("{} done, status {:#x}", res.engine, res.dma_status.bits());
//!     }))?;
//!
//!     let mut session = device.dma_open(&DmaOptions::new(Direction::CardToHost, 0, 1 << 20))?;
//!     session.transfer_start()?;
//!     session.wait_completion(Duration::from_secs(1))?;
//!     println!("first word: {:02x?}", &session.buffer()[..4]);
//!     Ok(())
//! }
//! ```
//!
//! ## Requirements (Linux backend)
//!
//! - The function bound to `uio_pci_generic` for interrupts
//! - `CAP_SYS_ADMIN` for `/proc/self/pagemap` page frame numbers
//! - Hugepages reserved for descriptor rings larger than one page
//! - No translating IOMMU between the card and host memory

pub mod descriptor;
pub mod device;
pub mod engine;
pub mod error;
pub mod event;
pub mod host;
pub mod interrupt;
pub mod perf;
pub mod regs;
pub mod session;
pub mod transaction;

// Re-exports for convenient access
pub use device::{Device, EngineInfo, EventHandler, Xdma};
pub use error::{clear_last_err, get_last_err, XdmaError, XdmaResult};
pub use host::{EventMask, InterruptType};
pub use interrupt::{IntHandler, InterruptResult, UserIntHandler};
pub use regs::{ControlFlags, Direction, EngineId, StatusFlags};
pub use session::{CompletionContext, DmaOptions, DmaSession, SessionId};
pub use transaction::TransferState;
