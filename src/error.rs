// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for XDMA operations.
//!
//! Besides the typed [`XdmaError`], the library keeps a human readable
//! description of the most recent failure in thread-local storage. It is
//! updated on every error path and can be fetched with [`get_last_err`]
//! right after a call failed, on the same thread.

use crate::regs::EngineId;
use std::cell::RefCell;
use thiserror::Error;

/// Failures reported by a host-DMA service backend.
#[derive(Debug, Error)]
pub enum HostError {
    /// No PCIe function matches the requested identifiers.
    #[error("no device {vendor:04x}:{device:04x} found")]
    DeviceNotFound { vendor: u16, device: u16 },

    /// The device or resource is already claimed.
    #[error("resource busy: {0}")]
    Busy(String),

    /// An address did not fall inside a mapped or pinned region.
    #[error("invalid address {0:#x}")]
    InvalidAddress(u64),

    /// Requested capability is not implemented by this backend.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure.
    #[error("{0}")]
    Failed(String),
}

/// Result type alias for host-DMA service calls.
pub type HostResult<T> = Result<T, HostError>;

/// Errors that can occur during XDMA operations.
#[derive(Debug, Error)]
pub enum XdmaError {
    /// Invalid argument provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No BAR of the device carries the XDMA identifier registers.
    #[error("device is not an XDMA device")]
    NotXdmaDevice,

    /// The requested engine is not populated in the hardware.
    #[error("engine {0} is not present")]
    EngineAbsent(EngineId),

    /// Channel out of range, or the identifier register reports another channel.
    #[error("invalid channel {channel} (identifier reports {reported:?})")]
    ChannelInvalid { channel: u32, reported: Option<u32> },

    /// A session is already attached to this engine.
    #[error("engine {0} is already open")]
    AlreadyOpen(EngineId),

    /// The operation was already performed (double enable or double register).
    #[error("{0} already done")]
    AlreadyDone(&'static str),

    /// Buffer address, FPGA offset or length violates the engine alignment rules.
    #[error("misaligned transfer: {0}")]
    Misaligned(String),

    /// Allocation or pinning failed.
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Waiting for a completion timed out.
    #[error("timeout waiting for DMA completion")]
    Timeout,

    /// The engine reported an error.
    #[error("DMA failed: status={status:#010x}")]
    DmaError { status: u32 },

    /// The host-DMA service failed.
    #[error("host service failure: {0}")]
    HostService(#[from] HostError),
}

impl XdmaError {
    /// Stable numeric code for this error kind.
    ///
    /// The values follow the status codes the XDMA sample tools print as
    /// `Error 0x<code> - <message>`.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidParameter(_) => 0x2000_0015,
            Self::NotXdmaDevice => 0x2000_0010,
            Self::EngineAbsent(_) => 0x2000_0012,
            Self::ChannelInvalid { .. } => 0x2000_0013,
            Self::AlreadyOpen(_) | Self::AlreadyDone(_) => 0x2000_000E,
            Self::Misaligned(_) => 0x2000_0016,
            Self::ResourceExhausted(_) => 0x2000_0008,
            Self::Timeout => 0x2000_0011,
            Self::DmaError { .. } => 0x2000_0017,
            Self::HostService(_) => 0x2000_0001,
        }
    }
}

/// Result type alias for XDMA operations.
pub type XdmaResult<T> = Result<T, XdmaError>;

thread_local! {
    static LAST_ERR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Get the description of the last error recorded on this thread.
///
/// Returns an empty string when no error was recorded since the last
/// [`clear_last_err`].
pub fn get_last_err() -> String {
    LAST_ERR.with(|e| e.borrow().clone())
}

/// Clear the last-error description of this thread.
pub fn clear_last_err() {
    LAST_ERR.with(|e| e.borrow_mut().clear());
}

/// Replace the last-error description of this thread.
pub(crate) fn set_last_err(msg: String) {
    LAST_ERR.with(|e| *e.borrow_mut() = msg);
}

/// Record `err` as the last error of this thread, log it and hand it back.
///
/// Intended for use on error paths: `return Err(err_log("dma_open", e))`.
pub(crate) fn err_log(context: &str, err: XdmaError) -> XdmaError {
    let msg = format!("{context}: {err}");
    log::error!("{msg}");
    LAST_ERR.with(|e| *e.borrow_mut() = msg);
    err
}

/// Extension for recording the error of a `Result` as the last error.
pub(crate) trait RecordErr<T> {
    fn record(self, context: &str) -> XdmaResult<T>;
}

impl<T, E: Into<XdmaError>> RecordErr<T> for Result<T, E> {
    fn record(self, context: &str) -> XdmaResult<T> {
        self.map_err(|e| err_log(context, e.into()))
    }
}
