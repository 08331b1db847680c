// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Transfer and throughput harness.
//!
//! Runs back-to-back transfers on one engine, or on an H2C and a C2H engine
//! in parallel (one thread per engine), and reports the bytes moved per
//! second. In interrupt mode a completion wait that expires is treated as a
//! missed interrupt: the engine is stopped and restarted, up to
//! [`PerfConfig::max_restarts`] times, and the measurement restarts with it.

use crate::device::Device;
use crate::error::{err_log, XdmaError, XdmaResult};
use crate::regs::{Direction, EngineId};
use crate::session::{DmaOptions, DmaSession};
use crate::transaction::TransferState;
use std::fmt;
use std::fmt::Write as _;
use std::thread;
use std::time::{Duration, Instant};

/// Completion wait before an interrupt is considered missed.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Stop/start cycles allowed after missed interrupts.
pub const DEFAULT_MAX_RESTARTS: u32 = 2;

/// Default transfer size.
pub const DEFAULT_TRANSFER_BYTES: usize = 64 * 1024;

/// Parameters of a harness run.
#[derive(Debug, Clone)]
pub struct PerfConfig {
    /// Buffer size of each session.
    pub bytes: usize,
    pub polling: bool,
    /// Move each buffer as a scatter/gather transaction.
    pub transaction: bool,
    /// How long to keep transferring.
    pub duration: Duration,
    pub wait_timeout: Duration,
    pub max_restarts: u32,
    pub fpga_offset: u64,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            bytes: DEFAULT_TRANSFER_BYTES,
            polling: false,
            transaction: false,
            duration: Duration::from_secs(5),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            max_restarts: DEFAULT_MAX_RESTARTS,
            fpga_offset: 0,
        }
    }
}

impl PerfConfig {
    pub fn new(bytes: usize, duration: Duration) -> Self {
        Self {
            bytes,
            duration,
            ..Self::default()
        }
    }

    pub fn polling(mut self, polling: bool) -> Self {
        self.polling = polling;
        self
    }

    pub fn transaction(mut self, transaction: bool) -> Self {
        self.transaction = transaction;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn max_restarts(mut self, restarts: u32) -> Self {
        self.max_restarts = restarts;
        self
    }

    pub fn fpga_offset(mut self, offset: u64) -> Self {
        self.fpga_offset = offset;
        self
    }

    fn options(&self, direction: Direction, channel: u32) -> DmaOptions {
        DmaOptions::new(direction, channel, self.bytes)
            .fpga_offset(self.fpga_offset)
            .polling(self.polling)
            .transaction(self.transaction)
    }
}

/// Outcome of one harness run on one engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PerfReport {
    pub engine: EngineId,
    /// Bytes moved since the last (re)start of the measurement.
    pub bytes_transferred: u64,
    /// Completed transfers since the last (re)start of the measurement.
    pub transfers: u64,
    /// Time since the last (re)start of the measurement.
    pub elapsed: Duration,
    /// Stop/start cycles performed after missed interrupts.
    pub restarts: u32,
}

impl PerfReport {
    /// Throughput in MB/s (10^6 bytes per second).
    pub fn mb_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / secs / 1e6
    }
}

impl fmt::Display for PerfReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} bytes in {} transfers, {:.3} s, {:.2} MB/s",
            self.engine,
            self.bytes_transferred,
            self.transfers,
            self.elapsed.as_secs_f64(),
            self.mb_per_sec()
        )?;
        if self.restarts > 0 {
            write!(f, " ({} restarts)", self.restarts)?;
        }
        Ok(())
    }
}

/// Fill `buf` with little-endian 32-bit words counting up from `seed`.
pub fn fill_pattern(buf: &mut [u8], seed: u32) {
    let mut word = seed;
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        chunk.copy_from_slice(&word.to_le_bytes());
        word = word.wrapping_add(1);
    }
    let tail = chunks.into_remainder();
    let len = tail.len();
    tail.copy_from_slice(&word.to_le_bytes()[..len]);
}

/// Hex dump of the first `max_bytes` of `buf`, 16 bytes per line, followed
/// by the length and CRC32 of the whole buffer.
pub fn buffer_dump(buf: &[u8], max_bytes: usize) -> String {
    let mut out = String::new();
    for (i, line) in buf[..buf.len().min(max_bytes)].chunks(16).enumerate() {
        let _ = write!(out, "{:08x}:", i * 16);
        for b in line {
            let _ = write!(out, " {b:02x}");
        }
        out.push('\n');
    }
    let _ = write!(
        out,
        "{} bytes, crc32 {:#010x}",
        buf.len(),
        crc32fast::hash(buf)
    );
    out
}

/// Measurement state of one engine.
struct Meter {
    start: Instant,
    bytes: u64,
    transfers: u64,
    restarts: u32,
}

impl Meter {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            bytes: 0,
            transfers: 0,
            restarts: 0,
        }
    }

    fn restart(&mut self) {
        self.start = Instant::now();
        self.bytes = 0;
        self.transfers = 0;
        self.restarts += 1;
    }

    fn report(&self, engine: EngineId) -> PerfReport {
        PerfReport {
            engine,
            bytes_transferred: self.bytes,
            transfers: self.transfers,
            elapsed: self.start.elapsed(),
            restarts: self.restarts,
        }
    }
}

/// Start the programmed transfer and wait for it, restarting the engine on
/// missed interrupts.
fn run_transfer(session: &mut DmaSession, config: &PerfConfig, meter: &mut Meter) -> XdmaResult<()> {
    session.transfer_start()?;
    loop {
        match session.wait_completion(config.wait_timeout) {
            Ok(()) => return Ok(()),
            Err(XdmaError::Timeout) if meter.restarts < config.max_restarts => {
                log::warn!(
                    "{}: no completion within {:?}, restarting engine",
                    session.engine(),
                    config.wait_timeout
                );
                session.transfer_stop()?;
                meter.restart();
                session.transfer_start()?;
            }
            Err(e) => {
                // Already stopped for polling sessions.
                let _ = session.transfer_stop();
                return Err(e);
            }
        }
    }
}

/// Move the whole buffer once, sub-transfer by sub-transfer.
fn run_transaction(
    session: &mut DmaSession,
    config: &PerfConfig,
    meter: &mut Meter,
) -> XdmaResult<()> {
    session.transaction_execute(None)?;
    let result = loop {
        if let Err(e) = run_transfer(session, config, meter) {
            break Err(e);
        }
        match session.transaction_transfer_ended() {
            Ok(TransferState::MoreRequired) => {}
            Ok(TransferState::Complete) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    session.transaction_release()?;
    result
}

/// Run transfers on an open session until `config.duration` has passed.
pub fn run_session(session: &mut DmaSession, config: &PerfConfig) -> XdmaResult<PerfReport> {
    let engine = session.engine();
    if session.is_to_device() {
        fill_pattern(session.buffer_mut(), engine.channel << 24);
    }

    let mut meter = Meter::new();
    while meter.start.elapsed() < config.duration {
        if config.transaction {
            run_transaction(session, config, &mut meter)?;
        } else {
            run_transfer(session, config, &mut meter)?;
        }
        meter.bytes += session.bytes() as u64;
        meter.transfers += 1;
    }

    let report = meter.report(engine);
    log::info!("{report}");
    Ok(report)
}

/// Open a session on one engine, run transfers for `config.duration` and
/// close it again.
pub fn run_single(
    device: &Device,
    direction: Direction,
    channel: u32,
    config: &PerfConfig,
) -> XdmaResult<PerfReport> {
    if !config.polling && !device.int_is_enabled() {
        return Err(err_log(
            "perf",
            XdmaError::InvalidParameter("interrupt mode run without enabled interrupts".into()),
        ));
    }
    let mut session = device.dma_open(&config.options(direction, channel))?;
    let report = run_session(&mut session, config)?;
    session.close()?;
    Ok(report)
}

/// Run an H2C and a C2H engine in parallel, one thread each.
///
/// Returns the H2C report followed by the C2H report. Both threads run to
/// completion before an error of either is returned.
pub fn run_bidirectional(
    device: &Device,
    h2c_channel: u32,
    c2h_channel: u32,
    config: &PerfConfig,
) -> XdmaResult<(PerfReport, PerfReport)> {
    let (h2c, c2h) = thread::scope(|s| {
        let h2c = s.spawn(|| run_single(device, Direction::ToDevice, h2c_channel, config));
        let c2h = s.spawn(|| run_single(device, Direction::CardToHost, c2h_channel, config));
        (h2c.join(), c2h.join())
    });
    let join = |r: thread::Result<XdmaResult<PerfReport>>| {
        r.unwrap_or_else(|_| {
            Err(err_log(
                "perf",
                XdmaError::InvalidParameter("transfer thread panicked".into()),
            ))
        })
    };
    Ok((join(h2c)?, join(c2h)?))
}
