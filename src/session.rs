// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA sessions.
//!
//! A session attaches a page-aligned, pinned host buffer to one engine and
//! owns the descriptor ring describing it. It can be started any number of
//! times without reallocation. Completion is detected either by polling the
//! write-back word or by waiting for the interrupt demultiplexer to signal
//! the session.
//!
//! Transaction sessions move buffers of any size: the page list is split
//! into windows of at most [`MAX_TRANSACTION_TRANSFER`] bytes and the ring
//! is rebuilt for every window.

use crate::descriptor::{build_ring, dump_ring, PollWriteBack, XdmaDesc, DESC_SIZE};
use crate::device::Device;
use crate::engine::{EngineMode, EngineRegs};
use crate::error::{err_log, RecordErr, XdmaError, XdmaResult};
use crate::event::Event;
use crate::host::{
    CoherentBuffer, DmaHandle, DmaPin, HostDevice, PinOptions, SgEntry, TransactionLimits,
};
use crate::regs::{Alignments, Direction, EngineId, StatusFlags};
use crate::transaction::{SgTransaction, TransferState, MAX_TRANSACTION_TRANSFER};
use std::alloc::{self, Layout};
use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Opaque user data handed back with every completion of a session.
pub type CompletionContext = Arc<dyn Any + Send + Sync>;

/// Identifies a session for the lifetime of its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Parameters of [`Device::dma_open`].
#[derive(Clone)]
pub struct DmaOptions {
    pub direction: Direction,
    pub channel: u32,
    /// Size of the host buffer in bytes.
    pub bytes: usize,
    /// Card-side address of the first byte.
    pub fpga_offset: u64,
    /// Detect completion through the write-back word instead of interrupts.
    pub polling: bool,
    /// Keep the card-side address fixed for every descriptor.
    pub non_incrementing: bool,
    /// Split the buffer into sub-transfers of at most
    /// [`MAX_TRANSACTION_TRANSFER`] bytes.
    pub transaction: bool,
    pub context: Option<CompletionContext>,
}

impl DmaOptions {
    /// Interrupt-mode, incrementing transfer at card offset 0.
    pub fn new(direction: Direction, channel: u32, bytes: usize) -> Self {
        Self {
            direction,
            channel,
            bytes,
            fpga_offset: 0,
            polling: false,
            non_incrementing: false,
            transaction: false,
            context: None,
        }
    }

    pub fn fpga_offset(mut self, offset: u64) -> Self {
        self.fpga_offset = offset;
        self
    }

    pub fn polling(mut self, polling: bool) -> Self {
        self.polling = polling;
        self
    }

    pub fn non_incrementing(mut self, non_incrementing: bool) -> Self {
        self.non_incrementing = non_incrementing;
        self
    }

    pub fn transaction(mut self, transaction: bool) -> Self {
        self.transaction = transaction;
        self
    }

    pub fn context(mut self, context: CompletionContext) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Debug for DmaOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaOptions")
            .field("direction", &self.direction)
            .field("channel", &self.channel)
            .field("bytes", &self.bytes)
            .field("fpga_offset", &format_args!("{:#x}", self.fpga_offset))
            .field("polling", &self.polling)
            .field("non_incrementing", &self.non_incrementing)
            .field("transaction", &self.transaction)
            .field("context", &self.context.is_some())
            .finish()
    }
}

/// Page-aligned, zero-initialized host buffer.
struct PageBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl PageBuffer {
    fn new(len: usize, page_size: usize) -> XdmaResult<Self> {
        let layout = Layout::from_size_align(len.max(1), page_size)
            .map_err(|e| XdmaError::InvalidParameter(format!("buffer layout: {e}")))?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| XdmaError::ResourceExhausted(format!("{len} byte host buffer")))?;
        Ok(Self { ptr, len, layout })
    }

    fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` owns `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` owns `len` initialized bytes, borrowed mutably.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `PageBuffer::new` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

/// Source of the "transfer ended" signal of a session.
enum Completion {
    /// The engine writes its completed descriptor count to this buffer.
    PollWord(CoherentBuffer),
    /// The interrupt demultiplexer signals the session event.
    Interrupt,
}

/// Engine status and completed count recorded by the demultiplexer.
#[derive(Debug, Clone, Copy)]
struct Outcome {
    status: StatusFlags,
    completed: u32,
}

/// Session state shared with the interrupt demultiplexer.
pub(crate) struct SessionCore {
    pub(crate) id: SessionId,
    pub(crate) mode: EngineMode,
    pub(crate) regs: EngineRegs,
    pub(crate) irq_mask: u32,
    host: Arc<dyn HostDevice>,
    pin: DmaHandle,
    context: Mutex<Option<CompletionContext>>,
    event: Event,
    outcome: Mutex<Option<Outcome>>,
}

impl SessionCore {
    fn context_lock(&self) -> MutexGuard<'_, Option<CompletionContext>> {
        self.context.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn outcome_lock(&self) -> MutexGuard<'_, Option<Outcome>> {
        self.outcome.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn context(&self) -> Option<CompletionContext> {
        self.context_lock().clone()
    }

    /// Make the device writes to the payload buffer visible to the CPU.
    pub(crate) fn sync_for_cpu(&self) -> XdmaResult<()> {
        Ok(self.host.sync_for_cpu(self.pin)?)
    }

    /// Record the end of a transfer and wake the waiter.
    pub(crate) fn complete(&self, status: StatusFlags, completed: u32) {
        *self.outcome_lock() = Some(Outcome { status, completed });
        self.event.signal();
    }
}

/// A DMA session attached to one engine.
///
/// Closing (or dropping) the session stops the engine, detaches it from the
/// engine slot and releases the pin, the descriptor ring, the write-back
/// buffer and the host buffer.
pub struct DmaSession {
    device: Device,
    core: Arc<SessionCore>,
    slot: usize,
    fpga_offset: u64,
    completion: Completion,
    ring: CoherentBuffer,
    ring_len: usize,
    transaction: Option<SgTransaction>,
    // Declared before `buffer`: the pin is released before the memory.
    pin: DmaPin,
    buffer: PageBuffer,
    poll_spin_limit: Option<u64>,
    closed: bool,
}

impl fmt::Debug for DmaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaSession")
            .field("id", &self.core.id)
            .field("engine", &self.core.regs.id())
            .field("bytes", &self.buffer.len)
            .field("fpga_offset", &format_args!("{:#x}", self.fpga_offset))
            .field("mode", &self.core.mode)
            .field("ring_len", &self.ring_len)
            .finish()
    }
}

/// Check a session request against the engine alignments register.
///
/// A register value of 0 disables the check.
fn check_alignment(
    raw: u32,
    buffer_addr: u64,
    options: &DmaOptions,
    streaming: bool,
) -> XdmaResult<()> {
    if raw == 0 {
        return Ok(());
    }
    let a = Alignments::from_raw(raw);
    log::trace!(
        "alignments {raw:#010x}: address {}, granularity {}, {} address bits",
        a.addr_align,
        a.len_granularity,
        a.address_bits
    );
    let align = u64::from(a.addr_align);

    if options.bytes as u64 % u64::from(a.len_granularity) != 0 {
        return Err(XdmaError::Misaligned(format!(
            "length {:#x} is not a multiple of {}",
            options.bytes, a.len_granularity
        )));
    }
    if streaming || options.non_incrementing {
        if buffer_addr % align != 0 {
            return Err(XdmaError::Misaligned(format!(
                "buffer {buffer_addr:#x} is not aligned to {align}"
            )));
        }
        if !streaming && options.fpga_offset % align != 0 {
            return Err(XdmaError::Misaligned(format!(
                "card offset {:#x} is not aligned to {align}",
                options.fpga_offset
            )));
        }
    } else if buffer_addr % align != options.fpga_offset % align {
        return Err(XdmaError::Misaligned(format!(
            "buffer {buffer_addr:#x} and card offset {:#x} differ modulo {align}",
            options.fpga_offset
        )));
    }
    Ok(())
}

/// Fill the descriptor ring for `entries` and point the engine at it.
fn program_ring(
    regs: &EngineRegs,
    ring: &mut CoherentBuffer,
    entries: &[SgEntry],
    mode: &EngineMode,
    fpga_offset: u64,
    adjacent: u8,
) -> XdmaResult<usize> {
    let phys = ring.phys();
    // SAFETY: `XdmaDesc` is plain data, the ring is page aligned and the
    // engine is not running while its ring is rebuilt.
    let descs = unsafe { ring.as_mut_slice::<XdmaDesc>() };
    let n = build_ring(
        descs,
        phys,
        entries,
        mode.direction,
        fpga_offset,
        mode.non_incrementing,
    )?;
    dump_ring(&descs[..n]);
    regs.set_descriptor_ring(phys, adjacent)?;
    ring.sync_for_device()?;
    Ok(n)
}

fn exhausted(what: &str) -> impl FnOnce(crate::error::HostError) -> XdmaError + '_ {
    move |e| XdmaError::ResourceExhausted(format!("{what}: {e}"))
}

impl DmaSession {
    pub(crate) fn open(device: &Device, options: &DmaOptions) -> XdmaResult<Self> {
        const CTX: &str = "dma_open";
        if options.bytes == 0 {
            return Err(err_log(
                CTX,
                XdmaError::InvalidParameter("zero byte transfer".into()),
            ));
        }

        let slot_index = device
            .reserve_engine(options.direction, options.channel)
            .map_err(|e| err_log(CTX, e))?;
        let shared = device.shared();
        let slot = &shared.slots[slot_index];
        // Until the session is attached, any failure returns the slot to idle.
        let reservation = scopeguard::guard((), |()| slot.release());

        let host = &shared.host;
        let page_size = host.page_size();
        let mut buffer = PageBuffer::new(options.bytes, page_size).map_err(|e| err_log(CTX, e))?;

        slot.regs.clear_non_incrementing().record(CTX)?;
        let alignments = slot.regs.alignments_raw().record(CTX)?;
        check_alignment(alignments, buffer.addr(), options, slot.streaming)
            .map_err(|e| err_log(CTX, e))?;

        let pin_options = PinOptions {
            direction: options.direction,
            addr64: true,
            no_page_merge: !options.transaction,
            transaction: options.transaction.then_some(TransactionLimits {
                max_transfer: MAX_TRANSACTION_TRANSFER,
                desc_stride: DESC_SIZE as u32,
            }),
        };
        // SAFETY: `buffer` is moved into the session next to the pin and
        // outlives it (field order).
        let pin = unsafe {
            DmaPin::new(
                host,
                buffer.as_mut_slice().as_mut_ptr(),
                options.bytes,
                &pin_options,
            )
        }
        .map_err(exhausted("pin"))
        .map_err(|e| err_log(CTX, e))?;

        let mode = EngineMode {
            direction: options.direction,
            polling: options.polling,
            streaming: slot.streaming,
            non_incrementing: options.non_incrementing,
        };

        let completion = if options.polling {
            let wb = CoherentBuffer::new(
                host,
                std::mem::size_of::<PollWriteBack>(),
                Direction::CardToHost,
            )
            .map_err(exhausted("write-back buffer"))
            .map_err(|e| err_log(CTX, e))?;
            slot.regs.set_writeback_address(wb.phys()).record(CTX)?;
            Completion::PollWord(wb)
        } else {
            Completion::Interrupt
        };

        let transaction = if options.transaction {
            Some(SgTransaction::new(pin.entries(), MAX_TRANSACTION_TRANSFER).record(CTX)?)
        } else {
            None
        };
        let ring_entries = match &transaction {
            Some(tr) => (MAX_TRANSACTION_TRANSFER as usize)
                .div_ceil(page_size)
                .saturating_add(1)
                .max(tr.max_window_entries()),
            None => pin.entries().len(),
        };
        let mut ring = CoherentBuffer::new(host, ring_entries * DESC_SIZE, Direction::ToDevice)
            .map_err(exhausted("descriptor ring"))
            .map_err(|e| err_log(CTX, e))?;

        let ring_len = if transaction.is_none() {
            program_ring(
                &slot.regs,
                &mut ring,
                pin.entries(),
                &mode,
                options.fpga_offset,
                device.adjacent_descriptors(),
            )
            .record(CTX)?
        } else {
            0
        };

        let core = Arc::new(SessionCore {
            id: SessionId(device.next_session_id()),
            mode,
            regs: slot.regs.clone(),
            irq_mask: slot.irq_mask,
            host: Arc::clone(host),
            pin: pin.handle(),
            context: Mutex::new(options.context.clone()),
            event: Event::new(),
            outcome: Mutex::new(None),
        });
        scopeguard::ScopeGuard::into_inner(reservation);
        slot.attach(Arc::clone(&core));

        log::debug!(
            "{}: opened on {}, {} bytes in {} pages, card offset {:#x}, {}",
            core.id,
            slot.id,
            options.bytes,
            pin.entries().len(),
            options.fpga_offset,
            if options.polling { "polling" } else { "interrupt" }
        );

        Ok(Self {
            device: device.clone(),
            core,
            slot: slot_index,
            fpga_offset: options.fpga_offset,
            completion,
            ring,
            ring_len,
            transaction,
            pin,
            buffer,
            poll_spin_limit: None,
            closed: false,
        })
    }

    pub fn id(&self) -> SessionId {
        self.core.id
    }

    pub fn engine(&self) -> EngineId {
        self.core.regs.id()
    }

    /// The host buffer.
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// The host buffer, for filling before an H2C transfer.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    /// Size of the host buffer in bytes.
    pub fn bytes(&self) -> usize {
        self.buffer.len
    }

    pub fn fpga_offset(&self) -> u64 {
        self.fpga_offset
    }

    /// Returns true for host-to-card sessions.
    pub fn is_to_device(&self) -> bool {
        self.core.mode.direction == Direction::ToDevice
    }

    pub fn is_polling(&self) -> bool {
        matches!(self.completion, Completion::PollWord(_))
    }

    /// Scatter/gather page list of the pinned buffer.
    pub fn page_list(&self) -> &[SgEntry] {
        self.pin.entries()
    }

    /// Descriptors of the transfer currently programmed.
    pub fn descriptors(&self) -> &[XdmaDesc] {
        // SAFETY: `XdmaDesc` is plain data and the ring is page aligned.
        let all = unsafe { self.ring.as_slice::<XdmaDesc>() };
        &all[..self.ring_len]
    }

    /// Completion context handed to the interrupt handler.
    pub fn context(&self) -> Option<CompletionContext> {
        self.core.context()
    }

    pub fn set_context(&self, context: Option<CompletionContext>) {
        *self.core.context_lock() = context;
    }

    /// Bound the number of write-back reads of [`DmaSession::poll_completion`].
    ///
    /// `None` (the default) spins until the engine finishes.
    pub fn set_poll_spin_limit(&mut self, limit: Option<u64>) {
        self.poll_spin_limit = limit;
    }

    /// Start the engine on the programmed descriptor ring.
    pub fn transfer_start(&mut self) -> XdmaResult<()> {
        const CTX: &str = "transfer_start";
        if self.ring_len == 0 {
            return Err(err_log(
                CTX,
                XdmaError::InvalidParameter("no transfer programmed".into()),
            ));
        }
        let core = &self.core;
        core.event.reset();
        *core.outcome_lock() = None;

        match &self.completion {
            Completion::PollWord(wb) => {
                // SAFETY: the buffer holds one aligned write-back record that the
                // engine does not write while it is stopped.
                unsafe { PollWriteBack::reset(wb.as_ptr().cast::<PollWriteBack>()) };
                wb.sync_for_device().record(CTX)?;
            }
            Completion::Interrupt => {
                if !self.device.int_is_enabled() {
                    log::warn!("{}: interrupt mode without enabled interrupts", core.id);
                }
                core.regs
                    .enable_interrupts(&core.mode, core.irq_mask)
                    .record(CTX)?;
            }
        }
        if core.mode.direction == Direction::ToDevice {
            self.pin_sync_for_device().record(CTX)?;
        }
        core.regs.start(&core.mode).record(CTX)
    }

    fn pin_sync_for_device(&self) -> XdmaResult<()> {
        Ok(self.core.host.sync_for_device(self.pin.handle())?)
    }

    /// Stop the engine.
    ///
    /// In interrupt mode the completion interrupts are masked as well, so a
    /// pending wait runs into its timeout.
    pub fn transfer_stop(&mut self) -> XdmaResult<()> {
        self.core.regs.stop(&self.core.mode).record("transfer_stop")
    }

    /// One read of the write-back word. Returns true once all descriptors
    /// of the ring completed.
    fn poll_step(&self) -> XdmaResult<bool> {
        let Completion::PollWord(wb) = &self.completion else {
            return Err(XdmaError::InvalidParameter(
                "session completes by interrupt".into(),
            ));
        };
        wb.sync_for_cpu()?;
        // SAFETY: the buffer holds one aligned write-back record.
        let word = unsafe { PollWriteBack::read_word(wb.as_ptr().cast::<PollWriteBack>()) };
        if PollWriteBack::is_error(word) {
            let status = self.core.regs.status(true)?.bits();
            return Err(XdmaError::DmaError { status });
        }
        Ok(PollWriteBack::completed_descs(word) as usize >= self.ring_len)
    }

    /// Stop the engine after a poll and hand back the poll result.
    fn finish_poll(&self, result: XdmaResult<()>) -> XdmaResult<()> {
        const CTX: &str = "poll_completion";
        let stopped = self.core.regs.stop(&self.core.mode);
        result.record(CTX)?;
        stopped.record(CTX)?;
        if self.core.mode.direction == Direction::CardToHost {
            self.core.sync_for_cpu().record(CTX)?;
        }
        Ok(())
    }

    fn poll_until(&self, deadline: Option<Instant>) -> XdmaResult<()> {
        let mut spins = 0u64;
        let result = loop {
            match self.poll_step() {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
            spins += 1;
            if self.poll_spin_limit.is_some_and(|limit| spins >= limit)
                || deadline.is_some_and(|d| Instant::now() >= d)
            {
                break Err(XdmaError::Timeout);
            }
            std::hint::spin_loop();
        };
        self.finish_poll(result)
    }

    /// Spin on the write-back word until the transfer completes.
    ///
    /// The engine is stopped afterwards, whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`XdmaError::DmaError`] if the write-back word reports an error; the
    ///   status register is read and cleared for the error value.
    /// - [`XdmaError::Timeout`] if a spin limit is set and reached.
    /// - [`XdmaError::InvalidParameter`] for interrupt-mode sessions.
    pub fn poll_completion(&mut self) -> XdmaResult<()> {
        self.poll_until(None)
    }

    /// Wait for the end of the current transfer, whatever the completion source.
    ///
    /// On [`XdmaError::Timeout`] in interrupt mode the engine keeps its state;
    /// the caller decides whether to stop and restart or close the session.
    pub fn wait_completion(&mut self, timeout: Duration) -> XdmaResult<()> {
        if self.is_polling() {
            return self.poll_until(Some(Instant::now() + timeout));
        }
        if !self.core.event.wait(timeout) {
            return Err(err_log("wait_completion", XdmaError::Timeout));
        }
        self.check_outcome()
    }

    /// Asynchronous variant of [`DmaSession::wait_completion`].
    #[cfg(feature = "async")]
    pub async fn wait_completion_async(&mut self, timeout: Duration) -> XdmaResult<()> {
        if self.is_polling() {
            let deadline = Instant::now() + timeout;
            let result = loop {
                match self.poll_step() {
                    Ok(true) => break Ok(()),
                    Ok(false) => {}
                    Err(e) => break Err(e),
                }
                if Instant::now() >= deadline {
                    break Err(XdmaError::Timeout);
                }
                tokio::task::yield_now().await;
            };
            return self.finish_poll(result);
        }
        if !self.core.event.wait_async(timeout).await {
            return Err(err_log("wait_completion", XdmaError::Timeout));
        }
        self.check_outcome()
    }

    fn check_outcome(&self) -> XdmaResult<()> {
        let outcome = self.core.outcome_lock().take();
        match outcome {
            Some(o) if o.status.is_error() => Err(err_log(
                "wait_completion",
                XdmaError::DmaError {
                    status: o.status.bits(),
                },
            )),
            Some(o) => {
                log::trace!(
                    "{}: {} descriptors completed, status {:#x}",
                    self.core.id,
                    o.completed,
                    o.status.bits()
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Read the engine status register, clearing it if `clear` is set.
    pub fn engine_status_read(&self, clear: bool) -> XdmaResult<StatusFlags> {
        self.core.regs.status(clear).record("engine_status_read")
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Arm a transaction session and program its first sub-transfer.
    ///
    /// `context` replaces the completion context when given.
    pub fn transaction_execute(&mut self, context: Option<CompletionContext>) -> XdmaResult<()> {
        const CTX: &str = "transaction_execute";
        let Some(transaction) = self.transaction.as_mut() else {
            return Err(err_log(
                CTX,
                XdmaError::InvalidParameter("not a transaction session".into()),
            ));
        };
        if let Some(ctx) = context {
            *self.core.context_lock() = Some(ctx);
        }

        let core = &self.core;
        let ring = &mut self.ring;
        let fpga_offset = self.fpga_offset;
        let adjacent = self.device.adjacent_descriptors();
        let mut programmed = 0;
        transaction
            .execute(|w| {
                let card = if core.mode.non_incrementing {
                    fpga_offset
                } else {
                    fpga_offset + w.offset
                };
                programmed = program_ring(&core.regs, ring, &w.entries, &core.mode, card, adjacent)?;
                Ok(())
            })
            .record(CTX)?;
        self.ring_len = programmed;
        log::debug!(
            "{}: transaction armed, {} sub-transfers",
            core.id,
            transaction.window_count()
        );
        Ok(())
    }

    /// Account for the completion of the current sub-transfer.
    ///
    /// Returns [`TransferState::MoreRequired`] after programming the next
    /// sub-transfer (start the engine again), or [`TransferState::Complete`].
    pub fn transaction_transfer_ended(&mut self) -> XdmaResult<TransferState> {
        const CTX: &str = "transaction_transfer_ended";
        let Some(transaction) = self.transaction.as_mut() else {
            return Err(err_log(
                CTX,
                XdmaError::InvalidParameter("not a transaction session".into()),
            ));
        };

        let core = &self.core;
        let ring = &mut self.ring;
        let fpga_offset = self.fpga_offset;
        let adjacent = self.device.adjacent_descriptors();
        let mut programmed = 0;
        let state = transaction
            .transfer_completed(|w| {
                let card = if core.mode.non_incrementing {
                    fpga_offset
                } else {
                    fpga_offset + w.offset
                };
                programmed = program_ring(&core.regs, ring, &w.entries, &core.mode, card, adjacent)?;
                Ok(())
            })
            .record(CTX)?;
        self.ring_len = match state {
            TransferState::MoreRequired => programmed,
            TransferState::Complete => 0,
        };
        log::debug!("{}: sub-transfer ended, {:?}", core.id, state);
        Ok(state)
    }

    /// Return the transaction to an armable state.
    pub fn transaction_release(&mut self) -> XdmaResult<()> {
        let Some(transaction) = self.transaction.as_mut() else {
            return Err(err_log(
                "transaction_release",
                XdmaError::InvalidParameter("not a transaction session".into()),
            ));
        };
        transaction.release();
        self.ring_len = 0;
        Ok(())
    }

    fn shutdown(&mut self) -> XdmaResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let stopped = self.core.regs.stop(&self.core.mode);
        self.device.shared().slots[self.slot].release();
        log::debug!("{}: closed", self.core.id);
        stopped.record("dma_close")
    }

    /// Stop the engine, detach the session and release its buffers.
    pub fn close(mut self) -> XdmaResult<()> {
        self.shutdown()
    }
}

impl Drop for DmaSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("session close failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescControl, DESC_MAGIC};
    use crate::host::sim::{SimCard, SimHost, SIM_PAGE_SIZE};
    use crate::interrupt::{IntHandler, InterruptResult};
    use crate::regs::ControlFlags;
    use crate::Xdma;
    use std::sync::mpsc;

    const VID: u16 = 0x10EE;
    const DID: u16 = 0x9038;
    const WAIT: Duration = Duration::from_secs(5);

    fn open(card: SimCard) -> (Arc<SimHost>, Xdma, Device) {
        let host = Arc::new(SimHost::new(card));
        let xdma = Xdma::init(host.clone()).unwrap();
        let dev = xdma.device_open(VID, DID).unwrap();
        (host, xdma, dev)
    }

    fn h2c(ch: u32) -> EngineId {
        EngineId::new(Direction::ToDevice, ch)
    }

    fn c2h(ch: u32) -> EngineId {
        EngineId::new(Direction::CardToHost, ch)
    }

    fn fill_u32(buf: &mut [u8], value: u32) {
        for chunk in buf.chunks_exact_mut(4) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
    }

    fn recording_handler() -> (IntHandler, mpsc::Receiver<InterruptResult>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: IntHandler = Arc::new(move |_: &Device, res: &InterruptResult| {
            let _ = tx.lock().unwrap().send(res.clone());
        });
        (handler, rx)
    }

    #[test]
    fn test_h2c_polling_4k() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let sim = host.device();
        crate::error::clear_last_err();

        let opts = DmaOptions::new(Direction::ToDevice, 0, 4096).polling(true);
        let mut s = dev.dma_open(&opts).unwrap();
        assert!(s.is_to_device() && s.is_polling());
        fill_u32(s.buffer_mut(), 0xDEAD_BEEF);

        s.transfer_start().unwrap();
        s.poll_completion().unwrap();

        assert_eq!(s.descriptors().len(), 4096usize.div_ceil(SIM_PAGE_SIZE));
        let Completion::PollWord(wb) = &s.completion else {
            panic!("polling session without write-back word");
        };
        // SAFETY: the write-back buffer holds one record.
        let word = unsafe { PollWriteBack::read_word(wb.as_ptr().cast::<PollWriteBack>()) };
        assert_eq!(PollWriteBack::completed_descs(word) as usize, s.descriptors().len());
        assert!(!PollWriteBack::is_error(word));
        assert!(crate::error::get_last_err().is_empty());
        let card = sim.card_read(0, 4096);
        assert!(card
            .chunks_exact(4)
            .all(|c| c == 0xDEAD_BEEFu32.to_le_bytes()));
        assert!(!sim.engine_control(h2c(0)).contains(ControlFlags::RUN));
        s.close().unwrap();
    }

    #[test]
    fn test_descriptor_invariants() {
        let (_host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let bytes = 5 * SIM_PAGE_SIZE + 100;
        let s = dev
            .dma_open(
                &DmaOptions::new(Direction::ToDevice, 0, bytes)
                    .fpga_offset(0x2000)
                    .polling(true),
            )
            .unwrap();

        let descs = s.descriptors();
        let pages = s.page_list();
        assert_eq!(descs.len(), pages.len());
        let total: u64 = descs.iter().map(|d| u64::from(d.bytes())).sum();
        assert_eq!(total, bytes as u64);

        let mut card = 0x2000;
        for (i, (d, p)) in descs.iter().zip(pages).enumerate() {
            assert_eq!(d.control() & 0xFFFF_0000, DESC_MAGIC);
            assert_eq!(d.src_addr(), p.phys);
            assert_eq!(d.dst_addr(), card);
            card += u64::from(d.bytes());
            let last = i == descs.len() - 1;
            assert_eq!(d.flags().contains(DescControl::LAST), last);
        }
    }

    #[test]
    fn test_non_incrementing_fixed_address() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let mut s = dev
            .dma_open(
                &DmaOptions::new(Direction::CardToHost, 0, 3 * SIM_PAGE_SIZE)
                    .fpga_offset(0x800)
                    .polling(true)
                    .non_incrementing(true),
            )
            .unwrap();
        assert!(s.descriptors().iter().all(|d| d.src_addr() == 0x800));

        host.device().card_write(0x800, &[0x5A; SIM_PAGE_SIZE]);
        s.transfer_start().unwrap();
        assert!(host
            .device()
            .engine_control(c2h(0))
            .contains(ControlFlags::NON_INCR_ADDR));
        s.poll_completion().unwrap();
        assert!(s.buffer().iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_c2h_interrupt_16k() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(2));
        let sim = host.device();
        let (handler, rx) = recording_handler();
        dev.int_enable(handler).unwrap();

        let pattern: Vec<u8> = (0..16384u32).map(|i| (i * 7 + 3) as u8).collect();
        sim.card_write(0x1000, &pattern);

        let ctx: CompletionContext = Arc::new(42u32);
        let opts = DmaOptions::new(Direction::CardToHost, 1, 16384)
            .fpga_offset(0x1000)
            .context(ctx);
        let mut s = dev.dma_open(&opts).unwrap();
        s.transfer_start().unwrap();
        s.wait_completion(WAIT).unwrap();

        let res = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(res.session, s.id());
        assert_eq!(res.engine, c2h(1));
        assert!(!res.dma_status.intersects(StatusFlags::READ_ERROR));
        let mask = dev.engine(c2h(1)).unwrap().irq_mask;
        assert_ne!(res.int_status & mask, 0);
        assert_eq!(res.completed_descs as usize, s.descriptors().len());
        assert!(res.is_message_based());
        let value = res.context.unwrap().downcast::<u32>().unwrap();
        assert_eq!(*value, 42);
        // exactly once
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        assert_eq!(s.buffer(), &pattern[..]);
        s.close().unwrap();
        dev.int_disable().unwrap();
    }

    #[test]
    fn test_restart_without_reallocation() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let sim = host.device();
        let mut s = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 8192).polling(true))
            .unwrap();
        let pins = sim.pin_count();
        for round in 0..3u8 {
            s.buffer_mut().fill(round);
            s.transfer_start().unwrap();
            s.wait_completion(WAIT).unwrap();
            assert!(sim.card_read(0, 8192).iter().all(|&b| b == round));
        }
        assert_eq!(sim.pin_count(), pins);
        assert_eq!(sim.engine_runs(h2c(0)), 3);
    }

    #[test]
    fn test_misaligned_length() {
        let id = h2c(0);
        // align 64, granularity 4
        let card = SimCard::new(VID, DID)
            .with_channels(1)
            .alignments(id, 0x0040_0440);
        let (host, _xdma, dev) = open(card);
        let sim = host.device();

        let err = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4095))
            .unwrap_err();
        assert!(matches!(err, XdmaError::Misaligned(_)));
        assert_eq!(sim.pin_count(), 0);
        assert!(!dev.engine(id).unwrap().initialized);
        assert!(crate::error::get_last_err().contains("dma_open"));

        // Offset and buffer disagree modulo 64.
        let err = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096).fpga_offset(0x10))
            .unwrap_err();
        assert!(matches!(err, XdmaError::Misaligned(_)));
        assert!(dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096).fpga_offset(0x40))
            .is_ok());
    }

    #[test]
    fn test_streaming_requires_aligned_buffer_only() {
        let id = c2h(0);
        let card = SimCard::new(VID, DID)
            .with_channels(1)
            .streaming(id)
            .alignments(id, 0x0040_0140);
        let (_host, _xdma, dev) = open(card);
        assert!(dev.engine(id).unwrap().streaming);
        // Card offsets mean nothing for a stream.
        assert!(dev
            .dma_open(&DmaOptions::new(Direction::CardToHost, 0, 4096).fpga_offset(0x3))
            .is_ok());
    }

    #[test]
    fn test_non_incrementing_misaligned_offset() {
        let id = h2c(0);
        // align 64, granularity 4
        let card = SimCard::new(VID, DID)
            .with_channels(1)
            .alignments(id, 0x0040_0440);
        let (host, _xdma, dev) = open(card);

        let fixed = |bytes: usize, offset: u64| {
            DmaOptions::new(Direction::ToDevice, 0, bytes)
                .fpga_offset(offset)
                .non_incrementing(true)
        };
        assert!(matches!(
            dev.dma_open(&fixed(4096, 0x20)),
            Err(XdmaError::Misaligned(_))
        ));
        assert!(matches!(
            dev.dma_open(&fixed(4094, 0x40)),
            Err(XdmaError::Misaligned(_))
        ));
        assert_eq!(host.device().pin_count(), 0);
        assert!(dev.dma_open(&fixed(4096, 0x40)).is_ok());
    }

    #[test]
    fn test_streaming_length_granularity() {
        let id = c2h(0);
        // align 64, granularity 8
        let card = SimCard::new(VID, DID)
            .with_channels(1)
            .streaming(id)
            .alignments(id, 0x0040_0840);
        let (_host, _xdma, dev) = open(card);
        assert!(matches!(
            dev.dma_open(&DmaOptions::new(Direction::CardToHost, 0, 4100)),
            Err(XdmaError::Misaligned(_))
        ));
        assert!(dev
            .dma_open(&DmaOptions::new(Direction::CardToHost, 0, 4104))
            .is_ok());
    }

    #[test]
    fn test_alignment_of_buffer_address() {
        // Session buffers are page aligned, so only odd addresses reach this.
        let raw = 0x0040_0440;
        let fixed = DmaOptions::new(Direction::ToDevice, 0, 4096).non_incrementing(true);
        assert!(matches!(
            check_alignment(raw, 0x1010, &fixed, false),
            Err(XdmaError::Misaligned(_))
        ));
        assert!(matches!(
            check_alignment(raw, 0x1010, &DmaOptions::new(Direction::CardToHost, 0, 4096), true),
            Err(XdmaError::Misaligned(_))
        ));
        assert!(check_alignment(raw, 0x1040, &fixed, false).is_ok());

        // Incrementing engines only need matching low bits.
        let moving = DmaOptions::new(Direction::ToDevice, 0, 4096).fpga_offset(0x2010);
        assert!(check_alignment(raw, 0x1010, &moving, false).is_ok());
        assert!(check_alignment(raw, 0x1020, &moving, false).is_err());
    }

    #[test]
    fn test_zero_alignments_register_skips_check() {
        let id = h2c(0);
        let card = SimCard::new(VID, DID).with_channels(1).alignments(id, 0);
        let (_host, _xdma, dev) = open(card);
        assert!(dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4095).fpga_offset(0x7))
            .is_ok());
    }

    #[test]
    fn test_open_validation() {
        let card = SimCard::new(VID, DID)
            .with_engine(Direction::ToDevice, 0)
            .with_engine(Direction::ToDevice, 1)
            .reported_channel(h2c(1), 2);
        let (_host, _xdma, dev) = open(card);

        let err = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 4, 4096))
            .unwrap_err();
        assert!(matches!(
            err,
            XdmaError::ChannelInvalid {
                channel: 4,
                reported: None
            }
        ));

        let err = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 1, 4096))
            .unwrap_err();
        assert!(matches!(
            err,
            XdmaError::ChannelInvalid {
                channel: 1,
                reported: Some(2)
            }
        ));

        let err = dev
            .dma_open(&DmaOptions::new(Direction::CardToHost, 0, 4096))
            .unwrap_err();
        assert!(matches!(err, XdmaError::EngineAbsent(id) if id == c2h(0)));

        // An absent engine reads back a zero identifier. Its channel field
        // is checked before the slot, so only channel 0 reports absence.
        let err = dev
            .dma_open(&DmaOptions::new(Direction::CardToHost, 1, 4096))
            .unwrap_err();
        assert!(matches!(
            err,
            XdmaError::ChannelInvalid {
                channel: 1,
                reported: Some(0)
            }
        ));

        assert!(matches!(
            dev.dma_open(&DmaOptions::new(Direction::ToDevice, 0, 0)),
            Err(XdmaError::InvalidParameter(_))
        ));

        let first = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096))
            .unwrap();
        let err = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096))
            .unwrap_err();
        assert!(matches!(err, XdmaError::AlreadyOpen(id) if id == h2c(0)));
        assert_eq!(err.code(), 0x2000_000E);

        drop(first);
        assert!(dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096))
            .is_ok());
    }

    #[test]
    fn test_open_rollback_on_allocation_failure() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let sim = host.device();
        // The write-back buffer is the first coherent allocation.
        sim.fail_coherent_allocs(1);
        let err = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096).polling(true))
            .unwrap_err();
        assert!(matches!(err, XdmaError::ResourceExhausted(_)));
        assert_eq!(sim.active_pins(), 0);
        assert_eq!(sim.active_coherent(), 0);
        assert!(!dev.engine(h2c(0)).unwrap().initialized);

        // Without a write-back buffer the descriptor ring is the first one.
        sim.fail_coherent_allocs(1);
        let err = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096))
            .unwrap_err();
        assert!(matches!(err, XdmaError::ResourceExhausted(_)));
        assert_eq!(sim.active_pins(), 0);

        let s = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096).polling(true))
            .unwrap();
        assert_eq!(sim.active_coherent(), 2);
        drop(s);
        assert_eq!(sim.active_coherent(), 0);
    }

    #[test]
    fn test_dma_error_polling() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let sim = host.device();
        let mut s = dev
            .dma_open(&DmaOptions::new(Direction::CardToHost, 0, 4096).polling(true))
            .unwrap();
        sim.fail_next_transfer(c2h(0));
        s.transfer_start().unwrap();
        let err = s.poll_completion().unwrap_err();
        let XdmaError::DmaError { status } = err else {
            panic!("unexpected error {err:?}");
        };
        assert!(StatusFlags::from_bits_retain(status).is_error());
        assert!(!sim.engine_control(c2h(0)).contains(ControlFlags::RUN));

        // The session stays usable.
        s.transfer_start().unwrap();
        s.poll_completion().unwrap();
    }

    #[test]
    fn test_dma_error_with_failing_status_read() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let sim = host.device();
        let mut s = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096).polling(true))
            .unwrap();
        sim.fail_next_transfer(h2c(0));
        s.transfer_start().unwrap();

        sim.fail_bar_access(true);
        let err = s.poll_completion().unwrap_err();
        assert!(matches!(err, XdmaError::HostService(_)), "unexpected error {err:?}");
        sim.fail_bar_access(false);

        s.transfer_start().unwrap();
        s.poll_completion().unwrap();
        s.close().unwrap();
    }

    #[test]
    fn test_dma_error_interrupt() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let sim = host.device();
        let (handler, rx) = recording_handler();
        dev.int_enable(handler).unwrap();
        let mut s = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096))
            .unwrap();
        sim.fail_next_transfer(h2c(0));
        s.transfer_start().unwrap();
        assert!(matches!(
            s.wait_completion(WAIT),
            Err(XdmaError::DmaError { .. })
        ));
        assert!(rx.recv_timeout(WAIT).unwrap().dma_status.is_error());
        drop(s);
        dev.int_disable().unwrap();
    }

    #[test]
    fn test_poll_spin_limit_times_out() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let sim = host.device();
        sim.hold_engine(h2c(0), true);
        let mut s = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096).polling(true))
            .unwrap();
        s.set_poll_spin_limit(Some(100));
        s.transfer_start().unwrap();
        assert!(matches!(s.poll_completion(), Err(XdmaError::Timeout)));
        assert!(!sim.engine_control(h2c(0)).contains(ControlFlags::RUN));
    }

    #[test]
    fn test_interrupt_wait_timeout_keeps_session() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let sim = host.device();
        let (handler, _rx) = recording_handler();
        dev.int_enable(handler).unwrap();
        sim.hold_engine(c2h(0), true);

        let mut s = dev
            .dma_open(&DmaOptions::new(Direction::CardToHost, 0, 4096))
            .unwrap();
        s.transfer_start().unwrap();
        assert!(matches!(
            s.wait_completion(Duration::from_millis(50)),
            Err(XdmaError::Timeout)
        ));
        assert!(s.engine_status_read(false).unwrap().contains(StatusFlags::BUSY));

        // Releasing the engine completes the held run.
        sim.hold_engine(c2h(0), false);
        s.wait_completion(WAIT).unwrap();
        dev.int_disable().unwrap();
    }

    #[test]
    fn test_close_in_flight_stops_and_unpins() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let sim = host.device();
        sim.hold_engine(h2c(0), true);
        let mut s = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 3 * 4096).polling(true))
            .unwrap();
        s.transfer_start().unwrap();
        assert!(sim.engine_control(h2c(0)).contains(ControlFlags::RUN));
        assert_eq!(sim.active_pins(), 1);

        s.close().unwrap();
        assert!(!sim.engine_control(h2c(0)).contains(ControlFlags::RUN));
        assert_eq!(sim.active_pins(), 0);
        assert_eq!(sim.active_coherent(), 0);
        assert!(!dev.engine(h2c(0)).unwrap().initialized);
    }

    #[test]
    fn test_transaction_large_c2h() {
        const BYTES: usize = 20 << 20;
        let card = SimCard::new(VID, DID)
            .with_channels(1)
            .card_memory(BYTES + 0x1000);
        let (host, _xdma, dev) = open(card);
        let sim = host.device();
        let pattern: Vec<u8> = (0..BYTES).map(|i| (i % 251) as u8).collect();
        sim.card_write(0x1000, &pattern);

        let mut s = dev
            .dma_open(
                &DmaOptions::new(Direction::CardToHost, 0, BYTES)
                    .fpga_offset(0x1000)
                    .polling(true)
                    .transaction(true),
            )
            .unwrap();
        assert!(s.transfer_start().is_err());

        s.transaction_execute(Some(Arc::new("bulk"))).unwrap();
        assert!(matches!(
            s.transaction_execute(None),
            Err(XdmaError::AlreadyDone(_))
        ));
        let mut windows = 0;
        loop {
            let window: u64 = s.descriptors().iter().map(|d| u64::from(d.bytes())).sum();
            assert!(window <= u64::from(MAX_TRANSACTION_TRANSFER));
            s.transfer_start().unwrap();
            s.wait_completion(WAIT).unwrap();
            windows += 1;
            if s.transaction_transfer_ended().unwrap() == TransferState::Complete {
                break;
            }
        }
        assert_eq!(windows, 2);
        assert!(s.buffer() == &pattern[..]);
        assert!(s.context().is_some());

        s.transaction_release().unwrap();
        s.transaction_execute(None).unwrap();
    }

    #[test]
    fn test_transaction_calls_on_plain_session() {
        let (_host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let mut s = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096))
            .unwrap();
        assert!(s.transaction_execute(None).is_err());
        assert!(s.transaction_transfer_ended().is_err());
        assert!(s.transaction_release().is_err());
    }

    #[cfg(feature = "async")]
    #[test]
    fn test_wait_completion_async() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (_host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let (handler, _rx) = recording_handler();
        dev.int_enable(handler).unwrap();
        let mut s = dev
            .dma_open(&DmaOptions::new(Direction::ToDevice, 0, 4096))
            .unwrap();
        s.transfer_start().unwrap();
        rt.block_on(s.wait_completion_async(WAIT)).unwrap();
        dev.int_disable().unwrap();
    }
}
