// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software model of an XDMA card.
//!
//! [`SimHost`] implements the host-DMA service for one simulated PCIe
//! function. The model covers what the engine driver relies on:
//!
//! - identifier registers on the configured BAR, alignments registers and
//!   per-engine streaming bits;
//! - engines that walk descriptor chains in host memory when the RUN bit is
//!   written, moving data between pinned host buffers and card memory;
//! - poll-mode write-back, status and completed-descriptor registers;
//! - the IRQ block with enable masks, a latched request register and a
//!   dispatch thread that plays the role of the interrupt handler.
//!
//! Physical addresses are identity-mapped: the "bus address" of host memory
//! is its virtual address. The engines only touch memory that is currently
//! pinned or allocated as coherent memory; anything else is reported as an
//! engine error, the same way an IOMMU fault would show up.
//!
//! Test hooks allow injecting phantom interrupt bits, dropping interrupts,
//! failing transfers and allocations, and holding an engine busy.

use super::{
    BarInfo, CoherentAlloc, DmaHandle, EventCallback, EventMask, HostDevice, HostDma,
    InterruptCallback, InterruptSnapshot, InterruptType, PinOptions, SgEntry, SgList,
    TransferCmd,
};
use crate::descriptor::{DescControl, XdmaDesc, DESC_SIZE, WB_ERROR};
use crate::error::{HostError, HostResult};
use crate::regs::{
    self, channel, config, irq, sgdma, ControlFlags, Direction, EngineId, StatusFlags,
    ENGINES_NUM,
};
use std::alloc::{self, Layout};
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};

/// Page size of the simulated host.
pub const SIM_PAGE_SIZE: usize = 4096;

/// Default card memory size.
const DEFAULT_CARD_MEMORY: usize = 1 << 20;

/// Default alignments register: byte alignment, byte granularity, 64 address bits.
const DEFAULT_ALIGNMENTS: u32 = 0x0001_0140;

/// Longest descriptor chain an engine follows before flagging an error.
const MAX_CHAIN: usize = 1 << 16;

const IRQ_BLOCK_ID: u32 = 0x1FC2_0006;
const CONFIG_BLOCK_ID: u32 = 0x1FC3_0006;
const H2C_SGDMA_ID: u32 = 0x1FC4_0006;
const C2H_SGDMA_ID: u32 = 0x1FC5_0006;

/// Configuration of one simulated engine.
#[derive(Debug, Clone, Copy)]
pub struct SimEngine {
    pub id: EngineId,
    pub streaming: bool,
    /// Raw alignments register value.
    pub alignments: u32,
    /// Channel number reported by the identifier register.
    pub reported_channel: u32,
}

/// Static description of a simulated card.
#[derive(Debug, Clone)]
pub struct SimCard {
    pub vendor_id: u16,
    pub device_id: u16,
    /// BAR sizes; 0 marks an unimplemented BAR.
    pub bar_sizes: Vec<u64>,
    /// BAR carrying the XDMA register space.
    pub config_bar: usize,
    /// False models a device whose BARs carry no XDMA identifiers.
    pub xdma_identifiers: bool,
    pub engines: Vec<SimEngine>,
    pub card_memory: usize,
    pub int_type: InterruptType,
    pub interrupt_pin: u8,
}

impl SimCard {
    /// A card with a user BAR 0 and the XDMA registers in BAR 1, no engines.
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        Self {
            vendor_id,
            device_id,
            bar_sizes: vec![0x10_0000, 0x1_0000],
            config_bar: 1,
            xdma_identifiers: true,
            engines: Vec::new(),
            card_memory: DEFAULT_CARD_MEMORY,
            int_type: InterruptType::Msi,
            interrupt_pin: 1,
        }
    }

    /// Add an engine.
    pub fn with_engine(mut self, direction: Direction, channel: u32) -> Self {
        self.engines.push(SimEngine {
            id: EngineId::new(direction, channel),
            streaming: false,
            alignments: DEFAULT_ALIGNMENTS,
            reported_channel: channel,
        });
        self
    }

    /// Add H2C and C2H engines on channels `0..channels`.
    pub fn with_channels(mut self, channels: u32) -> Self {
        for dir in [Direction::ToDevice, Direction::CardToHost] {
            for ch in 0..channels {
                self = self.with_engine(dir, ch);
            }
        }
        self
    }

    fn engine_mut(&mut self, id: EngineId) -> Option<&mut SimEngine> {
        self.engines.iter_mut().find(|e| e.id == id)
    }

    /// Mark an engine as AXI4-Stream.
    pub fn streaming(mut self, id: EngineId) -> Self {
        if let Some(e) = self.engine_mut(id) {
            e.streaming = true;
        }
        self
    }

    /// Set the raw alignments register of an engine.
    pub fn alignments(mut self, id: EngineId, raw: u32) -> Self {
        if let Some(e) = self.engine_mut(id) {
            e.alignments = raw;
        }
        self
    }

    /// Make an engine's identifier report another channel number.
    pub fn reported_channel(mut self, id: EngineId, channel: u32) -> Self {
        if let Some(e) = self.engine_mut(id) {
            e.reported_channel = channel;
        }
        self
    }

    pub fn card_memory(mut self, bytes: usize) -> Self {
        self.card_memory = bytes;
        self
    }

    pub fn int_type(mut self, int_type: InterruptType) -> Self {
        self.int_type = int_type;
        self
    }

    /// Place the XDMA registers in another BAR.
    pub fn config_bar(mut self, bar_sizes: Vec<u64>, config_bar: usize) -> Self {
        self.bar_sizes = bar_sizes;
        self.config_bar = config_bar;
        self
    }

    /// Remove the XDMA identifiers from all BARs.
    pub fn without_xdma(mut self) -> Self {
        self.xdma_identifiers = false;
        self
    }
}

// ============================================================================
// Host service
// ============================================================================

/// Host-DMA service backed by a single simulated card.
pub struct SimHost {
    device: Arc<SimDevice>,
    driver_open: AtomicBool,
}

impl SimHost {
    pub fn new(card: SimCard) -> Self {
        Self {
            device: SimDevice::new(card),
            driver_open: AtomicBool::new(false),
        }
    }

    /// The simulated device, for inspection and fault injection.
    pub fn device(&self) -> Arc<SimDevice> {
        Arc::clone(&self.device)
    }

    /// Returns true between `open` and `close`.
    pub fn is_open(&self) -> bool {
        self.driver_open.load(Ordering::Acquire)
    }
}

impl HostDma for SimHost {
    fn open(&self) -> HostResult<()> {
        if self.driver_open.swap(true, Ordering::AcqRel) {
            return Err(HostError::Busy("driver already open".into()));
        }
        Ok(())
    }

    fn close(&self) {
        self.driver_open.store(false, Ordering::Release);
    }

    fn device_open(&self, vendor: u16, device: u16) -> HostResult<Arc<dyn HostDevice>> {
        let card = &self.device.card;
        if card.vendor_id != vendor || card.device_id != device {
            return Err(HostError::DeviceNotFound { vendor, device });
        }
        if self.device.open.swap(true, Ordering::AcqRel) {
            return Err(HostError::Busy(format!("{vendor:04x}:{device:04x}")));
        }
        Ok(Arc::clone(&self.device) as Arc<dyn HostDevice>)
    }
}

// ============================================================================
// Device model
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct EngineState {
    present: bool,
    streaming: bool,
    identifier: u32,
    alignments: u32,
    irq_bit: u32,
    control: u32,
    status: u32,
    completed: u32,
    int_mask: u32,
    wb_lo: u32,
    wb_hi: u32,
    desc_lo: u32,
    desc_hi: u32,
    adjacent: u32,
    perf_cycles: u64,
    perf_data: u64,
    runs: u64,
    hold: bool,
    held_run: bool,
    fail_next: bool,
}

#[derive(Debug, Clone, Copy)]
enum RegionKind {
    Pinned,
    Coherent,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    len: usize,
    kind: RegionKind,
}

struct IntRegistration {
    cmds: Vec<TransferCmd>,
    callback: InterruptCallback,
}

struct SimState {
    engines: [EngineState; ENGINES_NUM],
    user_int_enable: u32,
    channel_int_enable: u32,
    user_int_request: u32,
    forced_channel_request: u32,
    channel_vector: [u32; 2],
    user_vector: [u32; 4],
    card_mem: Vec<u8>,
    regions: BTreeMap<u64, Region>,
    pins: HashMap<u64, u64>,
    coherent: HashMap<u64, (NonNull<u8>, Layout)>,
    next_handle: u64,
    pin_count: u64,
    sync_count: u64,
    fail_coherent: u32,
    fail_bar_access: bool,
    int: Option<IntRegistration>,
    int_counter: u64,
    int_lost: u64,
    drop_next: u32,
    event: Option<(EventMask, EventCallback)>,
}

// SAFETY: the raw pointers refer to allocations owned by the state.
unsafe impl Send for SimState {}

#[derive(Default)]
struct IrqQueue {
    pending: u32,
    stop: bool,
}

#[derive(Default)]
struct IrqLine {
    queue: Mutex<IrqQueue>,
    cv: Condvar,
}

struct Dispatcher {
    thread: JoinHandle<()>,
    id: ThreadId,
    line: Arc<IrqLine>,
}

/// One simulated XDMA card.
pub struct SimDevice {
    me: Weak<SimDevice>,
    card: SimCard,
    config_space: [u8; 256],
    state: Mutex<SimState>,
    dispatcher: Mutex<Option<Dispatcher>>,
    open: AtomicBool,
}

impl SimDevice {
    fn new(card: SimCard) -> Arc<Self> {
        let mut engines = [EngineState::default(); ENGINES_NUM];
        for e in &card.engines {
            let st = &mut engines[e.id.index()];
            st.present = true;
            st.streaming = e.streaming;
            st.alignments = e.alignments;
            let mut ident = (e.id.expected_identifier() & !regs::ID_CHANNEL_MASK)
                | (e.reported_channel << regs::ID_CHANNEL_SHIFT)
                | 0x06;
            if e.streaming {
                ident |= regs::ID_STREAMING;
            }
            st.identifier = ident;
        }
        let mut bit = 0;
        for st in engines.iter_mut().filter(|e| e.present) {
            st.irq_bit = 1 << bit;
            bit += 1;
        }

        let mut config_space = [0u8; 256];
        config_space[0..2].copy_from_slice(&card.vendor_id.to_le_bytes());
        config_space[2..4].copy_from_slice(&card.device_id.to_le_bytes());
        config_space[usize::from(regs::PCI_INTERRUPT_PIN)] = card.interrupt_pin;

        let state = SimState {
            engines,
            user_int_enable: 0,
            channel_int_enable: 0,
            user_int_request: 0,
            forced_channel_request: 0,
            channel_vector: [0; 2],
            user_vector: [0; 4],
            card_mem: vec![0u8; card.card_memory],
            regions: BTreeMap::new(),
            pins: HashMap::new(),
            coherent: HashMap::new(),
            next_handle: 1,
            pin_count: 0,
            sync_count: 0,
            fail_coherent: 0,
            fail_bar_access: false,
            int: None,
            int_counter: 0,
            int_lost: 0,
            drop_next: 0,
            event: None,
        };

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            card,
            config_space,
            state: Mutex::new(state),
            dispatcher: Mutex::new(None),
            open: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_bar(&self, bar: usize, offset: u64) -> HostResult<()> {
        match self.card.bar_sizes.get(bar) {
            Some(&size) if size > 0 && offset + 4 <= size => Ok(()),
            _ => Err(HostError::InvalidAddress(offset)),
        }
    }

    /// Queue one interrupt for the dispatch thread.
    fn raise(&self, st: &mut SimState) {
        if st.int.is_none() {
            st.int_lost += 1;
            return;
        }
        if st.drop_next > 0 {
            st.drop_next -= 1;
            st.int_lost += 1;
            return;
        }
        let guard = self.dispatcher.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(d) = guard.as_ref() {
            let mut q = d.line.queue.lock().unwrap_or_else(|p| p.into_inner());
            q.pending += 1;
            d.line.cv.notify_one();
        }
    }

    fn dispatch_loop(self: Arc<Self>, line: Arc<IrqLine>) {
        loop {
            {
                let mut q = line.queue.lock().unwrap_or_else(|p| p.into_inner());
                while q.pending == 0 && !q.stop {
                    q = line.cv.wait(q).unwrap_or_else(|p| p.into_inner());
                }
                if q.stop {
                    return;
                }
                q.pending -= 1;
            }

            let upcall = {
                let mut st = self.lock();
                let Some(reg) = st.int.as_ref() else {
                    continue;
                };
                let cmds = reg.cmds.clone();
                let callback = Arc::clone(&reg.callback);
                let mut latched = Vec::with_capacity(cmds.len());
                for cmd in cmds {
                    match cmd {
                        TransferCmd::Read32 { bar, offset } => {
                            latched.push(st.read(&self.card, bar, offset));
                        }
                        TransferCmd::Write32 { bar, offset, value } => {
                            if st.write(&self.card, bar, offset, value) {
                                self.raise(&mut st);
                            }
                        }
                    }
                }
                st.int_counter += 1;
                let snapshot = InterruptSnapshot {
                    latched,
                    counter: st.int_counter,
                    lost: st.int_lost,
                    int_type: self.card.int_type,
                    last_message: match self.card.int_type {
                        InterruptType::Line => 0,
                        _ => st.int_counter as u32,
                    },
                };
                (callback, snapshot)
            };

            let (callback, snapshot) = upcall;
            callback(&snapshot);
        }
    }

    fn stop_dispatcher(&self) {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(d) = dispatcher {
            {
                let mut q = d.line.queue.lock().unwrap_or_else(|p| p.into_inner());
                q.stop = true;
                d.line.cv.notify_all();
            }
            // The upcall itself may tear interrupts down; it cannot join itself.
            if d.id != thread::current().id() && d.thread.join().is_err() {
                log::error!("simulated interrupt thread panicked");
            }
        }
    }

    // ------------------------------------------------------------------
    // Test hooks
    // ------------------------------------------------------------------

    /// Copy `len` bytes of card memory starting at `offset`.
    pub fn card_read(&self, offset: usize, len: usize) -> Vec<u8> {
        let st = self.lock();
        st.card_mem[offset..offset + len].to_vec()
    }

    /// Write `data` into card memory at `offset`.
    pub fn card_write(&self, offset: usize, data: &[u8]) {
        let mut st = self.lock();
        st.card_mem[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Raw control register of an engine.
    pub fn engine_control(&self, id: EngineId) -> ControlFlags {
        ControlFlags::from_bits_retain(self.lock().engines[id.index()].control)
    }

    /// Raw interrupt enable mask of an engine.
    pub fn engine_int_mask(&self, id: EngineId) -> u32 {
        self.lock().engines[id.index()].int_mask
    }

    /// Number of times an engine processed a descriptor list.
    pub fn engine_runs(&self, id: EngineId) -> u64 {
        self.lock().engines[id.index()].runs
    }

    pub fn channel_int_enable(&self) -> u32 {
        self.lock().channel_int_enable
    }

    pub fn user_int_enable(&self) -> u32 {
        self.lock().user_int_enable
    }

    /// Channel vector registers (written for line interrupts).
    pub fn channel_vectors(&self) -> [u32; 2] {
        self.lock().channel_vector
    }

    /// Total number of pin operations performed.
    pub fn pin_count(&self) -> u64 {
        self.lock().pin_count
    }

    /// Pins currently held.
    pub fn active_pins(&self) -> usize {
        self.lock().pins.len()
    }

    /// Coherent allocations currently held.
    pub fn active_coherent(&self) -> usize {
        self.lock().coherent.len()
    }

    pub fn sync_count(&self) -> u64 {
        self.lock().sync_count
    }

    /// Interrupts dispatched and lost since the device was created.
    pub fn interrupt_counts(&self) -> (u64, u64) {
        let st = self.lock();
        (st.int_counter, st.int_lost)
    }

    /// Set bits in the channel request register for the next interrupt and raise it.
    pub fn inject_channel_irq(&self, bits: u32) {
        let mut st = self.lock();
        st.forced_channel_request |= bits;
        self.raise(&mut st);
    }

    /// Assert user interrupt lines. An interrupt is raised if any is enabled.
    pub fn raise_user_irq(&self, bits: u32) {
        let mut st = self.lock();
        st.user_int_request |= bits;
        if st.user_int_request & st.user_int_enable != 0 {
            self.raise(&mut st);
        }
    }

    /// Silently drop the next `n` interrupts.
    pub fn drop_interrupts(&self, n: u32) {
        self.lock().drop_next = n;
    }

    /// Make the next run of an engine fail with a descriptor error.
    pub fn fail_next_transfer(&self, id: EngineId) {
        self.lock().engines[id.index()].fail_next = true;
    }

    /// Fail the next `n` coherent allocations.
    pub fn fail_coherent_allocs(&self, n: u32) {
        self.lock().fail_coherent = n;
    }

    /// Make every BAR read and write through the host interface fail.
    pub fn fail_bar_access(&self, fail: bool) {
        self.lock().fail_bar_access = fail;
    }

    /// Keep an engine busy after RUN instead of processing descriptors.
    pub fn hold_engine(&self, id: EngineId, hold: bool) {
        let mut st = self.lock();
        let e = &mut st.engines[id.index()];
        e.hold = hold;
        if !hold && e.held_run {
            e.held_run = false;
            let raise = st.run_engine(&self.card, id);
            if raise {
                self.raise(&mut st);
            }
        }
    }

    /// Deliver a plug-and-play or power event.
    pub fn fire_event(&self, event: EventMask) {
        let registered = self.lock().event.clone();
        if let Some((mask, callback)) = registered {
            if mask.intersects(event) {
                callback(event & mask);
            }
        }
    }
}

impl SimState {
    fn engine_at(offset: u64) -> Option<(EngineId, u64)> {
        let dir = match offset & 0xF000 {
            regs::H2C_CHANNEL_BASE | regs::H2C_SGDMA_BASE => Direction::ToDevice,
            regs::C2H_CHANNEL_BASE | regs::C2H_SGDMA_BASE => Direction::CardToHost,
            _ => return None,
        };
        let ch = ((offset >> 8) & 0xF) as u32;
        if ch >= regs::CHANNELS_NUM {
            return None;
        }
        Some((EngineId::new(dir, ch), offset & 0xFF))
    }

    fn channel_request(&self) -> u32 {
        self.engines
            .iter()
            .filter(|e| e.present && e.status & e.int_mask != 0)
            .fold(0, |acc, e| acc | e.irq_bit)
    }

    fn read(&mut self, card: &SimCard, bar: usize, offset: u64) -> u32 {
        if bar != card.config_bar || !card.xdma_identifiers {
            return 0;
        }
        match offset & 0xF000 {
            regs::H2C_CHANNEL_BASE | regs::C2H_CHANNEL_BASE => {
                let Some((id, reg)) = Self::engine_at(offset) else {
                    return 0;
                };
                let e = &mut self.engines[id.index()];
                if !e.present {
                    return 0;
                }
                match reg {
                    channel::IDENTIFIER => e.identifier,
                    channel::CONTROL => e.control,
                    channel::STATUS => e.status,
                    channel::STATUS_RC => {
                        let status = e.status;
                        e.status &= StatusFlags::BUSY.bits();
                        status
                    }
                    channel::COMPLETED_DESC_COUNT => e.completed,
                    channel::ALIGNMENTS => e.alignments,
                    channel::POLL_WB_ADDR_LO => e.wb_lo,
                    channel::POLL_WB_ADDR_HI => e.wb_hi,
                    channel::INT_ENABLE_MASK => e.int_mask,
                    channel::PERF_CYCLE_COUNT_LO => e.perf_cycles as u32,
                    channel::PERF_CYCLE_COUNT_HI => (e.perf_cycles >> 32) as u32,
                    channel::PERF_DATA_COUNT_LO => e.perf_data as u32,
                    channel::PERF_DATA_COUNT_HI => (e.perf_data >> 32) as u32,
                    _ => 0,
                }
            }
            regs::IRQ_BLOCK_BASE => match offset {
                irq::IDENTIFIER => IRQ_BLOCK_ID,
                irq::USER_INT_ENABLE_MASK => self.user_int_enable,
                irq::CHANNEL_INT_ENABLE_MASK => self.channel_int_enable,
                irq::USER_INT_REQUEST => std::mem::take(&mut self.user_int_request),
                irq::CHANNEL_INT_REQUEST => {
                    self.channel_request() | std::mem::take(&mut self.forced_channel_request)
                }
                irq::USER_INT_PENDING => self.user_int_request & self.user_int_enable,
                irq::CHANNEL_INT_PENDING => self.channel_request() & self.channel_int_enable,
                irq::CHANNEL_VECTOR_1 => self.channel_vector[0],
                irq::CHANNEL_VECTOR_2 => self.channel_vector[1],
                o if (irq::USER_VECTOR_BASE..irq::USER_VECTOR_BASE + 16).contains(&o) => {
                    self.user_vector[((o - irq::USER_VECTOR_BASE) / 4) as usize]
                }
                _ => 0,
            },
            regs::CONFIG_BLOCK_BASE => match offset {
                config::IDENTIFIER => CONFIG_BLOCK_ID,
                config::PCIE_DATA_WIDTH => 3,
                _ => 0,
            },
            regs::H2C_SGDMA_BASE | regs::C2H_SGDMA_BASE => {
                let Some((id, reg)) = Self::engine_at(offset) else {
                    return 0;
                };
                let e = &self.engines[id.index()];
                if !e.present {
                    return 0;
                }
                match reg {
                    sgdma::IDENTIFIER => match id.direction {
                        Direction::ToDevice => H2C_SGDMA_ID | (id.channel << 8),
                        Direction::CardToHost => C2H_SGDMA_ID | (id.channel << 8),
                    },
                    sgdma::DESC_LO => e.desc_lo,
                    sgdma::DESC_HI => e.desc_hi,
                    sgdma::DESC_ADJACENT => e.adjacent,
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    /// Apply a register write. Returns true if an interrupt must be raised.
    fn write(&mut self, card: &SimCard, bar: usize, offset: u64, value: u32) -> bool {
        if bar != card.config_bar || !card.xdma_identifiers {
            return false;
        }
        match offset & 0xF000 {
            regs::H2C_CHANNEL_BASE | regs::C2H_CHANNEL_BASE => {
                let Some((id, reg)) = Self::engine_at(offset) else {
                    return false;
                };
                let e = &mut self.engines[id.index()];
                if !e.present {
                    return false;
                }
                match reg {
                    channel::CONTROL => e.control = value,
                    channel::CONTROL_W1S => e.control |= value,
                    channel::CONTROL_W1C => e.control &= !value,
                    channel::POLL_WB_ADDR_LO => e.wb_lo = value,
                    channel::POLL_WB_ADDR_HI => e.wb_hi = value,
                    channel::INT_ENABLE_MASK => e.int_mask = value,
                    channel::INT_ENABLE_MASK_W1S => e.int_mask |= value,
                    channel::INT_ENABLE_MASK_W1C => e.int_mask &= !value,
                    channel::PERF_CONTROL => {
                        if value & 0x2 != 0 {
                            e.perf_cycles = 0;
                            e.perf_data = 0;
                        }
                    }
                    _ => {}
                }
                if !matches!(
                    reg,
                    channel::CONTROL | channel::CONTROL_W1S | channel::CONTROL_W1C
                ) {
                    return false;
                }
                if e.control & ControlFlags::RUN.bits() == 0 {
                    // Clearing RUN cancels a held run.
                    e.held_run = false;
                    e.status &= !StatusFlags::BUSY.bits();
                    return false;
                }
                if reg == channel::CONTROL_W1C {
                    return false;
                }
                if e.hold {
                    e.held_run = true;
                    e.status = StatusFlags::BUSY.bits();
                    return false;
                }
                self.run_engine(card, id)
            }
            regs::IRQ_BLOCK_BASE => {
                match offset {
                    irq::USER_INT_ENABLE_MASK => self.user_int_enable = value,
                    irq::USER_INT_ENABLE_MASK_W1S => self.user_int_enable |= value,
                    irq::USER_INT_ENABLE_MASK_W1C => self.user_int_enable &= !value,
                    irq::CHANNEL_INT_ENABLE_MASK => self.channel_int_enable = value,
                    irq::CHANNEL_INT_ENABLE_MASK_W1S => self.channel_int_enable |= value,
                    irq::CHANNEL_INT_ENABLE_MASK_W1C => self.channel_int_enable &= !value,
                    irq::CHANNEL_VECTOR_1 => self.channel_vector[0] = value,
                    irq::CHANNEL_VECTOR_2 => self.channel_vector[1] = value,
                    o if (irq::USER_VECTOR_BASE..irq::USER_VECTOR_BASE + 16).contains(&o) => {
                        self.user_vector[((o - irq::USER_VECTOR_BASE) / 4) as usize] = value;
                    }
                    _ => {}
                }
                false
            }
            regs::H2C_SGDMA_BASE | regs::C2H_SGDMA_BASE => {
                if let Some((id, reg)) = Self::engine_at(offset) {
                    let e = &mut self.engines[id.index()];
                    match reg {
                        sgdma::DESC_LO => e.desc_lo = value,
                        sgdma::DESC_HI => e.desc_hi = value,
                        sgdma::DESC_ADJACENT => e.adjacent = value,
                        _ => {}
                    }
                }
                false
            }
            _ => false,
        }
    }

    /// Find the registered region holding `addr..addr + len`.
    fn host_range(&self, addr: u64, len: usize) -> Option<*mut u8> {
        let (&start, region) = self.regions.range(..=addr).next_back()?;
        let end = addr.checked_add(len as u64)?;
        if end > start + region.len as u64 {
            return None;
        }
        Some(addr as *mut u8)
    }

    fn read_desc(&self, addr: u64) -> Option<XdmaDesc> {
        let ptr = self.host_range(addr, DESC_SIZE)?;
        let mut raw = [0u8; DESC_SIZE];
        // SAFETY: the range lies inside a live coherent or pinned region.
        unsafe { std::ptr::copy_nonoverlapping(ptr, raw.as_mut_ptr(), DESC_SIZE) };
        Some(XdmaDesc::from_bytes(&raw))
    }

    /// Move the data of one descriptor. Returns false on an address fault.
    fn move_data(&mut self, dir: Direction, desc: &XdmaDesc) -> bool {
        let len = desc.bytes() as usize;
        let (host_addr, card_addr) = match dir {
            Direction::ToDevice => (desc.src_addr(), desc.dst_addr()),
            Direction::CardToHost => (desc.dst_addr(), desc.src_addr()),
        };
        let Some(host) = self.host_range(host_addr, len) else {
            return false;
        };
        let card_start = card_addr as usize;
        let Some(card) = self.card_mem.get_mut(card_start..card_start + len) else {
            return false;
        };
        // SAFETY: `host` spans `len` bytes of a live region disjoint from card memory.
        unsafe {
            match dir {
                Direction::ToDevice => std::ptr::copy_nonoverlapping(host, card.as_mut_ptr(), len),
                Direction::CardToHost => std::ptr::copy_nonoverlapping(card.as_ptr(), host, len),
            }
        }
        true
    }

    /// Process the descriptor list of an engine. Returns true if it interrupts.
    fn run_engine(&mut self, card: &SimCard, id: EngineId) -> bool {
        let idx = id.index();
        let (mut addr, fail) = {
            let e = &mut self.engines[idx];
            e.status = StatusFlags::BUSY.bits();
            e.runs += 1;
            let fail = std::mem::take(&mut e.fail_next);
            ((u64::from(e.desc_hi) << 32) | u64::from(e.desc_lo), fail)
        };

        let mut count = 0u32;
        let mut moved = 0u64;
        let mut error = StatusFlags::empty();
        let mut completed = false;
        if fail {
            error |= StatusFlags::from_bits_retain(1 << 19);
        } else {
            loop {
                let Some(desc) = self.read_desc(addr) else {
                    error |= StatusFlags::from_bits_retain(1 << 19);
                    break;
                };
                if !desc.has_magic() {
                    error |= StatusFlags::MAGIC_STOPPED;
                    break;
                }
                if !self.move_data(id.direction, &desc) {
                    error |= StatusFlags::from_bits_retain(1 << 9);
                    break;
                }
                count += 1;
                moved += u64::from(desc.bytes());
                if desc.flags().contains(DescControl::STOPPED) {
                    completed = desc.flags().contains(DescControl::COMPLETED);
                    break;
                }
                if count as usize >= MAX_CHAIN {
                    error |= StatusFlags::from_bits_retain(1 << 20);
                    break;
                }
                addr = desc.next_desc();
            }
        }

        let (control, wb_addr) = {
            let e = &mut self.engines[idx];
            let mut status = StatusFlags::DESC_STOPPED | error;
            if completed && error.is_empty() {
                status |= StatusFlags::DESC_COMPLETED;
            }
            e.status = status.bits();
            e.completed = count;
            e.perf_data += moved;
            e.perf_cycles += moved / 8 + 100;
            (e.control, (u64::from(e.wb_hi) << 32) | u64::from(e.wb_lo))
        };

        if control & ControlFlags::POLL_MODE_WB.bits() != 0 {
            let mut word = count;
            if !error.is_empty() {
                word |= WB_ERROR;
            }
            match self.host_range(wb_addr, 4) {
                // SAFETY: the write-back address lies inside a live region.
                Some(ptr) => unsafe {
                    std::ptr::write_volatile(ptr.cast::<u32>(), word.to_le());
                },
                None => log::warn!("sim: {id} write-back address {wb_addr:#x} not mapped"),
            }
        }
        fence(Ordering::SeqCst);

        let e = &self.engines[idx];
        log::trace!(
            "sim: {id} ran {count} descriptors, {moved} bytes, status {:#x}",
            e.status
        );
        e.status & e.int_mask != 0 && self.channel_int_enable & e.irq_bit != 0
    }

    fn new_handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }
}

impl HostDevice for SimDevice {
    fn page_size(&self) -> usize {
        SIM_PAGE_SIZE
    }

    fn bar_count(&self) -> usize {
        self.card.bar_sizes.len()
    }

    fn bar_info(&self, bar: usize) -> Option<BarInfo> {
        self.card.bar_sizes.get(bar).map(|&size| BarInfo {
            size,
            active: size > 0,
        })
    }

    fn read32(&self, bar: usize, offset: u64) -> HostResult<u32> {
        self.check_bar(bar, offset)?;
        let mut st = self.lock();
        if st.fail_bar_access {
            return Err(HostError::Failed(format!("BAR {bar} read at {offset:#x} failed")));
        }
        Ok(st.read(&self.card, bar, offset))
    }

    fn write32(&self, bar: usize, offset: u64, value: u32) -> HostResult<()> {
        self.check_bar(bar, offset)?;
        let mut st = self.lock();
        if st.fail_bar_access {
            return Err(HostError::Failed(format!("BAR {bar} write at {offset:#x} failed")));
        }
        if st.write(&self.card, bar, offset, value) {
            self.raise(&mut st);
        }
        Ok(())
    }

    fn config_read8(&self, offset: u16) -> HostResult<u8> {
        self.config_space
            .get(usize::from(offset))
            .copied()
            .ok_or(HostError::InvalidAddress(u64::from(offset)))
    }

    unsafe fn pin(&self, addr: *mut u8, len: usize, _options: &PinOptions) -> HostResult<SgList> {
        if addr.is_null() || len == 0 {
            return Err(HostError::InvalidAddress(addr as u64));
        }
        let start = addr as u64;
        let mut entries = Vec::new();
        let mut cur = start;
        let end = start + len as u64;
        while cur < end {
            let page_left = SIM_PAGE_SIZE as u64 - (cur % SIM_PAGE_SIZE as u64);
            let bytes = page_left.min(end - cur);
            entries.push(SgEntry {
                phys: cur,
                bytes: bytes as u32,
            });
            cur += bytes;
        }

        let mut st = self.lock();
        let handle = st.new_handle();
        st.regions.insert(
            start,
            Region {
                len,
                kind: RegionKind::Pinned,
            },
        );
        st.pins.insert(handle, start);
        st.pin_count += 1;
        Ok(SgList {
            handle: DmaHandle(handle),
            entries,
        })
    }

    fn unpin(&self, handle: DmaHandle) -> HostResult<()> {
        let mut st = self.lock();
        let start = st
            .pins
            .remove(&handle.0)
            .ok_or(HostError::Failed(format!("unknown pin {handle:?}")))?;
        st.regions.remove(&start);
        Ok(())
    }

    fn alloc_coherent(&self, len: usize, _direction: Direction) -> HostResult<CoherentAlloc> {
        let mut st = self.lock();
        if st.fail_coherent > 0 {
            st.fail_coherent -= 1;
            return Err(HostError::Failed("coherent allocation failed".into()));
        }
        let layout = Layout::from_size_align(len.max(1), SIM_PAGE_SIZE)
            .map_err(|e| HostError::Failed(e.to_string()))?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let virt = NonNull::new(ptr).ok_or(HostError::Failed("out of memory".into()))?;
        let handle = st.new_handle();
        st.regions.insert(
            ptr as u64,
            Region {
                len,
                kind: RegionKind::Coherent,
            },
        );
        st.coherent.insert(handle, (virt, layout));
        Ok(CoherentAlloc {
            handle: DmaHandle(handle),
            virt,
            phys: ptr as u64,
            len,
        })
    }

    fn free_coherent(&self, handle: DmaHandle) -> HostResult<()> {
        let mut st = self.lock();
        let (virt, layout) = st
            .coherent
            .remove(&handle.0)
            .ok_or(HostError::Failed(format!("unknown allocation {handle:?}")))?;
        if let Some(region) = st.regions.remove(&(virt.as_ptr() as u64)) {
            debug_assert!(matches!(region.kind, RegionKind::Coherent));
        }
        // SAFETY: allocated in `alloc_coherent` with this layout.
        unsafe { alloc::dealloc(virt.as_ptr(), layout) };
        Ok(())
    }

    fn sync_for_device(&self, handle: DmaHandle) -> HostResult<()> {
        let mut st = self.lock();
        if !st.pins.contains_key(&handle.0) && !st.coherent.contains_key(&handle.0) {
            return Err(HostError::Failed(format!("sync of unknown handle {handle:?}")));
        }
        st.sync_count += 1;
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn sync_for_cpu(&self, handle: DmaHandle) -> HostResult<()> {
        self.sync_for_device(handle)
    }

    fn int_enable(
        &self,
        cmds: &[TransferCmd],
        callback: InterruptCallback,
    ) -> HostResult<InterruptType> {
        {
            let mut st = self.lock();
            if st.int.is_some() {
                return Err(HostError::Busy("interrupts already enabled".into()));
            }
            st.int = Some(IntRegistration {
                cmds: cmds.to_vec(),
                callback,
            });
        }

        let line = Arc::new(IrqLine::default());
        let me = self
            .me
            .upgrade()
            .ok_or(HostError::Failed("device is being dropped".into()))?;
        let thread_line = Arc::clone(&line);
        let thread = thread::Builder::new()
            .name("xdma-sim-irq".into())
            .spawn(move || me.dispatch_loop(thread_line))
            .map_err(HostError::Io)?;
        let id = thread.thread().id();
        *self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(Dispatcher { thread, id, line });
        Ok(self.card.int_type)
    }

    fn int_disable(&self) -> HostResult<()> {
        self.lock().int = None;
        self.stop_dispatcher();
        Ok(())
    }

    fn int_is_enabled(&self) -> bool {
        self.lock().int.is_some()
    }

    fn event_register(&self, mask: EventMask, callback: EventCallback) -> HostResult<()> {
        let mut st = self.lock();
        if st.event.is_some() {
            return Err(HostError::Busy("event handler already registered".into()));
        }
        st.event = Some((mask, callback));
        Ok(())
    }

    fn event_unregister(&self) -> HostResult<()> {
        self.lock().event = None;
        Ok(())
    }

    fn event_is_registered(&self) -> bool {
        self.lock().event.is_some()
    }

    fn close(&self) -> HostResult<()> {
        self.int_disable()?;
        self.event_unregister()?;
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        for (_, (virt, layout)) in st.coherent.drain() {
            // SAFETY: allocated in `alloc_coherent` with this layout.
            unsafe { alloc::dealloc(virt.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::build_ring;
    use std::sync::mpsc;
    use std::time::Duration;

    fn card() -> SimCard {
        SimCard::new(0x10EE, 0x9038).with_channels(1)
    }

    fn open(host: &SimHost) -> Arc<dyn HostDevice> {
        host.device_open(0x10EE, 0x9038).unwrap()
    }

    #[test]
    fn test_identifiers() {
        let host = SimHost::new(card().streaming(EngineId::new(Direction::CardToHost, 0)));
        let dev = open(&host);
        assert_eq!(dev.read32(1, irq::IDENTIFIER).unwrap() & regs::ID_MASK, regs::ID_MAGIC);
        assert_eq!(dev.read32(0, irq::IDENTIFIER).unwrap(), 0);
        let c2h = dev.read32(1, regs::C2H_CHANNEL_BASE).unwrap();
        assert!(regs::is_xdma_identifier(c2h));
        assert_ne!(c2h & regs::ID_STREAMING, 0);
        assert_eq!(dev.read32(1, regs::C2H_CHANNEL_BASE + 0x100).unwrap(), 0);
        assert!(dev.read32(1, 0x1_0000).is_err());
    }

    #[test]
    fn test_device_open_exclusive() {
        let host = SimHost::new(card());
        let dev = open(&host);
        assert!(matches!(
            host.device_open(0x10EE, 0x9038),
            Err(HostError::Busy(_))
        ));
        assert!(matches!(
            host.device_open(0x10EE, 0x1234),
            Err(HostError::DeviceNotFound { .. })
        ));
        dev.close().unwrap();
        assert!(host.device_open(0x10EE, 0x9038).is_ok());
    }

    #[test]
    fn test_pin_splits_pages() {
        let host = SimHost::new(card());
        let dev = open(&host);
        let mut buf = vec![0u8; 3 * SIM_PAGE_SIZE];
        let opts = PinOptions {
            direction: Direction::ToDevice,
            addr64: true,
            no_page_merge: true,
            transaction: None,
        };
        let offset = SIM_PAGE_SIZE - (buf.as_ptr() as usize % SIM_PAGE_SIZE);
        let addr = unsafe { buf.as_mut_ptr().add(offset) };
        let list = unsafe { dev.pin(addr, SIM_PAGE_SIZE + 10, &opts) }.unwrap();
        assert_eq!(list.entries.len(), 2);
        assert_eq!(list.entries[0].bytes as usize, SIM_PAGE_SIZE);
        assert_eq!(list.entries[1].bytes, 10);
        assert_eq!(host.device().active_pins(), 1);
        dev.unpin(list.handle).unwrap();
        assert_eq!(host.device().active_pins(), 0);
    }

    #[test]
    fn test_engine_runs_descriptor_list() {
        let host = SimHost::new(card());
        let sim = host.device();
        let dev = open(&host);
        let h2c = EngineId::new(Direction::ToDevice, 0);

        let mut data = vec![0x5Au8; 256];
        let opts = PinOptions {
            direction: Direction::ToDevice,
            addr64: true,
            no_page_merge: true,
            transaction: None,
        };
        let list = unsafe { dev.pin(data.as_mut_ptr(), data.len(), &opts) }.unwrap();
        let ring_mem = dev.alloc_coherent(DESC_SIZE * 4, Direction::ToDevice).unwrap();
        let ring = unsafe {
            std::slice::from_raw_parts_mut(ring_mem.virt.as_ptr().cast::<XdmaDesc>(), 4)
        };
        let n = build_ring(ring, ring_mem.phys, &list.entries, Direction::ToDevice, 0x80, false)
            .unwrap();

        dev.write32(1, h2c.sgdma_base() + sgdma::DESC_LO, ring_mem.phys as u32).unwrap();
        dev.write32(1, h2c.sgdma_base() + sgdma::DESC_HI, (ring_mem.phys >> 32) as u32)
            .unwrap();
        dev.write32(1, h2c.channel_base() + channel::CONTROL, ControlFlags::RUN.bits())
            .unwrap();

        assert_eq!(
            dev.read32(1, h2c.channel_base() + channel::COMPLETED_DESC_COUNT).unwrap(),
            n as u32
        );
        let status = dev.read32(1, h2c.channel_base() + channel::STATUS_RC).unwrap();
        assert_eq!(
            StatusFlags::from_bits_retain(status),
            StatusFlags::DESC_STOPPED | StatusFlags::DESC_COMPLETED
        );
        assert_eq!(dev.read32(1, h2c.channel_base() + channel::STATUS).unwrap(), 0);
        assert_eq!(sim.card_read(0x80, 256), vec![0x5Au8; 256]);
        assert_eq!(sim.engine_runs(h2c), 1);

        dev.unpin(list.handle).unwrap();
        dev.free_coherent(ring_mem.handle).unwrap();
    }

    #[test]
    fn test_unmapped_descriptor_is_an_error() {
        let host = SimHost::new(card());
        let dev = open(&host);
        let c2h = EngineId::new(Direction::CardToHost, 0);
        dev.write32(1, c2h.sgdma_base() + sgdma::DESC_LO, 0x1000).unwrap();
        dev.write32(1, c2h.channel_base() + channel::CONTROL, ControlFlags::RUN.bits())
            .unwrap();
        let status = dev.read32(1, c2h.channel_base() + channel::STATUS).unwrap();
        assert!(StatusFlags::from_bits_retain(status).is_error());
    }

    #[test]
    fn test_interrupt_dispatch_latches_request() {
        let host = SimHost::new(card());
        let sim = host.device();
        let dev = open(&host);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let cmds = [TransferCmd::Read32 {
            bar: 1,
            offset: irq::CHANNEL_INT_REQUEST,
        }];
        let int_type = dev
            .int_enable(
                &cmds,
                Arc::new(move |snap: &InterruptSnapshot| {
                    let _ = tx.lock().unwrap().send(snap.latched[0]);
                }),
            )
            .unwrap();
        assert_eq!(int_type, InterruptType::Msi);
        assert!(dev.int_is_enabled());

        sim.inject_channel_irq(0x8);
        let latched = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(latched, 0x8);

        sim.drop_interrupts(1);
        sim.inject_channel_irq(0x4);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(sim.interrupt_counts(), (1, 1));

        dev.int_disable().unwrap();
        assert!(!dev.int_is_enabled());
    }

    #[test]
    fn test_events() {
        let host = SimHost::new(card());
        let sim = host.device();
        let dev = open(&host);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        dev.event_register(
            EventMask::PLUG_AND_PLAY,
            Arc::new(move |ev| {
                let _ = tx.lock().unwrap().send(ev);
            }),
        )
        .unwrap();
        sim.fire_event(EventMask::POWER_D3);
        sim.fire_event(EventMask::PCI_UNPLUG);
        assert_eq!(rx.try_recv().unwrap(), EventMask::PCI_UNPLUG);
        assert!(rx.try_recv().is_err());
    }
}
