// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! XDMA device discovery and device context.
//!
//! Opening a device locates the configuration BAR (the BAR whose IRQ-block
//! and config-block identifier registers carry the `0x1FC` magic) and
//! enumerates the eight engine slots, H2C0..3 then C2H0..3. Each populated
//! engine is assigned the next free bit of the channel interrupt request
//! word.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xdma_rust::host::sim::{SimCard, SimHost};
//! use xdma_rust::{Direction, DmaOptions, Xdma, XdmaError};
//!
//! fn main() -> Result<(), XdmaError> {
//!     let host = Arc::new(SimHost::new(SimCard::new(0x10EE, 0x9038).with_channels(1)));
//!     let xdma = Xdma::init(host)?;
//!     let device = xdma.device_open(0x10EE, 0x9038)?;
//!
//!     let options = DmaOptions::new(Direction::ToDevice, 0, 4096).polling(true);
//!     let mut session = device.dma_open(&options)?;
//!     session.buffer_mut().fill(0xA5);
//!     session.transfer_start()?;
//!     session.poll_completion()?;
//!     session.close()?;
//!     device.close()
//! }
//! ```

use crate::engine::EngineRegs;
use crate::error::{err_log, RecordErr, XdmaError, XdmaResult};
use crate::host::{
    EventCallback, EventMask, HostDevice, HostDma, InterruptCallback, InterruptType, TransferCmd,
};
use crate::interrupt::{self, IntHandler, UserIntHandler};
use crate::regs::{
    self, config, irq, Alignments, Direction, EngineId, CHANNELS_NUM, MIN_CONFIG_BAR_SIZE,
};
use crate::descriptor::DESC_MAX_ADJACENT;
use crate::session::{DmaOptions, DmaSession, SessionCore};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Adjacent descriptor count programmed with every descriptor ring.
pub const DEFAULT_ADJACENT_DESCRIPTORS: u8 = 0;

/// Handler for plug-and-play and power events.
pub type EventHandler = Arc<dyn Fn(&Device, EventMask) + Send + Sync>;

/// Library handle.
///
/// Owns the host-DMA service for its lifetime: [`Xdma::init`] opens the host
/// driver and dropping the handle (or [`Xdma::uninit`]) closes it.
pub struct Xdma {
    host: Arc<dyn HostDma>,
}

impl Xdma {
    /// Initialize the library on top of a host-DMA service.
    pub fn init(host: Arc<dyn HostDma>) -> XdmaResult<Self> {
        host.open().record("init")?;
        log::debug!("XDMA library initialized");
        Ok(Self { host })
    }

    /// Initialize the library with the Linux sysfs/UIO host service.
    #[cfg(target_os = "linux")]
    pub fn init_linux() -> XdmaResult<Self> {
        Self::init(Arc::new(crate::host::linux::LinuxHost::new()))
    }

    /// Release the library. Equivalent to dropping the handle.
    pub fn uninit(self) {}

    /// Open the XDMA device matching `vendor`/`device`.
    ///
    /// # Errors
    ///
    /// - [`XdmaError::HostService`] if the host cannot find or open the device.
    /// - [`XdmaError::InvalidParameter`] if the device has no active BAR.
    /// - [`XdmaError::NotXdmaDevice`] if no BAR carries the XDMA identifiers.
    pub fn device_open(&self, vendor: u16, device: u16) -> XdmaResult<Device> {
        let host = self.host.device_open(vendor, device).record("device_open")?;
        Device::probe(host).map_err(|e| err_log("device_open", e))
    }
}

impl Drop for Xdma {
    fn drop(&mut self) {
        self.host.close();
        log::debug!("XDMA library released");
    }
}

/// Information about one engine slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    pub id: EngineId,
    /// The engine is populated in the hardware.
    pub enabled: bool,
    /// AXI4-Stream engine (identifier bit 15).
    pub streaming: bool,
    /// Bit of this engine in the channel interrupt request word, 0 if absent.
    pub irq_mask: u32,
    /// Raw identifier register read at discovery.
    pub identifier: u32,
    /// A session is attached.
    pub initialized: bool,
}

pub(crate) enum SlotState {
    Idle,
    /// Reserved by a session open in progress.
    Opening,
    Attached(Arc<SessionCore>),
}

/// One of the eight engine slots of a device.
pub(crate) struct EngineSlot {
    pub(crate) id: EngineId,
    pub(crate) enabled: bool,
    pub(crate) streaming: bool,
    pub(crate) irq_mask: u32,
    pub(crate) identifier: u32,
    pub(crate) regs: EngineRegs,
    state: Mutex<SlotState>,
}

impl EngineSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The session core attached to this slot, if any.
    pub(crate) fn attached(&self) -> Option<Arc<SessionCore>> {
        match &*self.lock() {
            SlotState::Attached(core) => Some(Arc::clone(core)),
            _ => None,
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        !matches!(*self.lock(), SlotState::Idle)
    }

    fn reserve(&self) -> XdmaResult<()> {
        let mut state = self.lock();
        match *state {
            SlotState::Idle => {
                *state = SlotState::Opening;
                Ok(())
            }
            _ => Err(XdmaError::AlreadyOpen(self.id)),
        }
    }

    pub(crate) fn attach(&self, core: Arc<SessionCore>) {
        *self.lock() = SlotState::Attached(core);
    }

    /// Return the slot to the uninitialized state.
    pub(crate) fn release(&self) {
        *self.lock() = SlotState::Idle;
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            id: self.id,
            enabled: self.enabled,
            streaming: self.streaming,
            irq_mask: self.irq_mask,
            identifier: self.identifier,
            initialized: self.is_initialized(),
        }
    }
}

#[derive(Default)]
struct IntState {
    int_type: Option<InterruptType>,
    handler: Option<IntHandler>,
    user_handler: Option<UserIntHandler>,
}

/// Interrupt statistics kept by the demultiplexer.
#[derive(Default)]
pub(crate) struct IntStats {
    pub(crate) dispatched: AtomicU64,
    pub(crate) phantom: AtomicU64,
    pub(crate) failed: AtomicU64,
}

pub(crate) struct DeviceShared {
    pub(crate) host: Arc<dyn HostDevice>,
    pub(crate) config_bar: usize,
    bar_count: usize,
    pub(crate) slots: Vec<EngineSlot>,
    ints: Mutex<IntState>,
    pub(crate) stats: IntStats,
    adjacent: AtomicU8,
    next_session: AtomicU64,
    closed: AtomicBool,
}

impl DeviceShared {
    fn ints(&self) -> MutexGuard<'_, IntState> {
        self.ints.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Snapshot of the registered channel and user interrupt handlers.
    pub(crate) fn handlers(&self) -> (Option<IntHandler>, Option<UserIntHandler>) {
        let ints = self.ints();
        (ints.handler.clone(), ints.user_handler.clone())
    }

    fn shutdown(&self) -> XdmaResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.ints() = IntState::default();
        self.host.close()?;
        log::info!("XDMA device closed");
        Ok(())
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("device close failed: {e}");
        }
    }
}

/// An opened XDMA device.
///
/// Cloning is cheap; clones refer to the same device. The device is closed
/// by [`Device::close`] or when the last clone (including the ones held by
/// open sessions) is dropped.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config_bar", &self.shared.config_bar)
            .field("bar_count", &self.shared.bar_count)
            .finish_non_exhaustive()
    }
}

impl Device {
    fn probe(host: Arc<dyn HostDevice>) -> XdmaResult<Self> {
        // The host device is closed again unless probing succeeds.
        let host = scopeguard::guard(host, |h| {
            if let Err(e) = h.close() {
                log::warn!("close after failed probe: {e}");
            }
        });

        let dev: &Arc<dyn HostDevice> = &host;
        let config_bar = find_config_bar(dev.as_ref())?;
        let slots = enumerate_engines(dev, config_bar)?;

        let enabled: Vec<String> = slots
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.id.to_string())
            .collect();
        log::info!(
            "XDMA device: config BAR {}, engines [{}]",
            config_bar,
            enabled.join(", ")
        );

        let host = scopeguard::ScopeGuard::into_inner(host);
        Ok(Self {
            shared: Arc::new(DeviceShared {
                bar_count: host.bar_count(),
                host,
                config_bar,
                slots,
                ints: Mutex::new(IntState::default()),
                stats: IntStats::default(),
                adjacent: AtomicU8::new(DEFAULT_ADJACENT_DESCRIPTORS),
                next_session: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &DeviceShared {
        &self.shared
    }

    pub(crate) fn from_shared(shared: Arc<DeviceShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.shared.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Index of the BAR carrying the XDMA registers.
    pub fn config_bar(&self) -> usize {
        self.shared.config_bar
    }

    pub fn bar_count(&self) -> usize {
        self.shared.bar_count
    }

    /// All eight engine slots in discovery order.
    pub fn engines(&self) -> Vec<EngineInfo> {
        self.shared.slots.iter().map(EngineSlot::info).collect()
    }

    /// Information about one engine slot.
    pub fn engine(&self, id: EngineId) -> Option<EngineInfo> {
        self.slot(id.direction, id.channel).map(EngineSlot::info)
    }

    /// Decoded alignments register of a populated engine.
    pub fn engine_alignments(&self, id: EngineId) -> XdmaResult<Alignments> {
        let slot = self
            .slot(id.direction, id.channel)
            .filter(|s| s.enabled)
            .ok_or_else(|| err_log("engine_alignments", XdmaError::EngineAbsent(id)))?;
        slot.regs.alignments().record("engine_alignments")
    }

    fn slot(&self, direction: Direction, channel: u32) -> Option<&EngineSlot> {
        if channel >= CHANNELS_NUM {
            return None;
        }
        self.shared
            .slots
            .get(EngineId::new(direction, channel).index())
    }

    /// Validate a session request and reserve its engine slot.
    ///
    /// Returns the slot index. The slot stays reserved until the caller
    /// attaches a session or releases it.
    pub(crate) fn reserve_engine(&self, direction: Direction, channel: u32) -> XdmaResult<usize> {
        let Some(slot) = self.slot(direction, channel) else {
            return Err(XdmaError::ChannelInvalid {
                channel,
                reported: None,
            });
        };
        let reported = regs::identifier_channel(slot.regs.identifier()?);
        if reported != channel {
            return Err(XdmaError::ChannelInvalid {
                channel,
                reported: Some(reported),
            });
        }
        if !slot.enabled {
            return Err(XdmaError::EngineAbsent(slot.id));
        }
        slot.reserve()?;
        Ok(slot.id.index())
    }

    /// Open a DMA session on one engine.
    ///
    /// # Errors
    ///
    /// - [`XdmaError::ChannelInvalid`] for a channel above 3 or an identifier
    ///   register reporting another channel.
    /// - [`XdmaError::EngineAbsent`] if the engine is not populated.
    /// - [`XdmaError::AlreadyOpen`] if a session is attached to the engine.
    /// - [`XdmaError::Misaligned`] if the request violates the engine alignments.
    /// - [`XdmaError::ResourceExhausted`] if a buffer cannot be allocated or pinned.
    pub fn dma_open(&self, options: &DmaOptions) -> XdmaResult<DmaSession> {
        DmaSession::open(self, options)
    }

    /// Adjacent descriptor count written with each descriptor ring.
    pub fn adjacent_descriptors(&self) -> u8 {
        self.shared.adjacent.load(Ordering::Relaxed)
    }

    /// Set the adjacent descriptor count for rings programmed from now on.
    pub fn set_adjacent_descriptors(&self, count: u8) -> XdmaResult<()> {
        if count > DESC_MAX_ADJACENT {
            return Err(err_log(
                "set_adjacent_descriptors",
                XdmaError::InvalidParameter(format!(
                    "adjacent count {count} exceeds {DESC_MAX_ADJACENT}"
                )),
            ));
        }
        self.shared.adjacent.store(count, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Interrupts
    // ------------------------------------------------------------------

    /// Enable interrupts and route DMA completions to `handler`.
    ///
    /// Registers an interrupt-level read of the channel and user request
    /// registers with the host. For level-sensitive line interrupts the
    /// interrupt pin is written into the channel vector registers.
    ///
    /// # Errors
    ///
    /// Returns [`XdmaError::AlreadyDone`] if interrupts are already enabled.
    pub fn int_enable(&self, handler: IntHandler) -> XdmaResult<InterruptType> {
        const CTX: &str = "int_enable";
        let sh = &self.shared;
        if sh.host.int_is_enabled() {
            return Err(err_log(CTX, XdmaError::AlreadyDone("interrupt enable")));
        }
        sh.ints().handler = Some(handler);

        let cmds = [
            TransferCmd::Read32 {
                bar: sh.config_bar,
                offset: irq::CHANNEL_INT_REQUEST,
            },
            TransferCmd::Read32 {
                bar: sh.config_bar,
                offset: irq::USER_INT_REQUEST,
            },
        ];
        let weak = Arc::downgrade(&self.shared);
        let callback: InterruptCallback = Arc::new(move |snapshot| {
            if let Some(shared) = weak.upgrade() {
                interrupt::demux(&Device::from_shared(shared), snapshot);
            }
        });

        let int_type = match sh.host.int_enable(&cmds, callback) {
            Ok(t) => t,
            Err(e) => {
                sh.ints().handler = None;
                return Err(err_log(CTX, e.into()));
            }
        };
        sh.ints().int_type = Some(int_type);

        if int_type == InterruptType::Line {
            if let Err(e) = self.set_line_vectors() {
                if let Err(e2) = self.int_disable() {
                    log::warn!("rollback of interrupt enable failed: {e2}");
                }
                return Err(err_log(CTX, e));
            }
        }
        log::info!("{int_type} interrupts enabled");
        Ok(int_type)
    }

    /// Route the channel interrupts to the device's interrupt pin.
    fn set_line_vectors(&self) -> XdmaResult<()> {
        let sh = &self.shared;
        let pin = u32::from(sh.host.config_read8(regs::PCI_INTERRUPT_PIN)?);
        let vector = pin | (pin << 8) | (pin << 16) | (pin << 24);
        log::debug!("line interrupt pin {pin}, channel vector {vector:#010x}");
        sh.host.write32(sh.config_bar, irq::CHANNEL_VECTOR_1, vector)?;
        sh.host.write32(sh.config_bar, irq::CHANNEL_VECTOR_2, vector)?;
        Ok(())
    }

    /// Disable interrupts.
    ///
    /// Masks every channel and user interrupt in the IRQ block, then tears
    /// down the host routing.
    ///
    /// # Errors
    ///
    /// Returns [`XdmaError::AlreadyDone`] if interrupts are not enabled.
    pub fn int_disable(&self) -> XdmaResult<()> {
        const CTX: &str = "int_disable";
        let sh = &self.shared;
        if !sh.host.int_is_enabled() {
            return Err(err_log(CTX, XdmaError::AlreadyDone("interrupt disable")));
        }
        sh.host
            .write32(sh.config_bar, irq::CHANNEL_INT_ENABLE_MASK_W1C, u32::MAX)
            .record(CTX)?;
        sh.host
            .write32(sh.config_bar, irq::USER_INT_ENABLE_MASK_W1C, u32::MAX)
            .record(CTX)?;
        sh.host.int_disable().record(CTX)?;
        {
            let mut ints = sh.ints();
            ints.int_type = None;
            ints.handler = None;
        }
        log::info!("interrupts disabled");
        Ok(())
    }

    pub fn int_is_enabled(&self) -> bool {
        self.shared.host.int_is_enabled()
    }

    /// Interrupt type in use, `None` while interrupts are disabled.
    pub fn interrupt_type(&self) -> Option<InterruptType> {
        self.shared.ints().int_type
    }

    /// Route user interrupts to `handler`, replacing any previous handler.
    pub fn set_user_interrupt_handler(&self, handler: UserIntHandler) {
        self.shared.ints().user_handler = Some(handler);
    }

    fn irq_write(&self, ctx: &str, offset: u64, mask: u32) -> XdmaResult<()> {
        let sh = &self.shared;
        sh.host.write32(sh.config_bar, offset, mask).record(ctx)
    }

    /// Unmask user interrupt lines.
    pub fn user_interrupts_enable(&self, mask: u32) -> XdmaResult<()> {
        self.irq_write("user_interrupts_enable", irq::USER_INT_ENABLE_MASK_W1S, mask)
    }

    /// Mask user interrupt lines.
    pub fn user_interrupts_disable(&self, mask: u32) -> XdmaResult<()> {
        self.irq_write("user_interrupts_disable", irq::USER_INT_ENABLE_MASK_W1C, mask)
    }

    /// Unmask engine interrupts in the channel interrupt enable mask.
    pub fn channel_interrupts_enable(&self, mask: u32) -> XdmaResult<()> {
        self.irq_write(
            "channel_interrupts_enable",
            irq::CHANNEL_INT_ENABLE_MASK_W1S,
            mask,
        )
    }

    /// Mask engine interrupts in the channel interrupt enable mask.
    pub fn channel_interrupts_disable(&self, mask: u32) -> XdmaResult<()> {
        self.irq_write(
            "channel_interrupts_disable",
            irq::CHANNEL_INT_ENABLE_MASK_W1C,
            mask,
        )
    }

    /// Number of interrupt request bits that matched no engine.
    pub fn phantom_interrupts(&self) -> u64 {
        self.shared.stats.phantom.load(Ordering::Relaxed)
    }

    /// Number of engine interrupts whose handling failed on a host error.
    pub fn failed_interrupts(&self) -> u64 {
        self.shared.stats.failed.load(Ordering::Relaxed)
    }

    /// Number of engine completions delivered by the demultiplexer.
    pub fn dispatched_interrupts(&self) -> u64 {
        self.shared.stats.dispatched.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Deliver plug-and-play and power events matching `mask` to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`XdmaError::AlreadyDone`] if a handler is already registered.
    pub fn event_register(&self, mask: EventMask, handler: EventHandler) -> XdmaResult<()> {
        const CTX: &str = "event_register";
        let sh = &self.shared;
        if sh.host.event_is_registered() {
            return Err(err_log(CTX, XdmaError::AlreadyDone("event register")));
        }
        let weak = Arc::downgrade(&self.shared);
        let callback: EventCallback = Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                log::info!("device event {event:?}");
                handler(&Device::from_shared(shared), event);
            }
        });
        sh.host.event_register(mask, callback).record(CTX)
    }

    /// Remove the event handler.
    ///
    /// # Errors
    ///
    /// Returns [`XdmaError::AlreadyDone`] if no handler is registered.
    pub fn event_unregister(&self) -> XdmaResult<()> {
        const CTX: &str = "event_unregister";
        let sh = &self.shared;
        if !sh.host.event_is_registered() {
            return Err(err_log(CTX, XdmaError::AlreadyDone("event unregister")));
        }
        sh.host.event_unregister().record(CTX)
    }

    pub fn event_is_registered(&self) -> bool {
        self.shared.host.event_is_registered()
    }

    /// Close the device.
    ///
    /// Interrupts and events are torn down by the host. Sessions still open
    /// keep their resources until they are closed.
    pub fn close(&self) -> XdmaResult<()> {
        let open = self
            .shared
            .slots
            .iter()
            .filter(|s| s.is_initialized())
            .count();
        if open > 0 {
            log::warn!("closing device with {open} open session(s)");
        }
        self.shared.shutdown().record("device_close")
    }
}

/// Find the BAR carrying the XDMA register space.
fn find_config_bar(host: &dyn HostDevice) -> XdmaResult<usize> {
    let mut active = 0;
    for bar in 0..host.bar_count() {
        let Some(info) = host.bar_info(bar).filter(|i| i.active) else {
            continue;
        };
        active += 1;
        if info.size < MIN_CONFIG_BAR_SIZE {
            log::trace!("BAR {bar}: {:#x} bytes, too small", info.size);
            continue;
        }
        let irq_id = host.read32(bar, irq::IDENTIFIER)?;
        let cfg_id = host.read32(bar, config::IDENTIFIER)?;
        log::trace!("BAR {bar}: IRQ block id {irq_id:#010x}, config block id {cfg_id:#010x}");
        if regs::is_xdma_identifier(irq_id) && regs::is_xdma_identifier(cfg_id) {
            return Ok(bar);
        }
    }
    if active == 0 {
        return Err(XdmaError::InvalidParameter("device has no active BAR".into()));
    }
    Err(XdmaError::NotXdmaDevice)
}

/// Read the identifier of every engine slot and assign interrupt bits.
fn enumerate_engines(host: &Arc<dyn HostDevice>, config_bar: usize) -> XdmaResult<Vec<EngineSlot>> {
    let mut slots = Vec::with_capacity(regs::ENGINES_NUM);
    let mut next_bit = 0;
    for id in EngineId::all() {
        let engine = EngineRegs::new(Arc::clone(host), config_bar, id);
        let identifier = engine.identifier()?;
        let enabled = regs::is_xdma_identifier(identifier);
        let irq_mask = if enabled {
            let mask = 1 << next_bit;
            next_bit += 1;
            mask
        } else {
            0
        };
        let streaming = enabled && identifier & regs::ID_STREAMING != 0;
        log::trace!(
            "{id}: identifier {identifier:#010x}, enabled {enabled}, streaming {streaming}, irq mask {irq_mask:#x}"
        );
        slots.push(EngineSlot {
            id,
            enabled,
            streaming,
            irq_mask,
            identifier,
            regs: engine,
            state: Mutex::new(SlotState::Idle),
        });
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::get_last_err;
    use crate::host::sim::{SimCard, SimHost};
    use crate::host::HostDma;
    use crate::interrupt::InterruptResult;
    use std::sync::mpsc;
    use std::time::Duration;

    const VID: u16 = 0x10EE;
    const DID: u16 = 0x9034;

    fn open(card: SimCard) -> (Arc<SimHost>, Xdma, Device) {
        let host = Arc::new(SimHost::new(card));
        let xdma = Xdma::init(host.clone()).unwrap();
        let dev = xdma.device_open(VID, DID).unwrap();
        (host, xdma, dev)
    }

    fn null_handler() -> IntHandler {
        Arc::new(|_: &Device, _: &InterruptResult| {})
    }

    #[test]
    fn test_init_uninit() {
        let host = Arc::new(SimHost::new(SimCard::new(VID, DID)));
        let xdma = Xdma::init(host.clone()).unwrap();
        assert!(host.is_open());
        assert!(Xdma::init(host.clone()).is_err());
        xdma.uninit();
        assert!(!host.is_open());
    }

    #[test]
    fn test_discovery_packs_irq_bits() {
        let card = SimCard::new(VID, DID)
            .with_engine(Direction::ToDevice, 1)
            .with_engine(Direction::ToDevice, 3)
            .with_engine(Direction::CardToHost, 0)
            .streaming(EngineId::new(Direction::CardToHost, 0));
        let (_host, _xdma, dev) = open(card);
        assert_eq!(dev.config_bar(), 1);
        assert_eq!(dev.bar_count(), 2);

        let engines = dev.engines();
        assert_eq!(engines.len(), 8);
        let masks: Vec<u32> = engines.iter().map(|e| e.irq_mask).collect();
        assert_eq!(masks, vec![0, 0x1, 0, 0x2, 0x4, 0, 0, 0]);

        let c2h0 = dev.engine(EngineId::new(Direction::CardToHost, 0)).unwrap();
        assert!(c2h0.enabled && c2h0.streaming);
        let h2c1 = dev.engine(EngineId::new(Direction::ToDevice, 1)).unwrap();
        assert!(h2c1.enabled && !h2c1.streaming && !h2c1.initialized);
        assert!(!dev.engines()[0].enabled);
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let host = Arc::new(SimHost::new(SimCard::new(VID, DID).with_channels(2)));
        let xdma = Xdma::init(host.clone()).unwrap();

        let first = xdma.device_open(VID, DID).unwrap();
        let before = first.engines();
        first.close().unwrap();
        drop(first);

        let second = xdma.device_open(VID, DID).unwrap();
        assert_eq!(second.engines(), before);
    }

    #[test]
    fn test_config_bar_in_other_bar() {
        let card = SimCard::new(VID, DID)
            .config_bar(vec![0x1000, 0, 0x1_0000], 2)
            .with_channels(1);
        let (_host, _xdma, dev) = open(card);
        // BAR 0 is too small, BAR 1 is inactive.
        assert_eq!(dev.config_bar(), 2);
    }

    #[test]
    fn test_not_xdma_device() {
        let host = Arc::new(SimHost::new(SimCard::new(VID, DID).without_xdma()));
        let xdma = Xdma::init(host.clone()).unwrap();
        let err = xdma.device_open(VID, DID).unwrap_err();
        assert!(matches!(err, XdmaError::NotXdmaDevice));
        assert!(get_last_err().contains("device_open"));

        // The host device was released, so it can be opened again.
        assert!(host.device_open(VID, DID).is_ok());
    }

    #[test]
    fn test_no_active_bar() {
        let card = SimCard::new(VID, DID).config_bar(vec![0, 0], 0);
        let host = Arc::new(SimHost::new(card));
        let xdma = Xdma::init(host).unwrap();
        assert!(matches!(
            xdma.device_open(VID, DID),
            Err(XdmaError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_device_not_found() {
        let host = Arc::new(SimHost::new(SimCard::new(VID, DID)));
        let xdma = Xdma::init(host).unwrap();
        let err = xdma.device_open(VID, 0x1234).unwrap_err();
        assert!(matches!(err, XdmaError::HostService(_)));
    }

    #[test]
    fn test_int_enable_disable_round_trip() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(2));
        let sim = host.device();
        let before = (sim.channel_int_enable(), sim.user_int_enable(), sim.channel_vectors());

        assert_eq!(dev.int_enable(null_handler()).unwrap(), InterruptType::Msi);
        assert!(dev.int_is_enabled());
        assert_eq!(dev.interrupt_type(), Some(InterruptType::Msi));
        assert!(matches!(
            dev.int_enable(null_handler()),
            Err(XdmaError::AlreadyDone(_))
        ));

        dev.int_disable().unwrap();
        assert!(!dev.int_is_enabled());
        assert_eq!(dev.interrupt_type(), None);
        assert_eq!(
            (sim.channel_int_enable(), sim.user_int_enable(), sim.channel_vectors()),
            before
        );
        for e in dev.engines() {
            assert!(!sim.engine_control(e.id).contains(crate::regs::ControlFlags::RUN));
        }
        assert!(matches!(dev.int_disable(), Err(XdmaError::AlreadyDone(_))));
    }

    #[test]
    fn test_line_interrupt_vectors() {
        let card = SimCard::new(VID, DID)
            .with_channels(1)
            .int_type(InterruptType::Line);
        let (host, _xdma, dev) = open(card);
        dev.int_enable(null_handler()).unwrap();
        assert_eq!(host.device().channel_vectors(), [0x0101_0101; 2]);
        dev.int_disable().unwrap();
    }

    #[test]
    fn test_channel_and_user_masks() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        let sim = host.device();
        dev.channel_interrupts_enable(0x3).unwrap();
        dev.user_interrupts_enable(0xF0).unwrap();
        assert_eq!(sim.channel_int_enable(), 0x3);
        assert_eq!(sim.user_int_enable(), 0xF0);
        dev.channel_interrupts_disable(0x1).unwrap();
        dev.user_interrupts_disable(0x30).unwrap();
        assert_eq!(sim.channel_int_enable(), 0x2);
        assert_eq!(sim.user_int_enable(), 0xC0);
    }

    #[test]
    fn test_events() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: EventHandler = Arc::new(move |_: &Device, ev: EventMask| {
            let _ = tx.lock().unwrap().send(ev);
        });

        assert!(matches!(dev.event_unregister(), Err(XdmaError::AlreadyDone(_))));
        dev.event_register(EventMask::PLUG_AND_PLAY, handler.clone())
            .unwrap();
        assert!(dev.event_is_registered());
        assert!(matches!(
            dev.event_register(EventMask::POWER, handler),
            Err(XdmaError::AlreadyDone(_))
        ));

        host.device().fire_event(EventMask::POWER_D3);
        host.device().fire_event(EventMask::PCI_UNPLUG);
        let ev = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(ev, EventMask::PCI_UNPLUG);
        assert!(rx.try_recv().is_err());

        dev.event_unregister().unwrap();
        assert!(!dev.event_is_registered());
    }

    #[test]
    fn test_adjacent_descriptors() {
        let (_host, _xdma, dev) = open(SimCard::new(VID, DID));
        assert_eq!(dev.adjacent_descriptors(), DEFAULT_ADJACENT_DESCRIPTORS);
        dev.set_adjacent_descriptors(15).unwrap();
        assert_eq!(dev.adjacent_descriptors(), 15);
        assert!(dev.set_adjacent_descriptors(16).is_err());
    }

    #[test]
    fn test_close_releases_host_device() {
        let (host, _xdma, dev) = open(SimCard::new(VID, DID).with_channels(1));
        dev.int_enable(null_handler()).unwrap();
        dev.close().unwrap();
        assert!(!host.device().int_is_enabled());
        // Second close is a no-op.
        dev.close().unwrap();
        drop(dev);
        assert!(host.device_open(VID, DID).is_ok());
    }
}
