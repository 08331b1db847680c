// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Host-DMA service contract.
//!
//! The engine driver never touches PCIe resources directly. Everything it
//! needs from the platform (BAR access, pinning user memory, coherent
//! allocations, interrupt routing and plug-and-play events) goes through
//! the [`HostDma`] and [`HostDevice`] traits.
//!
//! Two implementations ship with the crate:
//!
//! - [`sim::SimHost`]: an in-process model of an XDMA card, used by the
//!   test suite and for development without hardware.
//! - `linux::LinuxHost` (Linux only): sysfs BAR mapping, `mlock` plus
//!   `/proc/self/pagemap` pinning, hugepage coherent buffers and UIO
//!   interrupts.

use crate::error::HostResult;
use crate::regs::Direction;
use bitflags::bitflags;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

#[cfg(target_os = "linux")]
pub mod linux;
pub mod sim;

/// Opaque handle identifying a pin or a coherent allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaHandle(pub u64);

/// Description of one BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInfo {
    /// Size of the region in bytes.
    pub size: u64,
    /// False if the BAR is not implemented or could not be mapped.
    pub active: bool,
}

/// Limits for a transaction-capable pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLimits {
    /// Largest number of bytes moved by one sub-transfer.
    pub max_transfer: u32,
    /// Size of one hardware descriptor.
    pub desc_stride: u32,
}

/// Options for pinning a buffer for DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinOptions {
    pub direction: Direction,
    /// The device can address all 64 bits.
    pub addr64: bool,
    /// Report every page separately even when physically contiguous.
    pub no_page_merge: bool,
    /// Present for pins that back a scatter/gather transaction.
    pub transaction: Option<TransactionLimits>,
}

/// One physically contiguous piece of a pinned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub phys: u64,
    pub bytes: u32,
}

/// Result of pinning a buffer.
#[derive(Debug, Clone)]
pub struct SgList {
    pub handle: DmaHandle,
    pub entries: Vec<SgEntry>,
}

/// Physically contiguous DMA-coherent memory handed out by the host.
#[derive(Debug)]
pub struct CoherentAlloc {
    pub handle: DmaHandle,
    pub virt: NonNull<u8>,
    pub phys: u64,
    pub len: usize,
}

// SAFETY: the allocation is owned memory; the pointer is only an address.
unsafe impl Send for CoherentAlloc {}

/// A register access performed by the host, possibly at interrupt level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCmd {
    Read32 { bar: usize, offset: u64 },
    Write32 { bar: usize, offset: u64, value: u32 },
}

/// Kind of interrupt routed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptType {
    /// Legacy level-sensitive INTx.
    Line,
    Msi,
    MsiX,
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Line => "Line",
            Self::Msi => "MSI",
            Self::MsiX => "MSI-X",
        };
        f.write_str(name)
    }
}

/// Data captured by the host for one interrupt.
#[derive(Debug, Clone)]
pub struct InterruptSnapshot {
    /// Values of the `Read32` commands registered with the interrupt, in order.
    pub latched: Vec<u32>,
    /// Interrupts handled since enable.
    pub counter: u64,
    /// Interrupts lost since enable.
    pub lost: u64,
    pub int_type: InterruptType,
    /// MSI/MSI-X message data of the last interrupt.
    pub last_message: u32,
}

/// Upcall invoked by the host for every interrupt.
pub type InterruptCallback = Arc<dyn Fn(&InterruptSnapshot) + Send + Sync>;

bitflags! {
    /// Plug-and-play and power-management event classes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const PCI_PLUG = 1 << 0;
        const PCI_UNPLUG = 1 << 1;
        const POWER_FULL = 1 << 4;
        const POWER_D1 = 1 << 5;
        const POWER_D2 = 1 << 6;
        const POWER_D3 = 1 << 7;
    }
}

impl EventMask {
    pub const PLUG_AND_PLAY: Self = Self::PCI_PLUG.union(Self::PCI_UNPLUG);
    pub const POWER: Self = Self::POWER_FULL
        .union(Self::POWER_D1)
        .union(Self::POWER_D2)
        .union(Self::POWER_D3);
}

/// Upcall invoked by the host for plug-and-play and power events.
pub type EventCallback = Arc<dyn Fn(EventMask) + Send + Sync>;

/// Driver-level host service.
pub trait HostDma: Send + Sync {
    /// Open the host driver. Called once by library init.
    fn open(&self) -> HostResult<()>;

    /// Close the host driver. Called by library uninit.
    fn close(&self);

    /// Locate and open the PCIe function matching `vendor`/`device`.
    fn device_open(&self, vendor: u16, device: u16) -> HostResult<Arc<dyn HostDevice>>;
}

/// Per-device host service.
pub trait HostDevice: Send + Sync {
    /// Page size used for pinning.
    fn page_size(&self) -> usize;

    /// Number of BARs of the function.
    fn bar_count(&self) -> usize;

    /// Size and state of one BAR, `None` if out of range.
    fn bar_info(&self, bar: usize) -> Option<BarInfo>;

    /// 32-bit read at byte `offset` of `bar`.
    fn read32(&self, bar: usize, offset: u64) -> HostResult<u32>;

    /// 32-bit write at byte `offset` of `bar`.
    fn write32(&self, bar: usize, offset: u64, value: u32) -> HostResult<()>;

    /// Execute a command list in order, returning the values read.
    fn transfer(&self, cmds: &[TransferCmd]) -> HostResult<Vec<u32>> {
        let mut values = Vec::new();
        for cmd in cmds {
            match *cmd {
                TransferCmd::Read32 { bar, offset } => values.push(self.read32(bar, offset)?),
                TransferCmd::Write32 { bar, offset, value } => self.write32(bar, offset, value)?,
            }
        }
        Ok(values)
    }

    /// Read one byte of PCI configuration space.
    fn config_read8(&self, offset: u16) -> HostResult<u8>;

    /// Pin `len` bytes at `addr` for DMA.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay allocated until [`HostDevice::unpin`]
    /// is called with the returned handle.
    unsafe fn pin(&self, addr: *mut u8, len: usize, options: &PinOptions) -> HostResult<SgList>;

    /// Release a pin.
    fn unpin(&self, handle: DmaHandle) -> HostResult<()>;

    /// Allocate physically contiguous DMA-coherent memory.
    fn alloc_coherent(&self, len: usize, direction: Direction) -> HostResult<CoherentAlloc>;

    /// Free memory obtained from [`HostDevice::alloc_coherent`].
    fn free_coherent(&self, handle: DmaHandle) -> HostResult<()>;

    /// Make CPU writes visible to the device.
    fn sync_for_device(&self, handle: DmaHandle) -> HostResult<()>;

    /// Make device writes visible to the CPU.
    fn sync_for_cpu(&self, handle: DmaHandle) -> HostResult<()>;

    /// Route interrupts to `callback`, executing `cmds` at interrupt level.
    fn int_enable(
        &self,
        cmds: &[TransferCmd],
        callback: InterruptCallback,
    ) -> HostResult<InterruptType>;

    fn int_disable(&self) -> HostResult<()>;

    fn int_is_enabled(&self) -> bool;

    /// Deliver events matching `mask` to `callback`.
    fn event_register(&self, mask: EventMask, callback: EventCallback) -> HostResult<()>;

    fn event_unregister(&self) -> HostResult<()>;

    fn event_is_registered(&self) -> bool;

    /// Release the device. Interrupts and events are torn down first.
    fn close(&self) -> HostResult<()>;
}

/// A pinned buffer, unpinned on drop.
pub struct DmaPin {
    host: Arc<dyn HostDevice>,
    list: SgList,
}

impl DmaPin {
    /// Pin `len` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// See [`HostDevice::pin`]: the memory must outlive the returned value.
    pub unsafe fn new(
        host: &Arc<dyn HostDevice>,
        addr: *mut u8,
        len: usize,
        options: &PinOptions,
    ) -> HostResult<Self> {
        let list = host.pin(addr, len, options)?;
        Ok(Self {
            host: Arc::clone(host),
            list,
        })
    }

    pub fn handle(&self) -> DmaHandle {
        self.list.handle
    }

    /// Scatter/gather page list.
    pub fn entries(&self) -> &[SgEntry] {
        &self.list.entries
    }
}

impl Drop for DmaPin {
    fn drop(&mut self) {
        if let Err(e) = self.host.unpin(self.list.handle) {
            log::warn!("unpin {:?} failed: {}", self.list.handle, e);
        }
    }
}

/// A coherent allocation, freed on drop.
pub struct CoherentBuffer {
    host: Arc<dyn HostDevice>,
    alloc: CoherentAlloc,
}

impl CoherentBuffer {
    pub fn new(host: &Arc<dyn HostDevice>, len: usize, direction: Direction) -> HostResult<Self> {
        let alloc = host.alloc_coherent(len, direction)?;
        Ok(Self {
            host: Arc::clone(host),
            alloc,
        })
    }

    pub fn handle(&self) -> DmaHandle {
        self.alloc.handle
    }

    /// Physical (bus) address of the first byte.
    pub fn phys(&self) -> u64 {
        self.alloc.phys
    }

    pub fn len(&self) -> usize {
        self.alloc.len
    }

    pub fn is_empty(&self) -> bool {
        self.alloc.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.alloc.virt.as_ptr()
    }

    /// Read-only view of the allocation as a slice of `T`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`CoherentBuffer::as_mut_slice`].
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        let n = self.alloc.len / std::mem::size_of::<T>();
        std::slice::from_raw_parts(self.alloc.virt.as_ptr().cast::<T>(), n)
    }

    /// View the allocation as a slice of `T`.
    ///
    /// # Safety
    ///
    /// `T` must be valid for any bit pattern and the allocation must be
    /// suitably aligned for `T`; the device must not write the memory while
    /// the slice is alive.
    pub unsafe fn as_mut_slice<T>(&mut self) -> &mut [T] {
        let n = self.alloc.len / std::mem::size_of::<T>();
        std::slice::from_raw_parts_mut(self.alloc.virt.as_ptr().cast::<T>(), n)
    }

    pub fn sync_for_device(&self) -> HostResult<()> {
        self.host.sync_for_device(self.alloc.handle)
    }

    pub fn sync_for_cpu(&self) -> HostResult<()> {
        self.host.sync_for_cpu(self.alloc.handle)
    }
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for CoherentBuffer {}
unsafe impl Sync for CoherentBuffer {}

impl Drop for CoherentBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.host.free_coherent(self.alloc.handle) {
            log::warn!("free of coherent buffer {:?} failed: {}", self.alloc.handle, e);
        }
    }
}
