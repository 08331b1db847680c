// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! XDMA scatter/gather descriptor and poll-mode write-back structures.
//!
//! Both structures are read or written by the engine through PCIe and are
//! therefore kept little-endian in memory regardless of the host byte order.

use crate::error::{XdmaError, XdmaResult};
use crate::host::SgEntry;
use crate::regs::Direction;
use bitflags::bitflags;

/// Magic expected by the engine in bits 31:16 of every descriptor control word.
pub const DESC_MAGIC: u32 = 0xAD4B_0000;

/// Largest byte count a single descriptor can carry.
pub const DESC_MAX_BYTES: u32 = 0x0FFF_FFFF;

/// Largest value of the adjacent-descriptor field.
pub const DESC_MAX_ADJACENT: u8 = 15;

/// Size of a descriptor in bytes.
pub const DESC_SIZE: usize = 32;

/// Shift of the adjacent-descriptor count within the control word.
const DESC_ADJACENT_SHIFT: u32 = 8;
const DESC_ADJACENT_MASK: u32 = 0x3F << DESC_ADJACENT_SHIFT;

bitflags! {
    /// Descriptor control bits (bits 15:0 of the control word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescControl: u32 {
        /// Stop fetching descriptors after this one.
        const STOPPED = 1 << 0;
        /// Raise the completed event after this descriptor.
        const COMPLETED = 1 << 1;
        /// End of packet (streaming engines).
        const EOP = 1 << 4;
    }
}

impl DescControl {
    /// Flags carried by the last descriptor of a ring.
    pub const LAST: Self = Self::STOPPED.union(Self::COMPLETED).union(Self::EOP);
}

/// 32-byte XDMA scatter/gather descriptor.
///
/// # Layout
///
/// | Offset | Size | Field |
/// |--------|------|-------|
/// | 0 | 4 | control (magic, adjacent count, flags) |
/// | 4 | 4 | byte count |
/// | 8 | 8 | source address |
/// | 16 | 8 | destination address |
/// | 24 | 8 | next descriptor address |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct XdmaDesc {
    control: u32,
    bytes: u32,
    src_addr: u64,
    dst_addr: u64,
    next_desc: u64,
}

impl XdmaDesc {
    /// Create a zeroed descriptor.
    #[inline]
    pub const fn new() -> Self {
        Self {
            control: 0,
            bytes: 0,
            src_addr: 0,
            dst_addr: 0,
            next_desc: 0,
        }
    }

    /// Create a magic-tagged descriptor moving `bytes` from `src` to `dst`.
    pub fn transfer(src: u64, dst: u64, bytes: u32) -> Self {
        Self {
            control: DESC_MAGIC.to_le(),
            bytes: bytes.to_le(),
            src_addr: src.to_le(),
            dst_addr: dst.to_le(),
            next_desc: 0,
        }
    }

    /// Raw control word.
    #[inline]
    pub fn control(&self) -> u32 {
        u32::from_le(self.control)
    }

    /// Control flags in bits 15:0.
    #[inline]
    pub fn flags(&self) -> DescControl {
        DescControl::from_bits_truncate(self.control())
    }

    /// Returns true if the control word carries the descriptor magic.
    #[inline]
    pub fn has_magic(&self) -> bool {
        self.control() & 0xFFFF_0000 == DESC_MAGIC
    }

    /// Add control flags.
    #[inline]
    pub fn add_flags(&mut self, flags: DescControl) {
        self.control = (self.control() | flags.bits()).to_le();
    }

    /// Number of descriptors adjacent to this one in memory.
    #[inline]
    pub fn adjacent(&self) -> u8 {
        ((self.control() & DESC_ADJACENT_MASK) >> DESC_ADJACENT_SHIFT) as u8
    }

    /// Set the adjacent descriptor count (clamped to [`DESC_MAX_ADJACENT`]).
    #[inline]
    pub fn set_adjacent(&mut self, adjacent: u8) {
        let adj = u32::from(adjacent.min(DESC_MAX_ADJACENT)) << DESC_ADJACENT_SHIFT;
        self.control = ((self.control() & !DESC_ADJACENT_MASK) | adj).to_le();
    }

    #[inline]
    pub fn bytes(&self) -> u32 {
        u32::from_le(self.bytes)
    }

    #[inline]
    pub fn src_addr(&self) -> u64 {
        u64::from_le(self.src_addr)
    }

    #[inline]
    pub fn dst_addr(&self) -> u64 {
        u64::from_le(self.dst_addr)
    }

    #[inline]
    pub fn next_desc(&self) -> u64 {
        u64::from_le(self.next_desc)
    }

    /// Link this descriptor to the one at physical address `next`.
    #[inline]
    pub fn set_next(&mut self, next: u64) {
        self.next_desc = next.to_le();
    }

    /// Decode a descriptor from its 32-byte wire form.
    pub fn from_bytes(raw: &[u8; DESC_SIZE]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes([raw[o], raw[o + 1], raw[o + 2], raw[o + 3]]);
        let u64_at = |o: usize| u64::from(u32_at(o)) | (u64::from(u32_at(o + 4)) << 32);
        Self {
            control: u32_at(0).to_le(),
            bytes: u32_at(4).to_le(),
            src_addr: u64_at(8).to_le(),
            dst_addr: u64_at(16).to_le(),
            next_desc: u64_at(24).to_le(),
        }
    }
}

impl Default for XdmaDesc {
    fn default() -> Self {
        Self::new()
    }
}

/// 32-byte poll-mode write-back record.
///
/// The engine writes the completed descriptor count to the first word when
/// the descriptor list stops. Bit 31 of that word flags an error.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PollWriteBack {
    completed: u32,
    reserved: [u32; 7],
}

/// Error flag in the write-back word.
pub const WB_ERROR: u32 = 1 << 31;
/// Completed descriptor count in the write-back word.
pub const WB_COUNT_MASK: u32 = !WB_ERROR;

impl PollWriteBack {
    /// Read the raw write-back word with volatile semantics.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live, aligned `PollWriteBack`.
    #[inline]
    pub unsafe fn read_word(ptr: *const PollWriteBack) -> u32 {
        u32::from_le(std::ptr::read_volatile(std::ptr::addr_of!((*ptr).completed)))
    }

    /// Reset the record before arming the engine.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live, aligned `PollWriteBack`.
    #[inline]
    pub unsafe fn reset(ptr: *mut PollWriteBack) {
        std::ptr::write_volatile(ptr, Self::default());
    }

    /// Completed descriptor count encoded in a write-back word.
    #[inline]
    pub fn completed_descs(word: u32) -> u32 {
        word & WB_COUNT_MASK
    }

    /// Returns true if a write-back word reports an error.
    #[inline]
    pub fn is_error(word: u32) -> bool {
        word & WB_ERROR != 0
    }
}

// Compile-time layout checks against the hardware format
const _: () = assert!(std::mem::size_of::<XdmaDesc>() == DESC_SIZE);
const _: () = assert!(std::mem::size_of::<PollWriteBack>() == 32);

/// Populate a descriptor ring for one transfer.
///
/// Fills `ring[..entries.len()]` so that descriptor `i` moves `entries[i]`
/// between host memory and the card address that starts at `fpga_offset`.
/// The card address advances by each entry's length unless `non_incrementing`
/// is set. Descriptors are chained through `ring_phys`, the physical address
/// of `ring[0]`; the last one is marked [`DescControl::LAST`].
///
/// # Errors
///
/// Returns [`XdmaError::InvalidParameter`] if `entries` is empty, does not
/// fit in `ring`, or an entry exceeds [`DESC_MAX_BYTES`].
pub fn build_ring(
    ring: &mut [XdmaDesc],
    ring_phys: u64,
    entries: &[SgEntry],
    direction: Direction,
    fpga_offset: u64,
    non_incrementing: bool,
) -> XdmaResult<usize> {
    if entries.is_empty() {
        return Err(XdmaError::InvalidParameter("empty page list".into()));
    }
    if entries.len() > ring.len() {
        return Err(XdmaError::InvalidParameter(format!(
            "{} pages exceed descriptor ring of {}",
            entries.len(),
            ring.len()
        )));
    }

    let mut card_addr = fpga_offset;
    let last = entries.len() - 1;
    for (i, (desc, page)) in ring.iter_mut().zip(entries).enumerate() {
        if page.bytes > DESC_MAX_BYTES {
            return Err(XdmaError::InvalidParameter(format!(
                "page {} of {:#x} bytes exceeds descriptor limit",
                i, page.bytes
            )));
        }

        *desc = match direction {
            Direction::ToDevice => XdmaDesc::transfer(page.phys, card_addr, page.bytes),
            Direction::CardToHost => XdmaDesc::transfer(card_addr, page.phys, page.bytes),
        };
        if !non_incrementing {
            card_addr += u64::from(page.bytes);
        }

        if i == last {
            desc.add_flags(DescControl::LAST);
        } else {
            desc.set_next(ring_phys + ((i + 1) * DESC_SIZE) as u64);
        }
    }

    Ok(entries.len())
}

/// Log a descriptor ring at trace level.
pub fn dump_ring(ring: &[XdmaDesc]) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    for (i, d) in ring.iter().enumerate() {
        log::trace!(
            "desc[{i}]: control={:#010x} bytes={:#x} src={:#018x} dst={:#018x} next={:#018x}",
            d.control(),
            d.bytes(),
            d.src_addr(),
            d.dst_addr(),
            d.next_desc()
        );
    }
}
