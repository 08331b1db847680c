// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! XDMA register map.
//!
//! Byte offsets into the XDMA configuration BAR as laid out by the
//! DMA/Bridge Subsystem for PCI Express (PG195):
//!
//! | Offset   | Block                                  |
//! |----------|----------------------------------------|
//! | `0x0000` | H2C channel registers (`0x100` per ch) |
//! | `0x1000` | C2H channel registers (`0x100` per ch) |
//! | `0x2000` | IRQ block                              |
//! | `0x3000` | Config block                           |
//! | `0x4000` | H2C SGDMA registers (`0x100` per ch)   |
//! | `0x5000` | C2H SGDMA registers (`0x100` per ch)   |
//! | `0x6000` | SGDMA common registers                 |

use bitflags::bitflags;
use std::fmt;

/// Number of channels per direction.
pub const CHANNELS_NUM: u32 = 4;

/// Number of engine slots (H2C0..3, C2H0..3).
pub const ENGINES_NUM: usize = 2 * CHANNELS_NUM as usize;

/// Smallest BAR that can hold the XDMA register space.
pub const MIN_CONFIG_BAR_SIZE: u64 = 0x8FE4;

/// Identifier magic in bits 31:20 of every identifier register.
pub const ID_MASK: u32 = 0xFFF0_0000;
pub const ID_MAGIC: u32 = 0x1FC0_0000;
/// Channel number field of a channel identifier register.
pub const ID_CHANNEL_MASK: u32 = 0x0000_0F00;
pub const ID_CHANNEL_SHIFT: u32 = 8;
/// Set in a channel identifier when the engine uses the AXI4-Stream interface.
pub const ID_STREAMING: u32 = 0x0000_8000;

/// Offset between consecutive channel register banks.
pub const CHANNEL_STRIDE: u64 = 0x100;

pub const H2C_CHANNEL_BASE: u64 = 0x0000;
pub const C2H_CHANNEL_BASE: u64 = 0x1000;
pub const IRQ_BLOCK_BASE: u64 = 0x2000;
pub const CONFIG_BLOCK_BASE: u64 = 0x3000;
pub const H2C_SGDMA_BASE: u64 = 0x4000;
pub const C2H_SGDMA_BASE: u64 = 0x5000;
pub const SGDMA_COMMON_BASE: u64 = 0x6000;

/// Channel register offsets, relative to the channel bank.
pub mod channel {
    pub const IDENTIFIER: u64 = 0x00;
    pub const CONTROL: u64 = 0x04;
    pub const CONTROL_W1S: u64 = 0x08;
    pub const CONTROL_W1C: u64 = 0x0C;
    pub const STATUS: u64 = 0x40;
    /// Reading returns the status and clears it.
    pub const STATUS_RC: u64 = 0x44;
    pub const COMPLETED_DESC_COUNT: u64 = 0x48;
    pub const ALIGNMENTS: u64 = 0x4C;
    pub const POLL_WB_ADDR_LO: u64 = 0x88;
    pub const POLL_WB_ADDR_HI: u64 = 0x8C;
    pub const INT_ENABLE_MASK: u64 = 0x90;
    pub const INT_ENABLE_MASK_W1S: u64 = 0x94;
    pub const INT_ENABLE_MASK_W1C: u64 = 0x98;
    pub const PERF_CONTROL: u64 = 0xC0;
    pub const PERF_CYCLE_COUNT_LO: u64 = 0xC4;
    pub const PERF_CYCLE_COUNT_HI: u64 = 0xC8;
    pub const PERF_DATA_COUNT_LO: u64 = 0xCC;
    pub const PERF_DATA_COUNT_HI: u64 = 0xD0;
}

/// IRQ block register offsets (absolute).
pub mod irq {
    pub const IDENTIFIER: u64 = 0x2000;
    pub const USER_INT_ENABLE_MASK: u64 = 0x2004;
    pub const USER_INT_ENABLE_MASK_W1S: u64 = 0x2008;
    pub const USER_INT_ENABLE_MASK_W1C: u64 = 0x200C;
    pub const CHANNEL_INT_ENABLE_MASK: u64 = 0x2010;
    pub const CHANNEL_INT_ENABLE_MASK_W1S: u64 = 0x2014;
    pub const CHANNEL_INT_ENABLE_MASK_W1C: u64 = 0x2018;
    pub const USER_INT_REQUEST: u64 = 0x2040;
    pub const CHANNEL_INT_REQUEST: u64 = 0x2044;
    pub const USER_INT_PENDING: u64 = 0x2048;
    pub const CHANNEL_INT_PENDING: u64 = 0x204C;
    /// Four user vector registers, `0x2080..=0x208C`.
    pub const USER_VECTOR_BASE: u64 = 0x2080;
    pub const CHANNEL_VECTOR_1: u64 = 0x20A0;
    pub const CHANNEL_VECTOR_2: u64 = 0x20A4;
}

/// Config block register offsets (absolute).
pub mod config {
    pub const IDENTIFIER: u64 = 0x3000;
    pub const BUSDEV: u64 = 0x3004;
    pub const PCIE_MAX_PAYLOAD: u64 = 0x3008;
    pub const PCIE_MAX_READ_REQUEST: u64 = 0x300C;
    pub const SYSTEM_ID: u64 = 0x3010;
    pub const MSI_ENABLE: u64 = 0x3014;
    pub const PCIE_DATA_WIDTH: u64 = 0x3018;
    pub const PCIE_CONTROL: u64 = 0x301C;
    pub const AXI_USER_MAX_PAYLOAD: u64 = 0x3040;
    pub const AXI_USER_MAX_READ_REQUEST: u64 = 0x3044;
    pub const WRITE_FLUSH_TIMEOUT: u64 = 0x3060;
}

/// SGDMA register offsets, relative to the SGDMA channel bank.
pub mod sgdma {
    pub const IDENTIFIER: u64 = 0x00;
    pub const DESC_LO: u64 = 0x80;
    pub const DESC_HI: u64 = 0x84;
    pub const DESC_ADJACENT: u64 = 0x88;
    pub const DESC_CREDITS: u64 = 0x8C;
}

/// Offset of the interrupt pin byte in PCI configuration space.
pub const PCI_INTERRUPT_PIN: u16 = 0x3D;

bitflags! {
    /// Engine control register bits (also used for the interrupt enable mask).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u32 {
        const RUN = 1 << 0;
        const IE_DESC_STOPPED = 1 << 1;
        const IE_DESC_COMPLETED = 1 << 2;
        const IE_DESC_ALIGN_MISMATCH = 1 << 3;
        const IE_MAGIC_STOPPED = 1 << 4;
        const IE_IDLE_STOPPED = 1 << 6;
        const IE_READ_ERROR = 0x1F << 9;
        const IE_DESC_ERROR = 0x1F << 19;
        /// Keep the card-side address constant across descriptors.
        const NON_INCR_ADDR = 1 << 25;
        /// Report completions through the poll-mode write-back word.
        const POLL_MODE_WB = 1 << 26;
    }
}

impl ControlFlags {
    /// Interrupt enables for every error class.
    pub const IE_ERRORS: Self = Self::IE_READ_ERROR
        .union(Self::IE_DESC_ERROR)
        .union(Self::IE_DESC_ALIGN_MISMATCH)
        .union(Self::IE_MAGIC_STOPPED);

    /// Interrupt enables signalling the end of a descriptor list.
    pub const IE_COMPLETION: Self = Self::IE_DESC_STOPPED.union(Self::IE_DESC_COMPLETED);
}

bitflags! {
    /// Engine status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        const BUSY = 1 << 0;
        const DESC_STOPPED = 1 << 1;
        const DESC_COMPLETED = 1 << 2;
        const ALIGN_MISMATCH = 1 << 3;
        const MAGIC_STOPPED = 1 << 4;
        const FETCH_STOPPED = 1 << 5;
        const IDLE_STOPPED = 1 << 6;
        const READ_ERROR = 0x1F << 9;
        const DESC_ERROR = 0x1F << 19;
    }
}

impl StatusFlags {
    /// Status bits reporting a failed transfer.
    pub const ERRORS: Self = Self::ALIGN_MISMATCH
        .union(Self::MAGIC_STOPPED)
        .union(Self::READ_ERROR)
        .union(Self::DESC_ERROR);

    /// Returns true if any error bit is set.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.intersects(Self::ERRORS)
    }
}

/// Transfer direction of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host-to-card (H2C).
    ToDevice,
    /// Card-to-host (C2H).
    CardToHost,
}

impl Direction {
    /// Short name as used in the XDMA documentation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ToDevice => "H2C",
            Self::CardToHost => "C2H",
        }
    }
}

/// Identifies one of the eight engine slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId {
    pub direction: Direction,
    pub channel: u32,
}

impl EngineId {
    /// Create an engine identifier. The channel is not range checked.
    pub const fn new(direction: Direction, channel: u32) -> Self {
        Self { direction, channel }
    }

    /// All engine slots in discovery order: H2C0..3 then C2H0..3.
    pub fn all() -> impl Iterator<Item = EngineId> {
        [Direction::ToDevice, Direction::CardToHost]
            .into_iter()
            .flat_map(|dir| (0..CHANNELS_NUM).map(move |ch| EngineId::new(dir, ch)))
    }

    /// Slot index in `0..ENGINES_NUM`.
    pub fn index(&self) -> usize {
        let base = match self.direction {
            Direction::ToDevice => 0,
            Direction::CardToHost => CHANNELS_NUM as usize,
        };
        base + self.channel as usize
    }

    /// Base offset of the channel register bank.
    pub fn channel_base(&self) -> u64 {
        let base = match self.direction {
            Direction::ToDevice => H2C_CHANNEL_BASE,
            Direction::CardToHost => C2H_CHANNEL_BASE,
        };
        base + CHANNEL_STRIDE * u64::from(self.channel)
    }

    /// Base offset of the SGDMA register bank.
    pub fn sgdma_base(&self) -> u64 {
        let base = match self.direction {
            Direction::ToDevice => H2C_SGDMA_BASE,
            Direction::CardToHost => C2H_SGDMA_BASE,
        };
        base + CHANNEL_STRIDE * u64::from(self.channel)
    }

    /// Identifier register value this engine reports when populated.
    pub fn expected_identifier(&self) -> u32 {
        let subsystem = match self.direction {
            Direction::ToDevice => 0x0000_0000,
            Direction::CardToHost => 0x0001_0000,
        };
        ID_MAGIC | subsystem | (self.channel << ID_CHANNEL_SHIFT)
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.direction.name(), self.channel)
    }
}

/// Returns true if an identifier register carries the XDMA magic.
#[inline]
pub fn is_xdma_identifier(value: u32) -> bool {
    value & ID_MASK == ID_MAGIC
}

/// Channel number reported by a channel identifier register.
#[inline]
pub fn identifier_channel(value: u32) -> u32 {
    (value & ID_CHANNEL_MASK) >> ID_CHANNEL_SHIFT
}

/// Decoded engine alignments register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignments {
    /// Required address alignment in bytes (bits 23:16).
    pub addr_align: u32,
    /// Required length granularity in bytes (bits 15:8).
    pub len_granularity: u32,
    /// Supported address bits (bits 7:0).
    pub address_bits: u32,
}

impl Alignments {
    /// Decode a raw alignments register value.
    ///
    /// Zero-valued alignment fields mean "no constraint" and decode to 1.
    pub fn from_raw(raw: u32) -> Self {
        Self {
            addr_align: ((raw >> 16) & 0xFF).max(1),
            len_granularity: ((raw >> 8) & 0xFF).max(1),
            address_bits: raw & 0xFF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_order_and_index() {
        let ids: Vec<EngineId> = EngineId::all().collect();
        assert_eq!(ids.len(), ENGINES_NUM);
        assert_eq!(ids[0], EngineId::new(Direction::ToDevice, 0));
        assert_eq!(ids[4], EngineId::new(Direction::CardToHost, 0));
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(id.index(), i);
        }
    }

    #[test]
    fn test_register_bases() {
        let c2h1 = EngineId::new(Direction::CardToHost, 1);
        assert_eq!(c2h1.channel_base(), 0x1100);
        assert_eq!(c2h1.sgdma_base(), 0x5100);
        let h2c3 = EngineId::new(Direction::ToDevice, 3);
        assert_eq!(h2c3.channel_base() + channel::STATUS, 0x0340);
        assert_eq!(h2c3.sgdma_base() + sgdma::DESC_HI, 0x4384);
    }

    #[test]
    fn test_identifier_decode() {
        let id = EngineId::new(Direction::CardToHost, 2).expected_identifier();
        assert!(is_xdma_identifier(id));
        assert_eq!(identifier_channel(id), 2);
        assert!(!is_xdma_identifier(0x1FB0_0000));
        assert!(!is_xdma_identifier(0xFFFF_FFFF));
    }

    #[test]
    fn test_alignments_decode() {
        let a = Alignments::from_raw(0x0040_0440);
        assert_eq!(a.addr_align, 64);
        assert_eq!(a.len_granularity, 4);
        assert_eq!(a.address_bits, 64);

        let zero = Alignments::from_raw(0);
        assert_eq!(zero.addr_align, 1);
        assert_eq!(zero.len_granularity, 1);
    }

    #[test]
    fn test_flag_groups() {
        assert_eq!(ControlFlags::IE_ERRORS.bits(), 0x00F8_3E18);
        assert_eq!(ControlFlags::IE_COMPLETION.bits(), 0x6);
        assert!(StatusFlags::from_bits_retain(1 << 19).is_error());
        assert!(!(StatusFlags::DESC_STOPPED | StatusFlags::DESC_COMPLETED).is_error());
    }
}
