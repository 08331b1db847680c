// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Engine controller.
//!
//! Register-level start, stop and status access for one H2C or C2H engine.
//! Buffer synchronization and completion waits live in the session; this
//! module only composes and issues register accesses.

use crate::error::XdmaResult;
use crate::host::{HostDevice, TransferCmd};
use crate::regs::{channel, irq, sgdma, Alignments, ControlFlags, Direction, EngineId, StatusFlags};
use std::sync::Arc;

/// Settings that determine the control register value of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineMode {
    pub direction: Direction,
    /// Completion reported through the write-back word instead of interrupts.
    pub polling: bool,
    pub streaming: bool,
    pub non_incrementing: bool,
}

impl EngineMode {
    /// Interrupt sources enabled while the engine runs in interrupt mode.
    pub fn interrupt_enables(&self) -> ControlFlags {
        let mut ie = ControlFlags::IE_ERRORS | ControlFlags::IE_COMPLETION;
        if self.streaming && self.direction == Direction::CardToHost {
            ie |= ControlFlags::IE_IDLE_STOPPED;
        }
        ie
    }

    /// Control register value for this mode, with or without RUN.
    pub fn control(&self, run: bool) -> ControlFlags {
        let mut ctrl = ControlFlags::IE_ERRORS;
        if run {
            ctrl |= ControlFlags::RUN;
        }
        if self.polling {
            ctrl |= ControlFlags::POLL_MODE_WB;
        } else {
            ctrl |= self.interrupt_enables() & !ControlFlags::IE_ERRORS;
        }
        if self.non_incrementing {
            ctrl |= ControlFlags::NON_INCR_ADDR;
        }
        ctrl
    }
}

/// Register accessor for one engine.
#[derive(Clone)]
pub struct EngineRegs {
    host: Arc<dyn HostDevice>,
    bar: usize,
    id: EngineId,
}

impl EngineRegs {
    pub fn new(host: Arc<dyn HostDevice>, bar: usize, id: EngineId) -> Self {
        Self { host, bar, id }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    #[inline]
    fn read(&self, reg: u64) -> XdmaResult<u32> {
        Ok(self.host.read32(self.bar, self.id.channel_base() + reg)?)
    }

    #[inline]
    fn write(&self, reg: u64, value: u32) -> XdmaResult<()> {
        Ok(self.host.write32(self.bar, self.id.channel_base() + reg, value)?)
    }

    #[inline]
    fn sgdma_write(&self, reg: u64, value: u32) -> XdmaResult<()> {
        Ok(self.host.write32(self.bar, self.id.sgdma_base() + reg, value)?)
    }

    /// Raw identifier register.
    pub fn identifier(&self) -> XdmaResult<u32> {
        self.read(channel::IDENTIFIER)
    }

    pub fn alignments_raw(&self) -> XdmaResult<u32> {
        self.read(channel::ALIGNMENTS)
    }

    pub fn alignments(&self) -> XdmaResult<Alignments> {
        Ok(Alignments::from_raw(self.alignments_raw()?))
    }

    pub fn control(&self) -> XdmaResult<ControlFlags> {
        Ok(ControlFlags::from_bits_retain(self.read(channel::CONTROL)?))
    }

    /// Read the status register, clearing it if `clear` is set.
    pub fn status(&self, clear: bool) -> XdmaResult<StatusFlags> {
        let reg = if clear {
            channel::STATUS_RC
        } else {
            channel::STATUS
        };
        Ok(StatusFlags::from_bits_retain(self.read(reg)?))
    }

    pub fn completed_count(&self) -> XdmaResult<u32> {
        self.read(channel::COMPLETED_DESC_COUNT)
    }

    /// Clear the non-incrementing address bit.
    pub fn clear_non_incrementing(&self) -> XdmaResult<()> {
        self.write(channel::CONTROL_W1C, ControlFlags::NON_INCR_ADDR.bits())
    }

    /// Program the poll-mode write-back address.
    pub fn set_writeback_address(&self, phys: u64) -> XdmaResult<()> {
        self.write(channel::POLL_WB_ADDR_LO, phys as u32)?;
        self.write(channel::POLL_WB_ADDR_HI, (phys >> 32) as u32)
    }

    /// Point the SGDMA at the first descriptor of a ring.
    pub fn set_descriptor_ring(&self, phys: u64, adjacent: u8) -> XdmaResult<()> {
        self.sgdma_write(sgdma::DESC_LO, phys as u32)?;
        self.sgdma_write(sgdma::DESC_HI, (phys >> 32) as u32)?;
        self.sgdma_write(sgdma::DESC_ADJACENT, u32::from(adjacent))
    }

    /// Enable this engine's interrupts.
    ///
    /// Writes the engine interrupt enable mask, sets `irq_mask` in the IRQ
    /// block channel enable mask and reads back the channel request register.
    pub fn enable_interrupts(&self, mode: &EngineMode, irq_mask: u32) -> XdmaResult<()> {
        let cmds = [
            TransferCmd::Write32 {
                bar: self.bar,
                offset: self.id.channel_base() + channel::INT_ENABLE_MASK,
                value: mode.interrupt_enables().bits(),
            },
            TransferCmd::Write32 {
                bar: self.bar,
                offset: irq::CHANNEL_INT_ENABLE_MASK_W1S,
                value: irq_mask,
            },
            TransferCmd::Read32 {
                bar: self.bar,
                offset: irq::CHANNEL_INT_REQUEST,
            },
        ];
        self.host.transfer(&cmds)?;
        Ok(())
    }

    /// Mask the completion interrupt sources of this engine.
    pub fn disable_completion_interrupts(&self) -> XdmaResult<()> {
        self.write(
            channel::INT_ENABLE_MASK_W1C,
            (ControlFlags::IE_COMPLETION | ControlFlags::IE_IDLE_STOPPED).bits(),
        )
    }

    /// Set RUN with the control bits of `mode`.
    ///
    /// The status register is read back afterwards so the write has reached
    /// the device before this returns.
    pub fn start(&self, mode: &EngineMode) -> XdmaResult<()> {
        let ctrl = mode.control(true);
        log::trace!("{}: start, control {:#010x}", self.id, ctrl.bits());
        self.write(channel::CONTROL, ctrl.bits())?;
        self.read(channel::STATUS)?;
        Ok(())
    }

    /// Clear RUN, keeping the other control bits of `mode`.
    pub fn stop(&self, mode: &EngineMode) -> XdmaResult<()> {
        let ctrl = mode.control(false);
        log::trace!("{}: stop, control {:#010x}", self.id, ctrl.bits());
        self.write(channel::CONTROL, ctrl.bits())?;
        if !mode.polling {
            self.disable_completion_interrupts()?;
        }
        Ok(())
    }

    /// Returns true if RUN is set.
    pub fn is_running(&self) -> XdmaResult<bool> {
        Ok(self.control()?.contains(ControlFlags::RUN))
    }

    /// Performance counters: (cycles, data beats).
    pub fn perf_counters(&self) -> XdmaResult<(u64, u64)> {
        let lo = self.read(channel::PERF_CYCLE_COUNT_LO)?;
        let hi = self.read(channel::PERF_CYCLE_COUNT_HI)?;
        let dlo = self.read(channel::PERF_DATA_COUNT_LO)?;
        let dhi = self.read(channel::PERF_DATA_COUNT_HI)?;
        Ok((
            (u64::from(hi) << 32) | u64::from(lo),
            (u64::from(dhi) << 32) | u64::from(dlo),
        ))
    }
}
