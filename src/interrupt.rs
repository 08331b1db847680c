// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Interrupt demultiplexer.
//!
//! The host latches the IRQ block channel request register (and the user
//! request register) at interrupt level and hands the values to
//! [`demux`]. Each set bit is owned by at most one engine slot; the
//! demultiplexer stops the completed engines, signals their sessions and
//! invokes the user handler once per engine.

use crate::device::{Device, EngineSlot};
use crate::error::{err_log, set_last_err, XdmaResult};
use crate::host::{InterruptSnapshot, InterruptType};
use crate::regs::{irq, Direction, EngineId, StatusFlags};
use crate::session::{CompletionContext, SessionId};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Completion data for one engine interrupt.
#[derive(Clone)]
pub struct InterruptResult {
    /// Session that owns the engine.
    pub session: SessionId,
    pub engine: EngineId,
    /// Engine status register, read and cleared by the demultiplexer.
    pub dma_status: StatusFlags,
    /// Latched channel interrupt request word.
    pub int_status: u32,
    /// Completed descriptor count of the engine.
    pub completed_descs: u32,
    /// Interrupts handled since enable.
    pub counter: u64,
    /// Interrupts lost since enable.
    pub lost: u64,
    pub int_type: InterruptType,
    /// MSI/MSI-X message data of this interrupt.
    pub last_message: u32,
    /// Completion context of the session.
    pub context: Option<CompletionContext>,
}

impl InterruptResult {
    pub fn is_message_based(&self) -> bool {
        matches!(self.int_type, InterruptType::Msi | InterruptType::MsiX)
    }
}

impl fmt::Debug for InterruptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptResult")
            .field("session", &self.session)
            .field("engine", &self.engine)
            .field("dma_status", &self.dma_status)
            .field("int_status", &format_args!("{:#x}", self.int_status))
            .field("completed_descs", &self.completed_descs)
            .field("counter", &self.counter)
            .field("lost", &self.lost)
            .field("int_type", &self.int_type)
            .field("last_message", &self.last_message)
            .field("context", &self.context.is_some())
            .finish()
    }
}

/// Handler for DMA completion interrupts.
pub type IntHandler = Arc<dyn Fn(&Device, &InterruptResult) + Send + Sync>;

/// Handler for user interrupts; receives the latched user request bits.
pub type UserIntHandler = Arc<dyn Fn(&Device, u32) + Send + Sync>;

/// Dispatch one latched interrupt.
///
/// `snapshot.latched` holds the channel request word followed by the user
/// request word. Errors are logged; nothing propagates to the host.
pub(crate) fn demux(device: &Device, snapshot: &InterruptSnapshot) {
    let shared = device.shared();
    let request = snapshot.latched.first().copied().unwrap_or(0);
    let user_request = snapshot.latched.get(1).copied().unwrap_or(0);

    if request != 0 {
        if let Err(e) =
            shared
                .host
                .write32(shared.config_bar, irq::CHANNEL_INT_ENABLE_MASK_W1C, request)
        {
            log::error!("failed to mask channel interrupts {request:#x}: {e}");
        }
    }

    let (handler, user_handler) = shared.handlers();
    let mut claimed = 0u32;
    // Only enabled slots own a bit; anything else in the word is phantom.
    for slot in shared.slots.iter().filter(|s| s.enabled) {
        if request & slot.irq_mask == 0 {
            continue;
        }
        claimed |= slot.irq_mask;

        match handle_engine(slot, request, snapshot) {
            Ok(Some(result)) => {
                shared.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                if let Some(h) = &handler {
                    h(device, &result);
                }
            }
            Ok(None) => {}
            Err(e) => {
                shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                let msg = format!("{}: interrupt handling failed: {}", slot.id, e);
                log::error!("{msg}");
                set_last_err(msg);
                if let Some(core) = slot.attached() {
                    if let Err(e) = core.regs.stop(&core.mode) {
                        err_log("interrupt_engine_stop", e);
                    }
                }
            }
        }
    }

    let unclaimed = request & !claimed;
    if unclaimed != 0 {
        shared.stats.phantom.fetch_add(1, Ordering::Relaxed);
        let msg = format!("EnginePhantomInterrupt: request bits {unclaimed:#x} match no enabled engine");
        log::error!("{msg}");
        set_last_err(msg);
    }

    if user_request != 0 {
        log::debug!("user interrupt request {user_request:#x}");
        match &user_handler {
            Some(h) => h(device, user_request),
            None => log::warn!("user interrupt {user_request:#x} without handler"),
        }
    }
}

/// Complete the transfer of one engine. Returns `None` for idle engines.
fn handle_engine(
    slot: &EngineSlot,
    request: u32,
    snapshot: &InterruptSnapshot,
) -> XdmaResult<Option<InterruptResult>> {
    let Some(core) = slot.attached() else {
        let status = slot.regs.status(true)?;
        log::warn!(
            "{}: interrupt without open session, status {:#x}",
            slot.id,
            status.bits()
        );
        return Ok(None);
    };

    let completed_descs = core.regs.completed_count()?;
    let dma_status = core.regs.status(true)?;
    core.regs.stop(&core.mode)?;
    if core.mode.direction == Direction::CardToHost {
        core.sync_for_cpu()?;
    }
    log::trace!(
        "{}: interrupt, {} descriptors completed, status {:#x}",
        slot.id,
        completed_descs,
        dma_status.bits()
    );

    core.complete(dma_status, completed_descs);

    Ok(Some(InterruptResult {
        session: core.id,
        engine: slot.id,
        dma_status,
        int_status: request,
        completed_descs,
        counter: snapshot.counter,
        lost: snapshot.lost,
        int_type: snapshot.int_type,
        last_message: snapshot.last_message,
        context: core.context(),
    }))
}
