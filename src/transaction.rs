// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Scatter/gather transactions.
//!
//! A transaction moves a pinned buffer that is larger than one descriptor
//! ring can describe. The page list is cut into windows of at most
//! `max_transfer` bytes; each window is programmed and run as one
//! sub-transfer, in order.

use crate::error::{XdmaError, XdmaResult};
use crate::host::SgEntry;

/// Largest sub-transfer of a transaction.
pub const MAX_TRANSACTION_TRANSFER: u32 = 0x00FF_FFFF;

/// Outcome of [`SgTransaction::transfer_completed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// The next sub-transfer has been programmed; start the engine again.
    MoreRequired,
    /// All sub-transfers are done.
    Complete,
}

/// One sub-transfer of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Offset of the window within the buffer.
    pub offset: u64,
    pub bytes: u64,
    pub entries: Vec<SgEntry>,
}

/// Sequencer for the sub-transfers of one pinned buffer.
#[derive(Debug)]
pub struct SgTransaction {
    windows: Vec<Window>,
    current: usize,
    armed: bool,
}

impl SgTransaction {
    /// Split `entries` into windows of at most `max_transfer` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`XdmaError::InvalidParameter`] if `max_transfer` is zero or
    /// the page list is empty.
    pub fn new(entries: &[SgEntry], max_transfer: u32) -> XdmaResult<Self> {
        if max_transfer == 0 {
            return Err(XdmaError::InvalidParameter("zero transaction transfer size".into()));
        }
        if entries.is_empty() {
            return Err(XdmaError::InvalidParameter("empty page list".into()));
        }

        let max = u64::from(max_transfer);
        let mut windows = Vec::new();
        let mut window = Window {
            offset: 0,
            bytes: 0,
            entries: Vec::new(),
        };
        let mut buf_offset = 0u64;

        for entry in entries {
            let mut phys = entry.phys;
            let mut left = u64::from(entry.bytes);
            while left > 0 {
                if window.bytes == max {
                    let next = Window {
                        offset: buf_offset,
                        bytes: 0,
                        entries: Vec::new(),
                    };
                    windows.push(std::mem::replace(&mut window, next));
                }
                let take = left.min(max - window.bytes);
                window.entries.push(SgEntry {
                    phys,
                    bytes: take as u32,
                });
                window.bytes += take;
                phys += take;
                left -= take;
                buf_offset += take;
            }
        }
        if !window.entries.is_empty() {
            windows.push(window);
        }

        Ok(Self {
            windows,
            current: 0,
            armed: false,
        })
    }

    /// Number of sub-transfers.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Largest number of page entries in any window.
    pub fn max_window_entries(&self) -> usize {
        self.windows.iter().map(|w| w.entries.len()).max().unwrap_or(0)
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    /// The window currently programmed, if the transaction is armed.
    pub fn current(&self) -> Option<&Window> {
        if self.armed {
            self.windows.get(self.current)
        } else {
            None
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Arm the transaction and program the first window with `program`.
    ///
    /// # Errors
    ///
    /// Returns [`XdmaError::AlreadyDone`] if the transaction is already armed,
    /// or the error of `program`, in which case the transaction stays idle.
    pub fn execute<F>(&mut self, mut program: F) -> XdmaResult<()>
    where
        F: FnMut(&Window) -> XdmaResult<()>,
    {
        if self.armed {
            return Err(XdmaError::AlreadyDone("transaction execute"));
        }
        program(&self.windows[0])?;
        self.current = 0;
        self.armed = true;
        Ok(())
    }

    /// Account for the completion of the current window.
    ///
    /// Programs the next window with `program` and returns
    /// [`TransferState::MoreRequired`], or returns [`TransferState::Complete`]
    /// after the last window.
    pub fn transfer_completed<F>(&mut self, mut program: F) -> XdmaResult<TransferState>
    where
        F: FnMut(&Window) -> XdmaResult<()>,
    {
        if !self.armed {
            return Err(XdmaError::InvalidParameter("transaction not executing".into()));
        }
        if self.current + 1 >= self.windows.len() {
            self.current = self.windows.len();
            return Ok(TransferState::Complete);
        }
        program(&self.windows[self.current + 1])?;
        self.current += 1;
        Ok(TransferState::MoreRequired)
    }

    /// Return the transaction to an armable state.
    pub fn release(&mut self) {
        self.armed = false;
        self.current = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize, page: u32) -> Vec<SgEntry> {
        (0..n)
            .map(|i| SgEntry {
                phys: 0x10_0000 + (i as u64) * u64::from(page) * 2,
                bytes: page,
            })
            .collect()
    }

    #[test]
    fn test_windows_cover_buffer() {
        let list = entries(10, 4096);
        let tr = SgTransaction::new(&list, 3 * 4096 + 100).unwrap();
        assert_eq!(tr.window_count(), 4);

        let total: u64 = tr.windows().iter().map(|w| w.bytes).sum();
        assert_eq!(total, 10 * 4096);

        let mut expected_offset = 0;
        for w in tr.windows() {
            assert_eq!(w.offset, expected_offset);
            assert!(w.bytes <= 3 * 4096 + 100);
            let sum: u64 = w.entries.iter().map(|e| u64::from(e.bytes)).sum();
            assert_eq!(sum, w.bytes);
            expected_offset += w.bytes;
        }

        // Page 3 is split across the first two windows.
        let w0 = &tr.windows()[0];
        let w1 = &tr.windows()[1];
        assert_eq!(w0.entries[3].bytes, 100);
        assert_eq!(w1.entries[0].phys, list[3].phys + 100);
        assert_eq!(w1.entries[0].bytes, 4096 - 100);
        assert!(tr.max_window_entries() <= 5);
    }

    #[test]
    fn test_sequence() {
        let list = entries(4, 4096);
        let mut tr = SgTransaction::new(&list, 2 * 4096).unwrap();
        let mut programmed = Vec::new();

        tr.execute(|w| {
            programmed.push(w.offset);
            Ok(())
        })
        .unwrap();
        assert!(matches!(
            tr.execute(|_| Ok(())),
            Err(XdmaError::AlreadyDone(_))
        ));

        let state = tr
            .transfer_completed(|w| {
                programmed.push(w.offset);
                Ok(())
            })
            .unwrap();
        assert_eq!(state, TransferState::MoreRequired);
        assert_eq!(tr.transfer_completed(|_| Ok(())).unwrap(), TransferState::Complete);
        assert_eq!(programmed, vec![0, 8192]);
        assert!(tr.current().is_none());

        tr.release();
        assert!(!tr.is_armed());
        assert!(tr.transfer_completed(|_| Ok(())).is_err());
        tr.execute(|_| Ok(())).unwrap();
        assert_eq!(tr.current().map(|w| w.offset), Some(0));
    }

    #[test]
    fn test_failed_program_leaves_idle() {
        let list = entries(2, 4096);
        let mut tr = SgTransaction::new(&list, 4096).unwrap();
        let res = tr.execute(|_| Err(XdmaError::Timeout));
        assert!(res.is_err());
        assert!(!tr.is_armed());
    }

    #[test]
    fn test_invalid() {
        assert!(SgTransaction::new(&[], 4096).is_err());
        assert!(SgTransaction::new(&entries(1, 16), 0).is_err());
    }
}
