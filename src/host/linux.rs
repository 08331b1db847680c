// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Linux host-DMA service.
//!
//! Discovers the PCIe function through sysfs and maps its memory BARs from
//! `/sys/bus/pci/devices/<addr>/resourceN`. User buffers are pinned with
//! `mlock` and translated through `/proc/self/pagemap`, which needs
//! `CAP_SYS_ADMIN` to report page frame numbers. Coherent buffers are backed
//! by a single 2 MiB hugepage, or by one locked page for small allocations.
//!
//! Interrupts are received through the UIO framework: the function must be
//! bound to `uio_pci_generic`, which delivers legacy line interrupts only.
//! Plug-and-play and power events are not available.
//!
//! An open device holds an exclusive `flock` on the function's `config`
//! file, so a second open of the same function fails with
//! [`HostError::Busy`] in this and in any other process using this backend.
//!
//! Without an IOMMU the bus addresses are the physical addresses reported by
//! pagemap. With an IOMMU in translating mode this backend does not work.

use super::{
    BarInfo, CoherentAlloc, DmaHandle, EventCallback, EventMask, HostDevice, HostDma,
    InterruptCallback, InterruptSnapshot, InterruptType, PinOptions, SgEntry, SgList, TransferCmd,
};
use crate::descriptor::DESC_MAX_BYTES;
use crate::error::{HostError, HostResult};
use crate::regs::Direction;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};

const SYSFS_PCI_PATH: &str = "/sys/bus/pci/devices";
const PAGEMAP_PATH: &str = "/proc/self/pagemap";

/// Number of standard BARs of a type 0 function.
const BAR_COUNT: usize = 6;

/// `IORESOURCE_MEM` in the flags column of the sysfs `resource` file.
const IORESOURCE_MEM: u64 = 0x200;

const HUGE_PAGE_SIZE: usize = 2 << 20;

/// Poll period of the interrupt thread, bounding how long disable waits.
const UIO_POLL_MS: libc::c_int = 100;

const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

// ============================================================================
// sysfs helpers
// ============================================================================

fn read_sysfs_string(path: &Path) -> HostResult<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Parse a sysfs hex identifier such as `0x10ee`.
fn parse_hex_u16(s: &str) -> Option<u16> {
    let s = s.trim();
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(digits, 16).ok()
}

fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

/// One line of the sysfs `resource` file: start, end and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Resource {
    start: u64,
    end: u64,
    flags: u64,
}

impl Resource {
    fn size(&self) -> u64 {
        if self.end > self.start {
            self.end - self.start + 1
        } else {
            0
        }
    }

    fn is_memory(&self) -> bool {
        self.flags & IORESOURCE_MEM != 0
    }
}

/// Parse the BAR lines of a sysfs `resource` file.
fn parse_resources(text: &str) -> Vec<Resource> {
    text.lines()
        .take(BAR_COUNT)
        .map(|line| {
            let mut cols = line.split_whitespace().map(parse_hex_u64);
            let mut next = || cols.next().flatten().unwrap_or(0);
            Resource {
                start: next(),
                end: next(),
                flags: next(),
            }
        })
        .collect()
}

/// Page frame number of a pagemap entry, `None` if the page is not present.
fn pagemap_pfn(entry: u64) -> Option<u64> {
    if entry & PAGEMAP_PRESENT == 0 {
        return None;
    }
    Some(entry & PAGEMAP_PFN_MASK)
}

/// Merge physically contiguous chunks, keeping every entry below `max`.
fn coalesce(chunks: &[SgEntry], merge: bool, max: u32) -> Vec<SgEntry> {
    let mut out: Vec<SgEntry> = Vec::with_capacity(chunks.len());
    for &chunk in chunks {
        match out.last_mut() {
            Some(last)
                if merge
                    && last.phys + u64::from(last.bytes) == chunk.phys
                    && u64::from(last.bytes) + u64::from(chunk.bytes) <= u64::from(max) =>
            {
                last.bytes += chunk.bytes;
            }
            _ => out.push(chunk),
        }
    }
    out
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

// ============================================================================
// Host service
// ============================================================================

/// Host-DMA service for Linux.
pub struct LinuxHost {
    sysfs_root: PathBuf,
    driver_open: AtomicBool,
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxHost {
    pub fn new() -> Self {
        Self::with_sysfs_root(SYSFS_PCI_PATH)
    }

    /// Scan PCI functions below `root` instead of `/sys/bus/pci/devices`.
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: root.into(),
            driver_open: AtomicBool::new(false),
        }
    }

    /// sysfs directory of the first function matching `vendor`/`device`.
    fn find_function(&self, vendor: u16, device: u16) -> HostResult<PathBuf> {
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.sysfs_root)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for path in entries {
            let ids = (
                read_sysfs_string(&path.join("vendor")).ok(),
                read_sysfs_string(&path.join("device")).ok(),
            );
            if let (Some(v), Some(d)) = ids {
                if parse_hex_u16(&v) == Some(vendor) && parse_hex_u16(&d) == Some(device) {
                    return Ok(path);
                }
            }
        }
        Err(HostError::DeviceNotFound { vendor, device })
    }
}

impl HostDma for LinuxHost {
    fn open(&self) -> HostResult<()> {
        if self.driver_open.swap(true, Ordering::AcqRel) {
            return Err(HostError::Busy("driver already open".into()));
        }
        if !self.sysfs_root.is_dir() {
            self.driver_open.store(false, Ordering::Release);
            return Err(HostError::Unsupported("PCI sysfs not available"));
        }
        Ok(())
    }

    fn close(&self) {
        self.driver_open.store(false, Ordering::Release);
    }

    fn device_open(&self, vendor: u16, device: u16) -> HostResult<Arc<dyn HostDevice>> {
        let path = self.find_function(vendor, device)?;
        log::debug!("found {vendor:04x}:{device:04x} at {}", path.display());
        Ok(LinuxDevice::open(path)? as Arc<dyn HostDevice>)
    }
}

// ============================================================================
// Device
// ============================================================================

/// Open the function's config space and take the exclusive open lock.
fn lock_function(path: &Path) -> HostResult<File> {
    let config = File::open(path.join("config"))?;
    // SAFETY: flock on a descriptor owned by `config`.
    let rc = unsafe { libc::flock(config.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(HostError::Busy(format!("{} is already open", path.display())));
        }
        return Err(err.into());
    }
    Ok(config)
}

/// One memory-mapped BAR.
struct BarMap {
    ptr: NonNull<u8>,
    len: usize,
}

impl BarMap {
    fn map(path: &Path, len: usize) -> HostResult<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        // SAFETY: mapping a sysfs resource file; the result is checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| HostError::Failed(format!("mmap of {} returned null", path.display())))?;
        Ok(Self { ptr, len })
    }

    fn reg(&self, offset: u64) -> HostResult<*mut u32> {
        let end = offset.checked_add(4).ok_or(HostError::InvalidAddress(offset))?;
        if offset % 4 != 0 || end > self.len as u64 {
            return Err(HostError::InvalidAddress(offset));
        }
        // SAFETY: `offset + 4` lies inside the mapping.
        Ok(unsafe { self.ptr.as_ptr().add(offset as usize).cast::<u32>() })
    }
}

impl Drop for BarMap {
    fn drop(&mut self) {
        // SAFETY: unmapping the region mapped in `BarMap::map`.
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

struct Pinned {
    addr: usize,
    len: usize,
}

struct Coherent {
    ptr: NonNull<u8>,
    len: usize,
}

struct LinuxState {
    pins: HashMap<u64, Pinned>,
    coherent: HashMap<u64, Coherent>,
    next_handle: u64,
}

impl LinuxState {
    fn new_handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }
}

struct IrqThread {
    thread: JoinHandle<()>,
    id: ThreadId,
    stop: Arc<AtomicBool>,
}

/// An opened PCIe function.
pub struct LinuxDevice {
    me: Weak<LinuxDevice>,
    path: PathBuf,
    page_size: usize,
    bars: Vec<Option<BarMap>>,
    bar_sizes: Vec<u64>,
    config: File,
    state: Mutex<LinuxState>,
    irq: Mutex<Option<IrqThread>>,
    closed: AtomicBool,
}

// SAFETY: the BAR pointers refer to MMIO mappings owned by the device and are
// only accessed with volatile 32-bit operations; the coherent pointers are
// owned mappings.
unsafe impl Send for LinuxDevice {}
unsafe impl Sync for LinuxDevice {}

impl LinuxDevice {
    fn open(path: PathBuf) -> HostResult<Arc<Self>> {
        let config = lock_function(&path)?;
        let resources = parse_resources(&fs::read_to_string(path.join("resource"))?);
        let mut bars = Vec::with_capacity(resources.len());
        let mut bar_sizes = Vec::with_capacity(resources.len());
        for (i, res) in resources.iter().enumerate() {
            let size = if res.is_memory() { res.size() } else { 0 };
            let map = if size > 0 {
                match BarMap::map(&path.join(format!("resource{i}")), size as usize) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        log::warn!("{}: BAR {i} not mapped: {e}", path.display());
                        None
                    }
                }
            } else {
                None
            };
            bar_sizes.push(if map.is_some() { size } else { 0 });
            bars.push(map);
        }

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            path,
            page_size: page_size(),
            bars,
            bar_sizes,
            config,
            state: Mutex::new(LinuxState {
                pins: HashMap::new(),
                coherent: HashMap::new(),
                next_handle: 1,
            }),
            irq: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, LinuxState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bar(&self, bar: usize) -> HostResult<&BarMap> {
        self.bars
            .get(bar)
            .and_then(Option::as_ref)
            .ok_or(HostError::InvalidAddress(bar as u64))
    }

    /// `/dev/uioN` of the UIO device bound to this function.
    fn uio_device(&self) -> HostResult<PathBuf> {
        let name = fs::read_dir(self.path.join("uio"))
            .map_err(|_| HostError::Unsupported("function is not bound to uio_pci_generic"))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .find(|n| n.starts_with("uio"))
            .ok_or(HostError::Unsupported("function is not bound to uio_pci_generic"))?;
        Ok(Path::new("/dev").join(name))
    }

    /// Translate `addr..addr + len` into physical chunks split at page
    /// boundaries.
    fn translate(&self, addr: usize, len: usize) -> HostResult<Vec<SgEntry>> {
        let pagemap = File::open(PAGEMAP_PATH)?;
        let page = self.page_size;
        let mut chunks = Vec::new();
        let mut cur = addr;
        let end = addr + len;
        while cur < end {
            let mut raw = [0u8; 8];
            pagemap.read_exact_at(&mut raw, (cur / page * 8) as u64)?;
            let pfn = pagemap_pfn(u64::from_le_bytes(raw))
                .ok_or(HostError::InvalidAddress(cur as u64))?;
            if pfn == 0 {
                return Err(HostError::Failed(
                    "pagemap hides page frames (CAP_SYS_ADMIN required)".into(),
                ));
            }
            let in_page = cur % page;
            let bytes = (page - in_page).min(end - cur);
            chunks.push(SgEntry {
                phys: pfn * page as u64 + in_page as u64,
                bytes: bytes as u32,
            });
            cur += bytes;
        }
        Ok(chunks)
    }

    fn map_anonymous(len: usize, huge: bool) -> HostResult<NonNull<u8>> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE | libc::MAP_LOCKED;
        if huge {
            flags |= libc::MAP_HUGETLB;
        }
        // SAFETY: anonymous mapping; the result is checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| HostError::Failed("mmap returned null".into()))
    }

    fn irq_loop(
        me: Weak<LinuxDevice>,
        uio: File,
        cmds: Vec<TransferCmd>,
        callback: InterruptCallback,
        stop: Arc<AtomicBool>,
    ) {
        let mut uio = uio;
        let mut counter = 0u64;
        let mut lost = 0u64;
        let mut last_count: Option<u32> = None;
        while !stop.load(Ordering::Acquire) {
            // Unmask the interrupt in the command register.
            if let Err(e) = uio.write_all(&1u32.to_ne_bytes()) {
                log::error!("uio unmask failed: {e}");
                return;
            }
            let mut pfd = libc::pollfd {
                fd: uio.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: polling one valid descriptor.
            let ready = unsafe { libc::poll(&mut pfd, 1, UIO_POLL_MS) };
            if ready <= 0 || stop.load(Ordering::Acquire) {
                continue;
            }
            let mut raw = [0u8; 4];
            if let Err(e) = uio.read_exact(&mut raw) {
                log::error!("uio read failed: {e}");
                return;
            }
            let count = u32::from_ne_bytes(raw);
            if let Some(prev) = last_count {
                lost += u64::from(count.wrapping_sub(prev).saturating_sub(1));
            }
            last_count = Some(count);
            counter += 1;

            let Some(dev) = me.upgrade() else {
                return;
            };
            let latched = match dev.transfer(&cmds) {
                Ok(v) => v,
                Err(e) => {
                    log::error!("interrupt register access failed: {e}");
                    continue;
                }
            };
            callback(&InterruptSnapshot {
                latched,
                counter,
                lost,
                int_type: InterruptType::Line,
                last_message: 0,
            });
        }
    }

    fn stop_irq_thread(&self) -> bool {
        let irq = self.irq.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(irq) = irq else {
            return false;
        };
        irq.stop.store(true, Ordering::Release);
        if irq.id != thread::current().id() && irq.thread.join().is_err() {
            log::error!("uio interrupt thread panicked");
        }
        true
    }
}

impl HostDevice for LinuxDevice {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn bar_count(&self) -> usize {
        self.bars.len()
    }

    fn bar_info(&self, bar: usize) -> Option<BarInfo> {
        self.bar_sizes.get(bar).map(|&size| BarInfo {
            size,
            active: size > 0,
        })
    }

    fn read32(&self, bar: usize, offset: u64) -> HostResult<u32> {
        let reg = self.bar(bar)?.reg(offset)?;
        // SAFETY: `reg` is an aligned register inside the mapped BAR.
        Ok(u32::from_le(unsafe { std::ptr::read_volatile(reg) }))
    }

    fn write32(&self, bar: usize, offset: u64, value: u32) -> HostResult<()> {
        let reg = self.bar(bar)?.reg(offset)?;
        // SAFETY: `reg` is an aligned register inside the mapped BAR.
        unsafe { std::ptr::write_volatile(reg, value.to_le()) };
        Ok(())
    }

    fn config_read8(&self, offset: u16) -> HostResult<u8> {
        let mut b = [0u8; 1];
        self.config.read_exact_at(&mut b, u64::from(offset))?;
        Ok(b[0])
    }

    unsafe fn pin(&self, addr: *mut u8, len: usize, options: &PinOptions) -> HostResult<SgList> {
        if addr.is_null() || len == 0 {
            return Err(HostError::InvalidAddress(addr as u64));
        }
        if libc::mlock(addr as *const libc::c_void, len) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let chunks = match self.translate(addr as usize, len) {
            Ok(c) => c,
            Err(e) => {
                libc::munlock(addr as *const libc::c_void, len);
                return Err(e);
            }
        };
        let max = options
            .transaction
            .map_or(DESC_MAX_BYTES, |t| t.max_transfer.min(DESC_MAX_BYTES));
        let entries = coalesce(&chunks, !options.no_page_merge, max);
        if !options.addr64 && entries.iter().any(|e| e.phys + u64::from(e.bytes) > 1 << 32) {
            libc::munlock(addr as *const libc::c_void, len);
            return Err(HostError::Failed("buffer above 4 GiB for 32-bit device".into()));
        }

        let mut st = self.lock();
        let handle = st.new_handle();
        st.pins.insert(
            handle,
            Pinned {
                addr: addr as usize,
                len,
            },
        );
        log::trace!(
            "pinned {len} bytes at {:#x} in {} entries",
            addr as usize,
            entries.len()
        );
        Ok(SgList {
            handle: DmaHandle(handle),
            entries,
        })
    }

    fn unpin(&self, handle: DmaHandle) -> HostResult<()> {
        let pin = self
            .lock()
            .pins
            .remove(&handle.0)
            .ok_or(HostError::Failed(format!("unknown pin {handle:?}")))?;
        // SAFETY: the range was locked in `pin`.
        unsafe { libc::munlock(pin.addr as *const libc::c_void, pin.len) };
        Ok(())
    }

    fn alloc_coherent(&self, len: usize, _direction: Direction) -> HostResult<CoherentAlloc> {
        let (ptr, map_len) = if len <= self.page_size {
            (Self::map_anonymous(self.page_size, false)?, self.page_size)
        } else if len <= HUGE_PAGE_SIZE {
            (Self::map_anonymous(HUGE_PAGE_SIZE, true)?, HUGE_PAGE_SIZE)
        } else {
            return Err(HostError::Unsupported("coherent allocation above 2 MiB"));
        };
        let phys = match self.translate(ptr.as_ptr() as usize, 1) {
            Ok(chunks) => chunks[0].phys,
            Err(e) => {
                // SAFETY: unmapping the region mapped above.
                unsafe { libc::munmap(ptr.as_ptr().cast(), map_len) };
                return Err(e);
            }
        };
        let mut st = self.lock();
        let handle = st.new_handle();
        st.coherent.insert(handle, Coherent { ptr, len: map_len });
        Ok(CoherentAlloc {
            handle: DmaHandle(handle),
            virt: ptr,
            phys,
            len,
        })
    }

    fn free_coherent(&self, handle: DmaHandle) -> HostResult<()> {
        let c = self
            .lock()
            .coherent
            .remove(&handle.0)
            .ok_or(HostError::Failed(format!("unknown allocation {handle:?}")))?;
        // SAFETY: unmapping the region mapped in `alloc_coherent`.
        unsafe { libc::munmap(c.ptr.as_ptr().cast(), c.len) };
        Ok(())
    }

    fn sync_for_device(&self, _handle: DmaHandle) -> HostResult<()> {
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn sync_for_cpu(&self, _handle: DmaHandle) -> HostResult<()> {
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn int_enable(
        &self,
        cmds: &[TransferCmd],
        callback: InterruptCallback,
    ) -> HostResult<InterruptType> {
        let mut irq = self.irq.lock().unwrap_or_else(|p| p.into_inner());
        if irq.is_some() {
            return Err(HostError::Busy("interrupts already enabled".into()));
        }
        let uio_path = self.uio_device()?;
        let uio = File::options().read(true).write(true).open(&uio_path)?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let me = self.me.clone();
        let cmds = cmds.to_vec();
        let thread = thread::Builder::new()
            .name("xdma-uio-irq".into())
            .spawn(move || Self::irq_loop(me, uio, cmds, callback, thread_stop))?;
        log::debug!("interrupts routed through {}", uio_path.display());
        *irq = Some(IrqThread {
            id: thread.thread().id(),
            thread,
            stop,
        });
        Ok(InterruptType::Line)
    }

    fn int_disable(&self) -> HostResult<()> {
        if self.stop_irq_thread() {
            Ok(())
        } else {
            Err(HostError::Failed("interrupts not enabled".into()))
        }
    }

    fn int_is_enabled(&self) -> bool {
        self.irq.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    fn event_register(&self, _mask: EventMask, _callback: EventCallback) -> HostResult<()> {
        Err(HostError::Unsupported("plug-and-play events"))
    }

    fn event_unregister(&self) -> HostResult<()> {
        Err(HostError::Unsupported("plug-and-play events"))
    }

    fn event_is_registered(&self) -> bool {
        false
    }

    fn close(&self) -> HostResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_irq_thread();
        // SAFETY: flock on the descriptor owned by `self.config`.
        unsafe { libc::flock(self.config.as_raw_fd(), libc::LOCK_UN) };
        let st = self.lock();
        if !st.pins.is_empty() || !st.coherent.is_empty() {
            log::warn!(
                "{}: closed with {} pins and {} coherent buffers",
                self.path.display(),
                st.pins.len(),
                st.coherent.len()
            );
        }
        Ok(())
    }
}

impl Drop for LinuxDevice {
    fn drop(&mut self) {
        self.stop_irq_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_ids() {
        assert_eq!(parse_hex_u16("0x10ee\n"), Some(0x10EE));
        assert_eq!(parse_hex_u16("9038"), Some(0x9038));
        assert_eq!(parse_hex_u16("0xzz"), None);
    }

    #[test]
    fn test_parse_resources() {
        let text = "0x00000000fb000000 0x00000000fb0fffff 0x0000000000040200\n\
                    0x00000000fb100000 0x00000000fb10ffff 0x0000000000040200\n\
                    0x0000000000000000 0x0000000000000000 0x0000000000000000\n\
                    0x000000000000e000 0x000000000000e07f 0x0000000000040101\n\
                    0x0000000000000000 0x0000000000000000 0x0000000000000000\n\
                    0x0000000000000000 0x0000000000000000 0x0000000000000000\n\
                    0x00000000fb200000 0x00000000fb27ffff 0x0000000000046200\n";
        let res = parse_resources(text);
        assert_eq!(res.len(), BAR_COUNT);
        assert_eq!(res[0].size(), 0x10_0000);
        assert!(res[0].is_memory());
        assert_eq!(res[1].size(), 0x1_0000);
        assert_eq!(res[2].size(), 0);
        assert!(!res[3].is_memory());
    }

    #[test]
    fn test_pagemap_entry() {
        assert_eq!(pagemap_pfn(0), None);
        assert_eq!(pagemap_pfn(PAGEMAP_PRESENT | 0x1234), Some(0x1234));
        // Soft-dirty and exclusive bits are not part of the frame number.
        assert_eq!(pagemap_pfn(PAGEMAP_PRESENT | (1 << 55) | (1 << 56) | 7), Some(7));
    }

    #[test]
    fn test_coalesce() {
        let chunks = [
            SgEntry { phys: 0x1000, bytes: 0x800 },
            SgEntry { phys: 0x1800, bytes: 0x1000 },
            SgEntry { phys: 0x2800, bytes: 0x1000 },
            SgEntry { phys: 0x8000, bytes: 0x1000 },
        ];
        let merged = coalesce(&chunks, true, DESC_MAX_BYTES);
        assert_eq!(
            merged,
            vec![
                SgEntry { phys: 0x1000, bytes: 0x2800 },
                SgEntry { phys: 0x8000, bytes: 0x1000 },
            ]
        );
        assert_eq!(coalesce(&chunks, false, DESC_MAX_BYTES), chunks.to_vec());
        assert_eq!(coalesce(&chunks, true, 0x1800).len(), 3);
    }

    #[test]
    fn test_find_function() {
        let root = std::env::temp_dir().join(format!("xdma-sysfs-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        for (addr, vendor, device) in [
            ("0000:00:1f.0", "0x8086", "0xa3c8"),
            ("0000:03:00.0", "0x10ee", "0x9038"),
        ] {
            let dir = root.join(addr);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("vendor"), format!("{vendor}\n")).unwrap();
            fs::write(dir.join("device"), format!("{device}\n")).unwrap();
        }

        let host = LinuxHost::with_sysfs_root(&root);
        host.open().unwrap();
        assert!(matches!(host.open(), Err(HostError::Busy(_))));
        assert_eq!(
            host.find_function(0x10EE, 0x9038).unwrap(),
            root.join("0000:03:00.0")
        );
        assert!(matches!(
            host.find_function(0x10EE, 0x7038),
            Err(HostError::DeviceNotFound { .. })
        ));
        host.close();
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_function_open_is_exclusive() {
        let dir = std::env::temp_dir().join(format!("xdma-lock-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config"), [0u8; 256]).unwrap();

        let first = lock_function(&dir).unwrap();
        assert!(matches!(lock_function(&dir), Err(HostError::Busy(_))));
        drop(first);
        let again = lock_function(&dir).unwrap();
        drop(again);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_open_without_sysfs() {
        let host = LinuxHost::with_sysfs_root("/nonexistent/xdma/sysfs");
        assert!(matches!(host.open(), Err(HostError::Unsupported(_))));
    }
}
