//! Device handle and hardware-context management.
//!
//! One [`Device`] per process. Loaded accelerator binaries map to reusable
//! hardware contexts keyed by path; the driver caps the table at 16. Power
//! mode and preemption are fixed at construction.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::app::NpuApp;
use crate::buffer::Buffer;
use crate::driver::DeviceFd;
use crate::error::NpuError;
use crate::sequence::NpuGeneration;
use crate::Result;

/// Hard constraint from the kernel driver.
pub const MAX_CONTEXTS: usize = 16;

/// Power-mode hint handed to the platform at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Powersaver,
    Balanced,
    Performance,
    Turbo,
}

impl PowerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Powersaver => "powersaver",
            Self::Balanced => "balanced",
            Self::Performance => "performance",
            Self::Turbo => "turbo",
        }
    }
}

impl FromStr for PowerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "powersaver" => Ok(Self::Powersaver),
            "balanced" => Ok(Self::Balanced),
            "default" | "performance" => Ok(Self::Performance),
            "turbo" => Ok(Self::Turbo),
            other => Err(format!(
                "invalid power mode `{other}` (expected powersaver, balanced, performance or turbo)"
            )),
        }
    }
}

/// The open accelerator node.
#[derive(Debug)]
pub struct Device {
    fd: Arc<DeviceFd>,
}

impl Device {
    pub fn open(device_id: u32) -> Result<Self> {
        let fd = DeviceFd::open(device_id).map_err(|source| NpuError::Driver {
            call: "open",
            source,
        })?;
        Ok(Self { fd: Arc::new(fd) })
    }

    pub fn fd(&self) -> &Arc<DeviceFd> {
        &self.fd
    }
}

/// A hardware context bound to one loaded binary. Destroyed with its handle.
#[derive(Debug)]
pub struct HwContext {
    fd: Arc<DeviceFd>,
    handle: u32,
    kernel_name: String,
    binary_path: PathBuf,
}

impl HwContext {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }
}

impl Drop for HwContext {
    fn drop(&mut self) {
        let _ = self.fd.destroy_hwctx(self.handle);
    }
}

/// Bounded path-keyed table; the registration bookkeeping lives here so it
/// stays testable without a device node.
pub(crate) struct BinaryTable<T> {
    entries: Vec<(PathBuf, Arc<T>)>,
    limit: usize,
}

impl<T> BinaryTable<T> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            entries: Vec::with_capacity(limit),
            limit,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get_or_insert(
        &mut self,
        path: &Path,
        create: impl FnOnce() -> Result<T>,
    ) -> Result<Arc<T>> {
        if let Some((_, entry)) = self.entries.iter().find(|(p, _)| p == path) {
            return Ok(entry.clone());
        }
        if self.entries.len() >= self.limit {
            return Err(NpuError::ContextLimitReached { limit: self.limit });
        }
        let entry = Arc::new(create()?);
        self.entries.push((path.to_path_buf(), entry.clone()));
        Ok(entry)
    }
}

/// Process-wide owner of the device handle and the context table.
pub struct DeviceManager {
    device: Device,
    generation: NpuGeneration,
    power_mode: PowerMode,
    preemption: bool,
    contexts: Mutex<BinaryTable<HwContext>>,
}

impl DeviceManager {
    pub fn new(
        device_id: u32,
        generation: NpuGeneration,
        power_mode: PowerMode,
        preemption: bool,
    ) -> Result<Self> {
        let device = Device::open(device_id)?;
        info!(
            target: "flm::npu",
            power_mode = power_mode.as_str(),
            preemption,
            "device {device_id} opened"
        );
        Ok(Self {
            device,
            generation,
            power_mode,
            preemption,
            contexts: Mutex::new(BinaryTable::new(MAX_CONTEXTS)),
        })
    }

    pub fn generation(&self) -> NpuGeneration {
        self.generation
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power_mode
    }

    pub fn preemption_enabled(&self) -> bool {
        self.preemption
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Map a loaded binary to a hardware context. Idempotent per path; at
    /// most [`MAX_CONTEXTS`] distinct binaries.
    pub fn register_binary(&self, path: &Path) -> Result<Arc<HwContext>> {
        let mut table = self.contexts.lock();
        let fd = self.device.fd().clone();
        let generation = self.generation;
        table.get_or_insert(path, || {
            let raw = std::fs::read(path)?;
            let kernel_name = extract_kernel_name(&raw);
            let num_tiles = match generation {
                NpuGeneration::Npu1 => 16,
                NpuGeneration::Npu2 => 32,
            };
            let handle = fd.create_hwctx(num_tiles).map_err(|source| NpuError::Driver {
                call: "create_hwctx",
                source,
            })?;
            debug!(target: "flm::npu", path = %path.display(), handle, %kernel_name, "binary registered");
            Ok(HwContext {
                fd: fd.clone(),
                handle,
                kernel_name,
                binary_path: path.to_path_buf(),
            })
        })
    }

    /// A fresh application bound to one context, with an empty sequence.
    pub fn create_app(&self, ctx: &Arc<HwContext>) -> NpuApp {
        NpuApp::new(
            self.device.fd().clone(),
            ctx.clone(),
            self.generation,
            self.preemption,
        )
    }

    /// DMA-visible allocation of `count` elements.
    pub fn alloc_buffer<T: Pod>(&self, count: usize) -> Result<Buffer<T>> {
        Buffer::device(self.device.fd().clone(), count)
    }

    /// Formatted telemetry block from the driver.
    pub fn npu_info(&self) -> Result<String> {
        let aie = self
            .device
            .fd()
            .query_aie_metadata()
            .map_err(|source| NpuError::Driver { call: "get_info", source })?;
        let clocks = self
            .device
            .fd()
            .query_clock_metadata()
            .map_err(|source| NpuError::Driver { call: "get_info", source })?;
        let mut out = String::new();
        let _ = writeln!(out, "NPU version: {}.{}", aie.version.major, aie.version.minor);
        let _ = writeln!(out, "MP-NPU clock: {} MHz", clocks.mp_npu_clock.freq_mhz);
        let _ = writeln!(out, "H clock: {} MHz", clocks.h_clock.freq_mhz);
        let _ = writeln!(out, "columns: {}, rows: {}", aie.cols, aie.rows);
        let _ = writeln!(
            out,
            "core rows {} (start {}), mem rows {} (start {}), shim rows {} (start {})",
            aie.core.row_count,
            aie.core.row_start,
            aie.mem.row_count,
            aie.mem.row_start,
            aie.shim.row_count,
            aie.shim.row_start
        );
        Ok(out)
    }

    /// Current power draw in watts.
    pub fn npu_power(&self) -> Result<f32> {
        self.device
            .fd()
            .query_power()
            .map_err(|source| NpuError::Driver { call: "get_info", source })
    }
}

/// The kernel entry point is embedded in the binary's metadata; entries for
/// this platform start with `MLIR_AIE`.
fn extract_kernel_name(raw: &[u8]) -> String {
    const MARKER: &[u8] = b"MLIR_AIE";
    if let Some(pos) = raw.windows(MARKER.len()).position(|w| w == MARKER) {
        let tail = &raw[pos..];
        let end = tail
            .iter()
            .position(|&b| !(b.is_ascii_alphanumeric() || b == b'_'))
            .unwrap_or(tail.len());
        if let Ok(name) = std::str::from_utf8(&tail[..end]) {
            return name.to_string();
        }
    }
    "MLIR_AIE".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_is_idempotent() {
        let mut table: BinaryTable<u32> = BinaryTable::new(16);
        let a = table
            .get_or_insert(Path::new("a.bin"), || Ok(1))
            .unwrap();
        let b = table
            .get_or_insert(Path::new("a.bin"), || panic!("must not recreate"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_registration_limit() {
        let mut table: BinaryTable<u32> = BinaryTable::new(2);
        table.get_or_insert(Path::new("a"), || Ok(0)).unwrap();
        table.get_or_insert(Path::new("b"), || Ok(1)).unwrap();
        let err = table.get_or_insert(Path::new("c"), || Ok(2)).unwrap_err();
        assert!(matches!(err, NpuError::ContextLimitReached { limit: 2 }));
        // Existing entries still resolve past the limit.
        assert_eq!(*table.get_or_insert(Path::new("b"), || Ok(9)).unwrap(), 1);
    }

    #[test]
    fn test_kernel_name_extraction() {
        let blob = [b"junk\x00\x01".as_ref(), b"MLIR_AIE_main\x00more".as_ref()].concat();
        assert_eq!(extract_kernel_name(&blob), "MLIR_AIE_main");
        assert_eq!(extract_kernel_name(b"nothing here"), "MLIR_AIE");
    }

    #[test]
    fn test_power_mode_parsing() {
        assert_eq!("turbo".parse::<PowerMode>().unwrap(), PowerMode::Turbo);
        assert_eq!("default".parse::<PowerMode>().unwrap(), PowerMode::Performance);
        assert!("warp".parse::<PowerMode>().is_err());
    }
}
