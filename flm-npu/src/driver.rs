//! Kernel driver ABI.
//!
//! The accelerator is exposed as a DRM accel node (`/dev/accel/accelN`).
//! This module owns the raw ioctl surface: hardware context create/destroy,
//! DMA buffer objects, command submission and completion waits, and the
//! telemetry queries. Everything above this module speaks safe types; all
//! `unsafe` is confined here.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

const DRM_IOCTL_BASE: u64 = b'd' as u64;
const DRM_COMMAND_BASE: u64 = 0x40;

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

/// `_IOWR('d', DRM_COMMAND_BASE + nr, size)`
const fn drm_iowr(nr: u64, size: usize) -> libc::c_ulong {
    (((IOC_READ | IOC_WRITE) << 30)
        | ((size as u64) << 16)
        | (DRM_IOCTL_BASE << 8)
        | (DRM_COMMAND_BASE + nr)) as libc::c_ulong
}

// Command numbers, in driver order.
const NR_CREATE_HWCTX: u64 = 0;
const NR_DESTROY_HWCTX: u64 = 1;
const NR_CREATE_BO: u64 = 3;
const NR_GET_BO_INFO: u64 = 4;
const NR_SYNC_BO: u64 = 5;
const NR_EXEC_CMD: u64 = 6;
const NR_GET_INFO: u64 = 7;
const NR_WAIT_CMD: u64 = 8;

// GET_INFO parameters.
pub const QUERY_AIE_METADATA: u32 = 1;
pub const QUERY_CLOCK_METADATA: u32 = 3;
pub const QUERY_SENSORS: u32 = 4;

// Buffer object placement.
pub const BO_SHARE: u32 = 1;
pub const BO_DEV: u32 = 3;
pub const BO_CMD: u32 = 4;

// Sync directions.
pub const SYNC_TO_DEVICE: u32 = 0;
pub const SYNC_FROM_DEVICE: u32 = 1;

/// Terminal and transient states of a submitted command, as reported in the
/// leading word of the command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CmdState {
    New = 1,
    Queued = 2,
    Running = 3,
    Completed = 4,
    Error = 5,
    Abort = 6,
    Submitted = 7,
    Timeout = 8,
    NoResponse = 9,
}

impl CmdState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::New,
            2 => Self::Queued,
            3 => Self::Running,
            4 => Self::Completed,
            5 => Self::Error,
            6 => Self::Abort,
            7 => Self::Submitted,
            8 => Self::Timeout,
            _ => Self::NoResponse,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::New | Self::Queued | Self::Running | Self::Submitted)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Abort => "abort",
            Self::Submitted => "submitted",
            Self::Timeout => "timeout",
            Self::NoResponse => "noresponse",
        }
    }
}

impl std::fmt::Display for CmdState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// Execution-packet header: state[0:3] custom[4:11] count[12:22] opcode[23:27] type[28:31]
const ERT_START_CU: u32 = 0;

/// Pack an execution-packet header for a fresh submission.
pub fn pack_exec_header(payload_words: u32) -> u32 {
    (CmdState::New as u32) | ((payload_words & 0x7FF) << 12) | (ERT_START_CU << 23)
}

/// Read the state field back out of an execution-packet header.
pub fn unpack_exec_state(header: u32) -> CmdState {
    CmdState::from_raw(header & 0xF)
}

#[repr(C)]
#[derive(Default)]
struct DrmCreateHwctx {
    ext: u64,
    ext_flags: u64,
    qos_p: u64,
    umq_bo: u32,
    log_buf_bo: u32,
    max_opc: u32,
    num_tiles: u32,
    mem_size: u32,
    umq_doorbell: u32,
    handle: u32,
    syncobj_handle: u32,
}

#[repr(C)]
#[derive(Default)]
struct DrmDestroyHwctx {
    handle: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Default)]
struct DrmCreateBo {
    flags: u64,
    bo_type: u32,
    pad: u32,
    vaddr: u64,
    size: u64,
    handle: u32,
    pad2: u32,
}

#[repr(C)]
#[derive(Default)]
struct DrmGetBoInfo {
    ext: u64,
    ext_flags: u64,
    handle: u32,
    pad: u32,
    map_offset: u64,
    vaddr: u64,
    xdna_addr: u64,
}

#[repr(C)]
#[derive(Default)]
struct DrmSyncBo {
    handle: u32,
    direction: u32,
    offset: u64,
    size: u64,
}

#[repr(C)]
#[derive(Default)]
struct DrmExecCmd {
    ext: u64,
    ext_flags: u64,
    hwctx: u32,
    cmd_type: u32,
    cmd_handles: u64,
    args: u64,
    cmd_count: u32,
    arg_count: u32,
    seq: u64,
}

#[repr(C)]
#[derive(Default)]
struct DrmWaitCmd {
    hwctx: u32,
    timeout: u32,
    seq: u64,
}

#[repr(C)]
#[derive(Default)]
struct DrmGetInfo {
    param: u32,
    buffer_size: u32,
    buffer: u64,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct ClockMetadata {
    pub name: [u8; 16],
    pub freq_mhz: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct QueryClockMetadata {
    pub mp_npu_clock: ClockMetadata,
    pub h_clock: ClockMetadata,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct AieVersion {
    pub major: u32,
    pub minor: u32,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct AieTileMetadata {
    pub row_count: u32,
    pub row_start: u32,
    pub dma_channel_count: u32,
    pub lock_count: u32,
    pub event_reg_count: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct QueryAieMetadata {
    pub version: AieVersion,
    pub col_size: u32,
    pub cols: u32,
    pub rows: u32,
    pub pad: u32,
    pub core: AieTileMetadata,
    pub mem: AieTileMetadata,
    pub shim: AieTileMetadata,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct QuerySensor {
    pub label: [u8; 64],
    pub input: u32,
    pub max: u32,
    pub average: u32,
    pub highest: u32,
    pub status: [u8; 64],
    pub units: [u8; 16],
    pub unitm: i8,
    pub sensor_type: u8,
    pub pad: [u8; 6],
}

impl Default for QuerySensor {
    fn default() -> Self {
        // Arrays over 32 elements do not derive Default.
        unsafe { std::mem::zeroed() }
    }
}

/// An open accel node. Closed on drop.
#[derive(Debug)]
pub struct DeviceFd {
    file: File,
}

fn ioctl<T>(fd: &DeviceFd, call: &'static str, req: libc::c_ulong, arg: &mut T) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd.file.as_raw_fd(), req, arg as *mut T) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        tracing::debug!(target: "flm::driver", call, error = %err, "ioctl failed");
        Err(err)
    } else {
        Ok(())
    }
}

impl DeviceFd {
    /// Open `/dev/accel/accel<id>`.
    pub fn open(device_id: u32) -> io::Result<Self> {
        let path = format!("/dev/accel/accel{device_id}");
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn create_hwctx(&self, num_tiles: u32) -> io::Result<u32> {
        let mut arg = DrmCreateHwctx {
            num_tiles,
            max_opc: 0x800,
            ..Default::default()
        };
        ioctl(
            self,
            "create_hwctx",
            drm_iowr(NR_CREATE_HWCTX, std::mem::size_of::<DrmCreateHwctx>()),
            &mut arg,
        )?;
        Ok(arg.handle)
    }

    pub fn destroy_hwctx(&self, handle: u32) -> io::Result<()> {
        let mut arg = DrmDestroyHwctx { handle, pad: 0 };
        ioctl(
            self,
            "destroy_hwctx",
            drm_iowr(NR_DESTROY_HWCTX, std::mem::size_of::<DrmDestroyHwctx>()),
            &mut arg,
        )
    }

    /// Allocate a buffer object of the given placement and return its handle.
    pub fn create_bo(&self, size: u64, bo_type: u32) -> io::Result<u32> {
        let mut arg = DrmCreateBo {
            bo_type,
            size,
            ..Default::default()
        };
        ioctl(
            self,
            "create_bo",
            drm_iowr(NR_CREATE_BO, std::mem::size_of::<DrmCreateBo>()),
            &mut arg,
        )?;
        Ok(arg.handle)
    }

    /// Query mapping offset and device address for a buffer object.
    pub fn bo_info(&self, handle: u32) -> io::Result<(u64, u64)> {
        let mut arg = DrmGetBoInfo {
            handle,
            ..Default::default()
        };
        ioctl(
            self,
            "get_bo_info",
            drm_iowr(NR_GET_BO_INFO, std::mem::size_of::<DrmGetBoInfo>()),
            &mut arg,
        )?;
        Ok((arg.map_offset, arg.xdna_addr))
    }

    /// Map a buffer object into the process.
    pub fn map_bo(&self, map_offset: u64, len: usize) -> io::Result<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                map_offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::last_os_error())
    }

    /// Unmap a previously mapped buffer object.
    pub fn unmap_bo(&self, ptr: NonNull<u8>, len: usize) {
        unsafe {
            libc::munmap(ptr.as_ptr().cast(), len);
        }
    }

    /// Drop a buffer object handle via GEM close.
    pub fn close_bo(&self, handle: u32) {
        #[repr(C)]
        #[derive(Default)]
        struct GemClose {
            handle: u32,
            pad: u32,
        }
        // DRM_IOCTL_GEM_CLOSE = _IOW('d', 0x09, struct drm_gem_close)
        let req = ((IOC_WRITE << 30)
            | ((std::mem::size_of::<GemClose>() as u64) << 16)
            | (DRM_IOCTL_BASE << 8)
            | 0x09) as libc::c_ulong;
        let mut arg = GemClose { handle, pad: 0 };
        let _ = unsafe { libc::ioctl(self.file.as_raw_fd(), req, &mut arg as *mut GemClose) };
    }

    pub fn sync_bo(&self, handle: u32, direction: u32, size: u64) -> io::Result<()> {
        let mut arg = DrmSyncBo {
            handle,
            direction,
            offset: 0,
            size,
        };
        ioctl(
            self,
            "sync_bo",
            drm_iowr(NR_SYNC_BO, std::mem::size_of::<DrmSyncBo>()),
            &mut arg,
        )
    }

    /// Submit a command buffer with its DMA arguments. Returns the fence
    /// sequence number to wait on.
    pub fn exec_cmd(&self, hwctx: u32, cmd_bo: u32, arg_handles: &[u32]) -> io::Result<u64> {
        let cmd_handles = [cmd_bo];
        let mut arg = DrmExecCmd {
            hwctx,
            cmd_type: 0,
            cmd_handles: cmd_handles.as_ptr() as u64,
            args: arg_handles.as_ptr() as u64,
            cmd_count: 1,
            arg_count: arg_handles.len() as u32,
            ..Default::default()
        };
        ioctl(
            self,
            "exec_cmd",
            drm_iowr(NR_EXEC_CMD, std::mem::size_of::<DrmExecCmd>()),
            &mut arg,
        )?;
        Ok(arg.seq)
    }

    /// Block until the fence signals or the timeout (ms, 0 = forever) expires.
    pub fn wait_cmd(&self, hwctx: u32, seq: u64, timeout_ms: u32) -> io::Result<()> {
        let mut arg = DrmWaitCmd {
            hwctx,
            timeout: timeout_ms,
            seq,
        };
        ioctl(
            self,
            "wait_cmd",
            drm_iowr(NR_WAIT_CMD, std::mem::size_of::<DrmWaitCmd>()),
            &mut arg,
        )
    }

    fn get_info<T: Default>(&self, param: u32) -> io::Result<T> {
        let mut out = T::default();
        let mut arg = DrmGetInfo {
            param,
            buffer_size: std::mem::size_of::<T>() as u32,
            buffer: &mut out as *mut T as u64,
        };
        ioctl(
            self,
            "get_info",
            drm_iowr(NR_GET_INFO, std::mem::size_of::<DrmGetInfo>()),
            &mut arg,
        )?;
        Ok(out)
    }

    pub fn query_clock_metadata(&self) -> io::Result<QueryClockMetadata> {
        self.get_info(QUERY_CLOCK_METADATA)
    }

    pub fn query_aie_metadata(&self) -> io::Result<QueryAieMetadata> {
        self.get_info(QUERY_AIE_METADATA)
    }

    /// Current power draw in watts.
    pub fn query_power(&self) -> io::Result<f32> {
        let sensor: QuerySensor = self.get_info(QUERY_SENSORS)?;
        Ok(sensor.input as f32 * 10f32.powi(sensor.unitm as i32))
    }
}
