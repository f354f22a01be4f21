//! NPU Device Layer
//!
//! Everything that talks to the tiled accelerator lives here:
//! - **Buffers**: host and DMA-visible device allocations ([`buffer`])
//! - **Commands**: the device wire format, one variant per opcode ([`cmd`])
//! - **Sequences**: the symbolic assembler - parse, build, re-emit ([`sequence`])
//! - **ELF**: packaging of instruction streams into loadable objects ([`elf`])
//! - **Driver**: the kernel driver ioctl surface ([`driver`])
//! - **Device**: context management and application launch ([`device`], [`app`])
//!
//! The assembler is bidirectional: any sequence it produces it can also
//! consume, and any valid sequence it consumes it reproduces byte-identically
//! on re-emission (don't-care words are canonicalized to zero).

pub mod app;
pub mod buffer;
pub mod cmd;
pub mod device;
pub mod driver;
pub mod elf;
pub mod error;
pub mod sequence;

pub use app::{NpuApp, Run, Runlist};
pub use buffer::{BoRef, Buffer, Bytes};
pub use cmd::{DmaDirection, NpuCmd, Tile};
pub use device::{Device, DeviceManager, HwContext, PowerMode};
pub use driver::CmdState;
pub use error::NpuError;
pub use sequence::{NpuGeneration, NpuSequence};

/// Result alias used throughout the device layer.
pub type Result<T> = std::result::Result<T, NpuError>;
