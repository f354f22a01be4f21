//! Applications: one instruction stream bound to one hardware context.
//!
//! The compiled kernel (ELF + unpacked control code + patch table + the
//! DMA-visible instruction buffer) is cached against the sequence's version
//! counter; recompilation is lazy on the next launch after a mutation.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::{BoRef, Buffer};
use crate::cmd::DdrPatch;
use crate::driver::{self, DeviceFd};
use crate::elf::{self, PatchRecord};
use crate::error::NpuError;
use crate::sequence::{NpuGeneration, NpuSequence};
use crate::Result;

/// Words reserved for the execution packet: header + control registers +
/// instruction pointer/size + argument addresses.
const EXEC_PACKET_WORDS: usize = 64;

struct KernelModule {
    version: u8,
    elf: Vec<u8>,
    words: Vec<u32>,
    patches: Vec<PatchRecord>,
    instr_bo: Buffer<u32>,
    cmd_bo: Buffer<u32>,
}

pub struct NpuApp {
    fd: Arc<DeviceFd>,
    ctx: Arc<crate::device::HwContext>,
    seq: NpuSequence,
    cached: Option<KernelModule>,
    preemption: bool,
}

impl NpuApp {
    pub(crate) fn new(
        fd: Arc<DeviceFd>,
        ctx: Arc<crate::device::HwContext>,
        generation: NpuGeneration,
        preemption: bool,
    ) -> Self {
        Self {
            fd,
            ctx,
            seq: NpuSequence::new(generation, preemption),
            cached: None,
            preemption,
        }
    }

    pub fn seq(&self) -> &NpuSequence {
        &self.seq
    }

    pub fn seq_mut(&mut self) -> &mut NpuSequence {
        &mut self.seq
    }

    /// Reassemble, repackage to ELF and rebind when the cached kernel is
    /// stale against the sequence.
    fn ensure_kernel(&mut self) -> Result<()> {
        let current = self.seq.version();
        if self.cached.as_ref().map(|m| m.version) == Some(current) {
            return Ok(());
        }
        let elf_bytes = self.seq.to_elf()?;
        // The sequence may have been rebuilt by to_elf(); take the version
        // after assembly so the cache matches what was packaged.
        let version = self.seq.version();
        let (words, patches) = elf::parse(&elf_bytes)?;
        let mut instr_bo: Buffer<u32> = Buffer::device(self.fd.clone(), words.len())?;
        instr_bo.copy_from_slice(&words)?;
        instr_bo.sync_to_device()?;
        let cmd_bo: Buffer<u32> = Buffer::device(self.fd.clone(), EXEC_PACKET_WORDS)?;
        debug!(
            target: "flm::npu",
            kernel = self.ctx.kernel_name(),
            words = words.len(),
            patches = patches.len(),
            version,
            "kernel rebuilt"
        );
        self.cached = Some(KernelModule {
            version,
            elf: elf_bytes,
            words,
            patches,
            instr_bo,
            cmd_bo,
        });
        Ok(())
    }

    /// Resolve the address patches against the launch arguments and push the
    /// patched stream to the device.
    fn bind_args(&mut self, args: &[BoRef]) -> Result<()> {
        let module = self.cached.as_mut().ok_or_else(|| NpuError::BadElf("kernel not built".into()))?;
        let mut words = module.words.clone();
        for patch in &module.patches {
            let arg = args
                .get(patch.arg_idx as usize)
                .ok_or(NpuError::MissingArgument(patch.arg_idx))?;
            let addr = arg.addr + patch.arg_offset;
            let base = patch.word_offset as usize;
            words[base + DdrPatch::ARG_IDX_WORD] = addr as u32;
            words[base + DdrPatch::ARG_OFFSET_WORD] = (addr >> 32) as u32;
        }
        module.instr_bo.copy_from_slice(&words)?;
        module.instr_bo.sync_to_device()
    }

    fn submit(&mut self, args: &[BoRef]) -> Result<u64> {
        self.ensure_kernel()?;
        self.bind_args(args)?;
        let module = self.cached.as_mut().ok_or_else(|| NpuError::BadElf("kernel not built".into()))?;
        let instr = module.instr_bo.bo()?;

        // Execution packet: header, CU mask, the three control registers the
        // kernel expects, instruction buffer address and length, then one
        // 64-bit address per argument.
        let mut packet: Vec<u32> = Vec::with_capacity(EXEC_PACKET_WORDS);
        packet.push(0); // header written last
        packet.push(0x1); // CU mask
        packet.extend_from_slice(&[3, 0, 0]);
        packet.push(instr.addr as u32);
        packet.push((instr.addr >> 32) as u32);
        packet.push(module.words.len() as u32);
        for arg in args {
            packet.push(arg.addr as u32);
            packet.push((arg.addr >> 32) as u32);
        }
        packet[0] = driver::pack_exec_header(packet.len() as u32 - 1);
        module.cmd_bo.fill(0);
        module.cmd_bo.copy_from_slice(&packet)?;
        module.cmd_bo.sync_to_device()?;

        let mut handles: Vec<u32> = Vec::with_capacity(args.len() + 1);
        handles.push(instr.handle);
        for arg in args {
            handles.push(arg.handle);
        }
        let cmd_handle = module.cmd_bo.bo()?.handle;
        self.fd
            .exec_cmd(self.ctx.handle(), cmd_handle, &handles)
            .map_err(|source| NpuError::Driver { call: "exec_cmd", source })
    }

    fn read_state(&mut self) -> Result<driver::CmdState> {
        let module = self.cached.as_mut().ok_or_else(|| NpuError::BadElf("kernel not built".into()))?;
        module.cmd_bo.sync_from_device()?;
        Ok(driver::unpack_exec_state(module.cmd_bo.as_slice()[0]))
    }

    /// Submit and wait for a terminal state. The state is returned as-is;
    /// callers decide whether non-completion is fatal.
    pub fn launch(&mut self, args: &[BoRef]) -> Result<driver::CmdState> {
        let seq_num = self.submit(args)?;
        self.fd
            .wait_cmd(self.ctx.handle(), seq_num, 0)
            .map_err(|source| NpuError::Driver { call: "wait_cmd", source })?;
        let state = self.read_state()?;
        debug!(target: "flm::npu", state = %state, "launch finished");
        Ok(state)
    }

    /// Submit without waiting. The caller waits on the returned [`Run`],
    /// groups runs into a [`Runlist`], or drops it to abandon the result.
    pub fn create_run(&mut self, args: &[BoRef]) -> Result<Run> {
        let seq_num = self.submit(args)?;
        Ok(Run {
            fd: self.fd.clone(),
            hwctx: self.ctx.handle(),
            seq_num,
        })
    }

    /// A container for batched dispatch. Not available with preemption.
    pub fn create_runlist(&self) -> Result<Runlist> {
        if self.preemption {
            return Err(NpuError::RunlistWithPreemption);
        }
        Ok(Runlist { runs: Vec::new() })
    }

    /// Write the packaged ELF to disk.
    pub fn store_elf(&mut self, path: &Path) -> Result<()> {
        self.ensure_kernel()?;
        let module = self.cached.as_ref().ok_or_else(|| NpuError::BadElf("kernel not built".into()))?;
        std::fs::write(path, &module.elf)?;
        Ok(())
    }

    /// Replace the sequence and kernel with a pre-packaged ELF.
    pub fn load_elf(&mut self, path: &Path) -> Result<()> {
        let elf_bytes = std::fs::read(path)?;
        let (words, patches) = elf::parse(&elf_bytes)?;
        self.seq.parse(words.clone())?;
        let mut instr_bo: Buffer<u32> = Buffer::device(self.fd.clone(), words.len())?;
        instr_bo.copy_from_slice(&words)?;
        instr_bo.sync_to_device()?;
        let cmd_bo: Buffer<u32> = Buffer::device(self.fd.clone(), EXEC_PACKET_WORDS)?;
        self.cached = Some(KernelModule {
            version: self.seq.version(),
            elf: elf_bytes,
            words,
            patches,
            instr_bo,
            cmd_bo,
        });
        Ok(())
    }
}

/// An in-flight submission.
pub struct Run {
    fd: Arc<DeviceFd>,
    hwctx: u32,
    seq_num: u64,
}

impl Run {
    /// Block until the fence signals.
    pub fn wait(&self) -> Result<driver::CmdState> {
        match self.fd.wait_cmd(self.hwctx, self.seq_num, 0) {
            Ok(()) => Ok(driver::CmdState::Completed),
            Err(err) if err.raw_os_error() == Some(libc::ETIME) => {
                Ok(driver::CmdState::Timeout)
            }
            Err(source) => Err(NpuError::Driver { call: "wait_cmd", source }),
        }
    }
}

/// Runs grouped for batched dispatch: waited in submission order.
pub struct Runlist {
    runs: Vec<Run>,
}

impl Runlist {
    pub fn add(&mut self, run: Run) {
        self.runs.push(run);
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Wait for every run; the first non-completed state wins.
    pub fn wait(&self) -> Result<driver::CmdState> {
        for run in &self.runs {
            let state = run.wait()?;
            if state != driver::CmdState::Completed {
                return Ok(state);
            }
        }
        Ok(driver::CmdState::Completed)
    }
}
