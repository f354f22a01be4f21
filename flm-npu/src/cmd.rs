//! Device command set.
//!
//! One variant per opcode on the wire. Each command knows its fixed word
//! count, encodes itself onto a `u32` stream and decodes itself from one.
//! Bit shifts and masks are fixed by the hardware.
//!
//! Strides and iteration sizes travel on the wire minus one; a size of one
//! disables the corresponding dimension. Words the hardware ignores are
//! canonicalized to zero on emission.

use tracing::warn;

/// Opcodes understood by the command processor.
pub const OP_REG_WRITE: u32 = 0x00;
pub const OP_DMA_BLOCK: u32 = 0x01;
pub const OP_MASK_WRITE: u32 = 0x03;
pub const OP_PREEMPT: u32 = 0x07;
pub const OP_WAIT_SYNC: u32 = 0x80;
pub const OP_DDR_PATCH: u32 = 0x81;

const BD_COL_SHIFT: u32 = 25;
const BD_ROW_SHIFT: u32 = 20;
const BD_COL_MASK: u32 = 0x7F;
const BD_ROW_MASK: u32 = 0x1F;
const BD_ID_SHIFT: u32 = 5;
const BD_ID_MASK: u32 = 0xF;

const EN_PACKET_SHIFT: u32 = 30;
const OUT_OF_ORDER_SHIFT: u32 = 24;
const PACKET_ID_SHIFT: u32 = 19;
const PACKET_TYPE_SHIFT: u32 = 16;
const EN_PACKET_MASK: u32 = 0x1;
const OUT_OF_ORDER_MASK: u32 = 0x3F;
const PACKET_ID_MASK: u32 = 0x1F;
const PACKET_TYPE_MASK: u32 = 0x7;

const DIM_SIZE_SHIFT: u32 = 20;
const DIM_SIZE_MASK: u32 = 0x3FF;
const DIM_STRIDE_MASK: u32 = 0xFFFFF;
const ITER_SIZE_SHIFT: u32 = 20;
const ITER_SIZE_MASK: u32 = 0x3FF;
const ITER_STRIDE_MASK: u32 = 0xFFFFF;
const AX_CACHE_SHIFT: u32 = 24;
const BURST_SIZE_WORD: u32 = 0xC000_0000;

const NEXT_BD_ID_SHIFT: u32 = 27;
const NEXT_BD_ID_MASK: u32 = 0xF;
const VALID_BD_SHIFT: u32 = 25;
const LOCK_REL_VAL_SHIFT: u32 = 18;
const LOCK_REL_VAL_MASK: u32 = 0xEF;
const LOCK_REL_ID_SHIFT: u32 = 13;
const LOCK_REL_ID_MASK: u32 = 0xF;
const LOCK_ACQ_EN_SHIFT: u32 = 12;
const LOCK_ACQ_VAL_SHIFT: u32 = 5;
const LOCK_ACQ_VAL_MASK: u32 = 0xEF;
const LOCK_ACQ_ID_MASK: u32 = 0xF;

const ENDING_REPEAT_SHIFT: u32 = 16;
const ENDING_REPEAT_MASK: u32 = 0xFF;
const ENDING_TOKEN_SHIFT: u32 = 31;
const ENDING_BD_ID_MASK: u32 = 0xF;
const QUEUE_CHANNEL_SHIFT: u32 = 3;

const QUEUE_PKT_ID_SHIFT: u32 = 8;
const ISSUE_TOKEN_MASK_WORD: u32 = 0x0000_1F00;

/// DMA queue register window on a shim tile.
const QUEUE_REG_BASE: u32 = 0x1D200;
const QUEUE_REG_WINDOW_MASK: u32 = 0x1FE00;
const BD_REG_BASE: u32 = 0x1D000;

const WAIT_ROW_SHIFT: u32 = 8;
const WAIT_COL_SHIFT: u32 = 16;
const WAIT_CHANNEL_SHIFT: u32 = 24;
const WAIT_TAIL_CONST: u32 = 0x10100;

const PREEMPT_LEVEL_SHIFT: u32 = 8;
const PREEMPT_LEVEL_MASK: u32 = 0x3;

/// DMA direction: stream-to-memory or memory-to-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    S2MM,
    MM2S,
}

impl DmaDirection {
    fn bit(self) -> u32 {
        match self {
            Self::S2MM => 0,
            Self::MM2S => 1,
        }
    }

    fn from_bit(bit: u32) -> Self {
        if bit == 0 { Self::S2MM } else { Self::MM2S }
    }
}

/// Tile coordinate on the 6x8 grid: row 0 holds the shim tiles, row 1 the
/// memory tiles, rows 2..6 the compute tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub row: u32,
    pub col: u32,
}

impl Tile {
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Shim (interface) tile of a column.
    pub const fn shim(col: u32) -> Self {
        Self { row: 0, col }
    }

    /// Memory tile of a column.
    pub const fn mem(col: u32) -> Self {
        Self { row: 1, col }
    }

    /// Compute tile; `row` counts from the first compute row.
    pub const fn core(row: u32, col: u32) -> Self {
        Self { row: row + 2, col }
    }
}

fn check_op_size(words: &[u32], word: usize, expected: u32, what: &str) {
    let read = words[word] >> 2;
    if read != expected {
        warn!(target: "flm::npu", "{what}: op size mismatch: {read} != {expected}");
    }
}

/// Register write (opcode 0x00, 6 words). Doubles as the DMA queue push when
/// the register address falls inside the queue window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegWrite {
    pub row: u32,
    pub col: u32,
    pub reg_addr: u32,
    pub value: u32,
    pub push_queue: bool,
    pub direction: DmaDirection,
    pub channel: u32,
    pub repeat: u32,
    pub issue_token: bool,
    pub bd_id: u32,
}

impl RegWrite {
    pub const WORDS: usize = 6;

    /// Plain register write. The queue-decode fields are derived the same
    /// way the parser derives them, so built and re-parsed commands compare
    /// equal.
    pub fn direct(row: u32, col: u32, reg_addr: u32, value: u32) -> Self {
        Self {
            row,
            col,
            reg_addr,
            value,
            push_queue: false,
            direction: DmaDirection::from_bit((reg_addr >> 4) & 0x1),
            channel: 0,
            repeat: 0,
            issue_token: false,
            bd_id: 0,
        }
    }

    /// Queue push against a shim DMA channel, with the register address and
    /// value in their canonical on-wire form.
    pub fn queue_push(
        row: u32,
        col: u32,
        direction: DmaDirection,
        channel: u32,
        repeat: u32,
        issue_token: bool,
        bd_id: u32,
    ) -> Self {
        let mut reg_addr = QUEUE_REG_BASE + 0x4;
        if direction == DmaDirection::MM2S {
            reg_addr |= 0x10;
        }
        if channel == 1 {
            reg_addr += 0x8;
        }
        let value = (bd_id & ENDING_BD_ID_MASK)
            | ((repeat & ENDING_REPEAT_MASK) << ENDING_REPEAT_SHIFT)
            | ((issue_token as u32) << ENDING_TOKEN_SHIFT);
        Self {
            row,
            col,
            reg_addr,
            value,
            push_queue: true,
            direction,
            channel,
            repeat,
            issue_token,
            bd_id,
        }
    }

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(OP_REG_WRITE);
        out.push(0);
        out.push((self.row << BD_ROW_SHIFT) | (self.col << BD_COL_SHIFT) | self.reg_addr);
        out.push(0);
        out.push(self.value);
        out.push((Self::WORDS as u32) << 2);
    }

    pub fn decode(words: &[u32]) -> Self {
        check_op_size(words, 5, Self::WORDS as u32, "reg write");
        let row = (words[2] >> BD_ROW_SHIFT) & BD_ROW_MASK;
        let col = (words[2] >> BD_COL_SHIFT) & BD_COL_MASK;
        let reg_addr = words[2] & 0xFFFFF;
        let push_queue = (reg_addr & QUEUE_REG_WINDOW_MASK) == QUEUE_REG_BASE;
        let direction = DmaDirection::from_bit((reg_addr >> 4) & 0x1);
        let value = words[4];
        let (channel, repeat, issue_token, bd_id) = if push_queue {
            (
                (words[2] >> QUEUE_CHANNEL_SHIFT) & 0x1,
                (value >> ENDING_REPEAT_SHIFT) & ENDING_REPEAT_MASK,
                (value >> ENDING_TOKEN_SHIFT) & 0x1 != 0,
                value & ENDING_BD_ID_MASK,
            )
        } else {
            (0, 0, false, 0)
        };
        Self {
            row,
            col,
            reg_addr,
            value,
            push_queue,
            direction,
            channel,
            repeat,
            issue_token,
            bd_id,
        }
    }
}

/// Buffer-descriptor block write (opcode 0x01, 12 words).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaBlock {
    pub row: u32,
    pub col: u32,
    pub bd_id: u32,
    pub buffer_length: u32,
    pub buffer_offset: u32,
    pub packet_enable: bool,
    pub out_of_order_id: u32,
    pub packet_id: u32,
    pub packet_type: u32,
    pub is_linear: bool,
    pub dim0_size: u32,
    pub dim0_stride: u32,
    pub dim1_size: u32,
    pub dim1_stride: u32,
    /// Not carried on the wire; inferred from the buffer length.
    pub dim2_size: u32,
    pub dim2_stride: u32,
    pub iter_size: u32,
    pub iter_stride: u32,
    pub next_bd_id: u32,
    pub valid_bd: bool,
    pub lock_rel_val: u32,
    pub lock_rel_id: u32,
    pub lock_acq_enable: u32,
    pub lock_acq_val: u32,
    pub lock_acq_id: u32,
}

impl DmaBlock {
    pub const WORDS: usize = 12;

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(OP_DMA_BLOCK);
        out.push(0);
        out.push(
            (self.row << BD_ROW_SHIFT)
                | (self.col << BD_COL_SHIFT)
                | (self.bd_id << BD_ID_SHIFT)
                | BD_REG_BASE,
        );
        out.push((Self::WORDS as u32) * 4);
        out.push(self.buffer_length);
        out.push(self.buffer_offset);
        out.push(
            ((self.packet_enable as u32) << EN_PACKET_SHIFT)
                | (self.out_of_order_id << OUT_OF_ORDER_SHIFT)
                | (self.packet_id << PACKET_ID_SHIFT)
                | (self.packet_type << PACKET_TYPE_SHIFT),
        );
        if self.is_linear {
            out.push(0);
        } else {
            out.push((self.dim0_size << DIM_SIZE_SHIFT) | (self.dim0_stride - 1));
        }
        out.push(BURST_SIZE_WORD | (self.dim1_size << DIM_SIZE_SHIFT) | (self.dim1_stride - 1));
        // Upper bits carry QoS fields (AxCache); dim2 size is not wired.
        out.push((0x2 << AX_CACHE_SHIFT) | (self.dim2_stride - 1));
        out.push(((self.iter_size - 1) << ITER_SIZE_SHIFT) | (self.iter_stride - 1));
        out.push(
            (self.next_bd_id << NEXT_BD_ID_SHIFT)
                | ((self.valid_bd as u32) << VALID_BD_SHIFT)
                | (self.lock_rel_val << LOCK_REL_VAL_SHIFT)
                | (self.lock_rel_id << LOCK_REL_ID_SHIFT)
                | (self.lock_acq_enable << LOCK_ACQ_EN_SHIFT)
                | (self.lock_acq_val << LOCK_ACQ_VAL_SHIFT)
                | self.lock_acq_id,
        );
    }

    pub fn decode(words: &[u32]) -> Self {
        check_op_size(words, 3, Self::WORDS as u32, "dma block");
        let row = (words[2] >> BD_ROW_SHIFT) & BD_ROW_MASK;
        let col = (words[2] >> BD_COL_SHIFT) & BD_COL_MASK;
        let bd_id = (words[2] >> BD_ID_SHIFT) & BD_ID_MASK;
        let buffer_length = words[4];
        let buffer_offset = words[5];
        let packet_enable = (words[6] >> EN_PACKET_SHIFT) & EN_PACKET_MASK != 0;
        let out_of_order_id = (words[6] >> OUT_OF_ORDER_SHIFT) & OUT_OF_ORDER_MASK;
        let packet_id = (words[6] >> PACKET_ID_SHIFT) & PACKET_ID_MASK;
        let packet_type = (words[6] >> PACKET_TYPE_SHIFT) & PACKET_TYPE_MASK;
        let is_linear = words[7] == 0;
        let dim0_size = (words[7] >> DIM_SIZE_SHIFT) & DIM_SIZE_MASK;
        let dim0_stride = (words[7] & DIM_STRIDE_MASK) + 1;
        let dim1_size = (words[8] >> DIM_SIZE_SHIFT) & DIM_SIZE_MASK;
        let dim1_stride = (words[8] & DIM_STRIDE_MASK) + 1;
        let dim2_size = if is_linear || dim0_size == 0 || dim1_size == 0 {
            0
        } else {
            buffer_length / (dim0_size * dim1_size)
        };
        let dim2_stride = (words[9] & DIM_STRIDE_MASK) + 1;
        let iter_size = ((words[10] >> ITER_SIZE_SHIFT) & ITER_SIZE_MASK) + 1;
        let iter_stride = (words[10] & ITER_STRIDE_MASK) + 1;
        Self {
            row,
            col,
            bd_id,
            buffer_length,
            buffer_offset,
            packet_enable,
            out_of_order_id,
            packet_id,
            packet_type,
            is_linear,
            dim0_size,
            dim0_stride,
            dim1_size,
            dim1_stride,
            dim2_size,
            dim2_stride,
            iter_size,
            iter_stride,
            next_bd_id: (words[11] >> NEXT_BD_ID_SHIFT) & NEXT_BD_ID_MASK,
            valid_bd: (words[11] >> VALID_BD_SHIFT) & 0x1 != 0,
            lock_rel_val: (words[11] >> LOCK_REL_VAL_SHIFT) & LOCK_REL_VAL_MASK,
            lock_rel_id: (words[11] >> LOCK_REL_ID_SHIFT) & LOCK_REL_ID_MASK,
            lock_acq_enable: (words[11] >> LOCK_ACQ_EN_SHIFT) & 0x1,
            lock_acq_val: (words[11] >> LOCK_ACQ_VAL_SHIFT) & LOCK_ACQ_VAL_MASK,
            lock_acq_id: words[11] & LOCK_ACQ_ID_MASK,
        }
    }
}

/// Task-completion-token issue (shares opcode 0x03 with the mask write;
/// distinguished by the queue register window and the fixed mask word).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueToken {
    pub row: u32,
    pub col: u32,
    pub direction: DmaDirection,
    pub channel: u32,
    pub controller_packet_id: u32,
}

impl IssueToken {
    pub const WORDS: usize = 7;

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(OP_MASK_WRITE);
        out.push(0);
        out.push(
            QUEUE_REG_BASE
                + self.channel * 0x8
                + 0x10 * self.direction.bit()
                + (self.row << BD_ROW_SHIFT)
                + (self.col << BD_COL_SHIFT),
        );
        out.push(0);
        out.push(self.controller_packet_id << QUEUE_PKT_ID_SHIFT);
        out.push(ISSUE_TOKEN_MASK_WORD);
        out.push((Self::WORDS as u32) << 2);
    }

    pub fn decode(words: &[u32]) -> Self {
        check_op_size(words, 6, Self::WORDS as u32, "issue token");
        Self {
            row: (words[2] >> BD_ROW_SHIFT) & BD_ROW_MASK,
            col: (words[2] >> BD_COL_SHIFT) & BD_COL_MASK,
            direction: DmaDirection::from_bit((words[2] >> 4) & 0x1),
            channel: (words[2] >> QUEUE_CHANNEL_SHIFT) & 0x1,
            controller_packet_id: words[4] >> QUEUE_PKT_ID_SHIFT,
        }
    }

    /// True when a raw 7-word window at opcode 0x03 is a token issue rather
    /// than a plain mask write.
    pub fn matches(words: &[u32]) -> bool {
        let addr = words[2] & 0xFFFFF;
        (addr & QUEUE_REG_WINDOW_MASK) == QUEUE_REG_BASE && words[5] == ISSUE_TOKEN_MASK_WORD
    }
}

/// Masked register write (opcode 0x03, 7 words).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskWrite {
    pub row: u32,
    pub col: u32,
    pub addr: u32,
    pub value: u32,
    pub mask: u32,
}

impl MaskWrite {
    pub const WORDS: usize = 7;

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(OP_MASK_WRITE);
        out.push(0);
        out.push((self.addr & 0xFFFFF) | (self.row << BD_ROW_SHIFT) | (self.col << BD_COL_SHIFT));
        out.push(0);
        out.push(self.value);
        out.push(self.mask);
        out.push((Self::WORDS as u32) << 2);
    }

    pub fn decode(words: &[u32]) -> Self {
        check_op_size(words, 6, Self::WORDS as u32, "mask write");
        Self {
            row: (words[2] >> BD_ROW_SHIFT) & BD_ROW_MASK,
            col: (words[2] >> BD_COL_SHIFT) & BD_COL_MASK,
            addr: words[2] & 0xFFFFF,
            value: words[4],
            mask: words[5],
        }
    }
}

/// Wait for a task completion token (opcode 0x80, 4 words).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSync {
    pub row: u32,
    pub col: u32,
    pub direction: DmaDirection,
    pub channel: u32,
}

impl WaitSync {
    pub const WORDS: usize = 4;

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(OP_WAIT_SYNC);
        out.push((Self::WORDS as u32) << 2);
        out.push((self.row << WAIT_ROW_SHIFT) | (self.col << WAIT_COL_SHIFT) | self.direction.bit());
        out.push((self.channel << WAIT_CHANNEL_SHIFT) | WAIT_TAIL_CONST);
    }

    pub fn decode(words: &[u32]) -> Self {
        check_op_size(words, 1, Self::WORDS as u32, "wait sync");
        Self {
            row: (words[2] >> WAIT_ROW_SHIFT) & 0xFF,
            col: (words[2] >> WAIT_COL_SHIFT) & 0xFF,
            direction: DmaDirection::from_bit(words[2] & 0x1),
            channel: (words[3] >> WAIT_CHANNEL_SHIFT) & 0xFF,
        }
    }
}

/// Host-buffer address patch (opcode 0x81, 12 words). The loader resolves
/// `arg_idx`/`arg_offset` against the launch arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdrPatch {
    pub row: u32,
    pub col: u32,
    pub bd_id: u32,
    pub arg_idx: u32,
    pub arg_offset: u32,
}

impl DdrPatch {
    pub const WORDS: usize = 12;
    /// Word offsets of the patchable payload inside the command.
    pub const ARG_IDX_WORD: usize = 8;
    pub const ARG_OFFSET_WORD: usize = 10;

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(OP_DDR_PATCH);
        out.push((Self::WORDS as u32) << 2);
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.push(
            (self.col << BD_COL_SHIFT)
                | (self.row << BD_ROW_SHIFT)
                | (self.bd_id << BD_ID_SHIFT)
                | (BD_REG_BASE + 0x4),
        );
        out.push(0);
        out.push(self.arg_idx);
        out.push(0);
        out.push(self.arg_offset);
        out.push(0);
    }

    pub fn decode(words: &[u32]) -> Self {
        check_op_size(words, 1, Self::WORDS as u32, "ddr patch");
        Self {
            col: (words[6] >> BD_COL_SHIFT) & BD_COL_MASK,
            row: (words[6] >> BD_ROW_SHIFT) & BD_ROW_MASK,
            bd_id: ((words[6] - 0x4) >> BD_ID_SHIFT) & 0x1F,
            arg_idx: words[8],
            arg_offset: words[10],
        }
    }
}

/// Preemption marker (opcode 0x07, 1 word).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preempt {
    pub level: u32,
}

impl Preempt {
    pub const WORDS: usize = 1;

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(OP_PREEMPT | ((self.level & PREEMPT_LEVEL_MASK) << PREEMPT_LEVEL_SHIFT));
    }

    pub fn decode(words: &[u32]) -> Self {
        Self {
            level: (words[0] >> PREEMPT_LEVEL_SHIFT) & PREEMPT_LEVEL_MASK,
        }
    }
}

/// A decoded device command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NpuCmd {
    RegWrite(RegWrite),
    DmaBlock(DmaBlock),
    IssueToken(IssueToken),
    MaskWrite(MaskWrite),
    WaitSync(WaitSync),
    DdrPatch(DdrPatch),
    Preempt(Preempt),
}

impl NpuCmd {
    /// Fixed word count on the wire.
    pub fn word_count(&self) -> usize {
        match self {
            Self::RegWrite(_) => RegWrite::WORDS,
            Self::DmaBlock(_) => DmaBlock::WORDS,
            Self::IssueToken(_) => IssueToken::WORDS,
            Self::MaskWrite(_) => MaskWrite::WORDS,
            Self::WaitSync(_) => WaitSync::WORDS,
            Self::DdrPatch(_) => DdrPatch::WORDS,
            Self::Preempt(_) => Preempt::WORDS,
        }
    }

    pub fn encode(&self, out: &mut Vec<u32>) {
        match self {
            Self::RegWrite(c) => c.encode(out),
            Self::DmaBlock(c) => c.encode(out),
            Self::IssueToken(c) => c.encode(out),
            Self::MaskWrite(c) => c.encode(out),
            Self::WaitSync(c) => c.encode(out),
            Self::DdrPatch(c) => c.encode(out),
            Self::Preempt(c) => c.encode(out),
        }
    }

    /// One-line summary for the interpreter dump.
    pub fn describe(&self) -> String {
        match self {
            Self::RegWrite(c) if c.push_queue => format!(
                "queue push  ({},{}) {:?} ch{} bd{} repeat {} token {}",
                c.row, c.col, c.direction, c.channel, c.bd_id, c.repeat, c.issue_token
            ),
            Self::RegWrite(c) => {
                format!("rtp write   ({},{}) addr {:#x} value {:#x}", c.row, c.col, c.reg_addr, c.value)
            }
            Self::DmaBlock(c) => format!(
                "dma block   ({},{}) bd{} len {} offset {} dims [{}x{} {}x{} {}x{}] iter {}x{}",
                c.row,
                c.col,
                c.bd_id,
                c.buffer_length,
                c.buffer_offset,
                c.dim0_size,
                c.dim0_stride,
                c.dim1_size,
                c.dim1_stride,
                c.dim2_size,
                c.dim2_stride,
                c.iter_size,
                c.iter_stride
            ),
            Self::IssueToken(c) => format!(
                "issue token ({},{}) {:?} ch{} pkt {}",
                c.row, c.col, c.direction, c.channel, c.controller_packet_id
            ),
            Self::MaskWrite(c) => format!(
                "mask write  ({},{}) addr {:#x} value {:#x} mask {:#x}",
                c.row, c.col, c.addr, c.value, c.mask
            ),
            Self::WaitSync(c) => format!(
                "wait sync   ({},{}) {:?} ch{}",
                c.row, c.col, c.direction, c.channel
            ),
            Self::DdrPatch(c) => format!(
                "ddr patch   ({},{}) bd{} arg {} offset {}",
                c.row, c.col, c.bd_id, c.arg_idx, c.arg_offset
            ),
            Self::Preempt(c) => format!("preempt     level {}", c.level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: &NpuCmd) -> NpuCmd {
        let mut words = Vec::new();
        cmd.encode(&mut words);
        assert_eq!(words.len(), cmd.word_count());
        match cmd {
            NpuCmd::RegWrite(_) => NpuCmd::RegWrite(RegWrite::decode(&words)),
            NpuCmd::DmaBlock(_) => NpuCmd::DmaBlock(DmaBlock::decode(&words)),
            NpuCmd::IssueToken(_) => NpuCmd::IssueToken(IssueToken::decode(&words)),
            NpuCmd::MaskWrite(_) => NpuCmd::MaskWrite(MaskWrite::decode(&words)),
            NpuCmd::WaitSync(_) => NpuCmd::WaitSync(WaitSync::decode(&words)),
            NpuCmd::DdrPatch(_) => NpuCmd::DdrPatch(DdrPatch::decode(&words)),
            NpuCmd::Preempt(_) => NpuCmd::Preempt(Preempt::decode(&words)),
        }
    }

    #[test]
    fn test_queue_push_roundtrip() {
        let cmd = NpuCmd::RegWrite(RegWrite::queue_push(
            0,
            2,
            DmaDirection::MM2S,
            1,
            3,
            true,
            5,
        ));
        assert_eq!(roundtrip(&cmd), cmd);
        let direct = NpuCmd::RegWrite(RegWrite::direct(2, 1, 0x1000, 42));
        assert_eq!(roundtrip(&direct), direct);
    }

    #[test]
    fn test_dma_block_roundtrip_strided() {
        let cmd = NpuCmd::DmaBlock(DmaBlock {
            row: 0,
            col: 1,
            bd_id: 7,
            buffer_length: 64 * 4 * 2,
            buffer_offset: 0,
            packet_enable: true,
            out_of_order_id: 0,
            packet_id: 3,
            packet_type: 0,
            is_linear: false,
            dim0_size: 64,
            dim0_stride: 1,
            dim1_size: 4,
            dim1_stride: 64,
            dim2_size: 2,
            dim2_stride: 256,
            iter_size: 1,
            iter_stride: 1,
            next_bd_id: 0,
            valid_bd: true,
            lock_rel_val: 128,
            lock_rel_id: 0,
            lock_acq_enable: 0,
            lock_acq_val: 0,
            lock_acq_id: 0,
        });
        assert_eq!(roundtrip(&cmd), cmd);
    }

    #[test]
    fn test_dma_block_linear_has_zero_d0_word() {
        let block = DmaBlock {
            row: 0,
            col: 0,
            bd_id: 0,
            buffer_length: 128,
            buffer_offset: 0,
            packet_enable: false,
            out_of_order_id: 0,
            packet_id: 0,
            packet_type: 0,
            is_linear: true,
            dim0_size: 0,
            dim0_stride: 1,
            dim1_size: 0,
            dim1_stride: 1,
            dim2_size: 0,
            dim2_stride: 1,
            iter_size: 1,
            iter_stride: 1,
            next_bd_id: 0,
            valid_bd: true,
            lock_rel_val: 128,
            lock_rel_id: 0,
            lock_acq_enable: 0,
            lock_acq_val: 0,
            lock_acq_id: 0,
        };
        let mut words = Vec::new();
        block.encode(&mut words);
        assert_eq!(words[7], 0);
        assert_eq!(DmaBlock::decode(&words), block);
    }

    #[test]
    fn test_issue_token_and_mask_write_share_opcode() {
        let token = IssueToken {
            row: 0,
            col: 3,
            direction: DmaDirection::S2MM,
            channel: 0,
            controller_packet_id: 15,
        };
        let mut words = Vec::new();
        token.encode(&mut words);
        assert_eq!(words[0], OP_MASK_WRITE);
        assert!(IssueToken::matches(&words));
        assert_eq!(IssueToken::decode(&words), token);

        let mask = MaskWrite {
            row: 2,
            col: 1,
            addr: 0x32000,
            value: 0xDEAD,
            mask: 0xFFFF,
        };
        let mut words = Vec::new();
        mask.encode(&mut words);
        assert!(!IssueToken::matches(&words));
        assert_eq!(MaskWrite::decode(&words), mask);
    }

    #[test]
    fn test_wait_and_patch_and_preempt_roundtrip() {
        let wait = NpuCmd::WaitSync(WaitSync {
            row: 0,
            col: 2,
            direction: DmaDirection::S2MM,
            channel: 1,
        });
        assert_eq!(roundtrip(&wait), wait);

        let patch = NpuCmd::DdrPatch(DdrPatch {
            row: 0,
            col: 4,
            bd_id: 9,
            arg_idx: 2,
            arg_offset: 4096,
        });
        assert_eq!(roundtrip(&patch), patch);

        let pre = NpuCmd::Preempt(Preempt { level: 2 });
        let mut words = Vec::new();
        pre.encode(&mut words);
        assert_eq!(words, vec![OP_PREEMPT | (2 << 8)]);
        assert_eq!(roundtrip(&pre), pre);
    }
}
