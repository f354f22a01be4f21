//! Symbolic assembler for the device instruction stream.
//!
//! An [`NpuSequence`] owns an ordered command list plus the 4-word device
//! header. The serialized `u32` stream is rebuilt lazily; every rebuild (and
//! every successful parse) bumps a wrapping version counter so consumers can
//! detect staleness and recompile.

use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use tracing::warn;

use crate::cmd::{
    DdrPatch, DmaBlock, DmaDirection, IssueToken, MaskWrite, NpuCmd, Preempt, RegWrite, Tile,
    WaitSync, OP_DDR_PATCH, OP_DMA_BLOCK, OP_MASK_WRITE, OP_PREEMPT, OP_REG_WRITE, OP_WAIT_SYNC,
};
use crate::elf::{self, PatchRecord};
use crate::error::NpuError;
use crate::Result;

const DEV_MAJOR_SHIFT: u32 = 0;
const DEV_MINOR_SHIFT: u32 = 8;
const DEV_GEN_SHIFT: u32 = 16;
const DEV_N_ROW_SHIFT: u32 = 24;
const DEV_NUM_COLS_SHIFT: u32 = 0;
const DEV_MEM_TILE_ROWS_SHIFT: u32 = 8;
const DEV_FIELD_MASK: u32 = 0xFF;

/// Header word count in front of the command stream.
const HEADER_WORDS: usize = 4;

/// Device generation. Generation 1 carries 4 columns, generation 2 carries 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpuGeneration {
    Npu1,
    Npu2,
}

#[derive(Debug)]
pub struct NpuSequence {
    generation: NpuGeneration,
    major: u32,
    minor: u32,
    dev_gen: u32,
    rows: u32,
    cols: u32,
    mem_tile_rows: u32,
    cmds: Vec<NpuCmd>,
    words: Vec<u32>,
    valid: bool,
    version: u8,
    preemption: bool,
    preempt_level: u32,
}

impl NpuSequence {
    pub fn new(generation: NpuGeneration, preemption: bool) -> Self {
        let (dev_gen, cols) = match generation {
            NpuGeneration::Npu1 => (1, 4),
            NpuGeneration::Npu2 => (4, 8),
        };
        Self {
            generation,
            major: 0,
            minor: 1,
            dev_gen,
            rows: 6,
            cols,
            mem_tile_rows: 1,
            cmds: Vec::new(),
            words: Vec::new(),
            valid: false,
            version: 0xFF,
            preemption,
            preempt_level: 2,
        }
    }

    pub fn generation(&self) -> NpuGeneration {
        self.generation
    }

    /// Load a sequence from disk: a raw native-order `u32` stream, or one hex
    /// word per line when `binary` is false.
    pub fn from_file(generation: NpuGeneration, path: &Path, binary: bool) -> Result<Self> {
        let mut seq = Self::new(generation, false);
        let words = if binary {
            let mut raw = Vec::new();
            std::fs::File::open(path)?.read_to_end(&mut raw)?;
            if raw.len() % 4 != 0 {
                return Err(NpuError::MalformedStream {
                    offset: 0,
                    reason: format!("stream length {} is not a multiple of 4", raw.len()),
                });
            }
            raw.chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        } else {
            let reader = BufReader::new(std::fs::File::open(path)?);
            let mut words = Vec::new();
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let word = u32::from_str_radix(trimmed.trim_start_matches("0x"), 16).map_err(
                    |_| NpuError::MalformedStream {
                        offset: line_no,
                        reason: format!("unparseable hex word `{trimmed}`"),
                    },
                )?;
                words.push(word);
            }
            words
        };
        seq.parse(words)?;
        Ok(seq)
    }

    /// Write the serialized stream to disk as raw native-order words.
    pub fn to_file(&mut self, path: &Path) -> Result<()> {
        self.serialize();
        let mut file = std::fs::File::create(path)?;
        for word in &self.words {
            file.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    /// Consume a raw word stream: decode the header, then each command in
    /// order. Count mismatches between the header and the decoded body are
    /// warnings; unknown opcodes and truncation are fatal.
    pub fn parse(&mut self, words: Vec<u32>) -> Result<()> {
        if words.len() < HEADER_WORDS {
            return Err(NpuError::MalformedStream {
                offset: words.len(),
                reason: "stream shorter than the 4-word header".into(),
            });
        }
        self.cmds.clear();
        self.major = (words[0] >> DEV_MAJOR_SHIFT) & DEV_FIELD_MASK;
        self.minor = (words[0] >> DEV_MINOR_SHIFT) & DEV_FIELD_MASK;
        self.dev_gen = (words[0] >> DEV_GEN_SHIFT) & DEV_FIELD_MASK;
        self.rows = (words[0] >> DEV_N_ROW_SHIFT) & DEV_FIELD_MASK;
        self.cols = (words[1] >> DEV_NUM_COLS_SHIFT) & DEV_FIELD_MASK;
        self.mem_tile_rows = (words[1] >> DEV_MEM_TILE_ROWS_SHIFT) & DEV_FIELD_MASK;
        let header_count = words[2] as usize;
        let header_lines = (words[3] / 4) as usize;

        let mut i = HEADER_WORDS;
        while i < words.len() {
            let op = words[i];
            let remaining = &words[i..];
            let consumed = match op {
                OP_REG_WRITE => {
                    Self::need(remaining, RegWrite::WORDS, i)?;
                    self.cmds.push(NpuCmd::RegWrite(RegWrite::decode(remaining)));
                    RegWrite::WORDS
                }
                OP_DMA_BLOCK => {
                    Self::need(remaining, DmaBlock::WORDS, i)?;
                    self.cmds.push(NpuCmd::DmaBlock(DmaBlock::decode(remaining)));
                    DmaBlock::WORDS
                }
                OP_MASK_WRITE => {
                    Self::need(remaining, MaskWrite::WORDS, i)?;
                    if IssueToken::matches(remaining) {
                        self.cmds.push(NpuCmd::IssueToken(IssueToken::decode(remaining)));
                    } else {
                        self.cmds.push(NpuCmd::MaskWrite(MaskWrite::decode(remaining)));
                    }
                    MaskWrite::WORDS
                }
                OP_WAIT_SYNC => {
                    Self::need(remaining, WaitSync::WORDS, i)?;
                    self.cmds.push(NpuCmd::WaitSync(WaitSync::decode(remaining)));
                    WaitSync::WORDS
                }
                OP_DDR_PATCH => {
                    Self::need(remaining, DdrPatch::WORDS, i)?;
                    self.cmds.push(NpuCmd::DdrPatch(DdrPatch::decode(remaining)));
                    DdrPatch::WORDS
                }
                other if (other & 0xFF) == OP_PREEMPT => {
                    self.cmds.push(NpuCmd::Preempt(Preempt::decode(remaining)));
                    Preempt::WORDS
                }
                other => {
                    return Err(NpuError::MalformedStream {
                        offset: i,
                        reason: format!("unknown opcode {other:#010x}"),
                    });
                }
            };
            i += consumed;
        }

        if header_count != self.cmds.len() {
            warn!(
                target: "flm::npu",
                "header instruction count {header_count} != decoded {}",
                self.cmds.len()
            );
        }
        let body_lines = HEADER_WORDS + self.cmds.iter().map(NpuCmd::word_count).sum::<usize>();
        if header_lines != body_lines {
            warn!(
                target: "flm::npu",
                "header instruction lines {header_lines} != decoded {body_lines}"
            );
        }

        self.words = words;
        self.valid = true;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    fn need(remaining: &[u32], count: usize, offset: usize) -> Result<()> {
        if remaining.len() < count {
            return Err(NpuError::MalformedStream {
                offset,
                reason: format!("truncated command needs {count} words, {} left", remaining.len()),
            });
        }
        Ok(())
    }

    /// Rebuild the serialized stream if stale and hand it out.
    pub fn serialize(&mut self) -> &[u32] {
        if !self.valid {
            let lines =
                HEADER_WORDS + self.cmds.iter().map(NpuCmd::word_count).sum::<usize>();
            let mut words = Vec::with_capacity(lines);
            words.push(
                (self.major << DEV_MAJOR_SHIFT)
                    | (self.minor << DEV_MINOR_SHIFT)
                    | (self.dev_gen << DEV_GEN_SHIFT)
                    | (self.rows << DEV_N_ROW_SHIFT),
            );
            words.push(
                (self.cols << DEV_NUM_COLS_SHIFT)
                    | (self.mem_tile_rows << DEV_MEM_TILE_ROWS_SHIFT),
            );
            words.push(self.cmds.len() as u32);
            words.push((lines as u32) * 4);
            for cmd in &self.cmds {
                cmd.encode(&mut words);
            }
            self.words = words;
            self.valid = true;
            self.version = self.version.wrapping_add(1);
        }
        &self.words
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Staleness counter; bumped on every rebuild and parse.
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn cmds(&self) -> &[NpuCmd] {
        &self.cmds
    }

    pub fn size_bytes(&mut self) -> usize {
        self.serialize().len() * 4
    }

    /// Drop every command and the cached stream.
    pub fn clear_cmds(&mut self) {
        self.cmds.clear();
        self.words.clear();
        self.valid = false;
    }

    fn push(&mut self, cmd: NpuCmd) {
        self.cmds.push(cmd);
        self.valid = false;
    }

    /// Preemption level used by the DMA helpers when preemption is enabled.
    pub fn set_preempt_level(&mut self, level: u32) {
        self.preempt_level = level & 0x3;
    }

    /// Direct register write.
    pub fn rtp_write(&mut self, tile: Tile, addr: u32, value: u32) {
        self.push(NpuCmd::RegWrite(RegWrite::direct(
            tile.row, tile.col, addr, value,
        )));
    }

    /// Direct masked register write.
    pub fn mask_write(&mut self, tile: Tile, addr: u32, value: u32, mask: u32) {
        self.push(NpuCmd::MaskWrite(MaskWrite {
            row: tile.row,
            col: tile.col,
            addr,
            value,
            mask,
        }));
    }

    /// Wait for the completion token of a DMA channel.
    pub fn dma_wait(&mut self, tile: Tile, direction: DmaDirection, channel: u32) {
        self.push(NpuCmd::WaitSync(WaitSync {
            row: tile.row,
            col: tile.col,
            direction,
            channel,
        }));
    }

    /// Preemption marker. No-op while preemption is disabled.
    pub fn preemption(&mut self, level: u32) {
        if !self.preemption {
            return;
        }
        self.push(NpuCmd::Preempt(Preempt { level: level & 0x3 }));
    }

    /// N-dimensional DMA transfer: block descriptor + optional token issue +
    /// address patch + queue push. `size`/`stride`/`offset` are ordered from
    /// the iteration dimension down to the innermost dimension.
    ///
    /// The hardware unit is the 32-bit word, so 1- and 2-byte element sizes
    /// fold the packing factor into the innermost size/offset and all
    /// strides. Element sizes above 4 bytes are rejected. S2MM transfers
    /// always issue a completion token.
    #[allow(clippy::too_many_arguments)]
    pub fn dma_memcpy_nd(
        &mut self,
        elem_size: usize,
        arg_idx: u32,
        direction: DmaDirection,
        tile: Tile,
        bd_id: u32,
        channel: u32,
        offset: [u32; 4],
        size: [u32; 4],
        stride: [u32; 4],
        packet: Option<(u32, u32)>,
        issue_token: bool,
    ) -> Result<()> {
        if elem_size > 4 {
            return Err(NpuError::UnsupportedElementSize(elem_size));
        }
        let mut offset = offset;
        let mut size = size;
        let mut stride = stride;
        let issue_token = issue_token || direction == DmaDirection::S2MM;

        let elem_size = match elem_size {
            1 => {
                size[3] >>= 2;
                offset[3] >>= 2;
                for s in stride.iter_mut().take(3) {
                    *s >>= 2;
                }
                4
            }
            2 => {
                size[3] >>= 1;
                offset[3] >>= 1;
                for s in stride.iter_mut().take(3) {
                    *s >>= 1;
                }
                4
            }
            other => other,
        };

        if self.preemption {
            let level = self.preempt_level;
            self.push(NpuCmd::Preempt(Preempt { level }));
        }

        let is_linear = size[1] == 1 && size[2] == 1;
        let buffer_length = size[1] * size[2] * size[3];
        let (d0s, d0st, d1s, d1st, d2s, d2st) = if is_linear {
            (0, 1, 0, 1, 0, 1)
        } else {
            (
                size[3],
                if size[3] != 1 { stride[3] } else { 1 },
                size[2],
                if size[2] != 1 { stride[2] } else { 1 },
                size[1],
                if size[1] != 1 { stride[1] } else { 1 },
            )
        };
        let (iter_size, iter_stride) = if is_linear {
            (1, 1)
        } else {
            (size[0], if size[0] > 1 { stride[0] } else { 1 })
        };

        self.push(NpuCmd::DmaBlock(DmaBlock {
            row: tile.row,
            col: tile.col,
            bd_id,
            buffer_length,
            buffer_offset: 0,
            packet_enable: packet.is_some(),
            out_of_order_id: 0,
            packet_id: packet.map_or(0, |p| p.0),
            packet_type: packet.map_or(0, |p| p.1),
            is_linear,
            dim0_size: d0s,
            dim0_stride: d0st,
            dim1_size: d1s,
            dim1_stride: d1st,
            dim2_size: d2s,
            dim2_stride: d2st,
            iter_size,
            iter_stride,
            next_bd_id: 0,
            valid_bd: true,
            lock_rel_val: 128,
            lock_rel_id: 0,
            lock_acq_enable: 0,
            lock_acq_val: 0,
            lock_acq_id: 0,
        }));

        if issue_token {
            self.push(NpuCmd::IssueToken(IssueToken {
                row: tile.row,
                col: tile.col,
                direction,
                channel,
                controller_packet_id: 15,
            }));
        }

        let mut arg_offset = offset[3];
        for i in (0..3).rev() {
            arg_offset += offset[i] * stride[i];
        }
        arg_offset *= elem_size as u32;
        self.push(NpuCmd::DdrPatch(DdrPatch {
            row: tile.row,
            col: tile.col,
            bd_id,
            arg_idx,
            arg_offset,
        }));

        self.push(NpuCmd::RegWrite(RegWrite::queue_push(
            tile.row,
            tile.col,
            direction,
            channel,
            size[0].saturating_sub(1),
            issue_token,
            bd_id,
        )));
        Ok(())
    }

    /// Human-readable dump of the serialized stream.
    pub fn interpret(&mut self) -> String {
        self.serialize();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "device v{}.{} gen {} rows {} cols {} mem-tile rows {}",
            self.major, self.minor, self.dev_gen, self.rows, self.cols, self.mem_tile_rows
        );
        let _ = writeln!(
            out,
            "{} instructions, {} words",
            self.cmds.len(),
            self.words.len()
        );
        let mut word = HEADER_WORDS;
        for (idx, cmd) in self.cmds.iter().enumerate() {
            let _ = writeln!(out, "{word:4} | {idx:3} | {}", cmd.describe());
            word += cmd.word_count();
        }
        out
    }

    /// Patch records for the ELF packager: where in the stream each address
    /// patch sits and which launch argument it resolves against.
    pub fn patch_records(&self) -> Vec<PatchRecord> {
        let mut records = Vec::new();
        let mut word = HEADER_WORDS as u32;
        for cmd in &self.cmds {
            if let NpuCmd::DdrPatch(patch) = cmd {
                records.push(PatchRecord {
                    word_offset: word,
                    arg_idx: patch.arg_idx,
                    arg_offset: patch.arg_offset as u64,
                });
            }
            word += cmd.word_count() as u32;
        }
        records
    }

    /// Package the serialized stream as a relocatable ELF object.
    pub fn to_elf(&mut self) -> Result<Vec<u8>> {
        let patches = self.patch_records();
        let words = self.serialize();
        Ok(elf::assemble(words, &patches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sequence() -> NpuSequence {
        let mut seq = NpuSequence::new(NpuGeneration::Npu2, false);
        seq.rtp_write(Tile::core(0, 0), 0x1000, 42);
        seq.dma_memcpy_nd(
            2,
            1,
            DmaDirection::MM2S,
            Tile::shim(0),
            3,
            0,
            [0, 0, 0, 0],
            [1, 1, 1, 256],
            [1, 1, 1, 1],
            None,
            false,
        )
        .unwrap();
        seq.dma_memcpy_nd(
            4,
            2,
            DmaDirection::S2MM,
            Tile::shim(1),
            4,
            1,
            [0, 0, 0, 64],
            [2, 4, 8, 16],
            [4096, 512, 64, 1],
            Some((3, 0)),
            false,
        )
        .unwrap();
        seq.dma_wait(Tile::shim(1), DmaDirection::S2MM, 1);
        seq.mask_write(Tile::mem(2), 0x32000, 0x1, 0xFF);
        seq
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let mut seq = sample_sequence();
        let words = seq.serialize().to_vec();

        let mut reparsed = NpuSequence::new(NpuGeneration::Npu2, false);
        reparsed.parse(words.clone()).unwrap();
        assert_eq!(reparsed.cmds(), seq.cmds());

        let rewritten = reparsed.serialize().to_vec();
        assert_eq!(rewritten, words);
    }

    #[test]
    fn test_header_counts_match_commands() {
        let mut seq = sample_sequence();
        let words = seq.serialize().to_vec();
        assert_eq!(words[2] as usize, seq.cmds().len());
        assert_eq!((words[3] / 4) as usize, words.len());
    }

    #[test]
    fn test_s2mm_forces_issue_token() {
        let mut seq = NpuSequence::new(NpuGeneration::Npu2, false);
        seq.dma_memcpy_nd(
            4,
            0,
            DmaDirection::S2MM,
            Tile::shim(0),
            0,
            0,
            [0; 4],
            [1, 1, 1, 8],
            [1; 4],
            None,
            false,
        )
        .unwrap();
        assert!(seq
            .cmds()
            .iter()
            .any(|c| matches!(c, NpuCmd::IssueToken(_))));
        match seq.cmds().last().unwrap() {
            NpuCmd::RegWrite(w) => assert!(w.push_queue && w.issue_token),
            other => panic!("unexpected tail command {other:?}"),
        }
    }

    #[test]
    fn test_two_byte_elements_fold_packing_factor() {
        let mut seq = NpuSequence::new(NpuGeneration::Npu2, false);
        seq.dma_memcpy_nd(
            2,
            0,
            DmaDirection::MM2S,
            Tile::shim(0),
            0,
            0,
            [0, 0, 0, 0],
            [1, 1, 1, 256],
            [1, 1, 1, 1],
            None,
            false,
        )
        .unwrap();
        match &seq.cmds()[0] {
            NpuCmd::DmaBlock(b) => {
                assert!(b.is_linear);
                // 256 x 2-byte elements = 128 words
                assert_eq!(b.buffer_length, 128);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_oversize_elements_rejected() {
        let mut seq = NpuSequence::new(NpuGeneration::Npu2, false);
        let err = seq
            .dma_memcpy_nd(
                8,
                0,
                DmaDirection::MM2S,
                Tile::shim(0),
                0,
                0,
                [0; 4],
                [1; 4],
                [1; 4],
                None,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, NpuError::UnsupportedElementSize(8)));
    }

    #[test]
    fn test_unknown_opcode_is_malformed() {
        let mut seq = sample_sequence();
        let mut words = seq.serialize().to_vec();
        words[4] = 0xAB;
        let mut fresh = NpuSequence::new(NpuGeneration::Npu2, false);
        match fresh.parse(words) {
            Err(NpuError::MalformedStream { offset, .. }) => assert_eq!(offset, 4),
            other => panic!("expected malformed stream, got {other:?}"),
        }
    }

    #[test]
    fn test_version_bumps_on_rebuild() {
        let mut seq = NpuSequence::new(NpuGeneration::Npu2, false);
        let v0 = seq.version();
        seq.rtp_write(Tile::core(0, 0), 0x10, 1);
        seq.serialize();
        let v1 = seq.version();
        assert_ne!(v0, v1);
        // A second serialize without mutation keeps the version stable.
        seq.serialize();
        assert_eq!(seq.version(), v1);
        seq.rtp_write(Tile::core(0, 0), 0x14, 2);
        seq.serialize();
        assert_ne!(seq.version(), v1);
    }

    #[test]
    fn test_preemption_marker_gated() {
        let mut off = NpuSequence::new(NpuGeneration::Npu2, false);
        off.preemption(1);
        assert!(off.cmds().is_empty());

        let mut on = NpuSequence::new(NpuGeneration::Npu2, true);
        on.preemption(1);
        assert_eq!(on.cmds().len(), 1);
        on.dma_memcpy_nd(
            4,
            0,
            DmaDirection::MM2S,
            Tile::shim(0),
            0,
            0,
            [0; 4],
            [1, 1, 1, 4],
            [1; 4],
            None,
            false,
        )
        .unwrap();
        // The DMA helper leads with its own marker when preemption is on.
        assert!(matches!(on.cmds()[1], NpuCmd::Preempt(_)));
    }

    #[test]
    fn test_binary_and_text_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = sample_sequence();
        let bin_path = dir.path().join("seq.bin");
        seq.to_file(&bin_path).unwrap();
        let from_bin = NpuSequence::from_file(NpuGeneration::Npu2, &bin_path, true).unwrap();
        assert_eq!(from_bin.cmds(), seq.cmds());

        let txt_path = dir.path().join("seq.txt");
        {
            let mut file = std::fs::File::create(&txt_path).unwrap();
            for word in seq.serialize() {
                writeln!(file, "{word:08x}").unwrap();
            }
        }
        let from_txt = NpuSequence::from_file(NpuGeneration::Npu2, &txt_path, false).unwrap();
        assert_eq!(from_txt.cmds(), from_bin.cmds());
    }

    #[test]
    fn test_clear_cmds_resets() {
        let mut seq = sample_sequence();
        seq.serialize();
        seq.clear_cmds();
        assert!(seq.cmds().is_empty());
        assert!(!seq.is_valid());
        assert_eq!(seq.serialize().len(), 4);
    }
}
