//! Weight archive and the 4-bit quantization codec.
//!
//! The archive is a JSON header (u64 little-endian length prefix, then
//! `{name: {dtype, shape, offsets}}`) followed by a binary blob. Plain
//! tensors are 16-bit float; quantized tensors use `q4nx` groups: 32
//! four-bit signed integers packed into 16 bytes, then a bf16 scale and a
//! 16-bit zero point. A group of values decodes as
//! `x[i] = (q[i] - zero) * scale`.
//!
//! For matmul weights the codec re-lays groups into a tile-friendly order:
//! rows are interleaved round-robin across the compute columns so each
//! tile's MAC units read one dense stream.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytemuck::Pod;
use half::bf16;
use tracing::debug;

use flm_npu::Buffer;

use crate::error::EngineError;
use crate::Result;

/// Values per quantization group.
pub const GROUP_SIZE: usize = 32;
/// Bytes per encoded group: 16 payload + 2 scale + 2 zero point.
pub const GROUP_BYTES: usize = 20;
/// Compute columns the matmul kernels fan rows across.
pub const N_TILES: usize = 8;

/// Quantized-tensor dtype tag in the archive header.
pub const DTYPE_Q4NX: &str = "q4nx";

#[derive(Debug, Clone)]
pub struct TensorMeta {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    /// Begin/end byte offsets inside the data blob.
    pub offsets: (u64, u64),
}

impl TensorMeta {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        (self.offsets.1 - self.offsets.0) as usize
    }

    pub fn is_quantized(&self) -> bool {
        self.dtype.eq_ignore_ascii_case(DTYPE_Q4NX)
    }
}

/// Decode one group into `out`.
pub fn decode_group(group: &[u8], out: &mut [f32]) {
    debug_assert_eq!(group.len(), GROUP_BYTES);
    debug_assert_eq!(out.len(), GROUP_SIZE);
    let scale = bf16::from_le_bytes([group[16], group[17]]).to_f32();
    let zero = i16::from_le_bytes([group[18], group[19]]) as f32;
    for (i, slot) in out.iter_mut().enumerate() {
        let byte = group[i / 2];
        let nibble = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
        // Sign-extend the 4-bit value.
        let q = ((nibble as i8) << 4 >> 4) as f32;
        *slot = (q - zero) * scale;
    }
}

/// Encode 32 values into one group. Used by the conversion tooling and the
/// codec tests; the runtime itself only decodes.
pub fn encode_group(values: &[f32]) -> [u8; GROUP_BYTES] {
    debug_assert_eq!(values.len(), GROUP_SIZE);
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let scale = if max > min { (max - min) / 15.0 } else { 1.0 };
    let zero = (-8.0 - min / scale).round().clamp(i16::MIN as f32, i16::MAX as f32);
    let mut out = [0u8; GROUP_BYTES];
    for (i, &x) in values.iter().enumerate() {
        let q = (x / scale + zero).round().clamp(-8.0, 7.0) as i8;
        let nibble = (q as u8) & 0x0F;
        if i % 2 == 0 {
            out[i / 2] |= nibble;
        } else {
            out[i / 2] |= nibble << 4;
        }
    }
    out[16..18].copy_from_slice(&bf16::from_f32(scale).to_le_bytes());
    out[18..20].copy_from_slice(&(zero as i16).to_le_bytes());
    out
}

/// Destination row for source row `r` in the tile-interleaved order: rows
/// congruent mod [`N_TILES`] become contiguous.
pub fn interleaved_row(r: usize, rows: usize) -> usize {
    (r % N_TILES) * (rows / N_TILES) + r / N_TILES
}

#[derive(Debug)]
pub struct WeightArchive {
    path: PathBuf,
    file: File,
    tensors: HashMap<String, TensorMeta>,
    data_start: u64,
}

impl WeightArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| EngineError::Archive(format!("cannot open {}: {e}", path.display())))?;
        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)
            .map_err(|e| EngineError::Archive(format!("short header: {e}")))?;
        let header_len = u64::from_le_bytes(len_bytes);
        let mut header = vec![0u8; header_len as usize];
        file.read_exact(&mut header)
            .map_err(|e| EngineError::Archive(format!("short header: {e}")))?;
        let header: serde_json::Value = serde_json::from_slice(&header)?;
        let table = header
            .as_object()
            .ok_or_else(|| EngineError::Archive("header is not an object".into()))?;

        let mut tensors = HashMap::new();
        for (name, desc) in table {
            if name == "__metadata__" {
                continue;
            }
            let dtype = desc["dtype"]
                .as_str()
                .ok_or_else(|| EngineError::Archive(format!("{name}: missing dtype")))?
                .to_string();
            let shape: Vec<usize> = desc["shape"]
                .as_array()
                .ok_or_else(|| EngineError::Archive(format!("{name}: missing shape")))?
                .iter()
                .filter_map(|v| v.as_u64().map(|n| n as usize))
                .collect();
            let offsets = desc
                .get("offsets")
                .or_else(|| desc.get("data_offsets"))
                .and_then(|v| v.as_array())
                .ok_or_else(|| EngineError::Archive(format!("{name}: missing offsets")))?;
            let begin = offsets
                .first()
                .and_then(|v| v.as_u64())
                .ok_or_else(|| EngineError::Archive(format!("{name}: bad offsets")))?;
            let end = offsets
                .get(1)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| EngineError::Archive(format!("{name}: bad offsets")))?;
            tensors.insert(
                name.clone(),
                TensorMeta {
                    name: name.clone(),
                    dtype,
                    shape,
                    offsets: (begin, end),
                },
            );
        }
        debug!(target: "flm::engine", tensors = tensors.len(), path = %path.display(), "archive opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            tensors,
            data_start: 8 + header_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tensor_meta(&self, name: &str) -> Result<&TensorMeta> {
        self.tensors
            .get(name)
            .ok_or_else(|| EngineError::Archive(format!("tensor `{name}` not in archive")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    fn read_raw(&mut self, name: &str) -> Result<(TensorMeta, Vec<u8>)> {
        let meta = self.tensor_meta(name)?.clone();
        let mut raw = vec![0u8; meta.byte_len()];
        self.file
            .seek(SeekFrom::Start(self.data_start + meta.offsets.0))?;
        self.file
            .read_exact(&mut raw)
            .map_err(|e| EngineError::Archive(format!("{name}: short read: {e}")))?;
        Ok((meta, raw))
    }

    /// Blit a tensor's raw bytes into `dst`, whose byte size must equal the
    /// archive record's length exactly.
    pub fn load<T: Pod>(&mut self, name: &str, dst: &mut Buffer<T>) -> Result<()> {
        let (_meta, raw) = self.read_raw(name)?;
        if dst.size_bytes() != raw.len() {
            return Err(EngineError::Archive(format!(
                "{name}: destination holds {} bytes, record holds {}",
                dst.size_bytes(),
                raw.len()
            )));
        }
        dst.copy_bytes_at(0, &raw)?;
        Ok(())
    }

    /// Copy a quantized matmul weight into `dst` in the tile-interleaved
    /// order. `columns` is the expected inner dimension.
    pub fn load_quantized_matmul(
        &mut self,
        name: &str,
        dst: &mut Buffer<u8>,
        columns: usize,
    ) -> Result<()> {
        let (meta, raw) = self.read_raw(name)?;
        if !meta.is_quantized() {
            return Err(EngineError::Archive(format!(
                "{name}: dtype {} is not quantized",
                meta.dtype
            )));
        }
        let (rows, cols) = matmul_shape(&meta)?;
        if cols != columns {
            return Err(EngineError::Archive(format!(
                "{name}: expected {columns} columns, archive holds {cols}"
            )));
        }
        if rows % N_TILES != 0 {
            return Err(EngineError::Archive(format!(
                "{name}: {rows} rows cannot interleave across {N_TILES} tiles"
            )));
        }
        let row_bytes = cols / GROUP_SIZE * GROUP_BYTES;
        if raw.len() != rows * row_bytes || dst.size_bytes() != raw.len() {
            return Err(EngineError::Archive(format!(
                "{name}: size mismatch ({} raw, {} destination)",
                raw.len(),
                dst.size_bytes()
            )));
        }
        let out = dst.as_bytes_mut();
        for r in 0..rows {
            let dst_row = interleaved_row(r, rows);
            out[dst_row * row_bytes..(dst_row + 1) * row_bytes]
                .copy_from_slice(&raw[r * row_bytes..(r + 1) * row_bytes]);
        }
        Ok(())
    }

    /// Decode a quantized tensor to 16-bit float in its natural row-major
    /// order. Verification path.
    pub fn dequantize(&mut self, name: &str, dst: &mut Buffer<bf16>) -> Result<()> {
        let (meta, raw) = self.read_raw(name)?;
        if !meta.is_quantized() {
            return Err(EngineError::Archive(format!(
                "{name}: dtype {} is not quantized",
                meta.dtype
            )));
        }
        let numel = meta.numel();
        if numel % GROUP_SIZE != 0 || raw.len() != numel / GROUP_SIZE * GROUP_BYTES {
            return Err(EngineError::Archive(format!("{name}: damaged group data")));
        }
        if dst.size() != numel {
            return Err(EngineError::Archive(format!(
                "{name}: destination holds {} values, tensor holds {numel}",
                dst.size()
            )));
        }
        let out = dst.as_mut_slice();
        let mut decoded = [0f32; GROUP_SIZE];
        for (g, group) in raw.chunks_exact(GROUP_BYTES).enumerate() {
            decode_group(group, &mut decoded);
            for (i, &x) in decoded.iter().enumerate() {
                out[g * GROUP_SIZE + i] = bf16::from_f32(x);
            }
        }
        Ok(())
    }
}

fn matmul_shape(meta: &TensorMeta) -> Result<(usize, usize)> {
    match meta.shape.as_slice() {
        [rows, cols] => Ok((*rows, *cols)),
        other => Err(EngineError::Archive(format!(
            "{}: matmul weight must be 2-D, shape is {other:?}",
            meta.name
        ))),
    }
}

/// Write an archive file. Used by the conversion tooling and tests.
pub fn write_archive(path: &Path, tensors: &[(&str, &str, Vec<usize>, Vec<u8>)]) -> Result<()> {
    use std::io::Write;
    let mut header = serde_json::Map::new();
    let mut offset = 0u64;
    for (name, dtype, shape, bytes) in tensors {
        let end = offset + bytes.len() as u64;
        header.insert(
            name.to_string(),
            serde_json::json!({
                "dtype": dtype,
                "shape": shape,
                "offsets": [offset, end],
            }),
        );
        offset = end;
    }
    let header = serde_json::to_vec(&serde_json::Value::Object(header))?;
    let mut file = File::create(path)?;
    file.write_all(&(header.len() as u64).to_le_bytes())?;
    file.write_all(&header)?;
    for (_, _, _, bytes) in tensors {
        file.write_all(bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantize_matrix(values: &[f32]) -> Vec<u8> {
        values
            .chunks_exact(GROUP_SIZE)
            .flat_map(|group| encode_group(group).to_vec())
            .collect()
    }

    #[test]
    fn test_group_roundtrip_within_scale_epsilon() {
        let values: Vec<f32> = (0..GROUP_SIZE).map(|i| (i as f32) * 0.25 - 3.0).collect();
        let encoded = encode_group(&values);
        let mut decoded = [0f32; GROUP_SIZE];
        decode_group(&encoded, &mut decoded);
        let scale = bf16::from_le_bytes([encoded[16], encoded[17]]).to_f32();
        for (a, b) in values.iter().zip(decoded.iter()) {
            // Half a quantization step plus bf16 rounding on the scale.
            assert!((a - b).abs() <= scale * 0.55 + 0.05, "{a} vs {b}");
        }
    }

    #[test]
    fn test_interleaved_rows_are_tile_contiguous() {
        let rows = 16;
        let order: Vec<usize> = (0..rows).map(|r| interleaved_row(r, rows)).collect();
        // Rows 0 and 8 (tile 0) land in adjacent slots.
        assert_eq!(order[0], 0);
        assert_eq!(order[8], 1);
        // Row 1 starts tile 1's block.
        assert_eq!(order[1], rows / N_TILES);
        // The mapping is a permutation.
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..rows).collect::<Vec<_>>());
    }

    #[test]
    fn test_archive_load_and_dequantize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.q4nx");

        let rows = 16;
        let cols = 64;
        let values: Vec<f32> = (0..rows * cols).map(|i| ((i % 97) as f32) * 0.1).collect();
        let quantized = quantize_matrix(&values);
        let plain: Vec<u8> = (0..128u32)
            .flat_map(|i| bf16::from_f32(i as f32).to_le_bytes())
            .collect();
        write_archive(
            &path,
            &[
                ("w.q", DTYPE_Q4NX, vec![rows, cols], quantized),
                ("w.plain", "BF16", vec![64], plain.clone()),
            ],
        )
        .unwrap();

        let mut archive = WeightArchive::open(&path).unwrap();

        let mut dst: Buffer<u8> = Buffer::host(plain.len()).unwrap();
        archive.load("w.plain", &mut dst).unwrap();
        assert_eq!(dst.as_slice(), plain.as_slice());

        // Wrong destination size is refused.
        let mut wrong: Buffer<u8> = Buffer::host(plain.len() + 1).unwrap();
        assert!(archive.load("w.plain", &mut wrong).is_err());

        let mut dequant: Buffer<bf16> = Buffer::host(rows * cols).unwrap();
        archive.dequantize("w.q", &mut dequant).unwrap();
        // The error bound is half a step of the group's scale plus rounding.
        for (a, b) in values.iter().zip(dequant.as_slice()) {
            assert!((a - b.to_f32()).abs() < 0.45, "{a} vs {b}");
        }
    }

    #[test]
    fn test_tile_reorder_moves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.q4nx");
        let rows = 16;
        let cols = 32;
        // One group per row; tag each row's values by the row index.
        let values: Vec<f32> = (0..rows)
            .flat_map(|r| std::iter::repeat(r as f32).take(cols))
            .collect();
        let quantized = quantize_matrix(&values);
        write_archive(&path, &[("w.q", DTYPE_Q4NX, vec![rows, cols], quantized.clone())]).unwrap();

        let mut archive = WeightArchive::open(&path).unwrap();
        let mut dst: Buffer<u8> = Buffer::host(quantized.len()).unwrap();
        archive.load_quantized_matmul("w.q", &mut dst, cols).unwrap();

        let row_bytes = cols / GROUP_SIZE * GROUP_BYTES;
        for r in 0..rows {
            let target = interleaved_row(r, rows);
            assert_eq!(
                &dst.as_slice()[target * row_bytes..(target + 1) * row_bytes],
                &quantized[r * row_bytes..(r + 1) * row_bytes],
            );
        }

        // Column mismatch is refused.
        let mut other: Buffer<u8> = Buffer::host(quantized.len()).unwrap();
        assert!(archive.load_quantized_matmul("w.q", &mut other, 64).is_err());
    }

    #[test]
    fn test_unknown_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.q4nx");
        write_archive(&path, &[("a", "BF16", vec![2], vec![0, 0, 0, 0])]).unwrap();
        let mut archive = WeightArchive::open(&path).unwrap();
        let mut dst: Buffer<u8> = Buffer::host(4).unwrap();
        assert!(archive.load("missing", &mut dst).is_err());
    }
}
