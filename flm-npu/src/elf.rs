//! ELF packaging of instruction streams.
//!
//! A serialized sequence is shipped to the loader as a relocatable ELF64
//! object: the stream itself in `.ctrltext`, and the external-buffer patch
//! table in `.ctrldata`. Consumers key off the section names, not the
//! machine field.

use crate::error::NpuError;
use crate::Result;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_REL: u16 = 1;
const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;

const TEXT_SECTION: &str = ".ctrltext";
const DATA_SECTION: &str = ".ctrldata";
const SHSTRTAB_SECTION: &str = ".shstrtab";

/// One entry of the external-buffer patch table: which launch argument the
/// address patch at `word_offset` resolves against, and at which byte offset
/// into that argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRecord {
    pub word_offset: u32,
    pub arg_idx: u32,
    pub arg_offset: u64,
}

impl PatchRecord {
    const BYTES: usize = 16;

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.word_offset.to_le_bytes());
        out.extend_from_slice(&self.arg_idx.to_le_bytes());
        out.extend_from_slice(&self.arg_offset.to_le_bytes());
    }

    fn read(bytes: &[u8]) -> Self {
        Self {
            word_offset: u32::from_le_bytes(bytes[0..4].try_into().unwrap_or_default()),
            arg_idx: u32::from_le_bytes(bytes[4..8].try_into().unwrap_or_default()),
            arg_offset: u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default()),
        }
    }
}

struct SectionDesc {
    name_offset: u32,
    sh_type: u32,
    offset: usize,
    size: usize,
}

fn push_shdr(out: &mut Vec<u8>, desc: &SectionDesc) {
    out.extend_from_slice(&desc.name_offset.to_le_bytes()); // sh_name
    out.extend_from_slice(&desc.sh_type.to_le_bytes()); // sh_type
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_flags
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
    out.extend_from_slice(&(desc.offset as u64).to_le_bytes()); // sh_offset
    out.extend_from_slice(&(desc.size as u64).to_le_bytes()); // sh_size
    out.extend_from_slice(&0u32.to_le_bytes()); // sh_link
    out.extend_from_slice(&0u32.to_le_bytes()); // sh_info
    out.extend_from_slice(&4u64.to_le_bytes()); // sh_addralign
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_entsize
}

/// Package an instruction stream and its patch table into a relocatable
/// object.
pub fn assemble(words: &[u32], patches: &[PatchRecord]) -> Vec<u8> {
    let mut text = Vec::with_capacity(words.len() * 4);
    for word in words {
        text.extend_from_slice(&word.to_le_bytes());
    }
    let mut data = Vec::with_capacity(patches.len() * PatchRecord::BYTES);
    for patch in patches {
        patch.write(&mut data);
    }

    // \0.ctrltext\0.ctrldata\0.shstrtab\0
    let mut shstrtab = vec![0u8];
    let text_name = shstrtab.len() as u32;
    shstrtab.extend_from_slice(TEXT_SECTION.as_bytes());
    shstrtab.push(0);
    let data_name = shstrtab.len() as u32;
    shstrtab.extend_from_slice(DATA_SECTION.as_bytes());
    shstrtab.push(0);
    let strtab_name = shstrtab.len() as u32;
    shstrtab.extend_from_slice(SHSTRTAB_SECTION.as_bytes());
    shstrtab.push(0);

    let text_off = EHDR_SIZE;
    let data_off = text_off + text.len();
    let strtab_off = data_off + data.len();
    let mut shoff = strtab_off + shstrtab.len();
    shoff = (shoff + 7) & !7;

    let mut out = Vec::with_capacity(shoff + 4 * SHDR_SIZE);
    out.extend_from_slice(&ELF_MAGIC);
    out.push(ELFCLASS64);
    out.push(ELFDATA2LSB);
    out.push(1); // EV_CURRENT
    out.extend_from_slice(&[0; 9]); // OS ABI + padding
    out.extend_from_slice(&ET_REL.to_le_bytes()); // e_type
    out.extend_from_slice(&0u16.to_le_bytes()); // e_machine
    out.extend_from_slice(&1u32.to_le_bytes()); // e_version
    out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    out.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
    out.extend_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes()); // e_shentsize
    out.extend_from_slice(&4u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&3u16.to_le_bytes()); // e_shstrndx
    debug_assert_eq!(out.len(), EHDR_SIZE);

    out.extend_from_slice(&text);
    out.extend_from_slice(&data);
    out.extend_from_slice(&shstrtab);
    out.resize(shoff, 0);

    push_shdr(
        &mut out,
        &SectionDesc {
            name_offset: 0,
            sh_type: 0,
            offset: 0,
            size: 0,
        },
    );
    push_shdr(
        &mut out,
        &SectionDesc {
            name_offset: text_name,
            sh_type: SHT_PROGBITS,
            offset: text_off,
            size: text.len(),
        },
    );
    push_shdr(
        &mut out,
        &SectionDesc {
            name_offset: data_name,
            sh_type: SHT_PROGBITS,
            offset: data_off,
            size: data.len(),
        },
    );
    push_shdr(
        &mut out,
        &SectionDesc {
            name_offset: strtab_name,
            sh_type: SHT_STRTAB,
            offset: strtab_off,
            size: shstrtab.len(),
        },
    );
    out
}

fn read_u16(bytes: &[u8], off: usize) -> u64 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]]) as u64
}

fn read_u64(bytes: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(buf)
}

fn section_name<'a>(strtab: &'a [u8], offset: usize) -> &'a str {
    let tail = &strtab[offset.min(strtab.len())..];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    std::str::from_utf8(&tail[..end]).unwrap_or("")
}

/// Unpack a control-code object back into its instruction stream and patch
/// table.
pub fn parse(bytes: &[u8]) -> Result<(Vec<u32>, Vec<PatchRecord>)> {
    if bytes.len() < EHDR_SIZE || bytes[0..4] != ELF_MAGIC {
        return Err(NpuError::BadElf("missing ELF magic".into()));
    }
    if bytes[4] != ELFCLASS64 || bytes[5] != ELFDATA2LSB {
        return Err(NpuError::BadElf("not a little-endian ELF64 object".into()));
    }
    let shoff = read_u64(bytes, 0x28) as usize;
    let shentsize = read_u16(bytes, 0x3A) as usize;
    let shnum = read_u16(bytes, 0x3C) as usize;
    let shstrndx = read_u16(bytes, 0x3E) as usize;
    if shentsize != SHDR_SIZE || shstrndx >= shnum {
        return Err(NpuError::BadElf("bad section header table".into()));
    }
    let shdr = |idx: usize| -> Result<(usize, usize, usize)> {
        let base = shoff + idx * SHDR_SIZE;
        if base + SHDR_SIZE > bytes.len() {
            return Err(NpuError::BadElf("section header out of range".into()));
        }
        let name = u32::from_le_bytes([bytes[base], bytes[base + 1], bytes[base + 2], bytes[base + 3]])
            as usize;
        let offset = read_u64(bytes, base + 0x18) as usize;
        let size = read_u64(bytes, base + 0x20) as usize;
        Ok((name, offset, size))
    };

    let (_, str_off, str_size) = shdr(shstrndx)?;
    if str_off + str_size > bytes.len() {
        return Err(NpuError::BadElf("string table out of range".into()));
    }
    let strtab = &bytes[str_off..str_off + str_size];

    let mut text: Option<&[u8]> = None;
    let mut data: Option<&[u8]> = None;
    for idx in 0..shnum {
        let (name_off, offset, size) = shdr(idx)?;
        if offset + size > bytes.len() {
            return Err(NpuError::BadElf("section out of range".into()));
        }
        match section_name(strtab, name_off) {
            TEXT_SECTION => text = Some(&bytes[offset..offset + size]),
            DATA_SECTION => data = Some(&bytes[offset..offset + size]),
            _ => {}
        }
    }

    let text = text.ok_or_else(|| NpuError::BadElf(format!("no {TEXT_SECTION} section")))?;
    if text.len() % 4 != 0 {
        return Err(NpuError::BadElf("control text is not word aligned".into()));
    }
    let words = text
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut patches = Vec::new();
    if let Some(data) = data {
        if data.len() % PatchRecord::BYTES != 0 {
            return Err(NpuError::BadElf("patch table is not record aligned".into()));
        }
        for chunk in data.chunks_exact(PatchRecord::BYTES) {
            patches.push(PatchRecord::read(chunk));
        }
    }
    Ok((words, patches))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_parse_roundtrip() {
        let words = vec![0x0401_0000, 0x0108, 2, 11 * 4, 0xAB, 0xCD];
        let patches = vec![
            PatchRecord {
                word_offset: 4,
                arg_idx: 0,
                arg_offset: 0,
            },
            PatchRecord {
                word_offset: 16,
                arg_idx: 2,
                arg_offset: 8192,
            },
        ];
        let elf = assemble(&words, &patches);
        let (got_words, got_patches) = parse(&elf).unwrap();
        assert_eq!(got_words, words);
        assert_eq!(got_patches, patches);
    }

    #[test]
    fn test_reject_garbage() {
        assert!(parse(b"not an elf").is_err());
        let mut elf = assemble(&[1, 2, 3, 4], &[]);
        elf[4] = 1; // 32-bit class
        assert!(parse(&elf).is_err());
    }

    #[test]
    fn test_empty_patch_table() {
        let elf = assemble(&[0xFF; 4], &[]);
        let (words, patches) = parse(&elf).unwrap();
        assert_eq!(words.len(), 4);
        assert!(patches.is_empty());
    }
}
