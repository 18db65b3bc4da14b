/// ロード済みバイナリイメージ
///
/// goblinでELF/PE/Mach-Oを解析し、ファイルオフセットとロードアドレスの
/// 対応表（マッピング）、実行可能領域、関数範囲を保持する。

use crate::host::AddressWidth;
use anyhow::{bail, Context, Result};
use goblin::elf::program_header::{PF_X, PT_LOAD};
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_NOBITS};
use goblin::elf::sym::STT_FUNC;
use goblin::mach::Mach;
use goblin::pe::section_table::IMAGE_SCN_MEM_EXECUTE;
use goblin::Object;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

// Mach-Oシンボルの型ビット
const MACH_N_STAB: u8 = 0xe0;
const MACH_N_TYPE: u8 = 0x0e;
const MACH_N_SECT: u8 = 0x0e;
const MACH_VM_PROT_EXECUTE: u32 = 0x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinaryFormat {
    Elf,
    Pe,
    MachO,
    /// 形式不明（オフセット = アドレスとして扱う）
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Architecture {
    X86,
    X86_64,
    Arm,
    Thumb,
    Arm64,
    Unknown,
}

impl Architecture {
    fn from_elf_machine(machine: u16) -> Self {
        match machine {
            0x03 => Architecture::X86,
            0x3E => Architecture::X86_64,
            0x28 => Architecture::Arm,
            0xB7 => Architecture::Arm64,
            _ => Architecture::Unknown,
        }
    }

    fn from_pe_machine(machine: u16) -> Self {
        match machine {
            0x14c => Architecture::X86,
            0x8664 => Architecture::X86_64,
            0x1c0 => Architecture::Arm,
            0x1c2 | 0x1c4 => Architecture::Thumb,
            0xaa64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        }
    }

    fn from_mach_cputype(cputype: u32) -> Self {
        match cputype {
            0x7 => Architecture::X86,
            0x1000007 => Architecture::X86_64,
            0xc => Architecture::Arm,
            0x100000c => Architecture::Arm64,
            _ => Architecture::Unknown,
        }
    }
}

/// ファイル上の範囲とロードアドレスの対応
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mapping {
    pub name: String,
    pub file_offset: u64,
    pub file_size: u64,
    pub address: u64,
    pub executable: bool,
}

impl Mapping {
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset - self.file_offset < self.file_size
    }

    pub fn contains_address(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.file_size
    }

    pub fn end_address(&self) -> u64 {
        self.address.saturating_add(self.file_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionRange {
    pub start: u64,
    /// 0はサイズ不明（次の関数またはマッピング終端まで）
    pub size: u64,
    pub name: String,
}

pub struct LoadedImage {
    pub path: PathBuf,
    pub format: BinaryFormat,
    pub arch: Architecture,
    pub width: AddressWidth,
    pub entry_point: u64,
    mappings: Vec<Mapping>,
    functions: Vec<FunctionRange>,
    data: Vec<u8>,
    fingerprint: String,
}

impl LoadedImage {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .with_context(|| format!("Failed to read binary {}", path.display()))?;
        Self::parse(path, data)
    }

    pub fn parse(path: impl AsRef<Path>, data: Vec<u8>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let fingerprint = fingerprint(&data);

        let object = if data.len() < 16 {
            // goblinは先頭16バイトでマジックを判定する
            None
        } else {
            Some(Object::parse(&data).context("Failed to parse binary header")?)
        };

        let layout = match object {
            Some(Object::Elf(elf)) => Layout::from_elf(&elf),
            Some(Object::PE(pe)) => Layout::from_pe(&pe),
            Some(Object::Mach(Mach::Binary(macho))) => Layout::from_macho(&macho),
            Some(Object::Mach(Mach::Fat(_))) => {
                bail!("Fat Mach-O binaries are not supported, extract a single architecture first")
            }
            Some(Object::Unknown(_)) | None => Layout::raw(data.len() as u64),
            Some(_) => bail!("Unsupported binary format: {}", path.display()),
        };

        // アドレス空間の終端を越えるマッピングは使えない
        let mut mappings = layout.mappings;
        mappings.retain(|m| {
            let fits = m.address.checked_add(m.file_size).is_some();
            if !fits {
                warn!(
                    "Dropping mapping {} (0x{:x} + 0x{:x} overflows the address space)",
                    m.name, m.address, m.file_size
                );
            }
            fits
        });

        let mut functions = layout.functions;
        functions.sort_by_key(|f| f.start);
        functions.dedup_by_key(|f| f.start);

        info!(
            "Loaded {} ({:?}, {:?}, {}-bit): {} mappings, {} functions",
            path.display(),
            layout.format,
            layout.arch,
            layout.width.bits(),
            mappings.len(),
            functions.len()
        );

        Ok(Self {
            path,
            format: layout.format,
            arch: layout.arch,
            width: layout.width,
            entry_point: layout.entry_point,
            mappings,
            functions,
            data,
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn functions(&self) -> &[FunctionRange] {
        &self.functions
    }

    /// ファイルオフセットをロードアドレスに変換
    pub fn resolve_file_offset(&self, offset: u64) -> Option<u64> {
        self.mappings
            .iter()
            .find(|m| m.contains_offset(offset))
            .and_then(|m| m.address.checked_add(offset - m.file_offset))
    }

    pub fn mapping_containing(&self, address: u64) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.contains_address(address))
    }

    /// マッピングに対応するファイル上のバイト列
    pub fn bytes(&self, mapping: &Mapping) -> &[u8] {
        let start = (mapping.file_offset as usize).min(self.data.len());
        let end = (mapping.file_offset.saturating_add(mapping.file_size) as usize).min(self.data.len());
        &self.data[start..end]
    }

    /// 実行可能なマッピングとそのバイト列
    pub fn code_regions(&self) -> impl Iterator<Item = (&Mapping, &[u8])> + '_ {
        self.mappings
            .iter()
            .filter(|m| m.executable)
            .map(move |m| (m, self.bytes(m)))
    }

    /// アドレスを含む関数
    ///
    /// サイズ不明の関数は、次の関数の先頭または同じ実行可能マッピングの終端までとみなす。
    pub fn function_containing(&self, address: u64) -> Option<&FunctionRange> {
        let idx = self.functions.partition_point(|f| f.start <= address);
        let func = self.functions.get(idx.checked_sub(1)?)?;

        if func.size > 0 {
            return (address - func.start < func.size).then_some(func);
        }

        let mapping = self.mapping_containing(func.start).filter(|m| m.executable)?;
        let limit = self
            .functions
            .get(idx)
            .map(|next| next.start.min(mapping.end_address()))
            .unwrap_or_else(|| mapping.end_address());

        (address < limit).then_some(func)
    }
}

fn fingerprint(data: &[u8]) -> String {
    let mut hasher = Xxh3::new();
    hasher.update(&(data.len() as u64).to_le_bytes());
    hasher.update(data);
    format!("{:016x}", hasher.digest())
}

/// 形式ごとの解析結果
struct Layout {
    format: BinaryFormat,
    arch: Architecture,
    width: AddressWidth,
    entry_point: u64,
    mappings: Vec<Mapping>,
    functions: Vec<FunctionRange>,
}

impl Layout {
    fn raw(len: u64) -> Self {
        debug!("Unknown format, mapping file offsets 1:1");
        Self {
            format: BinaryFormat::Raw,
            arch: Architecture::Unknown,
            width: AddressWidth::Bits64,
            entry_point: 0,
            mappings: vec![Mapping {
                name: "RAW".to_string(),
                file_offset: 0,
                file_size: len,
                address: 0,
                executable: false,
            }],
            functions: Vec::new(),
        }
    }

    fn from_elf(elf: &goblin::elf::Elf) -> Self {
        let arch = Architecture::from_elf_machine(elf.header.e_machine);

        let mut mappings: Vec<Mapping> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD && ph.p_filesz > 0)
            .enumerate()
            .map(|(i, ph)| Mapping {
                name: format!("LOAD{}", i),
                file_offset: ph.p_offset,
                file_size: ph.p_filesz,
                address: ph.p_vaddr,
                executable: ph.p_flags & PF_X != 0,
            })
            .collect();

        // 再配置可能オブジェクト（.o）はセグメントを持たないのでセクションで代用
        if mappings.is_empty() {
            mappings = elf
                .section_headers
                .iter()
                .filter(|sh| {
                    sh.sh_flags & SHF_ALLOC as u64 != 0
                        && sh.sh_type != SHT_NOBITS
                        && sh.sh_size > 0
                })
                .map(|sh| Mapping {
                    name: elf
                        .shdr_strtab
                        .get_at(sh.sh_name)
                        .unwrap_or("")
                        .to_string(),
                    file_offset: sh.sh_offset,
                    file_size: sh.sh_size,
                    address: sh.sh_addr,
                    executable: sh.sh_flags & SHF_EXECINSTR as u64 != 0,
                })
                .collect();
        }

        // Thumb関数はアドレスの最下位ビットが立っている
        let clear_thumb = |value: u64| {
            if arch == Architecture::Arm {
                value & !1
            } else {
                value
            }
        };

        let mut functions = Vec::new();
        for (syms, strtab) in [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)] {
            for sym in syms.iter() {
                if sym.st_type() != STT_FUNC || sym.st_value == 0 {
                    continue;
                }
                let name = strtab.get_at(sym.st_name).unwrap_or("");
                functions.push(FunctionRange {
                    start: clear_thumb(sym.st_value),
                    size: sym.st_size,
                    name: name.to_string(),
                });
            }
        }

        if elf.entry != 0 {
            functions.push(FunctionRange {
                start: clear_thumb(elf.entry),
                size: 0,
                name: "start".to_string(),
            });
        }

        Self {
            format: BinaryFormat::Elf,
            arch,
            width: if elf.is_64 {
                AddressWidth::Bits64
            } else {
                AddressWidth::Bits32
            },
            entry_point: elf.entry,
            mappings,
            functions,
        }
    }

    fn from_pe(pe: &goblin::pe::PE) -> Self {
        let image_base = pe.image_base as u64;
        let mut mappings = Vec::new();

        // ヘッダ領域もイメージベースにロードされる
        if let Some(header_size) = pe
            .header
            .optional_header
            .as_ref()
            .map(|h| h.windows_fields.size_of_headers as u64)
            .filter(|size| *size > 0)
        {
            mappings.push(Mapping {
                name: "HEADER".to_string(),
                file_offset: 0,
                file_size: header_size,
                address: image_base,
                executable: false,
            });
        }

        for section in &pe.sections {
            let Some(address) = image_base.checked_add(section.virtual_address as u64) else {
                continue;
            };
            let mut size = section.size_of_raw_data as u64;
            if section.virtual_size != 0 {
                size = size.min(section.virtual_size as u64);
            }
            if size == 0 {
                continue;
            }
            mappings.push(Mapping {
                name: String::from_utf8_lossy(&section.name)
                    .trim_end_matches('\0')
                    .to_string(),
                file_offset: section.pointer_to_raw_data as u64,
                file_size: size,
                address,
                executable: section.characteristics & IMAGE_SCN_MEM_EXECUTE != 0,
            });
        }

        let mut functions: Vec<FunctionRange> = pe
            .exports
            .iter()
            .filter(|export| export.reexport.is_none() && export.rva != 0)
            .filter_map(|export| {
                Some(FunctionRange {
                    start: image_base.checked_add(export.rva as u64)?,
                    size: 0,
                    name: export.name.unwrap_or("").to_string(),
                })
            })
            .collect();

        let entry_point = if pe.entry != 0 {
            image_base.checked_add(pe.entry as u64).unwrap_or(0)
        } else {
            0
        };
        if entry_point != 0 {
            functions.push(FunctionRange {
                start: entry_point,
                size: 0,
                name: "start".to_string(),
            });
        }

        Self {
            format: BinaryFormat::Pe,
            arch: Architecture::from_pe_machine(pe.header.coff_header.machine),
            width: if pe.is_64 {
                AddressWidth::Bits64
            } else {
                AddressWidth::Bits32
            },
            entry_point,
            mappings,
            functions,
        }
    }

    fn from_macho(macho: &goblin::mach::MachO) -> Self {
        let mappings: Vec<Mapping> = macho
            .segments
            .iter()
            .filter(|seg| seg.filesize > 0)
            .map(|seg| Mapping {
                name: seg.name().unwrap_or("").to_string(),
                file_offset: seg.fileoff,
                file_size: seg.filesize,
                address: seg.vmaddr,
                executable: seg.initprot & MACH_VM_PROT_EXECUTE != 0,
            })
            .collect();

        let functions = macho
            .symbols()
            .filter_map(|symbol| symbol.ok())
            .filter(|(_, nlist)| {
                nlist.n_type & MACH_N_STAB == 0
                    && nlist.n_type & MACH_N_TYPE == MACH_N_SECT
                    && mappings
                        .iter()
                        .any(|m| m.executable && m.contains_address(nlist.n_value))
            })
            .map(|(name, nlist)| FunctionRange {
                start: nlist.n_value,
                size: 0,
                name: name.trim_start_matches('_').to_string(),
            })
            .collect();

        Self {
            format: BinaryFormat::MachO,
            arch: Architecture::from_mach_cputype(macho.header.cputype),
            width: if macho.is_64 {
                AddressWidth::Bits64
            } else {
                AddressWidth::Bits32
            },
            entry_point: macho.entry,
            mappings,
            functions,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{elf64_with_code, elf64_with_code_at};
    use super::*;

    // push rbp; mov rbp, rsp; nop; pop rbp; ret
    const CODE: &[u8] = &[0x55, 0x48, 0x89, 0xe5, 0x90, 0x5d, 0xc3];

    #[test]
    fn test_elf_offset_mapping() {
        let image = LoadedImage::parse("test.elf", elf64_with_code(CODE)).unwrap();

        assert_eq!(image.format, BinaryFormat::Elf);
        assert_eq!(image.arch, Architecture::X86_64);
        assert_eq!(image.width, AddressWidth::Bits64);
        assert_eq!(image.resolve_file_offset(0x1000), Some(0x401000));
        assert_eq!(image.resolve_file_offset(0x1004), Some(0x401004));
        assert_eq!(image.resolve_file_offset(0x1000 + CODE.len() as u64), None);
        assert_eq!(image.resolve_file_offset(0x10), None);
    }

    #[test]
    fn test_mapping_past_address_space_end_is_dropped() {
        let image = LoadedImage::parse("test.elf", elf64_with_code_at(CODE, u64::MAX - 3)).unwrap();

        assert!(image.mappings().is_empty());
        assert_eq!(image.resolve_file_offset(0x1000), None);
        assert_eq!(image.resolve_file_offset(0x1006), None);
    }

    #[test]
    fn test_entry_point_function() {
        let image = LoadedImage::parse("test.elf", elf64_with_code(CODE)).unwrap();

        let func = image.function_containing(0x401004).unwrap();
        assert_eq!(func.start, 0x401000);
        assert!(image.function_containing(0x400fff).is_none());
        assert!(image.function_containing(0x401000 + CODE.len() as u64).is_none());
    }

    #[test]
    fn test_raw_image_is_identity() {
        let image = LoadedImage::parse("blob.bin", vec![0xAA; 64]).unwrap();

        assert_eq!(image.format, BinaryFormat::Raw);
        assert_eq!(image.resolve_file_offset(10), Some(10));
        assert_eq!(image.resolve_file_offset(64), None);
        assert_eq!(image.code_regions().count(), 0);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = LoadedImage::parse("a", vec![1; 32]).unwrap();
        let b = LoadedImage::parse("b", vec![1; 32]).unwrap();
        let c = LoadedImage::parse("c", vec![2; 32]).unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_sized_function_bounds() {
        let mut image = LoadedImage::parse("test.elf", elf64_with_code(CODE)).unwrap();
        image.functions = vec![FunctionRange {
            start: 0x401001,
            size: 3,
            name: "inner".to_string(),
        }];

        assert!(image.function_containing(0x401000).is_none());
        assert_eq!(image.function_containing(0x401003).unwrap().name, "inner");
        assert!(image.function_containing(0x401004).is_none());
    }
}
