/// アイテム境界マップ
///
/// 実行可能領域をCapstoneで線形スイープし、命令の先頭アドレスを記録する。
/// 命令として解釈できないバイトと、コード以外の領域は1バイト単位のアイテム。

use crate::image::{Architecture, LoadedImage};
use anyhow::{anyhow, Result};
use capstone::prelude::*;
use tracing::debug;

struct CodeRegion {
    start: u64,
    end: u64,
    /// (先頭アドレス, 命令長)、アドレス昇順
    heads: Vec<(u64, u8)>,
}

impl CodeRegion {
    fn head_of(&self, address: u64) -> Option<u64> {
        let idx = self.heads.partition_point(|(start, _)| *start <= address);
        let (start, len) = *self.heads.get(idx.checked_sub(1)?)?;
        (address - start < len as u64).then_some(start)
    }
}

#[derive(Default)]
pub struct ItemMap {
    regions: Vec<CodeRegion>,
}

impl ItemMap {
    pub fn build(image: &LoadedImage) -> Result<Self> {
        let cs = match disassembler_for(image.arch)? {
            Some(cs) => cs,
            None => {
                debug!("No disassembler for {:?}, every byte is an item", image.arch);
                return Ok(Self::default());
            }
        };

        let step = min_instruction_size(image.arch);
        let mut regions = Vec::new();

        for (mapping, bytes) in image.code_regions() {
            let heads = sweep(&cs, bytes, mapping.address, step)?;
            debug!(
                "Swept {} (0x{:x}): {} instructions",
                mapping.name,
                mapping.address,
                heads.len()
            );
            regions.push(CodeRegion {
                start: mapping.address,
                end: mapping.address.saturating_add(bytes.len() as u64),
                heads,
            });
        }

        Ok(Self { regions })
    }

    /// アドレスを含むアイテムの先頭
    pub fn item_head(&self, address: u64) -> u64 {
        self.regions
            .iter()
            .find(|r| address >= r.start && address < r.end)
            .and_then(|r| r.head_of(address))
            .unwrap_or(address)
    }

    pub fn instruction_count(&self) -> usize {
        self.regions.iter().map(|r| r.heads.len()).sum()
    }
}

fn disassembler_for(target: Architecture) -> Result<Option<Capstone>> {
    let cs = match target {
        Architecture::X86 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode32)
            .build(),
        Architecture::X86_64 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .build(),
        Architecture::Arm => Capstone::new()
            .arm()
            .mode(arch::arm::ArchMode::Arm)
            .build(),
        Architecture::Thumb => Capstone::new()
            .arm()
            .mode(arch::arm::ArchMode::Thumb)
            .build(),
        Architecture::Arm64 => Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .build(),
        Architecture::Unknown => return Ok(None),
    };

    cs.map(Some)
        .map_err(|e| anyhow!("Failed to create Capstone instance: {}", e))
}

fn min_instruction_size(arch: Architecture) -> usize {
    match arch {
        Architecture::Arm | Architecture::Arm64 => 4,
        Architecture::Thumb => 2,
        _ => 1,
    }
}

/// 線形スイープ。デコードできない位置は `step` バイト飛ばして再開する
fn sweep(cs: &Capstone, bytes: &[u8], base: u64, step: usize) -> Result<Vec<(u64, u8)>> {
    let mut heads = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let address = base
            .checked_add(offset as u64)
            .ok_or_else(|| anyhow!("Code region at 0x{:x} overflows the address space", base))?;
        let insns = cs
            .disasm_all(&bytes[offset..], address)
            .map_err(|e| anyhow!("Disassembly failed at 0x{:x}: {}", address, e))?;

        for insn in insns.iter() {
            let len = insn.bytes().len();
            heads.push((insn.address(), len as u8));
            offset += len;
        }

        if offset < bytes.len() {
            offset += step;
        }
    }

    Ok(heads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testing::{elf64_with_code, elf64_with_code_at};

    #[test]
    fn test_item_head_snaps_inside_instruction() {
        // push rbp; mov rbp, rsp; nop; pop rbp; ret
        let code = [0x55, 0x48, 0x89, 0xe5, 0x90, 0x5d, 0xc3];
        let image = LoadedImage::parse("test.elf", elf64_with_code(&code)).unwrap();
        let items = ItemMap::build(&image).unwrap();

        assert_eq!(items.instruction_count(), 5);
        assert_eq!(items.item_head(0x401000), 0x401000);
        assert_eq!(items.item_head(0x401002), 0x401001);
        assert_eq!(items.item_head(0x401003), 0x401001);
        assert_eq!(items.item_head(0x401004), 0x401004);
        assert_eq!(items.item_head(0x401006), 0x401006);
    }

    #[test]
    fn test_non_code_is_its_own_head() {
        let image = LoadedImage::parse("test.elf", elf64_with_code(&[0x90, 0xc3])).unwrap();
        let items = ItemMap::build(&image).unwrap();

        assert_eq!(items.item_head(0x400000), 0x400000);
        assert_eq!(items.item_head(0x500003), 0x500003);
    }

    #[test]
    fn test_sweep_resumes_after_undecodable_bytes() {
        let cs = disassembler_for(Architecture::X86_64).unwrap().unwrap();
        // nop; (不正バイト 0x06 は64ビットモードで無効); nop
        let heads = sweep(&cs, &[0x90, 0x06, 0x90], 0x1000, 1).unwrap();

        assert_eq!(heads, vec![(0x1000, 1), (0x1002, 1)]);
    }

    #[test]
    fn test_sweep_rejects_region_past_address_space_end() {
        let cs = disassembler_for(Architecture::X86_64).unwrap().unwrap();

        assert!(sweep(&cs, &[0x90, 0x06, 0x90], u64::MAX - 1, 1).is_err());
    }

    #[test]
    fn test_overflowing_segment_builds_empty_map() {
        let image = LoadedImage::parse("test.elf", elf64_with_code_at(&[0x90, 0xc3], u64::MAX - 3)).unwrap();
        let items = ItemMap::build(&image).unwrap();

        assert_eq!(items.instruction_count(), 0);
        assert_eq!(items.item_head(u64::MAX - 2), u64::MAX - 2);
    }

    #[test]
    fn test_unknown_arch_has_no_regions() {
        let image = LoadedImage::parse("blob.bin", vec![0; 32]).unwrap();
        let items = ItemMap::build(&image).unwrap();

        assert_eq!(items.instruction_count(), 0);
        assert_eq!(items.item_head(7), 7);
    }
}
