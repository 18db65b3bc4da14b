/// 解析環境（逆アセンブラ・デコンパイラ）との境界
///
/// 注釈処理はこのトレイト越しにのみ解析データベースへ触れる。
/// 実装は `session::ImageSession`（スタンドアロン）とテスト用のフェイク。

use crate::error::HostError;
use serde::Serialize;

/// 32ビット空間での「未マップ」値
pub const UNMAPPED_32: u64 = 0xFFFF_FFFF;
/// 64ビット空間での「未マップ」値
pub const UNMAPPED_64: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// アドレス幅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressWidth {
    Bits32,
    Bits64,
}

impl AddressWidth {
    pub fn unmapped(self) -> u64 {
        match self {
            AddressWidth::Bits32 => UNMAPPED_32,
            AddressWidth::Bits64 => UNMAPPED_64,
        }
    }

    pub fn is_unmapped(self, address: u64) -> bool {
        address == self.unmapped()
    }

    pub fn bits(self) -> u32 {
        match self {
            AddressWidth::Bits32 => 32,
            AddressWidth::Bits64 => 64,
        }
    }
}

/// デコンパイル結果（コメントを付ける単位）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecompiledUnit {
    /// 関数の先頭アドレス
    pub entry: u64,
    pub name: String,
}

pub trait AnalysisHost {
    fn address_width(&self) -> AddressWidth;

    /// ファイルオフセット → ロードアドレス。対応がなければ未マップ値を返す
    fn resolve_file_offset(&self, offset: u64) -> u64;

    /// アドレスを含むアイテム（命令・データ）の先頭
    fn item_head(&self, address: u64) -> u64;

    fn decompile(&mut self, address: u64) -> Result<DecompiledUnit, HostError>;

    fn set_disassembly_comment(&mut self, address: u64, text: &str);

    fn set_decompiled_comment(
        &mut self,
        unit: &DecompiledUnit,
        address: u64,
        text: &str,
    ) -> Result<(), HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_sentinel_per_width() {
        assert!(AddressWidth::Bits32.is_unmapped(0xFFFF_FFFF));
        assert!(!AddressWidth::Bits32.is_unmapped(u64::MAX));
        assert!(AddressWidth::Bits64.is_unmapped(u64::MAX));
        assert!(!AddressWidth::Bits64.is_unmapped(0xFFFF_FFFF));
        assert_eq!(AddressWidth::Bits64.bits(), 64);
    }
}
