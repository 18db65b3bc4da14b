/// コメントデータベース
///
/// 逆アセンブリ（リニアビュー）と疑似コードの2系統のコメントを保持し、
/// バイナリ横のJSONファイルに保存する。バイナリのハッシュを記録しておき、
/// 別のバイナリのデータベースを誤って読み込まないようにする。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 疑似コード側のコメント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PseudocodeComment {
    /// コメントを付けた関数の先頭
    pub function: u64,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentDatabase {
    /// 対象バイナリのxxh3ハッシュ
    pub fingerprint: String,
    #[serde(default)]
    disassembly: BTreeMap<u64, String>,
    #[serde(default)]
    pseudocode: BTreeMap<u64, PseudocodeComment>,
}

impl CommentDatabase {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            ..Default::default()
        }
    }

    /// `<binary>.strannotate.json`
    pub fn default_path(binary: &Path) -> PathBuf {
        let mut name = binary.as_os_str().to_owned();
        name.push(".strannotate.json");
        PathBuf::from(name)
    }

    /// ディスクから読み込む
    ///
    /// ファイルがなければ空のデータベース。ハッシュが一致しない場合も
    /// 警告を出して空のデータベースを返す（既存ファイルは上書きされるまで残る）。
    pub fn open(path: &Path, fingerprint: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(fingerprint));
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read comment database {}", path.display()))?;
        let db: CommentDatabase = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt comment database {}", path.display()))?;

        if db.fingerprint != fingerprint {
            warn!(
                "Comment database {} belongs to a different binary ({} != {}), starting fresh",
                path.display(),
                db.fingerprint,
                fingerprint
            );
            return Ok(Self::new(fingerprint));
        }

        info!(
            "Loaded {} disassembly / {} pseudocode comments from {}",
            db.disassembly.len(),
            db.pseudocode.len(),
            path.display()
        );
        Ok(db)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write comment database {}", path.display()))?;
        info!("Saved comment database to {}", path.display());
        Ok(())
    }

    /// 既存のコメントは上書き
    pub fn set_disassembly(&mut self, address: u64, text: &str) {
        self.disassembly.insert(address, text.to_string());
    }

    pub fn set_pseudocode(&mut self, function: u64, address: u64, text: &str) {
        self.pseudocode.insert(
            address,
            PseudocodeComment {
                function,
                text: text.to_string(),
            },
        );
    }

    pub fn disassembly_comment(&self, address: u64) -> Option<&str> {
        self.disassembly.get(&address).map(String::as_str)
    }

    pub fn pseudocode_comment(&self, address: u64) -> Option<&PseudocodeComment> {
        self.pseudocode.get(&address)
    }

    pub fn disassembly(&self) -> impl Iterator<Item = (u64, &str)> + '_ {
        self.disassembly.iter().map(|(a, t)| (*a, t.as_str()))
    }

    pub fn pseudocode(&self) -> impl Iterator<Item = (u64, &PseudocodeComment)> + '_ {
        self.pseudocode.iter().map(|(a, c)| (*a, c))
    }

    pub fn disassembly_count(&self) -> usize {
        self.disassembly.len()
    }

    pub fn pseudocode_count(&self) -> usize {
        self.pseudocode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disassembly.is_empty() && self.pseudocode.is_empty()
    }
}
