/// スタンドアロン解析セッション
///
/// ロード済みイメージ・アイテム境界マップ・コメントDBをまとめ、
/// `AnalysisHost` として注釈エンジンに渡す。

use crate::comment_db::CommentDatabase;
use crate::error::HostError;
use crate::host::{AddressWidth, AnalysisHost, DecompiledUnit};
use crate::image::LoadedImage;
use crate::item_map::ItemMap;
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct ImageSession {
    image: LoadedImage,
    items: ItemMap,
    comments: CommentDatabase,
    db_path: PathBuf,
}

/// セッション概要（CLI `info`・サーバー応答用）
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub binary: String,
    pub database: String,
    pub format: String,
    pub architecture: String,
    pub address_bits: u32,
    pub entry_point: u64,
    pub mappings: usize,
    pub functions: usize,
    pub instructions: usize,
    pub disassembly_comments: usize,
    pub pseudocode_comments: usize,
}

impl ImageSession {
    /// バイナリを開く。`db_path` 省略時は `<binary>.strannotate.json`
    pub fn open(binary: impl AsRef<Path>, db_path: Option<PathBuf>) -> Result<Self> {
        let binary = binary.as_ref();
        let image = LoadedImage::load(binary)?;
        let db_path = db_path.unwrap_or_else(|| CommentDatabase::default_path(binary));
        let comments = CommentDatabase::open(&db_path, image.fingerprint())?;
        Self::from_parts(image, comments, db_path)
    }

    pub fn from_parts(image: LoadedImage, comments: CommentDatabase, db_path: PathBuf) -> Result<Self> {
        let items = ItemMap::build(&image)?;
        info!(
            "Session ready: {} ({} instructions)",
            image.path.display(),
            items.instruction_count()
        );
        Ok(Self {
            image,
            items,
            comments,
            db_path,
        })
    }

    pub fn image(&self) -> &LoadedImage {
        &self.image
    }

    pub fn comments(&self) -> &CommentDatabase {
        &self.comments
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn save(&self) -> Result<()> {
        self.comments.save(&self.db_path)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            binary: self.image.path.display().to_string(),
            database: self.db_path.display().to_string(),
            format: format!("{:?}", self.image.format),
            architecture: format!("{:?}", self.image.arch),
            address_bits: self.image.width.bits(),
            entry_point: self.image.entry_point,
            mappings: self.image.mappings().len(),
            functions: self.image.functions().len(),
            instructions: self.items.instruction_count(),
            disassembly_comments: self.comments.disassembly_count(),
            pseudocode_comments: self.comments.pseudocode_count(),
        }
    }
}

impl AnalysisHost for ImageSession {
    fn address_width(&self) -> AddressWidth {
        self.image.width
    }

    fn resolve_file_offset(&self, offset: u64) -> u64 {
        self.image
            .resolve_file_offset(offset)
            .unwrap_or_else(|| self.image.width.unmapped())
    }

    fn item_head(&self, address: u64) -> u64 {
        self.items.item_head(address)
    }

    fn decompile(&mut self, address: u64) -> Result<DecompiledUnit, HostError> {
        self.image
            .function_containing(address)
            .map(|func| DecompiledUnit {
                entry: func.start,
                name: if func.name.is_empty() {
                    format!("sub_{:x}", func.start)
                } else {
                    func.name.clone()
                },
            })
            .ok_or(HostError::NoFunction { address })
    }

    fn set_disassembly_comment(&mut self, address: u64, text: &str) {
        debug!("cmt 0x{:x} = {:?}", address, text);
        self.comments.set_disassembly(address, text);
    }

    fn set_decompiled_comment(
        &mut self,
        unit: &DecompiledUnit,
        address: u64,
        text: &str,
    ) -> Result<(), HostError> {
        self.comments.set_pseudocode(unit.entry, address, text);
        Ok(())
    }
}
