/// エラー型
///
/// 文字列テーブルの取り込みで発生するエラーはすべて「その場で終了」扱い。
/// コンソールに表示されたあと、呼び出し元のセッションはそのまま継続する。

use thiserror::Error;

/// エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// ファイルが読めない
    Io,
    /// JSONとして不正
    Parse,
    /// 必須キー・必須フィールドの欠落
    Schema,
    /// オフセットがバイナリの範囲外
    Range,
}

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("Error reading file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error parsing file {path}, invalid json format.")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Error parsing file {path}, json has no key 'strings'.")]
    MissingStrings { path: String },

    #[error("Error parsing file {path}, key 'strings' is not a list.")]
    StringsNotList { path: String },

    #[error("Invalid string entry {entry}, expected format {{'offset':<string_offset>,'value':<ascii_string>}}")]
    InvalidEntry { index: usize, entry: String },

    #[error("Invalid string offset {entry}, not in range of binary.")]
    OffsetOutOfRange {
        index: usize,
        offset: u64,
        entry: String,
    },
}

impl AnnotateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnnotateError::Io { .. } => ErrorKind::Io,
            AnnotateError::Parse { .. } => ErrorKind::Parse,
            AnnotateError::MissingStrings { .. }
            | AnnotateError::StringsNotList { .. }
            | AnnotateError::InvalidEntry { .. } => ErrorKind::Schema,
            AnnotateError::OffsetOutOfRange { .. } => ErrorKind::Range,
        }
    }

    /// 失敗したレコードの位置（テーブル全体のエラーなら `None`）
    pub fn record_index(&self) -> Option<usize> {
        match self {
            AnnotateError::InvalidEntry { index, .. }
            | AnnotateError::OffsetOutOfRange { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// ホスト側の操作で発生するエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("no function contains address 0x{address:x}")]
    NoFunction { address: u64 },

    #[error("decompilation failed at 0x{address:x}: {reason}")]
    DecompileFailed { address: u64, reason: String },

    #[error("pseudocode comment rejected at 0x{address:x}")]
    CommentRejected { address: u64 },
}
