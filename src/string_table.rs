/// 文字列テーブル（外部ツールが出力したJSON）
///
/// ```json
/// {"strings": [{"offset": 256, "value": "hello"}, ...]}
/// ```
///
/// レコードの検証は反復時に1件ずつ行う。先頭から順に処理し、
/// 不正なレコードに到達した時点で呼び出し側が残りを打ち切る。

use crate::error::AnnotateError;
use serde::Serialize;
use serde_json::Value;

/// 1件分の文字列レコード
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StringRecord {
    /// ファイルオフセット（ロードアドレスではない）
    pub offset: u64,
    pub value: String,
}

impl StringRecord {
    /// JSONの1要素からレコードを作る
    ///
    /// `offset` は非負整数、`value` は文字列でなければならない。
    /// 型が違う・`null` の場合も欠落として扱う。
    pub fn from_entry(index: usize, entry: &Value) -> Result<Self, AnnotateError> {
        let invalid = || AnnotateError::InvalidEntry {
            index,
            entry: entry.to_string(),
        };

        let offset = entry.get("offset").and_then(Value::as_u64).ok_or_else(invalid)?;
        let value = entry.get("value").and_then(Value::as_str).ok_or_else(invalid)?;

        Ok(Self {
            offset,
            value: value.to_string(),
        })
    }
}

/// ファイル順に並んだレコード列
#[derive(Debug, Clone, Default)]
pub struct StringTable {
    entries: Vec<Value>,
}

impl StringTable {
    /// JSONテキストをパースし、`strings` 配列を取り出す
    ///
    /// `source` はエラーメッセージに出すファイル名。
    pub fn from_json(source: &str, text: &str) -> Result<Self, AnnotateError> {
        let document: Value = serde_json::from_str(text).map_err(|e| AnnotateError::Parse {
            path: source.to_string(),
            source: e,
        })?;

        let strings = match document.get("strings") {
            None | Some(Value::Null) => {
                return Err(AnnotateError::MissingStrings {
                    path: source.to_string(),
                })
            }
            Some(strings) => strings,
        };

        let entries = strings
            .as_array()
            .ok_or_else(|| AnnotateError::StringsNotList {
                path: source.to_string(),
            })?
            .clone();

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// ファイル順にレコードを検証しながら返す
    pub fn records(&self) -> impl Iterator<Item = (usize, &Value, Result<StringRecord, AnnotateError>)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (index, entry, StringRecord::from_entry(index, entry)))
    }
}
