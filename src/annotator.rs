/// 文字列注釈エンジン
///
/// 文字列テーブルを先頭から1件ずつ処理し、ファイルオフセットを
/// ロードアドレスへ変換してアイテム先頭に寄せ、逆アセンブリと
/// 疑似コードの両方にコメントを書き込む。
///
/// 不正なレコード・範囲外オフセットに当たった時点で残りは処理しない。
/// 疑似コード側の書き込みはベストエフォート（失敗しても続行）。

use crate::error::AnnotateError;
use crate::host::AnalysisHost;
use crate::string_table::StringTable;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// ステータス行の出力先
pub trait Console {
    fn line(&mut self, text: &str);
}

/// 標準出力へ書くコンソール
#[derive(Debug, Default)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn line(&mut self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        // 標準出力が閉じていても取り込みは続ける
        if let Err(e) = writeln!(stdout, "{}", text) {
            debug!("console write failed: {}", e);
        }
    }
}

/// 行をメモリに溜めるコンソール（サーバー応答・テスト用）
#[derive(Debug, Default, Clone)]
pub struct MemoryConsole {
    lines: Vec<String>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn take_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }
}

impl Console for MemoryConsole {
    fn line(&mut self, text: &str) {
        self.lines.push(text.to_string());
    }
}

impl<C: Console + ?Sized> Console for &mut C {
    fn line(&mut self, text: &str) {
        (**self).line(text)
    }
}

/// 適用済みコメント1件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedComment {
    pub index: usize,
    pub offset: u64,
    /// オフセットを変換した直後のアドレス
    pub resolved: u64,
    /// アイテム先頭に寄せた後のアドレス（コメント位置）
    pub address: u64,
    pub value: String,
    /// 疑似コードにも書き込めたか
    pub decompiled: bool,
}

/// 1回の取り込み結果
#[derive(Debug, Default)]
pub struct AnnotationReport {
    pub applied: Vec<AppliedComment>,
    /// 途中終了の原因
    pub aborted: Option<AnnotateError>,
}

impl AnnotationReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }

    pub fn decompiled_count(&self) -> usize {
        self.applied.iter().filter(|c| c.decompiled).count()
    }
}

pub struct Annotator<C: Console> {
    console: C,
}

impl<C: Console> Annotator<C> {
    pub fn new(console: C) -> Self {
        Self { console }
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    pub fn into_console(self) -> C {
        self.console
    }

    /// 文字列ファイルを読み込んで注釈を付ける
    pub fn annotate<H>(&mut self, host: &mut H, path: impl AsRef<Path>) -> AnnotationReport
    where
        H: AnalysisHost + ?Sized,
    {
        let path = path.as_ref();
        let source = path.display().to_string();
        info!("Importing strings from {}", source);

        match std::fs::read_to_string(path) {
            Ok(text) => self.annotate_text(host, &source, &text),
            Err(e) => {
                debug!("read failed: {}", e);
                self.abort(
                    AnnotationReport::default(),
                    AnnotateError::Io {
                        path: source,
                        source: e,
                    },
                )
            }
        }
    }

    /// 読み込み済みのJSONテキストから注釈を付ける
    pub fn annotate_text<H>(&mut self, host: &mut H, source: &str, text: &str) -> AnnotationReport
    where
        H: AnalysisHost + ?Sized,
    {
        let mut report = AnnotationReport::default();

        let table = match StringTable::from_json(source, text) {
            Ok(table) => table,
            Err(e) => return self.abort(report, e),
        };

        debug!("{} string entries in {}", table.len(), source);
        let width = host.address_width();

        for (index, entry, record) in table.records() {
            let record = match record {
                Ok(record) => record,
                Err(e) => return self.abort(report, e),
            };

            let resolved = host.resolve_file_offset(record.offset);
            if width.is_unmapped(resolved) {
                let err = AnnotateError::OffsetOutOfRange {
                    index,
                    offset: record.offset,
                    entry: entry.to_string(),
                };
                return self.abort(report, err);
            }

            // ずれたアドレスはアイテム先頭に寄せる
            let address = host.item_head(resolved);
            self.console
                .line(&format!("0x{:x} : {}", address, record.value));

            host.set_disassembly_comment(address, &record.value);
            let decompiled = self.set_pseudocode_comment(host, address, &record.value);

            report.applied.push(AppliedComment {
                index,
                offset: record.offset,
                resolved,
                address,
                value: record.value,
                decompiled,
            });
        }

        info!(
            "Applied {} string comments ({} in pseudocode)",
            report.applied.len(),
            report.decompiled_count()
        );
        report
    }

    fn set_pseudocode_comment<H>(&mut self, host: &mut H, address: u64, text: &str) -> bool
    where
        H: AnalysisHost + ?Sized,
    {
        let result = host
            .decompile(address)
            .and_then(|unit| host.set_decompiled_comment(&unit, address, text));

        match result {
            Ok(()) => true,
            Err(e) => {
                info!("Unable to comment pseudocode at 0x{:x}: {}", address, e);
                false
            }
        }
    }

    fn abort(&mut self, mut report: AnnotationReport, error: AnnotateError) -> AnnotationReport {
        warn!("String import aborted after {} entries", report.applied.len());
        self.console.line(&error.to_string());
        report.aborted = Some(error);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, HostError};
    use crate::host::{AddressWidth, DecompiledUnit, UNMAPPED_32};
    use std::collections::{BTreeMap, HashMap};

    /// オフセット表と命令境界を持つフェイクホスト
    struct FakeHost {
        width: AddressWidth,
        offsets: HashMap<u64, u64>,
        /// (先頭, サイズ)
        items: Vec<(u64, u64)>,
        functions: Vec<(u64, u64)>,
        disassembly: BTreeMap<u64, String>,
        pseudocode: BTreeMap<u64, String>,
        disassembly_writes: usize,
    }

    impl FakeHost {
        fn new(width: AddressWidth) -> Self {
            Self {
                width,
                offsets: HashMap::new(),
                items: Vec::new(),
                functions: Vec::new(),
                disassembly: BTreeMap::new(),
                pseudocode: BTreeMap::new(),
                disassembly_writes: 0,
            }
        }

        fn map(mut self, offset: u64, address: u64) -> Self {
            self.offsets.insert(offset, address);
            self
        }

        fn item(mut self, start: u64, size: u64) -> Self {
            self.items.push((start, size));
            self
        }

        fn function(mut self, start: u64, end: u64) -> Self {
            self.functions.push((start, end));
            self
        }
    }

    impl AnalysisHost for FakeHost {
        fn address_width(&self) -> AddressWidth {
            self.width
        }

        fn resolve_file_offset(&self, offset: u64) -> u64 {
            self.offsets
                .get(&offset)
                .copied()
                .unwrap_or(self.width.unmapped())
        }

        fn item_head(&self, address: u64) -> u64 {
            self.items
                .iter()
                .find(|(start, size)| address >= *start && address < start + size)
                .map(|(start, _)| *start)
                .unwrap_or(address)
        }

        fn decompile(&mut self, address: u64) -> Result<DecompiledUnit, HostError> {
            self.functions
                .iter()
                .find(|(start, end)| address >= *start && address < *end)
                .map(|(start, _)| DecompiledUnit {
                    entry: *start,
                    name: format!("sub_{:x}", start),
                })
                .ok_or(HostError::NoFunction { address })
        }

        fn set_disassembly_comment(&mut self, address: u64, text: &str) {
            self.disassembly_writes += 1;
            self.disassembly.insert(address, text.to_string());
        }

        fn set_decompiled_comment(
            &mut self,
            _unit: &DecompiledUnit,
            address: u64,
            text: &str,
        ) -> Result<(), HostError> {
            self.pseudocode.insert(address, text.to_string());
            Ok(())
        }
    }

    fn run(host: &mut FakeHost, json: &str) -> (AnnotationReport, Vec<String>) {
        let mut annotator = Annotator::new(MemoryConsole::new());
        let report = annotator.annotate_text(host, "strings.json", json);
        (report, annotator.into_console().take_lines())
    }

    #[test]
    fn test_single_string_both_views() {
        let mut host = FakeHost::new(AddressWidth::Bits64)
            .map(256, 0x401000)
            .item(0x401000, 5)
            .function(0x401000, 0x401100);

        let (report, lines) = run(&mut host, r#"{"strings":[{"offset":256,"value":"hello"}]}"#);

        assert!(report.is_complete());
        assert_eq!(lines, vec!["0x401000 : hello".to_string()]);
        assert_eq!(host.disassembly.get(&0x401000).map(String::as_str), Some("hello"));
        assert_eq!(host.pseudocode.get(&0x401000).map(String::as_str), Some("hello"));
        assert!(report.applied[0].decompiled);
    }

    #[test]
    fn test_missing_strings_key_writes_nothing() {
        let mut host = FakeHost::new(AddressWidth::Bits64).map(256, 0x401000);

        let (report, lines) = run(&mut host, r#"{"values":[{"offset":256,"value":"hello"}]}"#);

        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("json has no key 'strings'"));
        assert_eq!(report.aborted.as_ref().map(|e| e.kind()), Some(ErrorKind::Schema));
        assert_eq!(host.disassembly_writes, 0);
        assert!(host.pseudocode.is_empty());
    }

    #[test]
    fn test_malformed_json_writes_nothing() {
        let mut host = FakeHost::new(AddressWidth::Bits64).map(256, 0x401000);

        let (report, lines) = run(&mut host, r#"{"strings":[{"offset":256,"value":"hello"}"#);

        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("invalid json format."));
        assert_eq!(report.aborted.as_ref().map(|e| e.kind()), Some(ErrorKind::Parse));
        assert!(report.applied.is_empty());
        assert_eq!(host.disassembly_writes, 0);
        assert!(host.pseudocode.is_empty());
    }

    #[test]
    fn test_empty_table_is_complete() {
        let mut host = FakeHost::new(AddressWidth::Bits64).map(256, 0x401000);

        let (report, lines) = run(&mut host, r#"{"strings":[]}"#);

        assert!(report.is_complete());
        assert!(report.applied.is_empty());
        assert!(lines.is_empty());
        assert_eq!(host.disassembly_writes, 0);
    }

    #[test]
    fn test_unmapped_32bit_aborts_remaining() {
        let mut host = FakeHost::new(AddressWidth::Bits32)
            .map(0x10, 0x1000)
            .map(0x20, UNMAPPED_32)
            .map(0x30, 0x3000);

        let (report, lines) = run(
            &mut host,
            r#"{"strings":[
                {"offset":16,"value":"first"},
                {"offset":32,"value":"second"},
                {"offset":48,"value":"third"}
            ]}"#,
        );

        assert_eq!(report.applied.len(), 1);
        assert_eq!(host.disassembly.get(&0x1000).map(String::as_str), Some("first"));
        assert!(host.disassembly.get(&0x3000).is_none());
        let err = report.aborted.unwrap();
        assert_eq!(err.kind(), ErrorKind::Range);
        assert_eq!(err.record_index(), Some(1));
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("not in range of binary"));
    }

    #[test]
    fn test_bad_record_aborts_remaining() {
        let mut host = FakeHost::new(AddressWidth::Bits64)
            .map(1, 0x100)
            .map(3, 0x300);

        let (report, lines) = run(
            &mut host,
            r#"{"strings":[{"offset":1,"value":"a"},{"offset":2},{"offset":3,"value":"c"}]}"#,
        );

        assert_eq!(report.applied.len(), 1);
        assert_eq!(host.disassembly_writes, 1);
        assert!(host.disassembly.get(&0x300).is_none());
        assert_eq!(report.aborted.unwrap().record_index(), Some(1));
        // ステータス行は処理済みレコードの数だけ
        assert_eq!(lines.iter().filter(|l| l.starts_with("0x")).count(), 1);
    }

    #[test]
    fn test_misaligned_address_snaps_to_item_head() {
        let mut host = FakeHost::new(AddressWidth::Bits64)
            .map(0x402, 0x401002)
            .item(0x401000, 6);

        let (report, lines) = run(&mut host, r#"{"strings":[{"offset":1026,"value":"mid"}]}"#);

        assert_eq!(report.applied[0].resolved, 0x401002);
        assert_eq!(report.applied[0].address, 0x401000);
        assert_eq!(lines[0], "0x401000 : mid");
        assert!(host.disassembly.get(&0x401002).is_none());
    }

    #[test]
    fn test_pseudocode_failure_is_not_fatal() {
        let mut host = FakeHost::new(AddressWidth::Bits64)
            .map(1, 0x5000)
            .map(2, 0x6000)
            .function(0x6000, 0x6100);

        let (report, _) = run(
            &mut host,
            r#"{"strings":[{"offset":1,"value":"data"},{"offset":2,"value":"code"}]}"#,
        );

        assert!(report.is_complete());
        assert_eq!(report.applied.len(), 2);
        assert!(!report.applied[0].decompiled);
        assert!(report.applied[1].decompiled);
        assert_eq!(report.decompiled_count(), 1);
        assert_eq!(host.disassembly.len(), 2);
        assert_eq!(host.pseudocode.len(), 1);
    }

    #[test]
    fn test_last_write_wins_and_idempotent() {
        let json = r#"{"strings":[{"offset":1,"value":"old"},{"offset":2,"value":"new"}]}"#;
        let mut host = FakeHost::new(AddressWidth::Bits64)
            .map(1, 0x700)
            .map(2, 0x702)
            .item(0x700, 4);

        run(&mut host, json);
        let once = host.disassembly.clone();
        run(&mut host, json);

        assert_eq!(once.get(&0x700).map(String::as_str), Some("new"));
        assert_eq!(host.disassembly, once);
    }

    #[test]
    fn test_unreadable_file_is_io_error() {
        let mut host = FakeHost::new(AddressWidth::Bits64);
        let mut annotator = Annotator::new(MemoryConsole::new());

        let report = annotator.annotate(&mut host, "/nonexistent/strannotate/strings.json");

        assert_eq!(report.aborted.map(|e| e.kind()), Some(ErrorKind::Io));
        assert!(annotator.console().lines()[0].starts_with("Error reading file"));
        assert_eq!(host.disassembly_writes, 0);
    }

    #[test]
    fn test_annotate_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"strings":[{{"offset":256,"value":"hello"}}]}}"#).unwrap();

        let mut host = FakeHost::new(AddressWidth::Bits64).map(256, 0x401000);
        let mut annotator = Annotator::new(MemoryConsole::new());
        let report = annotator.annotate(&mut host, file.path());

        assert!(report.is_complete());
        assert_eq!(annotator.console().lines(), ["0x401000 : hello"]);
    }
}
