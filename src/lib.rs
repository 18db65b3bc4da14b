/// StrAnnotate ライブラリ
///
/// 外部ツールが抽出した文字列テーブル（ファイルオフセット → 文字列）を
/// 解析データベースのコメントとして取り込む

pub mod error;
pub mod string_table;
pub mod host;
pub mod annotator;
pub mod plugin;

// スタンドアロン解析環境（goblin + capstone）
pub mod image;
pub mod item_map;
pub mod comment_db;
pub mod session;

pub use annotator::{AnnotationReport, AppliedComment, Annotator, Console, MemoryConsole, StdoutConsole};
pub use error::{AnnotateError, ErrorKind, HostError};
pub use host::{AddressWidth, AnalysisHost, DecompiledUnit, UNMAPPED_32, UNMAPPED_64};
pub use plugin::{ActionDesc, PluginFlags, StrAnnotatePlugin, UiHost};
pub use session::ImageSession;
pub use string_table::{StringRecord, StringTable};
