/// StrAnnotate プラグイン本体
///
/// 解析環境のUIへアクション「Import strings!」を登録し、
/// 実行されたらファイル選択ダイアログで文字列JSONを選ばせて取り込む。
/// 登録はプロセス内で一度だけ行う。

use crate::annotator::{AnnotationReport, Annotator, Console};
use crate::host::AnalysisHost;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

pub const PLUGIN_NAME: &str = "StrAnnotate";
pub const PLUGIN_HOTKEY: &str = "";
pub const PLUGIN_COMMENT: &str = "StrAnnotate plugin: annotate a disassembly with an imported strings table";
pub const VERSION: &str = "1.0.0";

pub const ACTION_NAME: &str = "StrAnnotate";
pub const ACTION_LABEL: &str = "Import strings!";
pub const MENU_PATH: &str = "Edit/StrAnnotate";

pub const FILE_FILTER: &str = "*.json";
pub const FILE_PROMPT: &str = "Choose string file (json format)...";
pub const NO_FILE_MESSAGE: &str = "ERROR: You must choose a strings file to annotate with";

/// プロセス全体の初期化済みフラグ
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// アクションの定義
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDesc {
    pub name: String,
    pub label: String,
    pub hotkey: Option<String>,
    pub tooltip: Option<String>,
}

impl ActionDesc {
    pub fn import_strings() -> Self {
        Self {
            name: ACTION_NAME.to_string(),
            label: ACTION_LABEL.to_string(),
            hotkey: (!PLUGIN_HOTKEY.is_empty()).then(|| PLUGIN_HOTKEY.to_string()),
            tooltip: None,
        }
    }
}

/// 解析環境のUI機能
pub trait UiHost {
    fn register_action(&mut self, action: ActionDesc) -> bool;

    fn attach_action_to_menu(&mut self, menu_path: &str, action_name: &str) -> bool;

    /// ファイル選択。キャンセルされたら `None`
    fn ask_file(&mut self, filter: &str, prompt: &str) -> Option<PathBuf>;
}

/// `init` の戻り値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginFlags {
    /// プラグインをメモリに常駐させる
    Keep,
}

pub struct StrAnnotatePlugin<C: Console> {
    annotator: Annotator<C>,
}

impl<C: Console> StrAnnotatePlugin<C> {
    pub fn new(console: C) -> Self {
        Self {
            annotator: Annotator::new(console),
        }
    }

    pub fn console(&self) -> &C {
        self.annotator.console()
    }

    pub fn console_mut(&mut self) -> &mut C {
        self.annotator.console_mut()
    }

    pub fn init(&mut self, ui: &mut dyn UiHost) -> PluginFlags {
        self.init_once(ui, &INITIALIZED)
    }

    /// 初期化本体。`guard` が立っていればアクション登録もバナー表示もしない
    fn init_once(&mut self, ui: &mut dyn UiHost, guard: &AtomicBool) -> PluginFlags {
        if guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("{} already initialized", PLUGIN_NAME);
            return PluginFlags::Keep;
        }

        if !ui.register_action(ActionDesc::import_strings()) {
            info!("Action {} was already registered", ACTION_NAME);
        }
        ui.attach_action_to_menu(MENU_PATH, ACTION_NAME);
        self.print_banner();

        PluginFlags::Keep
    }

    fn print_banner(&mut self) {
        let rule = "=".repeat(80);
        let console = self.annotator.console_mut();
        console.line(&rule);
        console.line(&format!("\n{} v{}", PLUGIN_NAME, VERSION));
        console.line("\n");
        console.line("* Use this plugin to annotate your database with an externally generated strings table *");
        console.line("\n");
        console.line(&rule);
    }

    /// メニューから実行されたとき
    pub fn run<H>(&mut self, ui: &mut dyn UiHost, host: &mut H) -> Option<AnnotationReport>
    where
        H: AnalysisHost + ?Sized,
    {
        match ui.ask_file(FILE_FILTER, FILE_PROMPT) {
            Some(path) => Some(self.annotator.annotate(host, path)),
            None => {
                self.annotator.console_mut().line(NO_FILE_MESSAGE);
                None
            }
        }
    }

    pub fn term(&mut self) {}
}
