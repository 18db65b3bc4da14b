use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use strannotate::plugin::{self, ActionDesc, StrAnnotatePlugin, UiHost};
use strannotate::{ImageSession, MemoryConsole};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct McpRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct McpResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<McpError>,
}

#[derive(Debug, Serialize)]
struct McpError {
    code: i32,
    message: String,
}

/// プラグインのアクションをツールとして公開するUI
///
/// ファイル選択ダイアログの代わりに、ツール呼び出しの `path` 引数を返す。
#[derive(Default)]
struct ToolRegistry {
    actions: IndexMap<String, ActionDesc>,
    menus: IndexMap<String, String>,
    pending_file: Option<PathBuf>,
}

impl UiHost for ToolRegistry {
    fn register_action(&mut self, action: ActionDesc) -> bool {
        if self.actions.contains_key(&action.name) {
            return false;
        }
        info!("Registered action: {} ({})", action.name, action.label);
        self.actions.insert(action.name.clone(), action);
        true
    }

    fn attach_action_to_menu(&mut self, menu_path: &str, action_name: &str) -> bool {
        if !self.actions.contains_key(action_name) {
            return false;
        }
        self.menus.insert(action_name.to_string(), menu_path.to_string());
        true
    }

    fn ask_file(&mut self, _filter: &str, _prompt: &str) -> Option<PathBuf> {
        self.pending_file.take()
    }
}

struct ServerState {
    session: Option<ImageSession>,
    plugin: StrAnnotatePlugin<MemoryConsole>,
    registry: ToolRegistry,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 標準出力はJSON-RPC専用なのでログは標準エラーへ
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    info!("StrAnnotate server starting...");

    let mut registry = ToolRegistry::default();
    let mut plugin = StrAnnotatePlugin::new(MemoryConsole::new());
    plugin.init(&mut registry);
    for line in plugin.console_mut().take_lines() {
        info!("{}", line.trim());
    }

    // 起動時にバイナリを開く（オプショナル）
    let session = if let Ok(binary) = std::env::var("STRANNOTATE_BINARY") {
        let db = std::env::var("STRANNOTATE_DB").ok().map(PathBuf::from);
        match ImageSession::open(&binary, db) {
            Ok(session) => {
                info!("Opened {}", binary);
                Some(session)
            }
            Err(e) => {
                error!("Failed to open {}: {:#}", binary, e);
                None
            }
        }
    } else {
        info!("No binary loaded (STRANNOTATE_BINARY not set), use open_binary");
        None
    };

    let state = Arc::new(Mutex::new(ServerState {
        session,
        plugin,
        registry,
    }));

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    info!("Server ready");

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                let response = match process_request(&line, Arc::clone(&state)).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        error!("Request processing error: {:#}", e);
                        McpResponse {
                            jsonrpc: "2.0".to_string(),
                            id: None,
                            result: None,
                            error: Some(McpError {
                                code: -32603,
                                message: format!("{:#}", e),
                            }),
                        }
                    }
                };

                let response_str = serde_json::to_string(&response)?;
                stdout.write_all(response_str.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }

    let mut state = state.lock().await;
    state.plugin.term();
    info!("Server shutting down");
    Ok(())
}

async fn process_request(request_str: &str, state: Arc<Mutex<ServerState>>) -> Result<McpResponse> {
    let request: McpRequest = serde_json::from_str(request_str)?;

    info!("Processing method: {}", request.method);

    let result = match request.method.as_str() {
        "initialize" => handle_initialize(),
        "tools/list" => {
            let state = state.lock().await;
            handle_list_tools(&state.registry)
        }
        "tools/call" => {
            let mut state = state.lock().await;
            handle_tool_call(request.params, &mut state)?
        }
        _ => {
            return Ok(McpResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: None,
                error: Some(McpError {
                    code: -32601,
                    message: format!("Method not found: {}", request.method),
                }),
            });
        }
    };

    Ok(McpResponse {
        jsonrpc: "2.0".to_string(),
        id: request.id,
        result: Some(result),
        error: None,
    })
}

fn handle_initialize() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": "strannotate",
            "version": plugin::VERSION,
            "description": plugin::PLUGIN_COMMENT
        }
    })
}

fn handle_list_tools(registry: &ToolRegistry) -> Value {
    let mut tools = vec![
        json!({
            "name": "open_binary",
            "description": "Load a binary (ELF/PE/Mach-O) and its comment database",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Binary file path"},
                    "db": {"type": "string", "description": "Comment database path (default: <binary>.strannotate.json)"}
                },
                "required": ["path"]
            }
        }),
        json!({
            "name": "get_summary",
            "description": "Summary of the loaded binary and comment counts",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "list_comments",
            "description": "List disassembly and pseudocode comments",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "save",
            "description": "Write the comment database to disk",
            "inputSchema": {"type": "object", "properties": {}}
        }),
    ];

    // プラグインが登録したアクション（メニュー項目）
    for action in registry.actions.values() {
        tools.push(json!({
            "name": action.name,
            "description": format!(
                "{} ({})",
                action.label,
                registry.menus.get(&action.name).map(String::as_str).unwrap_or("")
            ),
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Strings file (json format)"
                    }
                }
            }
        }));
    }

    json!({ "tools": tools })
}

fn handle_tool_call(params: Option<Value>, state: &mut ServerState) -> Result<Value> {
    let params = params.ok_or_else(|| anyhow::anyhow!("Missing params"))?;
    let tool_name = params["name"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing tool name"))?;
    let arguments = &params["arguments"];

    info!("Calling tool: {}", tool_name);

    let result = match tool_name {
        "open_binary" => {
            let path = arguments["path"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("Missing argument: path"))?;
            let db = arguments["db"].as_str().map(PathBuf::from);
            let session = ImageSession::open(path, db)
                .with_context(|| format!("Failed to open {}", path))?;
            let summary = serde_json::to_value(session.summary())?;
            state.session = Some(session);
            summary
        }

        "get_summary" => serde_json::to_value(loaded(&state.session)?.summary())?,

        "list_comments" => {
            let comments = loaded(&state.session)?.comments();
            let disassembly: Vec<_> = comments
                .disassembly()
                .map(|(address, text)| json!({"address": format!("0x{:x}", address), "text": text}))
                .collect();
            let pseudocode: Vec<_> = comments
                .pseudocode()
                .map(|(address, c)| {
                    json!({
                        "address": format!("0x{:x}", address),
                        "function": format!("0x{:x}", c.function),
                        "text": c.text
                    })
                })
                .collect();
            json!({ "disassembly": disassembly, "pseudocode": pseudocode })
        }

        "save" => {
            let session = loaded(&state.session)?;
            session.save()?;
            json!({ "saved": session.db_path().display().to_string() })
        }

        name if state.registry.actions.contains_key(name) => {
            let session = state
                .session
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("No binary loaded, call open_binary first"))?;

            state.registry.pending_file = arguments["path"].as_str().map(PathBuf::from);
            let report = state.plugin.run(&mut state.registry, session);
            let console = state.plugin.console_mut().take_lines();

            match report {
                Some(report) => {
                    if let Some(err) = &report.aborted {
                        warn!("Import aborted: {}", err);
                    }
                    json!({
                        "console": console,
                        "applied": report.applied,
                        "pseudocode_comments": report.decompiled_count(),
                        "aborted": report.aborted.as_ref().map(|e| json!({
                            "kind": format!("{:?}", e.kind()),
                            "index": e.record_index(),
                            "message": e.to_string()
                        }))
                    })
                }
                None => json!({ "console": console, "applied": [] }),
            }
        }

        _ => {
            return Err(anyhow::anyhow!("Unknown tool: {}", tool_name));
        }
    };

    Ok(json!({
        "content": [{
            "type": "text",
            "text": serde_json::to_string_pretty(&result)?
        }]
    }))
}

fn loaded(session: &Option<ImageSession>) -> Result<&ImageSession> {
    session
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("No binary loaded, call open_binary first"))
}
