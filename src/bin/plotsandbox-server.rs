use plotsandbox::{
    AssistantReply, EngineConfig, ExecutionOptions, ExecutionResult, Orchestrator, SafetyValidator,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const MB: u64 = 1024 * 1024;

struct Server {
    config: EngineConfig,
    validator: SafetyValidator,
    /// `Err` when no worker can be started; validation tools still work.
    orchestrator: std::result::Result<Orchestrator, String>,
}

impl Server {
    fn new(config: EngineConfig) -> Self {
        let orchestrator = Orchestrator::from_config(config.clone()).map_err(|e| {
            tracing::error!("[SANDBOX] Render engine unavailable: {}", e);
            e.to_string()
        });
        Self::with_orchestrator(config, orchestrator)
    }

    fn with_orchestrator(config: EngineConfig, orchestrator: std::result::Result<Orchestrator, String>) -> Self {
        let validator = SafetyValidator::new(config.policy.clone());
        Self {
            config,
            validator,
            orchestrator,
        }
    }
}

fn load_config() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = std::env::args().collect();
    let path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .or_else(|| std::env::var("PLOTSANDBOX_CONFIG").ok())
        .map(PathBuf::from);

    let config = match path {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plotsandbox=info,plotsandbox_server=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = load_config()?;
    let server = Server::new(config);
    tracing::info!(
        "plotsandbox-server {} starting (engine ready: {})",
        env!("CARGO_PKG_VERSION"),
        server.orchestrator.is_ok()
    );

    let server = Arc::new(server);
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(write_responses(rx));

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid json-rpc line: {} | err={}", line, e);
                let resp = json!({
                    "jsonrpc": "2.0",
                    "error": { "code": -32700, "message": format!("Parse error: {}", e) },
                    "id": Value::Null
                });
                let _ = tx.send(resp);
                continue;
            }
        };

        let shutdown = parsed.get("method").and_then(|m| m.as_str()) == Some("shutdown");
        dispatch(&server, parsed, &tx).await;
        if shutdown {
            break;
        }
    }

    // In-flight calls hold sender clones; the writer drains them before exiting.
    drop(tx);
    let _ = writer.await;
    tracing::info!("plotsandbox-server stopping");
    Ok(())
}

/// Tool calls run on their own task so renders share the orchestrator's pool;
/// everything else is answered in order.
async fn dispatch(server: &Arc<Server>, msg: Value, tx: &mpsc::UnboundedSender<Value>) {
    if msg.get("method").and_then(|m| m.as_str()) == Some("tools/call") {
        let server = server.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(resp) = handle_message(&server, msg).await {
                let _ = tx.send(resp);
            }
        });
    } else if let Some(resp) = handle_message(server, msg).await {
        let _ = tx.send(resp);
    }
}

async fn write_responses(mut rx: mpsc::UnboundedReceiver<Value>) {
    let mut stdout = io::stdout();
    while let Some(value) = rx.recv().await {
        if let Err(e) = write_line(&mut stdout, &value).await {
            tracing::error!("failed to write response: {}", e);
            break;
        }
    }
}

async fn write_line(stdout: &mut io::Stdout, value: &Value) -> anyhow::Result<()> {
    let s = serde_json::to_string(value)?;
    stdout.write_all(s.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

async fn handle_message(server: &Server, msg: Value) -> Option<Value> {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = msg.get("id").cloned();
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    // Notifications get no response
    if id.is_none() {
        if method == "exit" {
            std::process::exit(0);
        }
        return None;
    }

    let result = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2025-06-18",
            "serverInfo": {
                "name": "plotsandbox",
                "version": env!("CARGO_PKG_VERSION")
            },
            "capabilities": {
                "tools": { "listChanged": false }
            }
        })),
        "tools/list" => Ok(json!({ "tools": tools_list() })),
        "tools/call" => call_tool(server, &params).await,
        "shutdown" => Ok(json!({})),
        _ => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", method)
        })),
    };

    Some(match result {
        Ok(v) => json!({ "jsonrpc": "2.0", "result": v, "id": id }),
        Err(err_obj) => json!({ "jsonrpc": "2.0", "error": err_obj, "id": id }),
    })
}

fn tools_list() -> Vec<Value> {
    let datasets_schema = json!({
        "type": "array",
        "items": { "type": "string" },
        "description": "Dataset file paths. Each is bound to a variable named by plot.aliases (e.g. df_sales)."
    });
    vec![
        json!({
            "name": "plot.render",
            "description": "Validate plotting code and render it in an isolated worker. Returns the image and the positions of its title, axis labels and legend entries.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "Python plotting code. plt, np, pd and sns are provided." },
                    "reply": { "type": "object", "description": "An assistant reply (type: plot | clarification | text | error). Used when code is absent." },
                    "datasets": datasets_schema,
                    "session": { "type": "string", "description": "A new render for the same session cancels the previous one." },
                    "timeout_seconds": { "type": "integer", "minimum": 1, "maximum": 600 },
                    "memory_mb": { "type": "integer", "minimum": 0, "description": "Worker memory cap; 0 disables it." },
                    "enforce_style": { "type": "boolean" }
                },
                "additionalProperties": false
            }
        }),
        json!({
            "name": "plot.validate",
            "description": "Run the safety validator only and return its verdict.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": { "type": "string" }
                },
                "required": ["code"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "plot.aliases",
            "description": "Variable names the datasets will be bound to.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "datasets": datasets_schema
                },
                "required": ["datasets"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "plotsandbox.health",
            "description": "Engine capabilities and pool state.",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }
        }),
    ]
}

async fn call_tool(server: &Server, params: &Value) -> std::result::Result<Value, Value> {
    let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let args = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name {
        "plot.render" => render_call(server, &args).await,
        "plot.validate" => validate_call(server, &args),
        "plot.aliases" => {
            let paths = dataset_paths(&args);
            let bindings = plotsandbox::AliasResolver::new().resolve(&paths);
            let text = bindings
                .iter()
                .map(|b| format!("{} = {}", b.alias, b.path.display()))
                .collect::<Vec<_>>()
                .join("\n");
            Ok(json!({
                "content": [{ "type": "text", "text": text }],
                "structuredContent": { "bindings": bindings },
                "isError": false
            }))
        }
        "plotsandbox.health" => Ok(match &server.orchestrator {
            Ok(orchestrator) => json!({
                "content": [{ "type": "text", "text": "ok" }],
                "structuredContent": {
                    "ok": true,
                    "version": env!("CARGO_PKG_VERSION"),
                    "health": orchestrator.health()
                },
                "isError": false
            }),
            Err(e) => json!({
                "content": [{ "type": "text", "text": format!("engine unavailable: {}", e) }],
                "structuredContent": { "ok": false, "error": e },
                "isError": true
            }),
        }),
        other => Ok(json!({
            "content": [{ "type": "text", "text": format!("Unknown tool: {}", other) }],
            "isError": true
        })),
    }
}

fn dataset_paths(args: &Value) -> Vec<PathBuf> {
    args.get("datasets")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).map(PathBuf::from).collect())
        .unwrap_or_default()
}

fn options_from_args(defaults: ExecutionOptions, args: &Value) -> ExecutionOptions {
    let mut options = defaults;
    if let Some(secs) = args.get("timeout_seconds").and_then(|v| v.as_u64()) {
        options.timeout_seconds = secs.clamp(1, 600);
    }
    if let Some(mb) = args.get("memory_mb").and_then(|v| v.as_u64()) {
        options.memory_cap_bytes = mb.saturating_mul(MB);
    }
    if let Some(enforce) = args.get("enforce_style").and_then(|v| v.as_bool()) {
        options.enforce_style_policy = enforce;
    }
    options
}

fn validate_call(server: &Server, args: &Value) -> std::result::Result<Value, Value> {
    let code = args
        .get("code")
        .and_then(|v| v.as_str())
        .ok_or_else(|| json!({ "code": -32602, "message": "Missing required argument: code" }))?;
    let verdict = server
        .validator
        .validate(code)
        .map_err(|e| json!({ "code": -32000, "message": e.to_string() }))?;
    let text = verdict
        .rejection_summary()
        .unwrap_or_else(|| format!("accepted ({} warning(s))", verdict.warnings.len()));
    Ok(json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": { "verdict": verdict },
        "isError": !verdict.accepted
    }))
}

async fn render_call(server: &Server, args: &Value) -> std::result::Result<Value, Value> {
    let code = match args.get("code").and_then(|v| v.as_str()) {
        Some(code) => code.to_string(),
        None => {
            let reply_value = args.get("reply").cloned().ok_or_else(|| {
                json!({ "code": -32602, "message": "Missing required argument: code or reply" })
            })?;
            let reply: AssistantReply = serde_json::from_value(reply_value)
                .map_err(|e| json!({ "code": -32602, "message": format!("Invalid reply: {}", e) }))?;
            match reply.code() {
                Some(code) => code.to_string(),
                None => return Ok(reply_passthrough(&reply)),
            }
        }
    };

    let orchestrator = server.orchestrator.as_ref().map_err(|e| {
        json!({ "code": -32000, "message": format!("Render engine unavailable: {}", e) })
    })?;

    let paths = dataset_paths(args);
    let options = options_from_args(server.config.defaults.clone(), args);
    let result = match args.get("session").and_then(|v| v.as_str()) {
        Some(session) => orchestrator.run_latest(session, &code, &paths, options).await,
        None => orchestrator.run_submission(&code, &paths, options).await,
    };

    Ok(json!({
        "content": [{ "type": "text", "text": summarize_result(&result) }],
        "structuredContent": { "result": result },
        "isError": !result.is_success()
    }))
}

fn reply_passthrough(reply: &AssistantReply) -> Value {
    let text = match reply {
        AssistantReply::Clarification { question } => question.clone(),
        AssistantReply::Text { text } => text.clone(),
        AssistantReply::Error { message } => message.clone(),
        AssistantReply::Plot { code, .. } => code.clone(),
    };
    json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": { "reply": reply },
        "isError": matches!(reply, AssistantReply::Error { .. })
    })
}

fn summarize_result(result: &ExecutionResult) -> String {
    let mut out = format!("status: {} ({} ms)", result.status.as_str(), result.wall_time_ms);
    if let Some(artifact) = &result.artifact {
        out.push_str(&format!("\nartifact: {} bytes", artifact.len()));
    }
    for element in &result.elements {
        out.push_str(&format!(
            "\n{:?} {:?} at ({:.3}, {:.3}, {:.3}x{:.3})",
            element.kind, element.text, element.bbox.x, element.bbox.y, element.bbox.width, element.bbox.height
        ));
    }
    if let Some(diagnostic) = &result.diagnostic {
        out.push('\n');
        out.push_str(diagnostic);
    }
    for warning in &result.warnings {
        out.push_str("\nwarning: ");
        out.push_str(warning);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plotsandbox::engine::EngineCapabilities;
    use plotsandbox::{CancelSignal, ExecutionStatus, FileDatasetProvider, ImageFormat, RenderEngine, RenderJob};
    use std::time::Duration;

    /// Takes half a second for sources mentioning "slow".
    struct SleepyEngine;

    #[async_trait]
    impl RenderEngine for SleepyEngine {
        async fn render(&self, job: &RenderJob, mut cancel: CancelSignal) -> ExecutionResult {
            let delay = if job.source.contains("slow") {
                Duration::from_millis(500)
            } else {
                Duration::from_millis(10)
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => ExecutionResult::success(vec![0x89, b'P', b'N', b'G'], ImageFormat::Png, vec![]),
                _ = cancel.cancelled() => ExecutionResult::failure(ExecutionStatus::Cancelled, "execution cancelled"),
            }
        }

        fn capabilities(&self) -> EngineCapabilities {
            EngineCapabilities {
                name: "sleepy".to_string(),
                interpreter: "none".to_string(),
                filesystem_confinement: false,
                network_isolation: false,
                memory_caps: false,
            }
        }

        fn spawn_count(&self) -> u64 {
            0
        }

        fn live_workers(&self) -> usize {
            0
        }
    }

    fn server() -> Arc<Server> {
        let config = EngineConfig::default();
        let orchestrator = Orchestrator::new(config.clone(), Arc::new(SleepyEngine), Arc::new(FileDatasetProvider::new()));
        Arc::new(Server::with_orchestrator(config, Ok(orchestrator)))
    }

    fn render(id: u64, code: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": "plot.render", "arguments": { "code": code } }
        })
    }

    #[tokio::test]
    async fn test_tool_calls_do_not_block_each_other() {
        let server = server();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatch(&server, render(1, "plt.title('slow')"), &tx).await;
        dispatch(&server, render(2, "plt.title('quick')"), &tx).await;

        let first = tokio::time::timeout(Duration::from_millis(400), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first["id"], 2);
        assert_eq!(first["result"]["structuredContent"]["result"]["status"], "success");

        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second["id"], 1);
    }

    #[tokio::test]
    async fn test_in_flight_calls_drain_after_input_closes() {
        let server = server();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatch(&server, render(7, "plt.title('slow')"), &tx).await;
        drop(tx);

        let resp = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp["id"], 7);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_protocol_methods_answer_inline() {
        let server = server();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatch(&server, json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }), &tx).await;
        let resp = rx.try_recv().unwrap();
        assert_eq!(resp["result"]["tools"].as_array().unwrap().len(), 4);

        dispatch(&server, json!({ "jsonrpc": "2.0", "id": 2, "method": "bogus" }), &tx).await;
        assert_eq!(rx.try_recv().unwrap()["error"]["code"], -32601);
    }
}
