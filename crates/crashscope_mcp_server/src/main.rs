mod session;

use std::{path::PathBuf, sync::Arc, time::Duration};

use crashscope_core::policy::Allowlist;
use crashscope_core::{ScopeError, SessionConfig};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use session::McpSession;

const DEFAULT_WAIT_STOPPED: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct MiStartParams {
    /// Path of the executable to debug
    target: String,
    #[serde(default)]
    args: Vec<String>,
    /// Debugger binary; defaults to CRASHSCOPE_GDB or gdb from PATH
    #[serde(default)]
    gdb: Option<String>,
    #[serde(default)]
    source_root: Option<String>,
    #[serde(default)]
    transcript_dir: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct MiCommandParams {
    /// One MI command, e.g. `-exec-run` or `-data-evaluate-expression buf`
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct MiWaitStoppedParams {
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct MiEvaluateParams {
    expression: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct EmptyParams {}

struct SessionManager {
    session: Option<McpSession>,
    allowlist: Allowlist,
}

impl SessionManager {
    fn new() -> Self {
        Self {
            session: None,
            allowlist: Allowlist::default(),
        }
    }
}

#[derive(Clone)]
struct CrashscopeMcpServer {
    tool_router: ToolRouter<Self>,
    manager: Arc<Mutex<SessionManager>>,
}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

fn scope_error(tool_name: &str, error: ScopeError) -> McpError {
    match error {
        ScopeError::Disallowed(disallowed) => McpError::invalid_params(disallowed.to_string(), None),
        other => to_mcp_error(format!("{tool_name} failed: {other}")),
    }
}

fn no_session_error(tool_name: &str) -> McpError {
    to_mcp_error(format!(
        "{tool_name} requires a running MI session. Call mi_start first."
    ))
}

fn start_config(params: &MiStartParams) -> SessionConfig {
    let mut config = SessionConfig::from_env(&params.target);
    config.target_args = params.args.clone();
    if let Some(gdb) = &params.gdb {
        config.debugger = Some(PathBuf::from(gdb));
    }
    if let Some(root) = &params.source_root {
        config.source_root = Some(PathBuf::from(root));
    }
    if let Some(dir) = &params.transcript_dir {
        config.transcript_dir = Some(PathBuf::from(dir));
    }
    config
}

#[tool_router]
impl CrashscopeMcpServer {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
            manager: Arc::new(Mutex::new(SessionManager::new())),
        }
    }

    #[tool(description = "Start gdb in MI mode and load a target executable")]
    async fn mi_start(&self, params: Parameters<MiStartParams>) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut manager = self.manager.lock().await;
        if manager.session.is_some() {
            return Err(to_mcp_error(
                "An MI session is already running. Call mi_stop before starting another.",
            ));
        }

        let config = start_config(&params);
        let session = McpSession::start(config, manager.allowlist.clone())
            .await
            .map_err(|e| scope_error("mi_start", e))?;
        let summary = session.summary();
        manager.session = Some(session);

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "session": summary,
        })))
    }

    #[tool(description = "Send one allow-listed MI command and return its result record")]
    async fn mi_command(&self, params: Parameters<MiCommandParams>) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut manager = self.manager.lock().await;
        let Some(session) = manager.session.as_mut() else {
            return Err(no_session_error("mi_command"));
        };

        let response = session
            .command(&params.command, params.timeout_ms.map(Duration::from_millis))
            .await
            .map_err(|e| scope_error("mi_command", e))?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "response": response,
        })))
    }

    #[tool(description = "Wait until the running target stops, then report where")]
    async fn mi_wait_stopped(
        &self,
        params: Parameters<MiWaitStoppedParams>,
    ) -> Result<CallToolResult, McpError> {
        let wait = params
            .0
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WAIT_STOPPED);
        let mut manager = self.manager.lock().await;
        let Some(session) = manager.session.as_mut() else {
            return Err(no_session_error("mi_wait_stopped"));
        };

        let stop = session
            .wait_stopped(wait)
            .await
            .map_err(|e| scope_error("mi_wait_stopped", e))?;
        Ok(CallToolResult::structured(stop))
    }

    #[tool(description = "List the stack frames of the stopped thread")]
    async fn mi_backtrace(&self, _params: Parameters<EmptyParams>) -> Result<CallToolResult, McpError> {
        let mut manager = self.manager.lock().await;
        let Some(session) = manager.session.as_mut() else {
            return Err(no_session_error("mi_backtrace"));
        };
        let backtrace = session
            .backtrace()
            .await
            .map_err(|e| scope_error("mi_backtrace", e))?;
        Ok(CallToolResult::structured(backtrace))
    }

    #[tool(description = "Evaluate an expression in the selected frame")]
    async fn mi_evaluate(&self, params: Parameters<MiEvaluateParams>) -> Result<CallToolResult, McpError> {
        let mut manager = self.manager.lock().await;
        let Some(session) = manager.session.as_mut() else {
            return Err(no_session_error("mi_evaluate"));
        };
        let value = session
            .evaluate(&params.0.expression)
            .await
            .map_err(|e| scope_error("mi_evaluate", e))?;
        Ok(CallToolResult::structured(value))
    }

    #[tool(description = "Summarize the session: stop, backtrace, variables, output and source")]
    async fn mi_observation(&self, _params: Parameters<EmptyParams>) -> Result<CallToolResult, McpError> {
        let mut manager = self.manager.lock().await;
        let Some(session) = manager.session.as_mut() else {
            return Err(no_session_error("mi_observation"));
        };
        Ok(CallToolResult::structured(session.observation()))
    }

    #[tool(description = "Exit gdb and end the session")]
    async fn mi_stop(&self, _params: Parameters<EmptyParams>) -> Result<CallToolResult, McpError> {
        let mut manager = self.manager.lock().await;
        let Some(session) = manager.session.take() else {
            return Ok(CallToolResult::structured(json!({
                "ok": true,
                "state": "stopped",
            })));
        };

        let status = session
            .stop()
            .await
            .map_err(|e| scope_error("mi_stop", e))?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "stopped",
            "exit_status": status.to_string(),
        })))
    }
}

#[tool_handler]
impl ServerHandler for CrashscopeMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Single-session gdb/MI server. Call mi_start, then mi_command and mi_wait_stopped to investigate a crash."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the MCP protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let server = CrashscopeMcpServer::new();
    let transport = transport::stdio();

    tracing::info!("Starting Crashscope MCP Server on stdio...");

    server.serve(transport).await?.waiting().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_config_applies_params() {
        let params: MiStartParams = serde_json::from_value(json!({
            "target": "/tmp/a.out",
            "args": ["x"],
            "gdb": "/usr/bin/gdb",
        }))
        .expect("valid params");
        let config = start_config(&params);
        assert_eq!(config.target, PathBuf::from("/tmp/a.out"));
        assert_eq!(config.target_args, vec!["x".to_string()]);
        assert_eq!(config.debugger, Some(PathBuf::from("/usr/bin/gdb")));
        assert!(config.source_root.is_none());
    }

    #[test]
    fn disallowed_commands_map_to_invalid_params() {
        let err = scope_error(
            "mi_command",
            ScopeError::Disallowed(crashscope_core::policy::DisallowedCommand::new("rm", "no")),
        );
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
        assert!(scope_error("mi_start", ScopeError::Cancelled)
            .message
            .contains("mi_start failed"));
    }

    #[tokio::test]
    async fn tools_require_a_session() {
        let server = CrashscopeMcpServer::new();
        let err = server
            .mi_backtrace(Parameters(EmptyParams {}))
            .await
            .expect_err("no session yet");
        assert!(err.message.contains("Call mi_start first"));

        let stopped = server
            .mi_stop(Parameters(EmptyParams {}))
            .await
            .expect("stopping without a session is fine");
        assert_eq!(stopped.structured_content, Some(json!({"ok": true, "state": "stopped"})));
    }
}
