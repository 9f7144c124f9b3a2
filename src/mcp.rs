//! MCP JSON-RPC protocol bridge.
//!
//! Adapts the [`ToolRegistry`] to rmcp's [`ServerHandler`] and serves it over
//! stdio. Tool failures come back as `CallToolResult::error` with a JSON body
//! naming the error kind; malformed arguments are protocol-level
//! `INVALID_PARAMS` errors.

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::Result;
use rmcp::model::*;
use rmcp::transport::stdio;
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt};

use semche_core::Error;

use crate::collection::Collection;
use crate::tools::{Tool as SemcheTool, ToolContext, ToolRegistry};

/// Bridges the tool registry to the MCP protocol.
#[derive(Clone)]
pub struct McpBridge {
    tools: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
}

impl McpBridge {
    pub fn new(tools: Arc<ToolRegistry>, ctx: Arc<ToolContext>) -> Self {
        Self { tools, ctx }
    }

    /// Convert a tool into an rmcp `Tool` descriptor.
    fn to_mcp_tool(tool: &dyn SemcheTool) -> Tool {
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> =
            match tool.parameters_schema() {
                serde_json::Value::Object(map) => Arc::new(map),
                _ => Arc::new(serde_json::Map::new()),
            };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(tool.read_only())),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

/// Map a tool failure to either a protocol error or an error result.
fn error_result(err: anyhow::Error) -> Result<CallToolResult, McpError> {
    match err.downcast_ref::<Error>() {
        Some(Error::Validation(message)) => {
            Err(McpError::new(ErrorCode::INVALID_PARAMS, message.clone(), None))
        }
        Some(core) => {
            let body = serde_json::json!({
                "error": core.kind(),
                "message": core.to_string(),
                "retryable": core.is_retryable(),
            });
            Ok(CallToolResult::error(vec![Content::text(body.to_string())]))
        }
        None => {
            let body = serde_json::json!({
                "error": "InternalError",
                "message": format!("{err:#}"),
            });
            Ok(CallToolResult::error(vec![Content::text(body.to_string())]))
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "semche".to_string(),
                title: Some("Semche".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Semantic document search. Use indexDocuments to add or replace documents, \
                 search to find relevant chunks, deleteDocuments to remove documents, \
                 getDocumentsByPrefix to list documents by id, and getCollectionInfo for counts."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool = self.tools.find(&request.name).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        tracing::debug!(tool = %request.name, "tool call");
        match tool.execute(params, &self.ctx).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => {
                tracing::warn!(tool = %request.name, error = %e, "tool call failed");
                error_result(e)
            }
        }
    }
}

/// Serve the collection over stdio until the client disconnects, then
/// flush it.
pub async fn run_stdio(collection: Arc<Collection>) -> Result<()> {
    let ctx = Arc::new(ToolContext::new(Arc::clone(&collection)));
    let bridge = McpBridge::new(Arc::new(ToolRegistry::with_builtins()), ctx);

    tracing::info!("serving MCP over stdio");
    let service = bridge
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    tokio::select! {
        quit = service.waiting() => {
            quit.map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }

    collection.flush().await
}
