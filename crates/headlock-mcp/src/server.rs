//! MCP Server implementation

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, methods};
use crate::{McpTool, PROTOCOL_VERSION, ServerCapabilities, ToolsCapability};

/// Handler for MCP requests
#[async_trait]
pub trait McpHandler: Send + Sync {
    /// List available tools
    async fn list_tools(&self) -> Vec<McpTool>;

    /// Call a tool. `Err` is reported to the client as a tool error, not a
    /// protocol error.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, String>;
}

/// MCP Server
pub struct McpServer<H: McpHandler> {
    handler: Arc<H>,
    capabilities: ServerCapabilities,
    server_name: String,
    server_version: String,
    instructions: Option<String>,
}

impl<H: McpHandler> McpServer<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
            },
            server_name: "headlock".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Usage guidance returned to clients on `initialize`
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Handle one raw JSON-RPC message.
    ///
    /// Returns `None` for notifications, which get no response.
    pub async fn handle_message(&self, message: serde_json::Value) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed MCP message");
                return Some(JsonRpcResponse::error(None, JsonRpcError::invalid_request()));
            }
        };

        if request.is_notification() {
            debug!(method = %request.method, "MCP notification");
            return None;
        }

        Some(self.handle_request(request).await)
    }

    /// Handle a JSON-RPC request
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!(method = %request.method, "MCP request");
        match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(request.id),
            methods::PING => JsonRpcResponse::success(request.id, serde_json::json!({})),
            methods::TOOLS_LIST => self.handle_tools_list(request.id).await,
            methods::TOOLS_CALL => self.handle_tools_call(request.id, request.params).await,
            _ => JsonRpcResponse::error(request.id, JsonRpcError::method_not_found()),
        }
    }

    fn handle_initialize(&self, id: Option<RequestId>) -> JsonRpcResponse {
        let mut result = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": self.capabilities,
            "serverInfo": {
                "name": self.server_name,
                "version": self.server_version
            }
        });
        if let Some(instructions) = &self.instructions {
            result["instructions"] = serde_json::Value::String(instructions.clone());
        }

        JsonRpcResponse::success(id, result)
    }

    async fn handle_tools_list(&self, id: Option<RequestId>) -> JsonRpcResponse {
        let tools = self.handler.list_tools().await;
        JsonRpcResponse::success(id, serde_json::json!({ "tools": tools }))
    }

    async fn handle_tools_call(
        &self,
        id: Option<RequestId>,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        let Some(params) = params else {
            return JsonRpcResponse::error(id, JsonRpcError::invalid_params());
        };

        let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
            return JsonRpcResponse::error(id, JsonRpcError::invalid_params());
        };

        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or(serde_json::Value::Object(Default::default()));

        match self.handler.call_tool(name, arguments).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
                let mut body = serde_json::json!({
                    "content": [{ "type": "text", "text": text }],
                    "isError": false
                });
                if result.is_object() {
                    body["structuredContent"] = result;
                }
                JsonRpcResponse::success(id, body)
            }
            Err(e) => {
                debug!(tool = %name, error = %e, "Tool call failed");
                JsonRpcResponse::success(
                    id,
                    serde_json::json!({
                        "content": [{ "type": "text", "text": e }],
                        "isError": true
                    }),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl McpHandler for EchoHandler {
        async fn list_tools(&self) -> Vec<McpTool> {
            vec![McpTool::new(
                "echo",
                "Echo the arguments back",
                json!({"type": "object"}),
            )]
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            match name {
                "echo" => Ok(arguments),
                other => Err(format!("Unknown tool: {}", other)),
            }
        }
    }

    fn server() -> McpServer<EchoHandler> {
        McpServer::new(Arc::new(EchoHandler)).with_instructions("Say hello")
    }

    fn request(method: &str, params: Option<serde_json::Value>) -> JsonRpcRequest {
        let request = JsonRpcRequest::new(RequestId::Number(1), method);
        match params {
            Some(params) => request.with_params(params),
            None => request,
        }
    }

    #[tokio::test]
    async fn test_initialize() {
        let response = server().handle_request(request(methods::INITIALIZE, None)).await;
        let result = response.result.unwrap();

        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "headlock");
        assert_eq!(result["instructions"], "Say hello");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
    }

    #[tokio::test]
    async fn test_tools_list() {
        let response = server().handle_request(request(methods::TOOLS_LIST, None)).await;
        let result = response.result.unwrap();

        assert_eq!(result["tools"][0]["name"], "echo");
        assert!(result["tools"][0].get("inputSchema").is_some());
    }

    #[tokio::test]
    async fn test_tools_call_success() {
        let params = json!({"name": "echo", "arguments": {"word": "hi"}});
        let response = server()
            .handle_request(request(methods::TOOLS_CALL, Some(params)))
            .await;
        let result = response.result.unwrap();

        assert_eq!(result["isError"], false);
        assert_eq!(result["structuredContent"]["word"], "hi");
        assert!(result["content"][0]["text"].as_str().unwrap().contains("hi"));
    }

    #[tokio::test]
    async fn test_tools_call_error_is_not_protocol_error() {
        let params = json!({"name": "missing"});
        let response = server()
            .handle_request(request(methods::TOOLS_CALL, Some(params)))
            .await;

        assert!(response.error.is_none());
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "Unknown tool: missing");
    }

    #[tokio::test]
    async fn test_tools_call_requires_name() {
        let response = server()
            .handle_request(request(methods::TOOLS_CALL, Some(json!({}))))
            .await;
        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let response = server().handle_request(request("resources/list", None)).await;
        assert_eq!(response.id, Some(RequestId::Number(1)));
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let message = json!({"jsonrpc": "2.0", "method": methods::INITIALIZED});
        assert!(server().handle_message(message).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_message() {
        let response = server().handle_message(json!({"jsonrpc": "2.0"})).await.unwrap();
        assert_eq!(response.id, None);
        assert_eq!(response.error.unwrap().code, -32600);
    }
}
