//! MCP (Model Context Protocol) server
//!
//! JSON-RPC 2.0 over stdio, one request per line. Exposes cached search,
//! cached elaboration and cache clearing as MCP tools. The server owns one
//! coordinator and one tokio runtime for its whole lifetime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use crate::coordinator::CacheCoordinator;
use crate::elaborate::{ElaborationSettings, Elaborator};
use crate::models::{CacheNamespace, Finding, Query, QueryOptions};

const PROTOCOL_VERSION: &str = "2024-11-05";
const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC 2.0 request
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error
#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

pub struct McpServer {
    coordinator: CacheCoordinator,
    /// Defaults for `search_codebase` arguments
    search_defaults: QueryOptions,
    settings: ElaborationSettings,
    elaborator: Arc<dyn Elaborator>,
    runtime: tokio::runtime::Runtime,
}

impl McpServer {
    pub fn new(
        coordinator: CacheCoordinator,
        search_defaults: QueryOptions,
        settings: ElaborationSettings,
        elaborator: Arc<dyn Elaborator>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
        Ok(Self {
            coordinator,
            search_defaults,
            settings,
            elaborator,
            runtime,
        })
    }

    /// Serve requests from stdin until it closes
    pub fn run(&self) -> Result<()> {
        log::info!("Starting scopecache MCP server on stdio");
        let stdin = io::stdin();
        let stdout = io::stdout();
        self.serve(stdin.lock(), stdout.lock())?;
        if let Err(e) = self.coordinator.close() {
            log::warn!("Failed to close cache store: {}", e);
        }
        log::info!("scopecache MCP server stopped");
        Ok(())
    }

    /// Line-delimited JSON-RPC loop over any reader and writer
    pub fn serve(&self, reader: impl BufRead, mut writer: impl Write) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            log::debug!("MCP input: {}", line);

            let request: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(req) => req,
                Err(e) => {
                    log::error!("Failed to parse JSON-RPC request: {}", e);
                    continue;
                }
            };

            // Notifications get no reply
            if request.id.is_none() && request.method.starts_with("notifications/") {
                log::debug!("MCP notification: {}", request.method);
                continue;
            }

            let response = self.process_request(request);
            let response_json = serde_json::to_string(&response)?;
            writeln!(writer, "{}", response_json)?;
            writer.flush()?;

            log::debug!("MCP output: {}", response_json);
        }
        Ok(())
    }

    fn process_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        log::debug!("MCP request: method={}", request.method);

        let result = match request.method.as_str() {
            "initialize" => handle_initialize(),
            "tools/list" => handle_list_tools(),
            "tools/call" => self.handle_call_tool(request.params),
            _ => Err(anyhow::anyhow!("Unknown method: {}", request.method)),
        };

        match result {
            Ok(value) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: Some(value),
                error: None,
            },
            Err(e) => {
                log::error!("MCP error: {:#}", e);
                JsonRpcResponse {
                    jsonrpc: "2.0".to_string(),
                    id: request.id,
                    result: None,
                    error: Some(JsonRpcError {
                        code: INTERNAL_ERROR,
                        message: format!("{:#}", e),
                        data: None,
                    }),
                }
            }
        }
    }

    fn handle_call_tool(&self, params: Option<Value>) -> Result<Value> {
        let params = params.ok_or_else(|| anyhow::anyhow!("Missing params for tools/call"))?;
        let name = params["name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing tool name"))?;
        let arguments = &params["arguments"];

        let text = match name {
            "search_codebase" => self.search_codebase(arguments)?,
            "elaborate_finding" => self.elaborate_finding(arguments)?,
            "clear_cache" => self.clear_cache(arguments)?,
            _ => anyhow::bail!("Unknown tool: {}", name),
        };

        Ok(json!({
            "content": [{
                "type": "text",
                "text": text
            }]
        }))
    }

    fn search_codebase(&self, arguments: &Value) -> Result<String> {
        let pattern = arguments["query"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing query"))?;

        let paths = string_list(&arguments["paths"]);
        let paths = if paths.is_empty() { vec![".".to_string()] } else { paths };

        let defaults = &self.search_defaults;
        let mut exclude_dirs = defaults.exclude_dirs.clone();
        exclude_dirs.extend(string_list(&arguments["exclude_dirs"]));
        let mut exclude_files = defaults.exclude_files.clone();
        exclude_files.extend(string_list(&arguments["exclude_files"]));

        let options = QueryOptions {
            is_regex: arguments["is_regex"].as_bool().unwrap_or(false),
            case_sensitive: arguments["is_case_sensitive"].as_bool().unwrap_or(false),
            context_lines: arguments["context_lines"]
                .as_u64()
                .map(|n| n as usize)
                .unwrap_or(defaults.context_lines),
            exclude_dirs,
            exclude_files,
            include_hidden: arguments["include_hidden"]
                .as_bool()
                .unwrap_or(defaults.include_hidden),
        };

        let query = Query::new(pattern, &paths, options);
        let outcome = self.coordinator.search_with_outcome(&query)?;
        log::info!("search_codebase: {} matches ({:?})", outcome.value.len(), outcome.source);
        Ok(serde_json::to_string(&outcome.value)?)
    }

    fn elaborate_finding(&self, arguments: &Value) -> Result<String> {
        let file_path = arguments["file_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing file_path"))?;
        let line_number = arguments["line_number"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("Missing line_number"))? as usize;
        let snippet = arguments["snippet"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing snippet"))?;

        let finding = Finding {
            file_path: file_path.to_string(),
            line_number,
            match_text: arguments["match_text"].as_str().unwrap_or("").to_string(),
            snippet: snippet.to_string(),
        };
        let context_window_lines = arguments["context_window_lines"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(self.settings.context_window_lines);

        let text = self.runtime.block_on(self.coordinator.elaborate(
            &finding,
            context_window_lines,
            &self.settings.params,
            self.elaborator.as_ref(),
            self.settings.timeout,
        ))?;
        Ok(text)
    }

    fn clear_cache(&self, arguments: &Value) -> Result<String> {
        let namespace = match arguments["namespace"].as_str() {
            Some(ns) => Some(
                ns.parse::<CacheNamespace>()
                    .map_err(|_| anyhow::anyhow!("Unknown namespace: {} (expected search or elaborate)", ns))?,
            ),
            None => None,
        };
        let removed = self.coordinator.clear_cache(namespace)?;
        Ok(format!("Removed {} cache entries", removed))
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
        .unwrap_or_default()
}

fn handle_initialize() -> Result<Value> {
    Ok(json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": "scopecache",
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn handle_list_tools() -> Result<Value> {
    Ok(json!({
        "tools": [
            {
                "name": "search_codebase",
                "description": "Search files for a literal or regex pattern and return every match with its surrounding lines.\n\nResults are cached per query and file state: repeating a search over unchanged files is instant, and narrowing a previous search to a subdirectory reuses the earlier result.\n\n**Returns:** JSON array of {file_path, line_number, match_text, snippet, char_start, char_end}.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Text or regular expression to search for"
                        },
                        "paths": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Files or directories to search (default: [\".\"])"
                        },
                        "is_regex": {
                            "type": "boolean",
                            "description": "Treat query as a regular expression"
                        },
                        "is_case_sensitive": {
                            "type": "boolean",
                            "description": "Match case exactly (default: false)"
                        },
                        "context_lines": {
                            "type": "integer",
                            "description": "Lines of context on each side of a match (default: 3)"
                        },
                        "include_hidden": {
                            "type": "boolean",
                            "description": "Search dot-files and dot-directories"
                        },
                        "exclude_dirs": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Extra directory globs to skip (e.g. ['build', 'docs/*'])"
                        },
                        "exclude_files": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Extra file globs to skip (e.g. ['*.min.js'])"
                        }
                    },
                    "required": ["query"]
                }
            },
            {
                "name": "elaborate_finding",
                "description": "Explain one search result with an LLM, using the surrounding lines of its source file. Explanations are cached until the source file changes.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "file_path": {
                            "type": "string",
                            "description": "File containing the finding"
                        },
                        "line_number": {
                            "type": "integer",
                            "description": "1-based line of the finding"
                        },
                        "snippet": {
                            "type": "string",
                            "description": "Code snippet around the finding"
                        },
                        "match_text": {
                            "type": "string",
                            "description": "The matched text, if known"
                        },
                        "context_window_lines": {
                            "type": "integer",
                            "description": "Lines of file context on each side (default: 10)"
                        }
                    },
                    "required": ["file_path", "line_number", "snippet"]
                }
            },
            {
                "name": "clear_cache",
                "description": "Delete cached results, either all of them or one namespace.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "namespace": {
                            "type": "string",
                            "enum": ["search", "elaborate"],
                            "description": "Namespace to clear (default: all)"
                        }
                    }
                }
            }
        ]
    }))
}
