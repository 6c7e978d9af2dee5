pub mod cache;
pub mod validator;

use serde::{Deserialize, Serialize};

/// A tool's schema as held internally and persisted to the cache file:
/// `{name, description?, inputSchema}` per the external interface in §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// The shape returned in `GET /mcp/tools` responses: `{name, description,
/// parameters}` — same data, different wire key for the schema field.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchemaResponse {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

impl From<ToolSchema> for ToolSchemaResponse {
    fn from(s: ToolSchema) -> Self {
        Self {
            name: s.name,
            description: s.description,
            parameters: s.input_schema,
        }
    }
}
