//! Fully-qualified upstream tool names: `mcp__<server>__<tool>`.
//!
//! Exactly three segments, separated by the literal two-character sequence
//! `__`. `<server>` and `<tool>` are each nonempty `[A-Za-z0-9_]+`. A fourth
//! segment (`mcp__a__b__c`) is rejected, as is anything with fewer than two
//! separators after the `mcp` prefix.

use std::fmt;
use std::str::FromStr;

use crate::errors::BrokerError;

const PREFIX: &str = "mcp";
const SEP: &str = "__";

/// A parsed, validated fully-qualified tool name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolName {
    pub server: String,
    pub tool: String,
}

impl ToolName {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{SEP}{}{SEP}{}", self.server, self.tool)
    }
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl FromStr for ToolName {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A literal "__" run is reserved as the separator; single
        // underscores inside a segment are fine. Splitting on "__" must
        // yield exactly three parts: prefix, server, tool.
        let parts: Vec<&str> = s.split(SEP).collect();
        if parts.len() != 3 {
            return Err(BrokerError::InvalidInput(format!(
                "tool name '{s}' must have exactly three '__'-separated segments"
            )));
        }
        let (prefix, server, tool) = (parts[0], parts[1], parts[2]);
        if prefix != PREFIX {
            return Err(BrokerError::InvalidInput(format!(
                "tool name '{s}' must start with '{PREFIX}{SEP}'"
            )));
        }
        if server.is_empty() || !server.chars().all(is_segment_char) {
            return Err(BrokerError::InvalidInput(format!(
                "tool name '{s}' has an invalid server segment"
            )));
        }
        if tool.is_empty() || !tool.chars().all(is_segment_char) {
            return Err(BrokerError::InvalidInput(format!(
                "tool name '{s}' has an invalid tool segment"
            )));
        }
        Ok(ToolName::new(server, tool))
    }
}

impl serde::Serialize for ToolName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ToolName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
