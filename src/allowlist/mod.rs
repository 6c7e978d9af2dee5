//! Allowlist validator: the set of upstream tool names one execution is
//! permitted to *invoke*. Discovery (`GET /mcp/tools`) is intentionally not
//! gated by this — see `proxy::discovery` for the rationale.
//!
//! Immutable, ordered, constructed once per execution. No wildcard support
//! (spec.md §4.2) — membership is an exact string match.

#[derive(Debug, Clone)]
pub struct Allowlist {
    tools: Vec<String>,
}

impl Allowlist {
    pub fn new(tools: Vec<String>) -> Self {
        Self { tools }
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t == name)
    }

    pub fn get_allowed_tools(&self) -> &[String] {
        &self.tools
    }
}
