//! Tool permission gate - scopes tool invocations to the active chain
//!
//! A tool either initiates a chain or rides inside one started by another
//! tool. The gate holds the current chain initiator; `send_user` clears it
//! before every user turn.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

/// Per-tool permission policy
#[derive(Debug, Clone, Default)]
pub struct ToolPermission {
    /// May this tool start a chain on its own?
    pub may_initiate: bool,
    /// Tools this one may invoke while it is the chain initiator
    pub allowed_tools: HashSet<String>,
}

impl ToolPermission {
    pub fn initiator() -> Self {
        Self {
            may_initiate: true,
            allowed_tools: HashSet::new(),
        }
    }

    pub fn with_allowed(mut self, tools: &[&str]) -> Self {
        self.allowed_tools = tools.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Decides whether a requested tool may execute in the current chain
#[derive(Debug, Default)]
pub struct PermissionGate {
    policies: HashMap<String, ToolPermission>,
    chain_initiator: Option<String>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, permission: ToolPermission) {
        self.policies.insert(name.into(), permission);
    }

    pub fn current_initiator(&self) -> Option<&str> {
        self.chain_initiator.as_deref()
    }

    /// Set (or clear) the chain initiator
    pub fn start_chain(&mut self, tool: Option<&str>) {
        self.chain_initiator = tool.map(|s| s.to_string());
    }

    /// Reset before each user turn
    pub fn reset_chain(&mut self) {
        self.chain_initiator = None;
    }

    pub fn is_allowed(&self, tool: &str) -> bool {
        let Some(policy) = self.policies.get(tool) else {
            return false;
        };
        match &self.chain_initiator {
            None => policy.may_initiate,
            Some(initiator) if initiator == tool => true,
            Some(initiator) => self
                .policies
                .get(initiator)
                .map(|p| p.allowed_tools.contains(tool))
                .unwrap_or(false),
        }
    }
}

#[derive(Serialize)]
struct PermissionDenied {
    error: String,
    status: &'static str,
    message: &'static str,
}

/// The tool_result body returned for a disallowed invocation
pub fn permission_denied_payload(tool: &str) -> String {
    let denied = PermissionDenied {
        error: format!(
            "Tool '{}' is not allowed in the current context. Review the chain of thought, rules, and guidelines.",
            tool
        ),
        status: "error",
        message: "Stop, inform the user of the error. Do NOT proceed!",
    };
    serde_json::to_string_pretty(&denied).unwrap_or_else(|_| denied.error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> PermissionGate {
        let mut gate = PermissionGate::new();
        gate.register(
            "orchestrate",
            ToolPermission::initiator().with_allowed(&["search", "render"]),
        );
        gate.register("search", ToolPermission::default());
        gate.register("render", ToolPermission::default());
        gate.register("rogue", ToolPermission::default());
        gate
    }

    #[test]
    fn test_unknown_tool_denied() {
        let gate = gate();
        assert!(!gate.is_allowed("no_such_tool"));
    }

    #[test]
    fn test_no_chain_requires_may_initiate() {
        let gate = gate();
        assert!(gate.is_allowed("orchestrate"));
        assert!(!gate.is_allowed("search"));
    }

    #[test]
    fn test_initiator_allows_self_recursion() {
        let mut gate = gate();
        gate.start_chain(Some("orchestrate"));
        assert!(gate.is_allowed("orchestrate"));
    }

    #[test]
    fn test_chain_members_allowed() {
        let mut gate = gate();
        gate.start_chain(Some("orchestrate"));
        assert!(gate.is_allowed("search"));
        assert!(gate.is_allowed("render"));
        assert!(!gate.is_allowed("rogue"));
    }

    #[test]
    fn test_reset_clears_chain() {
        let mut gate = gate();
        gate.start_chain(Some("orchestrate"));
        assert!(gate.is_allowed("search"));
        gate.reset_chain();
        assert!(!gate.is_allowed("search"));
        assert!(gate.current_initiator().is_none());
    }

    #[test]
    fn test_chain_with_unregistered_initiator_denies() {
        let mut gate = gate();
        gate.start_chain(Some("ghost"));
        assert!(!gate.is_allowed("search"));
    }

    #[test]
    fn test_denied_payload_shape() {
        let payload = permission_denied_payload("render");
        let expected = "{\n  \"error\": \"Tool 'render' is not allowed in the current context. Review the chain of thought, rules, and guidelines.\",\n  \"status\": \"error\",\n  \"message\": \"Stop, inform the user of the error. Do NOT proceed!\"\n}";
        assert_eq!(payload, expected);
    }
}
