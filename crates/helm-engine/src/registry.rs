use std::collections::BTreeMap;
use std::sync::Arc;

use helm_core::tools::{Tool, ToolDefinition};

/// Where a registered tool came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolSource {
    BuiltIn,
    External(String),
}

struct Registration {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// The set of tools available to a run, keyed by name.
///
/// Backed by a `BTreeMap` so names and definitions iterate in a stable
/// order, which keeps the tool list byte-identical across requests for
/// providers with prefix caching.
pub struct ToolRegistry {
    entries: BTreeMap<String, Registration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register a built-in tool. A later registration under the same name
    /// replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.register_with_source(tool, ToolSource::BuiltIn);
    }

    pub fn register_with_source(&mut self, tool: Arc<dyn Tool>, source: ToolSource) {
        self.entries
            .insert(tool.name().to_string(), Registration { tool, source });
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entries.get(name).map(|r| Arc::clone(&r.tool))
    }

    pub fn source(&self, name: &str) -> Option<&ToolSource> {
        self.entries.get(name).map(|r| &r.source)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in lexical order.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Wire definitions in lexical name order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.values().map(|r| r.tool.to_definition()).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
