pub mod bash;
pub mod read;

use std::sync::Arc;

use crate::registry::ToolRegistry;

/// Registry with the built-in tools.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(read::ReadTool));
    registry.register(Arc::new(bash::BashTool::new()));
    registry
}
