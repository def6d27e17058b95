use super::builtin::{EchoAgent, PromptAgent, SequenceAgent};
use super::AgentHandler;
use agentrun_base::error::AgentRunError;
use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// agent name -> handler
#[derive(Clone, Default)]
pub struct AgentRegistry {
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [Arc<dyn AgentHandler>; 3] = [
            Arc::new(EchoAgent),
            Arc::new(SequenceAgent),
            Arc::new(PromptAgent),
        ];
        for handler in builtins {
            registry
                .handlers
                .insert(handler.name().to_string(), handler);
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn AgentHandler>) -> Result<()> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(AgentRunError::AlreadyExists(format!("agent already registered: {}", name)).into());
        }
        tracing::info!("register agent: {}", &name);
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
