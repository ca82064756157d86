//! Handler registry
//!
//! Built once from a table of factories and never modified afterwards, so it
//! is shared between listeners as a plain `Arc<HandlerRegistry>`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::handler::{HandlerFactory, TaskHandler};

pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Instantiate every factory and index the handlers by their reported name.
    ///
    /// When two factories report the same name the later one wins.
    pub fn from_factories(factories: &[HandlerFactory]) -> Self {
        let mut handlers: HashMap<String, Arc<dyn TaskHandler>> = HashMap::new();
        for factory in factories {
            let handler = factory();
            let name = handler.name().to_string();
            if handlers.insert(name.clone(), handler).is_some() {
                tracing::debug!(task_name = %name, "Handler replaced by later registration");
            }
        }

        tracing::info!(handlers = handlers.len(), "Handler registry built");
        Self { handlers }
    }

    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_name).cloned()
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.handlers.contains_key(task_name)
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
