//! Module capability surface and manager.
//!
//! A module is a source/sink of messages with a small lifecycle: it is
//! given the push callback at setup, started, may receive commands, and is
//! stopped on shutdown. The core never looks inside a module.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use palisade_types::{Message, PalisadeError};

use crate::command::ExecutionResult;

/// Callback a module uses to hand messages to the queue. Returns the
/// number of messages accepted.
pub type PushMessageFn = Arc<dyn Fn(Message) -> usize + Send + Sync>;

/// The capability set every module implements.
pub trait Module: Send + Sync {
    /// Stable module name used for command routing.
    fn name(&self) -> &str;

    /// Receive the push callback and prepare internal state.
    fn setup(&mut self, push: PushMessageFn) -> Result<(), PalisadeError>;

    /// Begin producing messages. Must not block.
    fn start(&self) -> Result<(), PalisadeError>;

    /// Stop producing; called once at shutdown.
    fn stop(&self);

    /// Execute a manager command addressed to this module.
    fn execute_command(&self, command: &str, parameters: &[serde_json::Value]) -> ExecutionResult;
}

/// Owns every registered module and routes commands by name.
pub struct ModuleManager {
    modules: HashMap<String, Box<dyn Module>>,
    push: PushMessageFn,
}

impl ModuleManager {
    pub fn new(push: PushMessageFn) -> Self {
        Self {
            modules: HashMap::new(),
            push,
        }
    }

    /// Register a module. A second module with the same name replaces the
    /// first (logged).
    pub fn register(&mut self, module: Box<dyn Module>) {
        let name = module.name().to_string();
        if self.modules.insert(name.clone(), module).is_some() {
            warn!(module = %name, "module replaced an existing registration");
        }
    }

    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run setup on every module, handing each the push callback.
    pub fn setup_all(&mut self) {
        for (name, module) in &mut self.modules {
            if let Err(e) = module.setup(Arc::clone(&self.push)) {
                error!(module = %name, error = %e, "module setup failed");
            }
        }
    }

    /// Start every module.
    pub fn start_all(&self) {
        for (name, module) in &self.modules {
            match module.start() {
                Ok(()) => info!(module = %name, "module started"),
                Err(e) => error!(module = %name, error = %e, "module start failed"),
            }
        }
    }

    /// Stop every module.
    pub fn stop_all(&self) {
        for (name, module) in &self.modules {
            module.stop();
            info!(module = %name, "module stopped");
        }
    }

    /// Route a command to the named module.
    pub fn execute(
        &self,
        module: &str,
        command: &str,
        parameters: &[serde_json::Value],
    ) -> ExecutionResult {
        match self.modules.get(module) {
            Some(target) => target.execute_command(command, parameters),
            None => ExecutionResult::failed(format!("unknown module '{module}'")),
        }
    }
}
