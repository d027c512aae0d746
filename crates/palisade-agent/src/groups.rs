//! Centralized configuration: group assignments and shared-config overlays.
//!
//! The manager assigns this agent to shared groups; each group has a
//! configuration overlay file the agent downloads over the authenticated
//! channel. Two pieces live here:
//!
//! - [`GroupAssignmentModule`]: handles the manager's `set-group` command,
//!   persists the new memberships, and queues the overlay downloads.
//! - [`sync_group_configuration`]: the long-lived task that receives group
//!   lists (once at startup for the stored groups, then on every
//!   reassignment) and streams each overlay into the shared directory.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use palisade_comms::groups::fetch_group_configuration;
use palisade_comms::{HttpTransport, TokenHolder};
use palisade_types::{AgentConfig, PalisadeError};

use crate::command::ExecutionResult;
use crate::identity::IdentityStore;
use crate::module::{Module, PushMessageFn};

/// Module name the manager addresses group commands to.
pub const MODULE_NAME: &str = "centralized-configuration";

/// How long to wait for a usable token before attempting a download.
const TOKEN_WAIT_SECS: u64 = 30;

/// Group names become file names; only accept names that cannot escape
/// the shared directory.
fn valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.')
}

/// Applies `set-group` commands: persists the membership list and hands it
/// to the sync task for overlay downloads.
pub struct GroupAssignmentModule {
    identity: Arc<Mutex<IdentityStore>>,
    updates: mpsc::UnboundedSender<Vec<String>>,
}

impl GroupAssignmentModule {
    pub fn new(
        identity: Arc<Mutex<IdentityStore>>,
        updates: mpsc::UnboundedSender<Vec<String>>,
    ) -> Self {
        Self { identity, updates }
    }

    /// Accept group names as string parameters or one array parameter.
    fn parse_groups(parameters: &[serde_json::Value]) -> Vec<String> {
        let mut groups = Vec::new();
        for parameter in parameters {
            match parameter {
                serde_json::Value::String(name) => groups.push(name.clone()),
                serde_json::Value::Array(names) => {
                    groups.extend(names.iter().filter_map(|n| n.as_str().map(str::to_string)));
                }
                _ => {}
            }
        }
        groups
    }
}

impl Module for GroupAssignmentModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn setup(&mut self, _push: PushMessageFn) -> Result<(), PalisadeError> {
        Ok(())
    }

    fn start(&self) -> Result<(), PalisadeError> {
        Ok(())
    }

    fn stop(&self) {}

    fn execute_command(&self, command: &str, parameters: &[serde_json::Value]) -> ExecutionResult {
        match command {
            "set-group" => {
                let groups = Self::parse_groups(parameters);
                if groups.is_empty() {
                    return ExecutionResult::failed("set-group requires at least one group name");
                }
                if let Some(bad) = groups.iter().find(|g| !valid_group_name(g)) {
                    return ExecutionResult::failed(format!("invalid group name '{bad}'"));
                }

                let store = match self.identity.lock() {
                    Ok(store) => store,
                    Err(e) => {
                        return ExecutionResult::failed(format!("identity store unavailable: {e}"))
                    }
                };
                if let Err(e) = store.set_groups(&groups) {
                    return ExecutionResult::failed(e.to_string());
                }
                drop(store);

                if self.updates.send(groups.clone()).is_err() {
                    warn!("group sync task is gone, overlay download skipped");
                }

                info!(groups = ?groups, "group assignment updated");
                ExecutionResult::succeeded(format!("groups set: {}", groups.join(", ")))
            }
            other => ExecutionResult::failed(format!("unsupported command '{other}'")),
        }
    }
}

/// Long-lived task: download the overlay for every group it is handed.
///
/// The first batch arrives at startup (the stored memberships); later
/// batches come from `set-group` commands. Each download waits briefly for
/// a token if authentication has not completed yet; failures are logged
/// and the next reassignment retries them.
pub async fn sync_group_configuration(
    transport: Arc<HttpTransport>,
    config: AgentConfig,
    user_agent: String,
    token: Arc<TokenHolder>,
    dst_dir: PathBuf,
    mut updates: mpsc::UnboundedReceiver<Vec<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = std::fs::create_dir_all(&dst_dir) {
        warn!(dir = %dst_dir.display(), error = %e, "cannot create shared config dir");
        return;
    }

    info!("group configuration sync started");

    loop {
        let groups = tokio::select! {
            maybe = updates.recv() => match maybe {
                Some(groups) => groups,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        for group in groups {
            if *shutdown.borrow() {
                return;
            }
            if !valid_group_name(&group) {
                warn!(group = %group, "skipping invalid group name");
                continue;
            }

            // The startup batch can race enrollment; give the session
            // manager a moment to produce a token.
            let mut waited = 0;
            while token.is_empty() && waited < TOKEN_WAIT_SECS {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => waited += 1,
                    _ = shutdown.changed() => return,
                }
            }

            let dst = dst_dir.join(format!("{group}.yml"));
            match fetch_group_configuration(
                &transport,
                &config.manager_ip,
                &config.agent_comms_api_port,
                &user_agent,
                &token.snapshot(),
                config.use_https,
                &group,
                &dst,
            )
            .await
            {
                Ok(()) => info!(group = %group, "shared configuration applied"),
                Err(e) => warn!(group = %group, error = %e, "shared configuration download failed"),
            }
        }
    }

    info!("group configuration sync stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn module_with_store() -> (
        GroupAssignmentModule,
        Arc<Mutex<IdentityStore>>,
        mpsc::UnboundedReceiver<Vec<String>>,
        NamedTempFile,
    ) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Mutex::new(IdentityStore::open(tmp.path()).unwrap()));
        let (tx, rx) = mpsc::unbounded_channel();
        let module = GroupAssignmentModule::new(Arc::clone(&store), tx);
        (module, store, rx, tmp)
    }

    #[test]
    fn set_group_persists_and_queues_download() {
        let (module, store, mut rx, _tmp) = module_with_store();

        let result =
            module.execute_command("set-group", &[json!("default"), json!("webservers")]);
        assert!(result.success, "{}", result.message);

        assert_eq!(
            store.lock().unwrap().groups().unwrap(),
            vec!["default", "webservers"]
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            vec!["default".to_string(), "webservers".to_string()]
        );
    }

    #[test]
    fn set_group_accepts_an_array_parameter() {
        let (module, store, mut rx, _tmp) = module_with_store();

        let result = module.execute_command("set-group", &[json!(["a", "b"])]);
        assert!(result.success);
        assert_eq!(store.lock().unwrap().groups().unwrap(), vec!["a", "b"]);
        assert_eq!(rx.try_recv().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn set_group_without_names_fails() {
        let (module, store, mut rx, _tmp) = module_with_store();

        let result = module.execute_command("set-group", &[]);
        assert!(!result.success);
        assert!(store.lock().unwrap().groups().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_group_rejects_path_escaping_names() {
        let (module, store, _rx, _tmp) = module_with_store();

        for bad in ["../etc", "a/b", "", ".hidden"] {
            let result = module.execute_command("set-group", &[json!(bad)]);
            assert!(!result.success, "accepted '{bad}'");
        }
        assert!(store.lock().unwrap().groups().unwrap().is_empty());
    }

    #[test]
    fn unknown_command_fails() {
        let (module, _store, _rx, _tmp) = module_with_store();
        let result = module.execute_command("reboot", &[]);
        assert!(!result.success);
    }

    #[test]
    fn group_name_validation() {
        assert!(valid_group_name("default"));
        assert!(valid_group_name("web-servers_2.0"));
        assert!(!valid_group_name(""));
        assert!(!valid_group_name("../escape"));
        assert!(!valid_group_name("a/b"));
        assert!(!valid_group_name(".dotfile"));
        assert!(!valid_group_name("name with spaces"));
    }

    #[tokio::test]
    async fn sync_task_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = mpsc::unbounded_channel::<Vec<String>>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(sync_group_configuration(
            Arc::new(HttpTransport::new()),
            AgentConfig::default(),
            "PalisadeAgent/0.1.0".into(),
            Arc::new(TokenHolder::new()),
            dir.path().join("shared"),
            rx,
            shutdown_rx,
        ));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sync task did not stop")
            .unwrap();
    }
}
