//! The orchestrator: builds every subsystem and owns its lifecycle.
//!
//! Startup order mirrors the data flow: session refresh first (everything
//! needs a token), then the three request loops, then modules, then the
//! command processor. Shutdown is one watch-channel flip; every task
//! checks it at the top of each iteration and the dispatcher joins its
//! sink workers before the agent exits.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use palisade_comms::batching::MetadataProvider;
use palisade_comms::request_loop::{self, BodySource, SuccessHandler, UnauthorizedHandler};
use palisade_comms::{
    BatchDrain, HttpMethod, HttpPerformer, HttpRequestParams, HttpTransport, SessionManager,
    UuidKeyAuthenticator,
};
use palisade_queue::dispatcher::BatchSink;
use palisade_queue::{
    DispatcherConfig, EventDispatcher, EventStore, MessageQueue, SqliteEventStore,
};
use palisade_types::{AgentConfig, AgentInfo, Message, MessageType, PalisadeError};

use crate::command::process_commands;
use crate::groups::{sync_group_configuration, GroupAssignmentModule};
use crate::identity::IdentityStore;
use crate::module::{Module, ModuleManager, PushMessageFn};

/// Filename of the identity database under the data directory.
const IDENTITY_DB: &str = "agent-info.db";

/// Filename of the event spool under the data directory.
const SPOOL_DB: &str = "events.db";

/// Subdirectory of the data directory holding downloaded group overlays.
const SHARED_CONFIG_DIR: &str = "shared";

/// The assembled agent, ready to run.
pub struct Agent {
    config: AgentConfig,
    info: AgentInfo,
    data_dir: PathBuf,
    queue: Arc<MessageQueue>,
    transport: Arc<HttpTransport>,
    session: Arc<SessionManager>,
    spool: Arc<dyn EventStore>,
    modules: ModuleManager,
    group_updates_tx: mpsc::UnboundedSender<Vec<String>>,
    group_updates_rx: mpsc::UnboundedReceiver<Vec<String>>,
}

impl Agent {
    /// Build the agent: load or create the identity, open the event
    /// spool, and wire the session manager to the manager endpoint from
    /// the configuration.
    pub fn new(
        config: AgentConfig,
        data_dir: &Path,
        enroll_key: &str,
    ) -> Result<Self, PalisadeError> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            PalisadeError::Identity(format!(
                "failed to create data dir {}: {e}",
                data_dir.display()
            ))
        })?;

        let identity_store = IdentityStore::open(&data_dir.join(IDENTITY_DB))?;
        let default_name =
            std::env::var("HOSTNAME").unwrap_or_else(|_| "palisade-agent".to_string());
        let identity = identity_store.load_or_create(&default_name, enroll_key)?;
        let groups = identity_store.groups()?;

        let info = AgentInfo {
            uuid: identity.uuid,
            key: identity.key,
            name: identity.name,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            groups,
        };

        let queue = Arc::new(MessageQueue::new());
        let transport = Arc::new(HttpTransport::new());

        let authenticator = UuidKeyAuthenticator::new(
            Arc::clone(&transport),
            config.manager_ip.clone(),
            config.agent_comms_api_port.clone(),
            info.header_info(),
            info.uuid.clone(),
            info.key.clone(),
            config.use_https,
        );
        let session = Arc::new(SessionManager::new(Arc::new(authenticator)));

        let spool: Arc<dyn EventStore> =
            Arc::new(SqliteEventStore::open(&data_dir.join(SPOOL_DB))?);

        let push: PushMessageFn = {
            let queue = Arc::clone(&queue);
            Arc::new(move |message: Message| queue.push(message))
        };
        let mut modules = ModuleManager::new(push);

        // Built-in: group assignment commands from the manager.
        let identity_store = Arc::new(Mutex::new(identity_store));
        let (group_updates_tx, group_updates_rx) = mpsc::unbounded_channel();
        modules.register(Box::new(GroupAssignmentModule::new(
            identity_store,
            group_updates_tx.clone(),
        )));

        info!(
            uuid = %info.uuid,
            name = %info.name,
            manager = %config.manager_ip,
            port = %config.agent_comms_api_port,
            "agent assembled"
        );

        Ok(Self {
            config,
            info,
            data_dir: data_dir.to_path_buf(),
            queue,
            transport,
            session,
            spool,
            modules,
            group_updates_tx,
            group_updates_rx,
        })
    }

    /// Register a module before `run`.
    pub fn register_module(&mut self, module: Box<dyn Module>) {
        self.modules.register(module);
    }

    /// The message queue (for producers and tests).
    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue)
    }

    /// The event spool (for producers and tests).
    pub fn spool(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.spool)
    }

    fn pipeline_params(&self, method: HttpMethod, endpoint: &str) -> HttpRequestParams {
        HttpRequestParams::new(
            method,
            self.config.manager_ip.clone(),
            self.config.agent_comms_api_port.clone(),
            endpoint,
        )
        .with_user_agent(self.info.header_info())
        .with_https(self.config.use_https)
    }

    /// Run until the shutdown channel flips to `true`.
    ///
    /// Returns an error only for process-level fatal conditions (the event
    /// spool failing underneath the dispatcher); everything else is
    /// retried forever.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), PalisadeError> {
        let commands_params = self.pipeline_params(HttpMethod::Get, "/commands");
        let stateful_params = self.pipeline_params(HttpMethod::Post, "/stateful");
        let stateless_params = self.pipeline_params(HttpMethod::Post, "/stateless");

        let Agent {
            config,
            info,
            data_dir,
            queue,
            transport,
            session,
            spool,
            mut modules,
            group_updates_tx,
            group_updates_rx,
        } = self;

        let connection_retry = config.connection_retry();
        let batch_interval = config.batch_interval();

        // Internal stop channel: flipped by the external shutdown signal or
        // by a fatal dispatcher failure. Every task watches this one.
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let stop_tx = stop_tx.clone();
            let mut external = shutdown;
            tokio::spawn(async move {
                if !*external.borrow() {
                    let _ = external.changed().await;
                }
                let _ = stop_tx.send(true);
            });
        }

        // Spooled events ride the stateless pipeline: each dispatched batch
        // becomes one message on the STATELESS lane.
        let sink: BatchSink = {
            let queue = Arc::clone(&queue);
            Arc::new(move |payload: &str| {
                queue.push(Message::with_module(
                    MessageType::Stateless,
                    vec![payload.to_string()],
                    "events",
                    "spool",
                    r#"{"module":"events","type":"spool"}"#,
                )) == 1
            })
        };
        let dispatcher = EventDispatcher::start(
            Arc::clone(&spool),
            sink,
            DispatcherConfig::default(),
        )
        .map_err(|e| PalisadeError::Store(format!("failed to start dispatcher: {e}")))?;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // 1. Session refresh.
        {
            let session = Arc::clone(&session);
            let stop_rx = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                session.wait_and_reauthenticate(stop_rx).await;
            }));
        }

        let token = session.token();
        let performer: Arc<dyn HttpPerformer> = Arc::clone(&transport) as Arc<dyn HttpPerformer>;
        let on_unauthorized: UnauthorizedHandler = {
            let session = Arc::clone(&session);
            Arc::new(move || {
                session.try_reauthenticate();
            })
        };
        let metadata: MetadataProvider = {
            let info = info.clone();
            Arc::new(move || info.metadata_info())
        };

        // 2. Command poll.
        {
            let on_success: SuccessHandler = {
                let queue = Arc::clone(&queue);
                Arc::new(move |body: &str| {
                    crate::command::push_commands_to_queue(&queue, body);
                })
            };
            tasks.push(tokio::spawn(request_loop::run(
                Arc::clone(&performer),
                Arc::clone(&token),
                commands_params,
                None,
                Some(on_success),
                Arc::clone(&on_unauthorized),
                connection_retry,
                batch_interval,
                stop_rx.clone(),
            )));
        }

        // 3 + 4. Stateful and stateless push pipelines.
        for (kind, params) in [
            (MessageType::Stateful, stateful_params),
            (MessageType::Stateless, stateless_params),
        ] {
            let drain: Arc<dyn BodySource> = Arc::new(BatchDrain::new(
                Arc::clone(&queue),
                kind,
                config.max_batching_size,
                Arc::clone(&metadata),
            ));
            tasks.push(tokio::spawn(request_loop::run(
                Arc::clone(&performer),
                Arc::clone(&token),
                params,
                Some(drain),
                None,
                Arc::clone(&on_unauthorized),
                connection_retry,
                batch_interval,
                stop_rx.clone(),
            )));
        }

        // 5. Modules.
        modules.setup_all();
        modules.start_all();
        let modules = Arc::new(modules);

        // 6. Command processing.
        tasks.push(tokio::spawn(process_commands(
            Arc::clone(&queue),
            Arc::clone(&modules),
            stop_rx.clone(),
        )));

        // 7. Shared-group configuration sync: download the overlay for the
        // stored memberships now, then for every manager reassignment.
        if !info.groups.is_empty() {
            let _ = group_updates_tx.send(info.groups.clone());
        }
        tasks.push(tokio::spawn(sync_group_configuration(
            Arc::clone(&transport),
            config.clone(),
            info.header_info(),
            Arc::clone(&token),
            data_dir.join(SHARED_CONFIG_DIR),
            group_updates_rx,
            stop_rx.clone(),
        )));

        info!("agent running");

        // Park until shutdown flips, watching for a dead dispatcher.
        let mut stop_watch = stop_rx.clone();
        let mut fatal = false;
        while !*stop_watch.borrow() {
            tokio::select! {
                _ = stop_watch.changed() => {}
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                    if dispatcher.has_failed() {
                        error!("event dispatcher failed, shutting down");
                        fatal = true;
                        let _ = stop_tx.send(true);
                    }
                }
            }
        }

        info!("agent shutting down");
        modules.stop_all();
        for task in tasks {
            let _ = task.await;
        }
        dispatcher.stop();
        info!("agent stopped");

        if fatal {
            return Err(PalisadeError::Store("event dispatcher failed".into()));
        }
        Ok(())
    }
}
