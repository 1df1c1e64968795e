//! Runtime wiring and lifecycle management

use crate::config::{DaemonConfig, StorageConfig};
use crate::error::{DaemonError, DaemonResult};
use bpm_engine::{
    DefinitionDraft, DefinitionService, Engine, EventBus, FlowStore, MemoryDirectory,
    MemoryJobQueue, MemoryStore, TimeoutService,
};
use bpm_types::{Actor, Department, DirectoryUser, FlowEventEnvelope};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Directory entries and definitions loaded at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedFixture {
    #[serde(default)]
    pub users: Vec<DirectoryUser>,
    #[serde(default)]
    pub departments: Vec<Department>,
    /// Created and published in order, as the system actor
    #[serde(default)]
    pub definitions: Vec<DefinitionDraft>,
}

impl SeedFixture {
    pub fn from_file(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| DaemonError::Seed(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub users: usize,
    pub departments: usize,
    pub definitions: usize,
}

/// Everything the daemon runs: store, directory, engine, event bus and the
/// timeout runtime
pub struct Runtime {
    config: DaemonConfig,
    store: Arc<dyn FlowStore>,
    directory: Arc<MemoryDirectory>,
    engine: Arc<Engine>,
    events: EventBus,
    timeout: Arc<TimeoutService>,
    timeout_rx: mpsc::Receiver<()>,
}

impl Runtime {
    /// Build the runtime from configuration
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let store = build_store(&config.storage).await?;
        let directory = Arc::new(MemoryDirectory::new());
        let engine = Arc::new(Engine::new(directory.clone(), config.engine.clone()));
        let events = EventBus::new(config.events.capacity);

        let (timeout, timeout_rx) = TimeoutService::new(
            store.clone(),
            engine.clone(),
            events.clone(),
            Arc::new(MemoryJobQueue::new()),
            config.timeout.clone(),
        );

        Ok(Self {
            config,
            store,
            directory,
            engine,
            events,
            timeout,
            timeout_rx,
        })
    }

    /// Load directory entries, then create and publish each definition
    pub async fn seed(&self, fixture: SeedFixture) -> DaemonResult<SeedSummary> {
        let mut summary = SeedSummary::default();

        for dept in fixture.departments {
            self.directory.insert_department(dept).await;
            summary.departments += 1;
        }
        for user in fixture.users {
            self.directory.insert_user(user).await;
            summary.users += 1;
        }

        let definitions = DefinitionService::new(self.store.clone(), self.engine.clone());
        for draft in fixture.definitions {
            let code = draft.code.clone();
            let draft = definitions
                .create_draft(draft, &Actor::System)
                .await
                .map_err(|e| DaemonError::Seed(format!("definition {}: {}", code, e)))?;
            let published = definitions
                .publish(&draft.id, &Actor::System)
                .await
                .map_err(|e| DaemonError::Seed(format!("definition {}: {}", code, e)))?;
            tracing::info!(code = %published.code, version = published.version, definition_id = %published.id, "Definition seeded");
            summary.definitions += 1;
        }

        Ok(summary)
    }

    /// Run the timeout runtime until a shutdown signal arrives
    pub async fn run(self) -> DaemonResult<()> {
        let Runtime {
            config,
            events,
            timeout,
            timeout_rx,
            ..
        } = self;

        let runner = tokio::spawn(timeout.clone().start(timeout_rx));
        let event_log = config
            .events
            .log_events
            .then(|| tokio::spawn(log_events(events.subscribe())));

        tracing::info!("BPM daemon running");
        shutdown_signal().await;
        tracing::info!("BPM daemon shutting down");

        timeout.stop().await;
        if let Err(e) = runner.await {
            tracing::error!(error = %e, "Timeout runtime task failed");
        }
        if let Some(handle) = event_log {
            handle.abort();
        }

        Ok(())
    }
}

async fn build_store(config: &StorageConfig) -> DaemonResult<Arc<dyn FlowStore>> {
    match config {
        StorageConfig::Memory => {
            tracing::info!("Using in-memory storage");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            let store =
                bpm_engine::PostgresStore::connect(url, *max_connections, *connect_timeout_secs)
                    .await?;
            tracing::info!(max_connections = *max_connections, "Using PostgreSQL storage");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(DaemonError::Config(
            "PostgreSQL storage requires the `postgres` feature".to_string(),
        )),
    }
}

async fn log_events(mut rx: broadcast::Receiver<FlowEventEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                tracing::info!(
                    event = envelope.event.name(),
                    event_id = %envelope.id,
                    instance_id = %envelope.event.instance_id(),
                    "Lifecycle event"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event log lagged behind the bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpm_engine::{InstanceService, TaskManager};
    use bpm_types::{InstanceStatus, UserId};
    use serde_json::json;

    const SEED: &str = include_str!("../fixtures/seed.json");

    fn fixture() -> SeedFixture {
        serde_json::from_str(SEED).unwrap()
    }

    async fn seeded() -> Runtime {
        let runtime = Runtime::new(DaemonConfig::default()).await.unwrap();
        runtime.seed(fixture()).await.unwrap();
        runtime
    }

    fn alice() -> Actor {
        Actor::user(UserId::new("alice"), "Alice")
    }

    #[test]
    fn test_bundled_fixture_parses() {
        let fixture = fixture();
        assert_eq!(fixture.users.len(), 6);
        assert_eq!(fixture.departments.len(), 3);
        assert_eq!(fixture.definitions.len(), 2);
        assert_eq!(fixture.definitions[0].form_schema.len(), 2);
    }

    #[test]
    fn test_seed_publishes_definitions() {
        let summary = tokio_test::block_on(async {
            let runtime = Runtime::new(DaemonConfig::default()).await.unwrap();
            runtime.seed(fixture()).await.unwrap()
        });
        assert_eq!(
            summary,
            SeedSummary {
                users: 6,
                departments: 3,
                definitions: 2
            }
        );
    }

    #[tokio::test]
    async fn test_seeded_leave_flow_runs() {
        let runtime = seeded().await;
        let instances =
            InstanceService::new(runtime.store.clone(), runtime.engine.clone(), runtime.events.clone());
        let tasks =
            TaskManager::new(runtime.store.clone(), runtime.engine.clone(), runtime.events.clone());

        let instance = instances
            .start("leave", &alice(), None, json!({"days": 5, "reason": "trip"}))
            .await
            .unwrap();
        assert_eq!(instance.title, "Leave Request - Alice");

        let lead = instances.todo(&UserId::new("bob")).await.unwrap();
        assert_eq!(lead.len(), 1);
        assert!(lead[0].due_at.is_some());
        tasks
            .approve(&lead[0].id, &Actor::user(UserId::new("bob"), "Bob"), None, None)
            .await
            .unwrap();

        // five days routes through HR, where either HR user may approve
        let hr = instances.todo(&UserId::new("dan")).await.unwrap();
        assert_eq!(hr.len(), 1);
        let outcome = tasks
            .approve(&hr[0].id, &Actor::user(UserId::new("dan"), "Dan"), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.instance_status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_seeded_purchase_flow_fans_out() {
        let runtime = seeded().await;
        let instances =
            InstanceService::new(runtime.store.clone(), runtime.engine.clone(), runtime.events.clone());

        let instance = instances
            .start("purchase", &alice(), None, json!({"amount": 1200, "vendor": "Acme"}))
            .await
            .unwrap();

        let detail = instances.detail(&instance.id).await.unwrap();
        assert_eq!(detail.tasks.len(), 2);
        assert_eq!(detail.copies.len(), 1);
        assert_eq!(detail.instance.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_missing_required_field_is_rejected() {
        let runtime = seeded().await;
        let instances =
            InstanceService::new(runtime.store.clone(), runtime.engine.clone(), runtime.events.clone());

        let err = instances
            .start("purchase", &alice(), None, json!({"amount": 10}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), bpm_types::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_invalid_definition_fails_seeding() {
        let runtime = Runtime::new(DaemonConfig::default()).await.unwrap();
        let fixture: SeedFixture = serde_json::from_value(json!({
            "definitions": [{
                "code": "broken",
                "name": "Broken",
                "graph": {"nodes": [{"id": "start", "kind": "START"}], "edges": []}
            }]
        }))
        .unwrap();

        let err = runtime.seed(fixture).await.unwrap_err();
        assert!(matches!(err, DaemonError::Seed(_)));
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_postgres_requires_feature() {
        let mut config = DaemonConfig::default();
        config.storage = StorageConfig::Postgres {
            url: "postgres://localhost/bpm".to_string(),
            max_connections: 1,
            connect_timeout_secs: 1,
        };
        assert!(matches!(
            Runtime::new(config).await,
            Err(DaemonError::Config(_))
        ));
    }
}
