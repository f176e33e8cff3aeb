//! Application state shared by routes, workers and the scheduler.

use std::sync::Arc;

use feeder_client::{ExternalClient, RelayRunner, RenewRunner};
use feeder_core::config::{AppConfig, StoreBackend};
use feeder_core::Result;
use feeder_feed::discovery::Discovery;
use feeder_feed::fetch::{build_http_client, FetchClient};
use feeder_hub::{DistributeRunner, HubEngine, VerifyRunner};
use feeder_poller::PollRunner;
use feeder_store::{KvBackend, MemoryBackend, PgBackend, Store, TaskQueue};

/// The queue handlers, one per message tag.
#[derive(Clone)]
pub struct Handlers {
    pub poller: PollRunner,
    pub verify: VerifyRunner,
    pub distribute: DistributeRunner,
    pub renew: RenewRunner,
    pub relay: RelayRunner,
}

/// Everything a request or worker needs. Clones share the underlying
/// backend and HTTP client.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Store,
    pub queue: TaskQueue,
    pub hub: HubEngine,
    pub client: ExternalClient,
    pub handlers: Handlers,
}

impl AppState {
    /// Build the full service graph on top of a backend.
    pub fn build(config: AppConfig, backend: Arc<dyn KvBackend>) -> Result<Self> {
        let store = Store::new(backend.clone());
        let queue = TaskQueue::new(backend);

        let http = build_http_client()?;
        let feed_fetch = FetchClient::new(
            http.clone(),
            config.polling.fetch_timeout(),
            config.polling.max_body_bytes,
        );
        let discovery = Discovery::new(feed_fetch.clone());
        let hub_url = config.hub.hub_url_or(&config.server.base_url);

        let hub = HubEngine::new(store.clone(), feed_fetch.clone(), config.hub.clone());
        let client = ExternalClient::new(
            store.clone(),
            queue.clone(),
            discovery,
            http.clone(),
            config.clone(),
        );

        let handlers = Handlers {
            poller: PollRunner::new(store.clone(), feed_fetch, hub.clone()),
            verify: VerifyRunner::new(store.clone(), http.clone(), config.hub.webhook_timeout()),
            distribute: DistributeRunner::new(
                store.clone(),
                http.clone(),
                hub_url,
                config.hub.webhook_timeout(),
            ),
            renew: RenewRunner::new(store.clone(), http.clone(), config.clone()),
            relay: RelayRunner::new(store.clone(), http, config.hub.webhook_timeout()),
        };

        Ok(Self {
            config: Arc::new(config),
            store,
            queue,
            hub,
            client,
            handlers,
        })
    }

    /// Connect the configured backend and build the state.
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let backend: Arc<dyn KvBackend> = match config.database.backend {
            StoreBackend::Postgres => Arc::new(PgBackend::connect(&config.database).await?),
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory storage; state is lost on restart");
                Arc::new(MemoryBackend::new())
            }
        };
        Self::build(config, backend)
    }
}
