use std::{sync::Arc, time::Duration};

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::{
    auth::JwtKeys,
    cache::{Cache, MemoryCache, RedisCache, UserCache},
    config::{AppConfig, Backend},
    events::{
        bus::{EventPublisher, EventStream, MemoryEventBus},
        redis_streams::RedisEventBus,
    },
    moderation::ModerationService,
    storage::{MemoryObjectStore, ObjectStore, S3ObjectStore},
    users::{
        memory::InMemoryUserRepository,
        repo::{PgUserRepository, UserRepository},
        services::UserService,
    },
};

/// Collaborator handles, created once at startup and shared.
#[derive(Clone)]
pub struct Backends {
    pub repo: Arc<dyn UserRepository>,
    pub storage: Arc<dyn ObjectStore>,
    pub cache: Arc<dyn Cache>,
    pub publisher: Arc<dyn EventPublisher>,
    pub stream: Arc<dyn EventStream>,
}

impl Backends {
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.database_url)
            .await
            .context("connect to postgres")?;

        if let Err(e) = sqlx::migrate!("./migrations").run(&db).await {
            warn!(error = %e, "migrations folder not found or migration failed; continuing");
        }

        let storage = Arc::new(S3ObjectStore::new(&config.storage).await?) as Arc<dyn ObjectStore>;

        let cache: Arc<dyn Cache> = match config.cache.backend {
            Backend::Redis => Arc::new(RedisCache::connect(&config.cache.redis_url).await?),
            Backend::Memory => Arc::new(MemoryCache::new()),
        };

        let (publisher, stream): (Arc<dyn EventPublisher>, Arc<dyn EventStream>) =
            match config.events.backend {
                Backend::Redis => {
                    let bus = Arc::new(RedisEventBus::connect(&config.events).await?);
                    (bus.clone() as Arc<dyn EventPublisher>, bus as Arc<dyn EventStream>)
                }
                Backend::Memory => {
                    let bus = Arc::new(MemoryEventBus::new(config.events.partitions));
                    (bus.clone() as Arc<dyn EventPublisher>, bus as Arc<dyn EventStream>)
                }
            };

        info!(
            cache = ?config.cache.backend,
            events = ?config.events.backend,
            "backends connected"
        );

        Ok(Self {
            repo: Arc::new(PgUserRepository::new(db)),
            storage,
            cache,
            publisher,
            stream,
        })
    }

    /// Everything in process memory; no external services.
    pub fn in_memory(config: &AppConfig) -> Self {
        let bus = Arc::new(MemoryEventBus::new(config.events.partitions));
        Self {
            repo: Arc::new(InMemoryUserRepository::new()),
            storage: Arc::new(MemoryObjectStore::new(
                &config.storage.public_url,
                &config.storage.bucket,
            )),
            cache: Arc::new(MemoryCache::new()),
            publisher: bus.clone(),
            stream: bus,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jwt: JwtKeys,
    pub backends: Backends,
    pub users: UserService,
    pub moderation: ModerationService,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);
        let backends = Backends::connect(&config).await?;
        Ok(Self::from_parts(config, backends))
    }

    pub fn from_parts(config: Arc<AppConfig>, backends: Backends) -> Self {
        let cache = UserCache::new(
            backends.cache.clone(),
            config.cache.ttl(),
            config.cache.op_timeout(),
        );
        let users = UserService::new(
            backends.repo.clone(),
            backends.storage.clone(),
            cache.clone(),
            backends.publisher.clone(),
        );
        let moderation = ModerationService::new(backends.repo.clone(), cache);
        Self {
            jwt: JwtKeys::new(&config.jwt),
            config,
            backends,
            users,
            moderation,
        }
    }

    /// State over in-memory backends with test configuration.
    pub fn fake() -> Self {
        let config = Arc::new(AppConfig::for_tests());
        let backends = Backends::in_memory(&config);
        Self::from_parts(config, backends)
    }
}
