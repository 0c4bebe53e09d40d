use crate::error::DbError;
use configuration::DatabaseSettings;
use log::LevelFilter;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{ConnectOptions, PgPool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

/// Which endpoint an engine serves. Only the master exists today; the registry
/// is keyed by role so further endpoints slot in without new global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineRole {
    Master,
}

/// Connection limits applied when the pool is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_open: u32,
    /// Carried for reporting; the sqlx pool has no idle-count cap and instead
    /// retires idle connections after its idle timeout.
    pub max_idle: u32,
}

/// A configured connection pool to one PostgreSQL endpoint.
///
/// The health flag is decided once by the startup probe and never changes
/// afterwards; a process restart is the only way to re-evaluate it.
#[derive(Debug, Clone)]
pub struct Engine {
    pool: PgPool,
    descriptor: String,
    limits: PoolLimits,
    healthy: bool,
}

impl Engine {
    /// Builds the pool and runs the one-shot connectivity probe.
    ///
    /// Only a failure to build the pool is returned as an error. A failed
    /// probe is logged and yields an unhealthy engine, so startup is never
    /// blocked by a database that is temporarily down.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, DbError> {
        settings
            .validate()
            .map_err(|e| DbError::EngineBuild(e.to_string()))?;

        let options = connect_options(settings)?;
        let descriptor = describe(&options);
        let limits = PoolLimits {
            max_open: settings.max_open_connections,
            max_idle: settings.max_idle_connections,
        };

        // The pool is created lazily; the probe below opens the first connection.
        let pool = PgPoolOptions::new()
            .max_connections(limits.max_open)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .connect_lazy_with(options);

        let healthy = match sqlx::query("SELECT 1").execute(&pool).await {
            Ok(_) => {
                tracing::info!(engine = %descriptor, "Database engine is healthy.");
                true
            }
            Err(e) => {
                tracing::error!(
                    r#type = "ping_db_engine_err",
                    err = %e,
                    engine = %descriptor,
                    "Failed to ping PostgreSQL; continuing with an unhealthy engine."
                );
                false
            }
        };

        Ok(Self {
            pool,
            descriptor,
            limits,
            healthy,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `user@host:port/db`, never including the password.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Translates the settings into driver connect options.
///
/// A configured `url` wins over the individual fields. TLS is disabled, and
/// statement echo follows `show_sql`.
pub fn connect_options(settings: &DatabaseSettings) -> Result<PgConnectOptions, DbError> {
    let options = match &settings.url {
        Some(url) => PgConnectOptions::from_str(url)
            .map_err(|e| DbError::EngineBuild(format!("invalid database url: {e}")))?,
        None => {
            let options = PgConnectOptions::new()
                .host(&settings.host)
                .port(settings.port)
                .username(&settings.user)
                .database(&settings.db_name)
                .ssl_mode(PgSslMode::Disable);
            match settings.password() {
                Some(password) => options.password(password),
                None => options,
            }
        }
    };

    Ok(if settings.show_sql {
        options.log_statements(LevelFilter::Info)
    } else {
        options.disable_statement_logging()
    })
}

/// `user@host:port/db` for the endpoint the options actually point at.
fn describe(options: &PgConnectOptions) -> String {
    format!(
        "{}@{}:{}/{}",
        options.get_username(),
        options.get_host(),
        options.get_port(),
        options.get_database().unwrap_or_default()
    )
}

/// Owns every engine of the process.
///
/// Built once at startup and shared behind an `Arc`. Lookups take the read
/// side of the lock; nothing writes after construction.
#[derive(Debug)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<EngineRole, Engine>>,
}

impl EngineRegistry {
    /// Builds the master engine from `settings`.
    pub async fn init(settings: &DatabaseSettings) -> Result<Self, DbError> {
        let master = Engine::connect(settings).await?;
        Ok(Self::with_master(master))
    }

    pub fn with_master(master: Engine) -> Self {
        let mut engines = HashMap::new();
        engines.insert(EngineRole::Master, master);
        Self {
            engines: RwLock::new(engines),
        }
    }

    /// The master engine if its startup probe succeeded.
    pub fn get_healthy_engine(&self) -> Result<Engine, DbError> {
        self.healthy_engine(EngineRole::Master)
    }

    pub fn healthy_engine(&self, role: EngineRole) -> Result<Engine, DbError> {
        match self.read().get(&role) {
            Some(engine) if engine.healthy => Ok(engine.clone()),
            _ => Err(DbError::EngineUnavailable),
        }
    }

    /// The engine for `role` regardless of its health flag.
    pub fn engine(&self, role: EngineRole) -> Result<Engine, DbError> {
        self.read()
            .get(&role)
            .cloned()
            .ok_or(DbError::EngineUnavailable)
    }

    pub fn master(&self) -> Result<Engine, DbError> {
        self.engine(EngineRole::Master)
    }

    /// Closes every pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        let pools: Vec<PgPool> = self.read().values().map(|e| e.pool.clone()).collect();
        for pool in pools {
            pool.close().await;
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<EngineRole, Engine>> {
        // Nothing mutates the map after construction, so a poisoned lock still
        // guards consistent data.
        self.engines.read().unwrap_or_else(PoisonError::into_inner)
    }
}
