//! # Persistence Layer
//!
//! This crate owns every conversation the service has with PostgreSQL: the
//! connection pool, sessions and transactions, generic entity writes,
//! identifier sequences and the translation of driver errors into domain
//! errors.
//!
//! ## Architectural Principles
//!
//! - **Injected, not global:** `EngineRegistry` is built once at startup and
//!   shared through an `Arc`. Nothing in this crate holds process-wide state.
//! - **Fail soft at startup:** an unreachable database yields an unhealthy
//!   engine instead of aborting. Only a pool that cannot be built at all is
//!   reported as fatal.
//! - **Explicit transaction boundaries:** every write takes a `SessionScope`,
//!   so call sites say whether they own the transaction or let the repository
//!   manage it.
//!
//! ## Public API
//!
//! - `EngineRegistry`: holds the master `Engine` and its latched health flag.
//! - `SessionFactory` / `Session`: managed and auto-close sessions.
//! - `DbRepository`: `insert_one`, `insert_many`, `update_by_unique_condition`,
//!   `delete_by_unique_condition` over any `Model`.
//! - `SequenceGenerator`: `next_value` from a named sequence.
//! - `DbError`: including the `DuplicateKey` and `EngineUnavailable` sentinels.

// Declare the modules that constitute this crate.
pub mod connection;
pub mod error;
pub mod model;
pub mod repository;
pub mod sequence;
pub mod session;

// Re-export the key components to create a clean, public-facing API.
pub use connection::{Engine, EngineRegistry, EngineRole, PoolLimits};
pub use error::{DbError, classify};
pub use model::{Model, UniqueCondition, UniqueModel, Value};
pub use repository::DbRepository;
pub use sequence::SequenceGenerator;
pub use session::{Session, SessionFactory, SessionScope, TxState};

#[cfg(test)]
pub(crate) mod testing {
    use crate::connection::EngineRegistry;
    use configuration::DatabaseSettings;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Settings pointing at a port nothing listens on, with a short acquire
    /// timeout so probes fail fast.
    pub fn unreachable_settings() -> DatabaseSettings {
        DatabaseSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "wechat".to_string(),
            password: None,
            db_name: "wechat".to_string(),
            max_open_connections: 4,
            max_idle_connections: 2,
            show_sql: false,
            acquire_timeout_secs: 1,
            url: None,
        }
    }

    pub async fn unreachable_registry() -> Arc<EngineRegistry> {
        let registry = EngineRegistry::init(&unreachable_settings())
            .await
            .expect("building a lazy pool never needs the server");
        Arc::new(registry)
    }

    /// Collects the JSON log lines written while the returned guard is alive.
    #[derive(Clone, Default)]
    pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
            let logs = Self::default();
            let writer = logs.clone();
            let subscriber = tracing_subscriber::fmt()
                .json()
                .with_writer(move || writer.clone())
                .finish();
            (logs, tracing::subscriber::set_default(subscriber))
        }

        pub fn contents(&self) -> String {
            let bytes = self.0.lock().unwrap_or_else(|e| e.into_inner());
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
