use crate::connection::{Engine, EngineRegistry};
use crate::error::{DbError, classify};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgQueryResult};
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::sync::Arc;

/// Where a session is in its transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    None,
    Open,
    Committed,
    RolledBack,
}

/// How a repository call chooses its session.
///
/// `Auto` lets the call manage its own session: a single auto-close statement,
/// or an internal transaction for multi-row inserts. `Caller` runs the
/// statement on the given session and leaves every transaction boundary to
/// the caller.
pub enum SessionScope<'s> {
    Auto,
    Caller(&'s mut Session),
}

enum Handle {
    Idle,
    Conn(PoolConnection<Postgres>),
    Tx(Transaction<'static, Postgres>),
}

/// A handle for issuing statements against one engine.
///
/// Auto-close sessions end after their first statement whatever the outcome.
/// Managed sessions live until `close`; dropping one with an open
/// transaction rolls the transaction back.
pub struct Session {
    engine: Engine,
    auto_close: bool,
    handle: Handle,
    state: TxState,
    closed: bool,
}

impl Session {
    fn new(engine: Engine, auto_close: bool) -> Self {
        Self {
            engine,
            auto_close,
            handle: Handle::Idle,
            state: TxState::None,
            closed: false,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn is_auto_close(&self) -> bool {
        self.auto_close
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Opens a transaction on a dedicated connection.
    pub async fn begin(&mut self) -> Result<(), DbError> {
        self.ensure_open()?;
        if self.auto_close {
            return Err(DbError::TransactionState(
                "auto-close sessions cannot open a transaction",
            ));
        }
        if self.state == TxState::Open {
            return Err(DbError::TransactionState("transaction already open"));
        }
        let tx = self
            .engine
            .pool()
            .begin()
            .await
            .map_err(|e| classify(e, "begin transaction"))?;
        // Any plain connection held so far goes back to the pool.
        self.handle = Handle::Tx(tx);
        self.state = TxState::Open;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), DbError> {
        self.ensure_open()?;
        let tx = self.take_tx("commit without an open transaction")?;
        // The state moves on even if COMMIT fails: PostgreSQL has discarded
        // the transaction either way.
        let result = tx.commit().await;
        self.state = if result.is_ok() {
            TxState::Committed
        } else {
            TxState::RolledBack
        };
        result.map_err(|e| classify(e, "commit transaction"))
    }

    pub async fn rollback(&mut self) -> Result<(), DbError> {
        self.ensure_open()?;
        let tx = self.take_tx("rollback without an open transaction")?;
        self.state = TxState::RolledBack;
        tx.rollback()
            .await
            .map_err(|e| classify(e, "rollback transaction"))
    }

    /// Ends the session. An open transaction is rolled back first. Closing an
    /// already-closed session is a no-op.
    pub async fn close(&mut self) -> Result<(), DbError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match std::mem::replace(&mut self.handle, Handle::Idle) {
            Handle::Tx(tx) => {
                self.state = TxState::RolledBack;
                tx.rollback()
                    .await
                    .map_err(|e| classify(e, "rollback on close"))
            }
            Handle::Conn(_) | Handle::Idle => Ok(()),
        }
    }

    /// The live connection behind this session, for statements the
    /// repository does not cover. Inside a transaction this is the
    /// transaction's connection.
    pub async fn connection(&mut self) -> Result<&mut PgConnection, DbError> {
        self.ensure_open()?;
        if self.auto_close {
            return Err(DbError::InvalidStatement(
                "auto-close sessions do not hold a connection".to_string(),
            ));
        }
        if matches!(self.handle, Handle::Idle) {
            let conn = self
                .engine
                .pool()
                .acquire()
                .await
                .map_err(|e| classify(e, "acquire connection"))?;
            self.handle = Handle::Conn(conn);
        }
        match &mut self.handle {
            Handle::Tx(tx) => Ok(&mut **tx),
            Handle::Conn(conn) => Ok(&mut **conn),
            Handle::Idle => Err(DbError::SessionClosed),
        }
    }

    /// Runs one statement. `context` labels unclassified failures.
    pub(crate) async fn execute(
        &mut self,
        builder: &mut QueryBuilder<'_, Postgres>,
        context: &str,
    ) -> Result<PgQueryResult, DbError> {
        self.ensure_open()?;
        let query = builder.build();
        let result = if self.auto_close {
            let result = query.execute(self.engine.pool()).await;
            self.closed = true;
            result
        } else {
            match &mut self.handle {
                Handle::Tx(tx) => query.execute(&mut **tx).await,
                Handle::Conn(conn) => query.execute(&mut **conn).await,
                Handle::Idle => match self.engine.pool().acquire().await {
                    Ok(mut conn) => {
                        let result = query.execute(&mut *conn).await;
                        self.handle = Handle::Conn(conn);
                        result
                    }
                    Err(e) => Err(e),
                },
            }
        };
        result.map_err(|e| classify(e, context))
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed {
            Err(DbError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn take_tx(&mut self, misuse: &'static str) -> Result<Transaction<'static, Postgres>, DbError> {
        match std::mem::replace(&mut self.handle, Handle::Idle) {
            Handle::Tx(tx) => Ok(tx),
            other => {
                self.handle = other;
                Err(DbError::TransactionState(misuse))
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.engine.descriptor())
            .field("auto_close", &self.auto_close)
            .field("state", &self.state)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Creates sessions against engines handed out by the registry.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    registry: Arc<EngineRegistry>,
}

impl SessionFactory {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self { registry }
    }

    /// A caller-managed session on a healthy engine.
    pub fn new_managed_session(&self) -> Result<Session, DbError> {
        let engine = self.registry.get_healthy_engine()?;
        Ok(Session::new(engine, false))
    }

    /// A single-statement session.
    ///
    /// An unhealthy probe result does not stop the call: the master engine is
    /// used anyway so the statement itself reports any real connectivity
    /// problem, and a database that recovered after startup keeps working.
    pub fn new_auto_close_session(&self) -> Result<Session, DbError> {
        let engine = match self.registry.get_healthy_engine() {
            Ok(engine) => engine,
            Err(_) => self.registry.master()?,
        };
        Ok(Session::new(engine, true))
    }
}
