use thiserror::Error;

/// SQLSTATE PostgreSQL reports for a unique-constraint violation.
pub const UNIQUE_VIOLATION_CODE: &str = "23505";

/// Text PostgreSQL puts in every unique-violation message. Only consulted
/// when the error carries no SQLSTATE; the wording is driver and locale
/// dependent.
pub const DUPLICATE_KEY_MARKER: &str = "duplicate key";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("db engine not available")]
    EngineUnavailable,

    #[error("db model duplicated: {0}")]
    DuplicateKey(#[source] sqlx::Error),

    #[error("gen {name} sequence error: {source}")]
    Sequence {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{context}: {source}")]
    Unclassified {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to build the database engine: {0}")]
    EngineBuild(String),

    #[error("session is already closed")]
    SessionClosed,

    #[error("invalid transaction state: {0}")]
    TransactionState(&'static str),

    #[error("invalid statement: {0}")]
    InvalidStatement(String),
}

impl DbError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, DbError::DuplicateKey(_))
    }

    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, DbError::EngineUnavailable)
    }
}

/// Maps a raw driver error onto the domain taxonomy.
///
/// Callers only learn "this row already exists" versus "something else went
/// wrong"; which constraint fired is not surfaced. The driver error is kept
/// as the source either way.
pub fn classify(err: sqlx::Error, context: impl Into<String>) -> DbError {
    if is_unique_violation(&err) {
        DbError::DuplicateKey(err)
    } else {
        DbError::Unclassified {
            context: context.into(),
            source: err,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code == UNIQUE_VIOLATION_CODE;
        }
    }
    mentions_duplicate_key(&err.to_string())
}

fn mentions_duplicate_key(message: &str) -> bool {
    message.contains(DUPLICATE_KEY_MARKER)
}
