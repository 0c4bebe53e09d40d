use crate::connection::EngineRegistry;
use crate::error::DbError;
use std::sync::Arc;

/// Mints identifiers from named PostgreSQL sequences.
///
/// Every call is one round trip to the master engine; nothing is cached or
/// pre-allocated.
#[derive(Debug, Clone)]
pub struct SequenceGenerator {
    registry: Arc<EngineRegistry>,
}

impl SequenceGenerator {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self { registry }
    }

    /// Advances `sequence` and returns its new value.
    pub async fn next_value(&self, sequence: &str) -> Result<i64, DbError> {
        let engine = self.registry.master()?;
        let raw: Option<String> = sqlx::query_scalar("SELECT nextval($1::regclass)::text")
            .bind(sequence)
            .fetch_one(engine.pool())
            .await
            .map_err(|e| sequence_error(sequence, e))?;

        parse_sequence_value(sequence, raw)
    }
}

fn parse_sequence_value(sequence: &str, raw: Option<String>) -> Result<i64, DbError> {
    let text = raw.ok_or_else(|| sequence_error(sequence, "nextval returned NULL"))?;
    text.trim()
        .parse::<i64>()
        .map_err(|e| sequence_error(sequence, e))
}

fn sequence_error(
    sequence: &str,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> DbError {
    DbError::Sequence {
        name: sequence.to_string(),
        source: source.into(),
    }
}
