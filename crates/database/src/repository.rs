use crate::error::DbError;
use crate::model::{Model, UniqueCondition, UniqueModel, Value};
use crate::session::{Session, SessionFactory, SessionScope};
use sqlx::postgres::PgQueryResult;
use sqlx::{Postgres, QueryBuilder};

/// PostgreSQL's limit on bind parameters in a single statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// The `DbRepository` provides generic full-column CRUD over any `Model`.
///
/// Every entry point takes a `SessionScope`. With `SessionScope::Auto` the
/// call opens and finishes its own session; with `SessionScope::Caller` the
/// statement joins the caller's session and the caller owns begin, commit,
/// rollback and close.
#[derive(Debug, Clone)]
pub struct DbRepository {
    sessions: SessionFactory,
}

impl DbRepository {
    /// Creates a new `DbRepository` on top of a shared session factory.
    pub fn new(sessions: SessionFactory) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &SessionFactory {
        &self.sessions
    }

    /// Writes every column of `entity`.
    ///
    /// A unique-key conflict comes back as `DbError::DuplicateKey`.
    pub async fn insert_one<M: Model>(
        &self,
        scope: SessionScope<'_>,
        entity: &M,
    ) -> Result<(), DbError> {
        let mut builder = insert_statement(std::slice::from_ref(entity))?;
        let context = format!("insert into {}", M::TABLE);
        self.run(scope, &mut builder, &context).await?;
        Ok(())
    }

    /// Writes all `entities`.
    ///
    /// With `SessionScope::Auto` the rows go in inside one internal
    /// transaction: all of them persist or none do. With a caller session the
    /// rows are only appended to whatever the caller has open, and that
    /// session must be a managed one.
    pub async fn insert_many<M: Model>(
        &self,
        scope: SessionScope<'_>,
        entities: &[M],
    ) -> Result<(), DbError> {
        if entities.is_empty() {
            return Ok(());
        }
        let mut statements = insert_statements(entities, MAX_BIND_PARAMS)?;
        let context = format!("insert into {}", M::TABLE);

        match scope {
            SessionScope::Caller(session) => {
                // A batch may span several statements; an auto-close session
                // would end after the first and leave the rest unwritten.
                if session.is_auto_close() {
                    return Err(DbError::TransactionState(
                        "insert_many needs a managed session",
                    ));
                }
                execute_all(session, &mut statements, &context).await
            }
            SessionScope::Auto => {
                let mut session = self.sessions.new_managed_session()?;
                let result = insert_atomically(&mut session, &mut statements, &context).await;
                let closed = session.close().await;
                result.and(closed)
            }
        }
    }

    /// Overwrites every column of every row matching the entity's unique
    /// condition.
    ///
    /// There is no version check: two writers holding stale copies of the
    /// same row simply overwrite each other, last write wins. Returns the
    /// number of rows updated.
    pub async fn update_by_unique_condition<M: UniqueModel>(
        &self,
        scope: SessionScope<'_>,
        entity: &M,
    ) -> Result<u64, DbError> {
        let mut builder = update_statement(entity)?;
        let context = format!("update {}", M::TABLE);
        let result = self.run(scope, &mut builder, &context).await?;
        Ok(result.rows_affected())
    }

    /// Deletes every row matching the entity's unique condition. Matching
    /// nothing is not an error. Returns the number of rows deleted.
    pub async fn delete_by_unique_condition<M: UniqueModel>(
        &self,
        scope: SessionScope<'_>,
        entity: &M,
    ) -> Result<u64, DbError> {
        let mut builder = delete_statement(entity)?;
        let context = format!("delete from {}", M::TABLE);
        let result = self.run(scope, &mut builder, &context).await?;
        Ok(result.rows_affected())
    }

    async fn run(
        &self,
        scope: SessionScope<'_>,
        builder: &mut QueryBuilder<'static, Postgres>,
        context: &str,
    ) -> Result<PgQueryResult, DbError> {
        match scope {
            SessionScope::Caller(session) => session.execute(builder, context).await,
            SessionScope::Auto => {
                let mut session = self.sessions.new_auto_close_session()?;
                session.execute(builder, context).await
            }
        }
    }
}

async fn insert_atomically(
    session: &mut Session,
    statements: &mut [QueryBuilder<'static, Postgres>],
    context: &str,
) -> Result<(), DbError> {
    session.begin().await?;
    match execute_all(session, statements, context).await {
        Ok(()) => session.commit().await,
        Err(e) => {
            if let Err(rollback_err) = session.rollback().await {
                tracing::warn!(
                    err = %rollback_err,
                    context,
                    "Rollback after failed insert also failed."
                );
            }
            Err(e)
        }
    }
}

async fn execute_all(
    session: &mut Session,
    statements: &mut [QueryBuilder<'static, Postgres>],
    context: &str,
) -> Result<(), DbError> {
    for builder in statements.iter_mut() {
        session.execute(builder, context).await?;
    }
    Ok(())
}

fn checked_values<M: Model>(entity: &M) -> Result<Vec<Value>, DbError> {
    if M::COLUMNS.is_empty() {
        return Err(DbError::InvalidStatement(format!(
            "model for {} declares no columns",
            M::TABLE
        )));
    }
    let values = entity.values();
    if values.len() != M::COLUMNS.len() {
        return Err(DbError::InvalidStatement(format!(
            "model for {} has {} columns but produced {} values",
            M::TABLE,
            M::COLUMNS.len(),
            values.len()
        )));
    }
    Ok(values)
}

fn insert_statement<M: Model>(entities: &[M]) -> Result<QueryBuilder<'static, Postgres>, DbError> {
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) VALUES ",
        M::TABLE,
        M::COLUMNS.join(", ")
    ));
    for (row, entity) in entities.iter().enumerate() {
        let values = checked_values(entity)?;
        if row > 0 {
            builder.push(", ");
        }
        builder.push("(");
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            value.push_bind(&mut builder);
        }
        builder.push(")");
    }
    Ok(builder)
}

/// Multi-row INSERTs, split so no statement exceeds `max_params` binds.
fn insert_statements<M: Model>(
    entities: &[M],
    max_params: usize,
) -> Result<Vec<QueryBuilder<'static, Postgres>>, DbError> {
    let rows_per_statement = (max_params / M::COLUMNS.len().max(1)).max(1);
    entities
        .chunks(rows_per_statement)
        .map(insert_statement)
        .collect()
}

fn update_statement<M: UniqueModel>(
    entity: &M,
) -> Result<QueryBuilder<'static, Postgres>, DbError> {
    let values = checked_values(entity)?;
    let mut builder = QueryBuilder::new(format!("UPDATE {} SET ", M::TABLE));
    for (i, (column, value)) in M::COLUMNS.iter().zip(values).enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push(format!("{column} = "));
        value.push_bind(&mut builder);
    }
    push_condition(&mut builder, entity.unique_condition())?;
    Ok(builder)
}

fn delete_statement<M: UniqueModel>(
    entity: &M,
) -> Result<QueryBuilder<'static, Postgres>, DbError> {
    let mut builder = QueryBuilder::new(format!("DELETE FROM {}", M::TABLE));
    push_condition(&mut builder, entity.unique_condition())?;
    Ok(builder)
}

/// Appends ` WHERE <clause>`, binding each `?` to the next parameter.
///
/// The clause is split on every `?`, so it must not contain a literal
/// question mark.
fn push_condition(
    builder: &mut QueryBuilder<'static, Postgres>,
    condition: UniqueCondition,
) -> Result<(), DbError> {
    if condition.clause.trim().is_empty() {
        return Err(DbError::InvalidStatement(
            "unique condition must not be empty".to_string(),
        ));
    }
    if condition.placeholder_count() != condition.params.len() {
        return Err(DbError::InvalidStatement(format!(
            "condition `{}` has {} placeholders but {} parameters",
            condition.clause,
            condition.placeholder_count(),
            condition.params.len()
        )));
    }

    builder.push(" WHERE ");
    let mut params = condition.params.into_iter();
    for (i, piece) in condition.clause.split('?').enumerate() {
        if i > 0 {
            if let Some(param) = params.next() {
                param.push_bind(builder);
            }
        }
        builder.push(piece);
    }
    Ok(())
}
