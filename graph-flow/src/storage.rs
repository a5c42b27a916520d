use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sqlx::{Row, postgres::PgPoolOptions, types::Json};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;

/// Session information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session<S> {
    pub id: String,
    pub state: S,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<S> Session<S> {
    pub fn new(id: impl Into<String>, state: S) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Trait for storing and retrieving sessions.
///
/// Keys are opaque caller-supplied identifiers; implementations never look across keys.
#[async_trait]
pub trait SessionStorage<S>: Send + Sync
where
    S: Default + Clone + Send + Sync + 'static,
{
    async fn save(&self, session: Session<S>) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Session<S>>>;
    async fn delete(&self, id: &str) -> Result<()>;

    /// Load the session or start a fresh one with the default state.
    /// A fresh session is not persisted until it is saved.
    async fn get_or_create(&self, id: &str) -> Result<Session<S>> {
        Ok(self
            .get(id)
            .await?
            .unwrap_or_else(|| Session::new(id, S::default())))
    }
}

/// In-memory implementation of SessionStorage
pub struct InMemorySessionStorage<S> {
    sessions: Arc<DashMap<String, Session<S>>>,
}

impl<S> InMemorySessionStorage<S> {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }
}

impl<S> Default for InMemorySessionStorage<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S> SessionStorage<S> for InMemorySessionStorage<S>
where
    S: Default + Clone + Send + Sync + 'static,
{
    async fn save(&self, session: Session<S>) -> Result<()> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session<S>>> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }
}

/// PostgreSQL implementation of SessionStorage; each session is one JSONB row
pub struct PostgresSessionStorage<S> {
    pool: sqlx::PgPool,
    _state: PhantomData<fn() -> S>,
}

impl<S> PostgresSessionStorage<S> {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS graph_flow_sessions (
                id TEXT PRIMARY KEY,
                session JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("Connected to PostgreSQL session storage");
        Ok(Self {
            pool,
            _state: PhantomData,
        })
    }
}

#[async_trait]
impl<S> SessionStorage<S> for PostgresSessionStorage<S>
where
    S: Default + Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    async fn save(&self, session: Session<S>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO graph_flow_sessions (id, session, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET session = EXCLUDED.session, updated_at = NOW()
            "#,
        )
        .bind(&session.id)
        .bind(Json(&session))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session<S>>> {
        let row = sqlx::query("SELECT session FROM graph_flow_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.try_get("session")?;
                Ok(Some(serde_json::from_value(value)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM graph_flow_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
