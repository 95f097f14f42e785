use std::sync::Arc;

#[cfg(any(feature = "postgres", feature = "sqlite"))]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};
use tracing::info;

use crate::config::{DatabaseConfig, DbType};
use crate::db::memory::MemoryKvStore;
#[cfg(feature = "postgres")]
use crate::db::postgres::PostgresKvStore;
#[cfg(feature = "sqlite")]
use crate::db::sqlite::SqliteKvStore;
use crate::db::{
    DatabaseError, KvStore, LinkStore, MarkerStore, MessageStore, SubscriptionStore, UserStore,
};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    kv: Arc<dyn KvStore>,
    db_type: DbType,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        match config.db_type() {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let manager = ConnectionManager::<PgConnection>::new(config.connection_string());
                let pool = r2d2::Pool::builder()
                    .max_size(config.max_connections())
                    .min_idle(Some(config.min_connections()))
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                Ok(Self {
                    postgres_pool: Some(pool.clone()),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    kv: Arc::new(PostgresKvStore::new(pool)),
                    db_type: DbType::Postgres,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite path is missing".to_string())
                })?;

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    sqlite_path: Some(path.clone()),
                    kv: Arc::new(SqliteKvStore::new(Arc::new(path))),
                    db_type: DbType::Sqlite,
                })
            }
            DbType::Memory => Ok(Self::new_in_memory()),
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub fn new_in_memory() -> Self {
        Self::with_store(Arc::new(MemoryKvStore::new()))
    }

    pub fn with_store(kv: Arc<dyn KvStore>) -> Self {
        Self {
            #[cfg(feature = "postgres")]
            postgres_pool: None,
            #[cfg(feature = "sqlite")]
            sqlite_path: None,
            kv,
            db_type: DbType::Memory,
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        #[cfg(feature = "postgres")]
        if let Some(pool) = self.postgres_pool.as_ref() {
            Self::migrate_postgres(pool).await?;
            info!("database migrated backend=postgres");
            return Ok(());
        }
        #[cfg(feature = "sqlite")]
        if let Some(path) = self.sqlite_path.as_ref() {
            Self::migrate_sqlite(path).await?;
            info!("database migrated backend=sqlite path={}", path);
            return Ok(());
        }
        info!("database migrated backend=memory");
        Ok(())
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: &Pool) -> Result<(), DatabaseError> {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS kv_entries (
                    entry_key TEXT PRIMARY KEY,
                    entry_value TEXT NOT NULL,
                    expires_at BIGINT,
                    updated_at BIGINT NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_kv_entries_expires_at ON kv_entries(expires_at)",
                "CREATE INDEX IF NOT EXISTS idx_kv_entries_prefix ON kv_entries(entry_key text_pattern_ops)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    pub(crate) async fn migrate_sqlite(path: &str) -> Result<(), DatabaseError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = crate::db::sqlite::establish_connection(&path)?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS kv_entries (
                    entry_key TEXT PRIMARY KEY NOT NULL,
                    entry_value TEXT NOT NULL,
                    expires_at BIGINT,
                    updated_at BIGINT NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_kv_entries_expires_at ON kv_entries(expires_at)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    pub fn link_store(&self) -> LinkStore {
        LinkStore::new(self.kv.clone())
    }

    pub fn message_store(&self) -> MessageStore {
        MessageStore::new(self.kv.clone())
    }

    pub fn user_store(&self) -> UserStore {
        UserStore::new(self.kv.clone())
    }

    pub fn subscription_store(&self) -> SubscriptionStore {
        SubscriptionStore::new(self.kv.clone())
    }

    pub fn marker_store(&self) -> MarkerStore {
        MarkerStore::new(self.kv.clone())
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}
