use std::sync::Arc;

use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use super::DatabaseError;
use super::stores::{KvCondition, KvOp, KvStore, expiry_millis, now_millis};
use crate::db::schema::kv_entries;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = kv_entries)]
struct DbEntry {
    entry_key: String,
    entry_value: String,
    expires_at: Option<i64>,
}

#[derive(Insertable)]
#[diesel(table_name = kv_entries)]
struct NewEntry<'a> {
    entry_key: &'a str,
    entry_value: &'a str,
    expires_at: Option<i64>,
    updated_at: i64,
}

pub(crate) fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    let mut conn =
        SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))?;
    conn.batch_execute("PRAGMA busy_timeout = 5000;")
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    Ok(conn)
}

fn read_live(conn: &mut SqliteConnection, key: &str, now: i64) -> QueryResult<Option<String>> {
    use crate::db::schema::kv_entries::dsl::*;
    kv_entries
        .filter(entry_key.eq(key))
        .filter(expires_at.is_null().or(expires_at.gt(now)))
        .select(entry_value)
        .first::<String>(conn)
        .optional()
}

fn apply_op(conn: &mut SqliteConnection, op: &KvOp, now: i64) -> QueryResult<()> {
    use crate::db::schema::kv_entries::dsl::*;
    match op {
        KvOp::Put { key, value, ttl } => {
            let expiry = expiry_millis(*ttl);
            diesel::insert_into(kv_entries)
                .values(&NewEntry {
                    entry_key: key,
                    entry_value: value,
                    expires_at: expiry,
                    updated_at: now,
                })
                .on_conflict(entry_key)
                .do_update()
                .set((
                    entry_value.eq(value.as_str()),
                    expires_at.eq(expiry),
                    updated_at.eq(now),
                ))
                .execute(conn)?;
        }
        KvOp::Delete { key } => {
            diesel::delete(kv_entries.filter(entry_key.eq(key.as_str()))).execute(conn)?;
        }
    }
    Ok(())
}

pub struct SqliteKvStore {
    db_path: Arc<String>,
}

impl SqliteKvStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let db_path = self.db_path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            read_live(&mut conn, &key, now_millis()).map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, DatabaseError> {
        let db_path = self.db_path.clone();
        let pattern = format!("{}%", super::escape_like(prefix));
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::kv_entries::dsl::*;
            let now = now_millis();
            let rows = kv_entries
                .filter(entry_key.like(pattern).escape('\\'))
                .filter(expires_at.is_null().or(expires_at.gt(now)))
                .order(entry_key.asc())
                .select(DbEntry::as_select())
                .load::<DbEntry>(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(rows
                .into_iter()
                .filter(|row| row.entry_key.starts_with(&prefix) && row.expires_at.is_none_or(|at| at > now))
                .map(|row| (row.entry_key, row.entry_value))
                .collect())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn transact(
        &self,
        conditions: Vec<KvCondition>,
        ops: Vec<KvOp>,
    ) -> Result<bool, DatabaseError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            conn.immediate_transaction::<bool, diesel::result::Error, _>(|conn| {
                let now = now_millis();
                for condition in &conditions {
                    let current = read_live(conn, &condition.key, now)?;
                    if current != condition.expected {
                        return Ok(false);
                    }
                }
                for op in &ops {
                    apply_op(conn, op, now)?;
                }
                Ok(true)
            })
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn purge_expired(&self) -> Result<u64, DatabaseError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::kv_entries::dsl::*;
            diesel::delete(kv_entries.filter(expires_at.le(now_millis())))
                .execute(&mut conn)
                .map(|count| count as u64)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}
