use async_trait::async_trait;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::Text;

use super::DatabaseError;
use super::manager::Pool;
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

fn read_live(conn: &mut PgConnection, key: &str, now: i64) -> QueryResult<Option<String>> {
    use crate::db::schema::kv_entries::dsl::*;
    kv_entries
        .filter(entry_key.eq(key))
        .filter(expires_at.is_null().or(expires_at.gt(now)))
        .select(entry_value)
        .first::<String>(conn)
        .optional()
}

fn apply_op(conn: &mut PgConnection, op: &KvOp, now: i64) -> QueryResult<()> {
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

/// Serializes writers per key for the rest of the transaction; keys are
/// locked in sorted order so concurrent transactions cannot deadlock.
fn lock_keys(conn: &mut PgConnection, conditions: &[KvCondition], ops: &[KvOp]) -> QueryResult<()> {
    let mut keys: Vec<&str> = conditions
        .iter()
        .map(|c| c.key.as_str())
        .chain(ops.iter().map(KvOp::key))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    for key in keys {
        diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind::<Text, _>(key)
            .execute(conn)?;
    }
    Ok(())
}

pub struct PostgresKvStore {
    pool: Pool,
}

impl PostgresKvStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for PostgresKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let pool = self.pool.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
            read_live(&mut conn, &key, now_millis()).map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, DatabaseError> {
        let pool = self.pool.clone();
        let pattern = format!("{}%", super::escape_like(prefix));
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
            use crate::db::schema::kv_entries::dsl::*;
            let now = now_millis();
            kv_entries
                .filter(entry_key.like(pattern).escape('\\'))
                .filter(expires_at.is_null().or(expires_at.gt(now)))
                .order(entry_key.asc())
                .select(DbEntry::as_select())
                .load::<DbEntry>(&mut conn)
                .map(|rows| {
                    rows.into_iter()
                        .map(|row| (row.entry_key, row.entry_value))
                        .collect()
                })
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn transact(
        &self,
        conditions: Vec<KvCondition>,
        ops: Vec<KvOp>,
    ) -> Result<bool, DatabaseError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
            conn.transaction::<bool, diesel::result::Error, _>(|conn| {
                lock_keys(conn, &conditions, &ops)?;
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
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
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
