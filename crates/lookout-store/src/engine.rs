//! The generic persistence engine.
//!
//! Every record lives as one row in the shared payload table; indexed types
//! additionally keep one denormalized row in their per-type index table.
//! Both rows are created, updated, and deleted together inside a single
//! transaction — a partially written pair is never observable (invariant:
//! matching identity and version at every committed point in time).
//!
//! Reads distinguish three outcomes everywhere: absent (`None` / empty vec),
//! failed (`Err`), and succeeded-with-N-rows (returned counts). Callers must
//! not conflate them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, error, warn};

use lookout_core::registry::{IndexSchema, PAYLOAD_COLUMNS, PAYLOAD_TABLE};
use lookout_core::{Filter, Predicate, Record, RecordMeta, TypeRegistry, Value};

use crate::error::StoreError;
use crate::sql::{push_nullable, push_predicate};

/// Records per transaction in [`RecordStore::batch_update`].
pub const MAX_BATCH_SIZE: usize = 64;

// ── Row mapping ─────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct PayloadRow {
    id: i64,
    record_type: String,
    payload: String,
    version: i32,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
}

/// Outcome of a [`RecordStore::batch_update`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Total payload rows updated.
    pub updated: u64,
    /// Records skipped after failing their individual fallback update.
    pub skipped: usize,
}

// ── Store ───────────────────────────────────────────────────────────

/// CRUD + filtered listing over the two-table storage model.
#[derive(Clone)]
pub struct RecordStore {
    pool: PgPool,
    registry: Arc<TypeRegistry>,
}

impl RecordStore {
    pub fn new(pool: PgPool, registry: Arc<TypeRegistry>) -> Self {
        Self { pool, registry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    // ── Create ──────────────────────────────────────────────────────

    /// Persist a new record and return its generated id. The record must
    /// not have an id yet; its meta is stamped in memory on success and
    /// restored untouched on failure.
    pub async fn create<R: Record>(&self, record: &mut R) -> Result<i64, StoreError> {
        if record.meta().id.is_some() {
            return Err(StoreError::IdAlreadyAssigned);
        }
        let saved = record.meta().clone();
        match self.try_create(record).await {
            Ok(id) => {
                debug!(id, record_type = %R::record_type(), "created record");
                Ok(id)
            }
            Err(e) => {
                *record.meta_mut() = saved;
                Err(e)
            }
        }
    }

    async fn try_create<R: Record>(&self, record: &mut R) -> Result<i64, StoreError> {
        let now = Utc::now();
        {
            let meta = record.meta_mut();
            if meta.create_time.is_none() {
                meta.create_time = Some(now);
            }
            meta.update_time = Some(now);
            if meta.version == 0 {
                meta.version = 1;
            }
        }
        let payload = serde_json::to_string(record)?;
        let meta = record.meta().clone();
        let tag = self.registry.tag(R::record_type());

        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO record_payload (record_type, payload, version, create_time, update_time)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(tag)
        .bind(&payload)
        .bind(meta.version)
        .bind(meta.create_time)
        .bind(meta.update_time)
        .fetch_one(&mut *tx)
        .await?;

        record.meta_mut().id = Some(id);

        if let Some(schema) = self.registry.index_schema(R::record_type()) {
            self.insert_index_row(&mut tx, schema, id, &record.index_values(), &meta)
                .await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    // ── Update ──────────────────────────────────────────────────────

    /// Update an existing record (last-writer-wins). Returns the number of
    /// payload rows affected: 0 means the record is gone — a miss, not an
    /// error.
    pub async fn update<R: Record>(&self, record: &mut R) -> Result<u64, StoreError> {
        self.update_with(record, None).await
    }

    /// Update guarded by a predicate over the payload-table columns
    /// (e.g. `version = n` for optimistic concurrency). 0 rows means the
    /// record is gone or the guard did not match.
    pub async fn update_guarded<R: Record>(
        &self,
        record: &mut R,
        guard: &Predicate,
    ) -> Result<u64, StoreError> {
        self.update_with(record, Some(guard)).await
    }

    async fn update_with<R: Record>(
        &self,
        record: &mut R,
        guard: Option<&Predicate>,
    ) -> Result<u64, StoreError> {
        if record.meta().id.is_none() {
            return Err(StoreError::MissingId);
        }
        if let Some(guard) = guard {
            guard.validate(PAYLOAD_TABLE, PAYLOAD_COLUMNS)?;
        }
        let saved = record.meta().clone();
        let result = async {
            let mut tx = self.pool.begin().await?;
            let rows = self.update_in(&mut tx, record, guard).await?;
            tx.commit().await?;
            Ok::<u64, StoreError>(rows)
        }
        .await;
        match result {
            Ok(0) => {
                // Nothing was written; undo the in-memory stamps.
                *record.meta_mut() = saved;
                Ok(0)
            }
            Ok(rows) => Ok(rows),
            Err(e) => {
                *record.meta_mut() = saved;
                Err(e)
            }
        }
    }

    /// Update inside a caller-owned transaction. Stamps `update_time` and
    /// bumps `version` in memory; the caller owns restoring meta if its
    /// transaction fails. This is the unit-of-work seam the task queue
    /// builds its leasing protocol on.
    pub async fn update_in<R: Record>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &mut R,
        guard: Option<&Predicate>,
    ) -> Result<u64, StoreError> {
        let id = record.meta().id.ok_or(StoreError::MissingId)?;
        {
            let meta = record.meta_mut();
            meta.update_time = Some(Utc::now());
            meta.version += 1;
        }
        let payload = serde_json::to_string(record)?;
        let meta = record.meta().clone();
        let tag = self.registry.tag(R::record_type());

        let mut builder = QueryBuilder::new("UPDATE record_payload SET payload = ");
        builder.push_bind(payload);
        builder.push(", version = ");
        builder.push_bind(meta.version);
        builder.push(", update_time = ");
        builder.push_bind(meta.update_time);
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND record_type = ");
        builder.push_bind(tag);
        if let Some(guard) = guard {
            builder.push(" AND ");
            push_predicate(&mut builder, guard);
        }
        let rows = builder.build().execute(&mut **tx).await?.rows_affected();

        match rows {
            0 => Ok(0),
            1 => {
                if let Some(schema) = self.registry.index_schema(R::record_type()) {
                    let index_rows = self
                        .update_index_row(tx, schema, id, &record.index_values(), &meta)
                        .await?;
                    if index_rows != 1 {
                        error!(
                            id,
                            index_rows,
                            table = schema.table,
                            "payload row updated but index row count is off"
                        );
                        return Err(StoreError::Consistency(format!(
                            "payload row {} updated but {} rows affected in '{}'",
                            id, index_rows, schema.table
                        )));
                    }
                }
                Ok(1)
            }
            n => {
                error!(id, rows = n, "single-id update touched more than one payload row");
                Err(StoreError::Consistency(format!(
                    "update of id {} touched {} payload rows",
                    id, n
                )))
            }
        }
    }

    /// Update many records, [`MAX_BATCH_SIZE`] per transaction. A failing
    /// chunk rolls back and degrades to one transaction per record so a
    /// single poison record cannot block the rest; records that still fail
    /// are skipped and reported in the outcome, never retried.
    pub async fn batch_update<R: Record>(
        &self,
        records: &mut [R],
    ) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        for chunk in records.chunks_mut(MAX_BATCH_SIZE) {
            let saved: Vec<RecordMeta> = chunk.iter().map(|r| r.meta().clone()).collect();
            let chunk_result = async {
                let mut tx = self.pool.begin().await?;
                let mut rows = 0u64;
                for record in chunk.iter_mut() {
                    rows += self.update_in(&mut tx, record, None).await?;
                }
                tx.commit().await?;
                Ok::<u64, StoreError>(rows)
            }
            .await;

            match chunk_result {
                Ok(rows) => outcome.updated += rows,
                Err(e) => {
                    warn!(error = %e, "batch update chunk failed, retrying records one by one");
                    for (record, meta) in chunk.iter_mut().zip(saved) {
                        *record.meta_mut() = meta;
                    }
                    for record in chunk.iter_mut() {
                        match self.update(record).await {
                            Ok(rows) => outcome.updated += rows,
                            Err(e) => {
                                outcome.skipped += 1;
                                warn!(
                                    error = %e,
                                    id = ?record.meta().id,
                                    "skipping record that failed individual update"
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Fetch by id. `None` when the row is absent or its type tag does not
    /// match the requested type.
    pub async fn get<R: Record>(&self, id: i64) -> Result<Option<R>, StoreError> {
        let row = sqlx::query_as::<_, PayloadRow>(
            "SELECT id, record_type, payload, version, create_time, update_time
             FROM record_payload WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        self.decode_optional(row)
    }

    /// Fetch by id inside a caller-owned transaction (sees its uncommitted
    /// writes and respects its locks).
    pub async fn get_in<R: Record>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
    ) -> Result<Option<R>, StoreError> {
        let row = sqlx::query_as::<_, PayloadRow>(
            "SELECT id, record_type, payload, version, create_time, update_time
             FROM record_payload WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        self.decode_optional(row)
    }

    /// Fetch a batch of ids. Missing or type-mismatched ids are simply
    /// absent from the result.
    pub async fn get_many<R: Record>(&self, ids: &[i64]) -> Result<Vec<R>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let tag = self.registry.tag(R::record_type());
        let rows = sqlx::query_as::<_, PayloadRow>(
            "SELECT id, record_type, payload, version, create_time, update_time
             FROM record_payload WHERE id = ANY($1) AND record_type = $2
             ORDER BY id ASC",
        )
        .bind(ids)
        .bind(tag)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| self.decode_row(row)).collect()
    }

    /// All records of the type, id-ascending.
    pub async fn get_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let tag = self.registry.tag(R::record_type());
        let rows = sqlx::query_as::<_, PayloadRow>(
            "SELECT id, record_type, payload, version, create_time, update_time
             FROM record_payload WHERE record_type = $1
             ORDER BY id ASC",
        )
        .bind(tag)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| self.decode_row(row)).collect()
    }

    /// One page of records of the type, id-ascending.
    pub async fn list<R: Record>(&self, limit: i64, offset: i64) -> Result<Vec<R>, StoreError> {
        if limit < 0 {
            return Err(lookout_core::FilterError::NegativeLimit(limit).into());
        }
        if offset < 0 {
            return Err(lookout_core::FilterError::NegativeOffset(offset).into());
        }
        let tag = self.registry.tag(R::record_type());
        let rows = sqlx::query_as::<_, PayloadRow>(
            "SELECT id, record_type, payload, version, create_time, update_time
             FROM record_payload WHERE record_type = $1
             ORDER BY id ASC LIMIT $2 OFFSET $3",
        )
        .bind(tag)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| self.decode_row(row)).collect()
    }

    // ── Filtered reads ──────────────────────────────────────────────

    /// Resolve the ids matching a filter via the index table, id-ascending,
    /// honoring limit/offset.
    pub async fn filter_ids(&self, filter: &Filter) -> Result<Vec<i64>, StoreError> {
        let schema = self
            .registry
            .index_schema(filter.record_type)
            .ok_or(StoreError::Unindexed(filter.record_type))?;
        filter.validate(schema)?;

        let mut builder =
            QueryBuilder::new(format!("SELECT base_id FROM {} WHERE ", schema.table));
        push_predicate(&mut builder, &filter.predicate);
        builder.push(" ORDER BY base_id ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }
        if let Some(offset) = filter.offset {
            builder.push(" OFFSET ");
            builder.push_bind(offset);
        }
        Ok(builder
            .build_query_scalar::<i64>()
            .fetch_all(&self.pool)
            .await?)
    }

    /// Two-step filtered read: resolve ids on the index table, then batch
    /// fetch the payload rows.
    pub async fn filter<R: Record>(&self, filter: &Filter) -> Result<Vec<R>, StoreError> {
        self.check_filter_type::<R>(filter)?;
        let ids = self.filter_ids(filter).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.get_many(&ids).await
    }

    /// Single-statement variant of [`filter`](Self::filter): payload joined
    /// to a subquery over the index table. Returns identical results for
    /// identical inputs, trading the second round trip for one plan.
    pub async fn filter_join<R: Record>(&self, filter: &Filter) -> Result<Vec<R>, StoreError> {
        self.check_filter_type::<R>(filter)?;
        let schema = self
            .registry
            .index_schema(filter.record_type)
            .ok_or(StoreError::Unindexed(filter.record_type))?;
        filter.validate(schema)?;

        let mut builder = QueryBuilder::new(
            "SELECT p.id, p.record_type, p.payload, p.version, p.create_time, p.update_time
             FROM record_payload p
             JOIN (SELECT base_id FROM ",
        );
        builder.push(schema.table);
        builder.push(" WHERE ");
        push_predicate(&mut builder, &filter.predicate);
        builder.push(" ORDER BY base_id ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }
        if let Some(offset) = filter.offset {
            builder.push(" OFFSET ");
            builder.push_bind(offset);
        }
        builder.push(") m ON m.base_id = p.id ORDER BY p.id ASC");

        let rows = builder
            .build_query_as::<PayloadRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|row| self.decode_row(row)).collect()
    }

    /// Count matching rows: the index table for indexed types, the payload
    /// table (by tag) for unindexed ones. Unindexed types cannot carry a
    /// predicate.
    pub async fn count<R: Record>(&self, predicate: Option<&Predicate>) -> Result<i64, StoreError> {
        match self.registry.index_schema(R::record_type()) {
            Some(schema) => {
                let mut builder = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", schema.table));
                if let Some(predicate) = predicate {
                    predicate.validate(schema.table, &schema.allowed_columns())?;
                    builder.push(" WHERE ");
                    push_predicate(&mut builder, predicate);
                }
                Ok(builder
                    .build_query_scalar::<i64>()
                    .fetch_one(&self.pool)
                    .await?)
            }
            None => {
                if predicate.is_some() {
                    return Err(StoreError::Unindexed(R::record_type()));
                }
                let tag = self.registry.tag(R::record_type());
                Ok(sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM record_payload WHERE record_type = $1",
                )
                .bind(tag)
                .fetch_one(&self.pool)
                .await?)
            }
        }
    }

    // ── Delete ──────────────────────────────────────────────────────

    pub async fn delete<R: Record>(&self, id: i64) -> Result<u64, StoreError> {
        self.delete_many::<R>(&[id]).await
    }

    /// Delete payload and index rows together. Returns payload rows
    /// removed. Related records (e.g. tasks referencing a job) are the
    /// caller's responsibility — nothing cascades.
    pub async fn delete_many<R: Record>(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let tag = self.registry.tag(R::record_type());
        let mut tx = self.pool.begin().await?;
        if let Some(schema) = self.registry.index_schema(R::record_type()) {
            let mut builder =
                QueryBuilder::new(format!("DELETE FROM {} WHERE base_id = ANY(", schema.table));
            builder.push_bind(ids.to_vec());
            builder.push(")");
            builder.build().execute(&mut *tx).await?;
        }
        let rows = sqlx::query("DELETE FROM record_payload WHERE id = ANY($1) AND record_type = $2")
            .bind(ids)
            .bind(tag)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        debug!(rows, record_type = %R::record_type(), "deleted records");
        Ok(rows)
    }

    /// Resolve ids on the index table, then delete by id.
    pub async fn delete_by_predicate<R: Record>(
        &self,
        predicate: &Predicate,
    ) -> Result<u64, StoreError> {
        let filter = Filter::new(R::record_type(), predicate.clone());
        let ids = self.filter_ids(&filter).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.delete_many::<R>(&ids).await
    }

    // ── Internals ───────────────────────────────────────────────────

    fn decode_optional<R: Record>(&self, row: Option<PayloadRow>) -> Result<Option<R>, StoreError> {
        let Some(row) = row else {
            return Ok(None);
        };
        if row.record_type != self.registry.tag(R::record_type()) {
            // The id exists but is some other type. Absent, by contract.
            return Ok(None);
        }
        Ok(Some(self.decode_row(row)?))
    }

    fn decode_row<R: Record>(&self, row: PayloadRow) -> Result<R, StoreError> {
        let mut record: R = serde_json::from_str(&row.payload)?;
        let meta = record.meta_mut();
        meta.id = Some(row.id);
        meta.version = row.version;
        meta.create_time = Some(row.create_time);
        meta.update_time = Some(row.update_time);
        Ok(record)
    }

    fn check_filter_type<R: Record>(&self, filter: &Filter) -> Result<(), StoreError> {
        if filter.record_type != R::record_type() {
            return Err(StoreError::Consistency(format!(
                "filter targets {} but {} was requested",
                filter.record_type,
                R::record_type()
            )));
        }
        Ok(())
    }

    fn check_projection(
        &self,
        schema: &IndexSchema,
        values: &[(&'static str, Option<Value>)],
    ) -> Result<(), StoreError> {
        let aligned = values.len() == schema.columns.len()
            && schema
                .columns
                .iter()
                .zip(values)
                .all(|(column, (name, _))| column.name == *name);
        if !aligned {
            error!(table = schema.table, "index projection does not match schema");
            return Err(StoreError::Consistency(format!(
                "index projection for '{}' does not match its schema",
                schema.table
            )));
        }
        Ok(())
    }

    async fn insert_index_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        schema: &IndexSchema,
        base_id: i64,
        values: &[(&'static str, Option<Value>)],
        meta: &RecordMeta,
    ) -> Result<(), StoreError> {
        self.check_projection(schema, values)?;

        let mut builder = QueryBuilder::new(format!("INSERT INTO {} (base_id", schema.table));
        for column in schema.columns {
            builder.push(", ");
            builder.push(column.name);
        }
        builder.push(", version, create_time, update_time) VALUES (");
        builder.push_bind(base_id);
        for (column, (_, value)) in schema.columns.iter().zip(values) {
            builder.push(", ");
            push_nullable(&mut builder, column.kind, value);
        }
        builder.push(", ");
        builder.push_bind(meta.version);
        builder.push(", ");
        builder.push_bind(meta.create_time);
        builder.push(", ");
        builder.push_bind(meta.update_time);
        builder.push(")");

        builder.build().execute(&mut **tx).await?;
        Ok(())
    }

    async fn update_index_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        schema: &IndexSchema,
        base_id: i64,
        values: &[(&'static str, Option<Value>)],
        meta: &RecordMeta,
    ) -> Result<u64, StoreError> {
        self.check_projection(schema, values)?;

        let mut builder = QueryBuilder::new(format!("UPDATE {} SET ", schema.table));
        for (i, (column, (_, value))) in schema.columns.iter().zip(values).enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push(column.name);
            builder.push(" = ");
            push_nullable(&mut builder, column.kind, value);
        }
        builder.push(", version = ");
        builder.push_bind(meta.version);
        builder.push(", update_time = ");
        builder.push_bind(meta.update_time);
        builder.push(" WHERE base_id = ");
        builder.push_bind(base_id);

        Ok(builder.build().execute(&mut **tx).await?.rows_affected())
    }
}
