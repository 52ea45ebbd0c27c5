//! PostgreSQL document store (`parts` table)

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use super::{dedupe_last, DocumentStore, UpsertCounts};
use crate::error::SyncResult;
use crate::models::PartRecord;

/// Bind parameters per part row
const COLUMNS_PER_ROW: usize = 22;

/// Rows per statement, under PostgreSQL's 65535 bind parameter limit
const MAX_ROWS_PER_STATEMENT: usize = 65_535 / COLUMNS_PER_ROW;

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_chunk(&self, chunk: &[&PartRecord]) -> SyncResult<UpsertCounts> {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            INSERT INTO parts (
                part_number, integration_id, file_name, integration_name,
                description, brand, supplier, price, currency, quantity,
                stock_status, min_order_qty, stock_code, origin, weight,
                weight_unit, volume, delivery_days, category, subcategory,
                imported_at, last_updated
            )
            "#,
        );

        query_builder.push_values(chunk.iter(), |mut b, record| {
            b.push_bind(&record.part_number)
                .push_bind(record.integration_id)
                .push_bind(&record.file_name)
                .push_bind(&record.integration_name)
                .push_bind(&record.description)
                .push_bind(&record.brand)
                .push_bind(&record.supplier)
                .push_bind(record.price)
                .push_bind(&record.currency)
                .push_bind(record.quantity)
                .push_bind(record.stock_status.as_str())
                .push_bind(record.min_order_qty)
                .push_bind(&record.stock_code)
                .push_bind(&record.origin)
                .push_bind(record.weight)
                .push_bind(&record.weight_unit)
                .push_bind(record.volume)
                .push_bind(record.delivery_days)
                .push_bind(&record.category)
                .push_bind(&record.subcategory)
                .push_bind(record.imported_at)
                .push_bind(record.last_updated);
        });

        // xmax is 0 only for freshly inserted tuples
        query_builder.push(
            r#"
            ON CONFLICT (part_number, integration_id, file_name) DO UPDATE SET
                integration_name = EXCLUDED.integration_name,
                description = EXCLUDED.description,
                brand = EXCLUDED.brand,
                supplier = EXCLUDED.supplier,
                price = EXCLUDED.price,
                currency = EXCLUDED.currency,
                quantity = EXCLUDED.quantity,
                stock_status = EXCLUDED.stock_status,
                min_order_qty = EXCLUDED.min_order_qty,
                stock_code = EXCLUDED.stock_code,
                origin = EXCLUDED.origin,
                weight = EXCLUDED.weight,
                weight_unit = EXCLUDED.weight_unit,
                volume = EXCLUDED.volume,
                delivery_days = EXCLUDED.delivery_days,
                category = EXCLUDED.category,
                subcategory = EXCLUDED.subcategory,
                last_updated = EXCLUDED.last_updated
            RETURNING (xmax = 0) AS inserted
            "#,
        );

        let rows = query_builder.build().fetch_all(&self.pool).await?;

        let mut counts = UpsertCounts::default();
        for row in rows {
            if row.try_get::<bool, _>("inserted")? {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn bulk_upsert(&self, records: &[PartRecord]) -> SyncResult<UpsertCounts> {
        let unique = dedupe_last(records);
        if unique.is_empty() {
            return Ok(UpsertCounts::default());
        }

        let mut total = UpsertCounts::default();
        for chunk in unique.chunks(MAX_ROWS_PER_STATEMENT) {
            total += self.upsert_chunk(chunk).await?;
        }

        debug!(
            records = records.len(),
            duplicates = records.len() - unique.len(),
            inserted = total.inserted,
            updated = total.updated,
            "Upserted parts"
        );
        Ok(total)
    }

    async fn delete_by_integration(&self, integration_id: Uuid) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM parts WHERE integration_id = $1")
            .bind(integration_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
