use async_trait::async_trait;
use holdfast_order::models::OrderAggregate;
use holdfast_order::{OrderRepository, StoreError};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Orders persisted whole as JSONB, one row per aggregate. The columns
/// beside `body` exist only for lookups and the version check.
pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_many(&self, query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>) -> Result<Vec<OrderAggregate>, StoreError> {
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        rows.iter().map(decode).collect()
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<OrderAggregate, StoreError> {
    let Json(mut agg): Json<OrderAggregate> = row.try_get("body").map_err(backend)?;
    let version: i64 = row.try_get("version").map_err(backend)?;
    agg.version = version as u64;
    Ok(agg)
}

fn awaiting_inspection(agg: &OrderAggregate) -> bool {
    let o = &agg.order;
    o.delivery.buyer_confirmed() && !o.inspection.inspected() && !o.is_closed()
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn insert(&self, agg: &mut OrderAggregate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO escrow_orders (id, reference, merchant_id, version, awaiting_inspection, closed, body, created_at)
            VALUES ($1, $2, $3, 1, $4, $5, $6, $7)
            "#,
        )
        .bind(agg.id())
        .bind(agg.reference())
        .bind(&agg.order.merchant_id)
        .bind(awaiting_inspection(agg))
        .bind(agg.order.is_closed())
        .bind(Json(&*agg))
        .bind(agg.order.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                agg.version = 1;
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::Duplicate(agg.id())),
            Err(e) => Err(backend(e)),
        }
    }

    async fn load(&self, id: Uuid) -> Result<Option<OrderAggregate>, StoreError> {
        let row = sqlx::query("SELECT version, body FROM escrow_orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(decode).transpose()
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<OrderAggregate>, StoreError> {
        let row = sqlx::query("SELECT version, body FROM escrow_orders WHERE reference = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(decode).transpose()
    }

    async fn save(&self, agg: &mut OrderAggregate) -> Result<(), StoreError> {
        let expected = agg.version as i64;
        let updated = sqlx::query(
            r#"
            UPDATE escrow_orders
            SET version = version + 1, awaiting_inspection = $3, closed = $4, body = $5, updated_at = NOW()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(agg.id())
        .bind(expected)
        .bind(awaiting_inspection(agg))
        .bind(agg.order.is_closed())
        .bind(Json(&*agg))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 1 {
            agg.version += 1;
            return Ok(());
        }

        let found: Option<i64> = sqlx::query_scalar("SELECT version FROM escrow_orders WHERE id = $1")
            .bind(agg.id())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match found {
            Some(found) => Err(StoreError::Conflict {
                id: agg.id(),
                expected: agg.version,
                found: found as u64,
            }),
            None => Err(StoreError::Missing(agg.id())),
        }
    }

    async fn awaiting_inspection(&self) -> Result<Vec<OrderAggregate>, StoreError> {
        self.fetch_many(sqlx::query(
            "SELECT version, body FROM escrow_orders WHERE awaiting_inspection AND NOT closed",
        ))
        .await
    }

    async fn list_for_merchant(&self, merchant_id: &str) -> Result<Vec<OrderAggregate>, StoreError> {
        self.fetch_many(
            sqlx::query("SELECT version, body FROM escrow_orders WHERE merchant_id = $1 ORDER BY created_at")
                .bind(merchant_id),
        )
        .await
    }
}
