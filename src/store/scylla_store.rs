use async_trait::async_trait;
use scylla::client::session::Session;
use scylla::response::query_result::QueryResult;
use scylla::value::{CqlValue, Row};
use std::sync::Arc;
use uuid::Uuid;

use super::{newest_first, OrderFilter, OrderStore, StoreError};
use crate::domain::order::Order;

// ============================================================================
// ScyllaDB Order Store
// ============================================================================
//
// One row per order. The aggregate is kept as a JSON document in `body`;
// the columns next to it exist for lookups and for the version check.
// Writes are lightweight transactions:
// - create: INSERT ... IF NOT EXISTS
// - save:   UPDATE ... IF version = <loaded version>
//
// ============================================================================

const CREATE_ORDERS_TABLE: &str = "CREATE TABLE IF NOT EXISTS orders (
    id uuid PRIMARY KEY,
    client_id text,
    status text,
    version bigint,
    is_deleted boolean,
    created_at timestamp,
    body text
)";

const CREATE_CLIENT_INDEX: &str = "CREATE INDEX IF NOT EXISTS orders_by_client ON orders (client_id)";

pub struct ScyllaOrderStore {
    session: Arc<Session>,
}

impl ScyllaOrderStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Create the table and index if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.session
            .query_unpaged(CREATE_ORDERS_TABLE, &[])
            .await
            .map_err(StoreError::backend)?;
        self.session
            .query_unpaged(CREATE_CLIENT_INDEX, &[])
            .await
            .map_err(StoreError::backend)?;

        tracing::info!("Order tables ready");
        Ok(())
    }

    async fn select_bodies(&self, filter: &OrderFilter) -> Result<Vec<String>, StoreError> {
        let result = match (&filter.order_id, &filter.client_id) {
            (Some(id), _) => self
                .session
                .query_unpaged("SELECT body FROM orders WHERE id = ?", (*id,))
                .await,
            (None, Some(client_id)) => self
                .session
                .query_unpaged("SELECT body FROM orders WHERE client_id = ?", (client_id,))
                .await,
            (None, None) => self.session.query_unpaged("SELECT body FROM orders", &[]).await,
        }
        .map_err(StoreError::backend)?;

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(Vec::new()),
        };

        let mut bodies = Vec::new();
        for row in rows_result.rows::<(String,)>().map_err(StoreError::backend)? {
            let (body,) = row.map_err(StoreError::backend)?;
            bodies.push(body);
        }
        Ok(bodies)
    }
}

fn encode(order: &Order) -> Result<String, StoreError> {
    serde_json::to_string(order).map_err(StoreError::backend)
}

fn decode(body: &str) -> Result<Order, StoreError> {
    serde_json::from_str(body).map_err(StoreError::backend)
}

/// Outcome of a lightweight transaction: `Ok(true)` when applied.
/// When not applied, the second column holds the current version if the row exists.
fn lwt_outcome(result: QueryResult) -> Result<(bool, Option<i64>), StoreError> {
    let rows_result = result.into_rows_result().map_err(StoreError::backend)?;
    let row = rows_result
        .maybe_first_row::<Row>()
        .map_err(StoreError::backend)?
        .ok_or_else(|| StoreError::backend(anyhow::anyhow!("lightweight transaction returned no rows")))?;

    let applied = matches!(row.columns.first(), Some(Some(CqlValue::Boolean(true))));
    let current_version = row.columns.iter().skip(1).find_map(|column| match column {
        Some(CqlValue::BigInt(version)) => Some(*version),
        _ => None,
    });
    Ok((applied, current_version))
}

#[async_trait]
impl OrderStore for ScyllaOrderStore {
    async fn create(&self, mut order: Order) -> Result<Order, StoreError> {
        order.version = 1;
        let body = encode(&order)?;

        let result = self
            .session
            .query_unpaged(
                "INSERT INTO orders (id, client_id, status, version, is_deleted, created_at, body)
                 VALUES (?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS",
                (
                    order.id,
                    &order.client_id,
                    order.status().as_str(),
                    order.version,
                    order.is_deleted,
                    order.created_at,
                    &body,
                ),
            )
            .await
            .map_err(StoreError::backend)?;

        let (applied, _) = lwt_outcome(result)?;
        if !applied {
            return Err(StoreError::Duplicate(order.id));
        }

        tracing::debug!(order_id = %order.id, "Inserted order row");
        Ok(order)
    }

    async fn find_by_id(&self, id: Uuid, exclude_deleted: bool) -> Result<Option<Order>, StoreError> {
        let result = self
            .session
            .query_unpaged("SELECT body FROM orders WHERE id = ?", (id,))
            .await
            .map_err(StoreError::backend)?;

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(None),
        };

        match rows_result.maybe_first_row::<(String,)>().map_err(StoreError::backend)? {
            Some((body,)) => {
                let order = decode(&body)?;
                Ok((!(exclude_deleted && order.is_deleted())).then_some(order))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, mut order: Order) -> Result<Order, StoreError> {
        let expected = order.version;
        order.version += 1;
        let body = encode(&order)?;

        let result = self
            .session
            .query_unpaged(
                "UPDATE orders SET status = ?, version = ?, is_deleted = ?, body = ?
                 WHERE id = ? IF version = ?",
                (
                    order.status().as_str(),
                    order.version,
                    order.is_deleted,
                    &body,
                    order.id,
                    expected,
                ),
            )
            .await
            .map_err(StoreError::backend)?;

        match lwt_outcome(result)? {
            (true, _) => {
                tracing::debug!(order_id = %order.id, version = order.version, "Updated order row");
                Ok(order)
            }
            (false, Some(_)) => Err(StoreError::VersionConflict { id: order.id, expected }),
            (false, None) => Err(StoreError::NotFound(order.id)),
        }
    }

    async fn query(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let mut orders = Vec::new();
        for body in self.select_bodies(filter).await? {
            let order = decode(&body)?;
            if filter.matches(&order) {
                orders.push(order);
            }
        }
        newest_first(&mut orders);
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::aggregate::tests::create_command;
    use chrono::Utc;

    #[test]
    fn test_body_round_trip_keeps_version_and_status() {
        let mut order = Order::create(create_command(), Utc::now());
        order.version = 7;
        order.cancel(Some("duplicate"), Utc::now()).unwrap();

        let decoded = decode(&encode(&order).unwrap()).unwrap();

        assert_eq!(decoded, order);
        assert_eq!(decoded.version(), 7);
        assert_eq!(decoded.cancellation_reason(), Some("duplicate"));
    }

    #[test]
    fn test_corrupt_body_is_a_backend_error() {
        assert!(matches!(decode("{not json"), Err(StoreError::Backend(_))));
    }
}
