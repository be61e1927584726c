use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use super::identity::CallerIdentity;
use crate::domain::order::{CreateOrder, Order, OrderError, UpdateStatus};
use crate::orchestrator::OrderOrchestrator;
use crate::store::OrderFilter;

// ============================================================================
// Order Service - RPC surface
// ============================================================================
//
// One method per RPC, shaped like a tonic service: `Request<T>` in,
// `Result<Response<U>, Status>` out. The caller identity travels in request
// metadata (see `identity`).
//
// Authorization:
// - Clients only see, create and cancel their own orders.
// - Admins see and cancel any order; only admins change status.
//
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOneOrder {
    pub id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderStatus {
    pub id: Uuid,
    #[serde(flatten)]
    pub update: UpdateStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrder {
    pub id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHistory {
    pub client_id: String,
}

pub struct OrderService {
    orchestrator: Arc<OrderOrchestrator>,
}

impl OrderService {
    pub fn new(orchestrator: Arc<OrderOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn create_order(&self, request: Request<CreateOrder>) -> Result<Response<Order>, Status> {
        let caller = CallerIdentity::from_metadata(request.metadata())?;
        let mut command = request.into_inner();

        if !caller.is_admin() {
            if command.client_id.trim().is_empty() {
                command.client_id = caller.user_id.clone();
            } else if command.client_id != caller.user_id {
                return Err(denied(&caller, "clients can only order for themselves").into());
            }
            if command.client_email.trim().is_empty() {
                if let Some(email) = &caller.email {
                    command.client_email = email.clone();
                }
            }
        }

        let order = self.orchestrator.create(command).await?;
        Ok(Response::new(order))
    }

    pub async fn find_all_orders(&self, request: Request<OrderFilter>) -> Result<Response<Vec<Order>>, Status> {
        let caller = CallerIdentity::from_metadata(request.metadata())?;
        let mut filter = request.into_inner();

        if !caller.is_admin() {
            if filter.client_id.as_ref().is_some_and(|id| *id != caller.user_id) {
                return Err(denied(&caller, "clients can only list their own orders").into());
            }
            filter.client_id = Some(caller.user_id.clone());
        }

        let orders = self.orchestrator.find_all(&filter).await?;
        Ok(Response::new(orders))
    }

    pub async fn find_one_order(&self, request: Request<FindOneOrder>) -> Result<Response<Order>, Status> {
        let caller = CallerIdentity::from_metadata(request.metadata())?;
        let id = request.into_inner().id;

        let order = self.orchestrator.get(id).await?;
        authorize_owner(&caller, &order)?;
        Ok(Response::new(order))
    }

    pub async fn update_order_status(&self, request: Request<UpdateOrderStatus>) -> Result<Response<Order>, Status> {
        let caller = CallerIdentity::from_metadata(request.metadata())?;
        if !caller.is_admin() {
            return Err(denied(&caller, "only administrators can change order status").into());
        }

        let UpdateOrderStatus { id, update } = request.into_inner();
        let order = self.orchestrator.update_status(id, update).await?;
        Ok(Response::new(order))
    }

    pub async fn cancel_order(&self, request: Request<CancelOrder>) -> Result<Response<Order>, Status> {
        let caller = CallerIdentity::from_metadata(request.metadata())?;
        let CancelOrder { id, reason } = request.into_inner();

        // Ownership is checked against the current order before mutating it.
        if !caller.is_admin() {
            let order = self.orchestrator.get(id).await?;
            authorize_owner(&caller, &order)?;
        }

        let order = self.orchestrator.cancel(id, reason.as_deref()).await?;
        Ok(Response::new(order))
    }

    pub async fn get_client_history(&self, request: Request<ClientHistory>) -> Result<Response<Vec<Order>>, Status> {
        let caller = CallerIdentity::from_metadata(request.metadata())?;
        let client_id = request.into_inner().client_id;

        if !caller.is_admin() && client_id != caller.user_id {
            return Err(denied(&caller, "clients can only read their own history").into());
        }

        let orders = self.orchestrator.client_history(&client_id).await?;
        Ok(Response::new(orders))
    }
}

fn authorize_owner(caller: &CallerIdentity, order: &Order) -> Result<(), OrderError> {
    if caller.is_admin() || order.client_id == caller.user_id {
        Ok(())
    } else {
        Err(denied(caller, "order belongs to another client"))
    }
}

fn denied(caller: &CallerIdentity, reason: &str) -> OrderError {
    tracing::warn!(user_id = %caller.user_id, role = %caller.role, reason, "Permission denied");
    OrderError::PermissionDenied(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::aggregate::tests::create_command;
    use crate::domain::order::OrderStatus;
    use crate::orchestrator::tests::{harness, Harness};
    use tonic::Code;

    fn request<T>(body: T, user_id: &str, role: &str) -> Request<T> {
        let mut request = Request::new(body);
        request.metadata_mut().insert("x-user-id", user_id.parse().unwrap());
        request.metadata_mut().insert("x-user-role", role.parse().unwrap());
        request
    }

    async fn service() -> (Harness, OrderService) {
        let h = harness().await;
        let service = OrderService::new(h.orchestrator.clone());
        (h, service)
    }

    async fn placed(service: &OrderService) -> Order {
        service
            .create_order(request(create_command(), "client-1", "client"))
            .await
            .unwrap()
            .into_inner()
    }

    #[tokio::test]
    async fn test_client_creates_own_order_with_implicit_client_id() {
        let (_h, service) = service().await;
        let mut command = create_command();
        command.client_id = String::new();

        let order = service
            .create_order(request(command, "client-1", "client"))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(order.client_id, "client-1");
        assert_eq!(order.status(), OrderStatus::Pendiente);
    }

    #[tokio::test]
    async fn test_client_cannot_order_for_someone_else() {
        let (h, service) = service().await;

        let status = service
            .create_order(request(create_command(), "client-2", "client"))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::PermissionDenied);
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthenticated() {
        let (_h, service) = service().await;

        let status = service
            .find_one_order(Request::new(FindOneOrder { id: Uuid::new_v4() }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn test_find_one_respects_ownership() {
        let (_h, service) = service().await;
        let order = placed(&service).await;

        let own = service
            .find_one_order(request(FindOneOrder { id: order.id }, "client-1", "client"))
            .await;
        let other = service
            .find_one_order(request(FindOneOrder { id: order.id }, "client-2", "client"))
            .await;
        let admin = service
            .find_one_order(request(FindOneOrder { id: order.id }, "ops", "admin"))
            .await;

        assert!(own.is_ok());
        assert_eq!(other.unwrap_err().code(), Code::PermissionDenied);
        assert!(admin.is_ok());
    }

    #[tokio::test]
    async fn test_find_all_scopes_clients_to_their_orders() {
        let (_h, service) = service().await;
        placed(&service).await;
        let mut other = create_command();
        other.client_id = "client-2".into();
        service.create_order(request(other, "ops", "admin")).await.unwrap();

        let mine = service
            .find_all_orders(request(OrderFilter::default(), "client-1", "client"))
            .await
            .unwrap()
            .into_inner();
        let all = service
            .find_all_orders(request(OrderFilter::default(), "ops", "admin"))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].client_id, "client-1");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_only_admin_updates_status() {
        let (_h, service) = service().await;
        let order = placed(&service).await;
        let body = UpdateOrderStatus {
            id: order.id,
            update: UpdateStatus::to(OrderStatus::EnProcesamiento),
        };

        let client = service
            .update_order_status(request(body.clone(), "client-1", "client"))
            .await
            .unwrap_err();
        let admin = service
            .update_order_status(request(body, "ops", "admin"))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(client.code(), Code::PermissionDenied);
        assert_eq!(admin.status(), OrderStatus::EnProcesamiento);
    }

    #[tokio::test]
    async fn test_ship_without_tracking_is_invalid_argument() {
        let (_h, service) = service().await;
        let order = placed(&service).await;
        service
            .update_order_status(request(
                UpdateOrderStatus {
                    id: order.id,
                    update: UpdateStatus::to(OrderStatus::EnProcesamiento),
                },
                "ops",
                "admin",
            ))
            .await
            .unwrap();

        let status = service
            .update_order_status(request(
                UpdateOrderStatus {
                    id: order.id,
                    update: UpdateStatus::to(OrderStatus::Enviado),
                },
                "ops",
                "admin",
            ))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_cancel_checks_ownership_before_mutating() {
        let (h, service) = service().await;
        let order = placed(&service).await;
        let cancel = CancelOrder {
            id: order.id,
            reason: Some("no longer needed".into()),
        };

        let other = service
            .cancel_order(request(cancel.clone(), "client-2", "client"))
            .await
            .unwrap_err();
        let stored = h.orchestrator.get(order.id).await.unwrap();

        assert_eq!(other.code(), Code::PermissionDenied);
        assert_eq!(stored.status(), OrderStatus::Pendiente);

        let cancelled = service
            .cancel_order(request(cancel, "client-1", "client"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(cancelled.status(), OrderStatus::Cancelado);
        assert_eq!(cancelled.cancellation_reason(), Some("no longer needed"));
    }

    #[tokio::test]
    async fn test_client_history() {
        let (_h, service) = service().await;
        placed(&service).await;
        placed(&service).await;

        let history = service
            .get_client_history(request(
                ClientHistory {
                    client_id: "client-1".into(),
                },
                "client-1",
                "client",
            ))
            .await
            .unwrap()
            .into_inner();
        let foreign = service
            .get_client_history(request(
                ClientHistory {
                    client_id: "client-1".into(),
                },
                "client-2",
                "client",
            ))
            .await
            .unwrap_err();

        assert_eq!(history.len(), 2);
        assert!(history[0].created_at >= history[1].created_at);
        assert_eq!(foreign.code(), Code::PermissionDenied);
    }
}
