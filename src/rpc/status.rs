use tonic::Status;

use crate::domain::order::{ErrorKind, OrderError};

impl From<OrderError> for Status {
    fn from(error: OrderError) -> Self {
        match (&error, error.kind()) {
            (OrderError::InsufficientStock(items), _) => {
                let detail = items
                    .iter()
                    .map(|i| format!("{} (requested {}, available {})", i.product_id, i.requested, i.available))
                    .collect::<Vec<_>>()
                    .join(", ");
                Status::failed_precondition(format!("Insufficient stock: {detail}"))
            }
            (OrderError::ConcurrentModification(_), _) => Status::aborted(error.to_string()),
            (_, ErrorKind::Validation) => Status::invalid_argument(error.to_string()),
            (_, ErrorKind::NotFound) => Status::not_found(error.to_string()),
            (_, ErrorKind::Conflict) => Status::failed_precondition(error.to_string()),
            (_, ErrorKind::PermissionDenied) => Status::permission_denied(error.to_string()),
            (_, ErrorKind::Infrastructure) => Status::internal(error.to_string()),
        }
    }
}
