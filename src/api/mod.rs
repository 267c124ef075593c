pub mod auth;
pub mod routes;

pub use auth::{admin_auth_middleware, AuthError};
pub use routes::{create_router, ApiError, AppState};
