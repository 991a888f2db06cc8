mod auth;

pub use auth::{require_operator_key, OperatorApiKey};
