//! HTTP surface: models, error mapping, the body pipeline, and routes.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod routes;

pub use routes::router;
