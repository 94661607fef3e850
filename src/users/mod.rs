pub mod dto;
pub mod handlers;
pub mod memory;
pub mod model;
pub mod repo;
mod repo_types;
pub mod services;
pub(crate) mod validation;

pub use handlers::user_routes;
