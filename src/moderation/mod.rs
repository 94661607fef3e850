pub mod dto;
pub mod handlers;
pub mod services;

pub use handlers::moderation_routes;
pub use services::ModerationService;
