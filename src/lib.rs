pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod grpc;
pub mod moderation;
pub mod state;
pub mod storage;
pub mod users;
