//! gRPC surface: `user.v1.UserService/GetUser`, served next to the HTTP API.

use std::net::SocketAddr;

use anyhow::Context;
use prost_types::Timestamp;
use time::{Date, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status};
use tracing::{info, instrument};

use crate::users::{dto::UserView, services::UserService, validation::parse_user_id};

/// Generated protobuf types
pub mod pb {
    tonic::include_proto!("user.v1");
}

use pb::{
    user_service_server::{UserService as UserServiceApi, UserServiceServer},
    GetUserRequest, GetUserResponse,
};

pub struct UserGrpc {
    users: UserService,
}

impl UserGrpc {
    pub fn new(users: UserService) -> Self {
        Self { users }
    }
}

#[tonic::async_trait]
impl UserServiceApi for UserGrpc {
    #[instrument(skip_all)]
    async fn get_user(
        &self,
        request: Request<GetUserRequest>,
    ) -> Result<Response<GetUserResponse>, Status> {
        let id = parse_user_id(&request.into_inner().user_id)?;
        let view = self.users.get_user_by_id(id).await?;
        Ok(Response::new(view.into()))
    }
}

fn timestamp(t: OffsetDateTime) -> Timestamp {
    Timestamp {
        seconds: t.unix_timestamp(),
        nanos: t.nanosecond() as i32,
    }
}

fn date_timestamp(d: Date) -> Timestamp {
    timestamp(d.midnight().assume_utc())
}

impl From<UserView> for GetUserResponse {
    fn from(v: UserView) -> Self {
        Self {
            id: v.id.to_string(),
            created_at: Some(timestamp(v.created_at)),
            updated_at: Some(timestamp(v.updated_at)),
            deleted_at: v.deleted_at.map(timestamp),
            email: v.email,
            firstname: v.firstname,
            lastname: v.lastname,
            about: Some(v.about),
            date_of_birth: v.date_of_birth.map(date_timestamp),
            avatar_url: v.avatar_url,
            gender: v.gender.map(|g| g.as_str().to_string()),
            location: v.location,
            socials: v.socials,
            needs_completion: v.needs_completion,
            role: v.role.as_str().to_string(),
            active: v.active,
        }
    }
}

/// Serves gRPC on `addr` until `cancel` fires.
pub async fn serve(addr: SocketAddr, users: UserService, cancel: CancellationToken) -> anyhow::Result<()> {
    info!(%addr, "grpc listening");
    Server::builder()
        .add_service(UserServiceServer::new(UserGrpc::new(users)))
        .serve_with_shutdown(addr, cancel.cancelled_owned())
        .await
        .context("grpc server")?;
    info!("grpc server stopped");
    Ok(())
}
