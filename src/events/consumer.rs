use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    bus::{Delivery, EventStream},
    UserCreated, UserDeleted, UserEvent, UserUpdated,
};
use crate::{
    storage::ObjectStore,
    users::{
        model::User,
        repo::{CreateOutcome, StoreError, UserRepository},
        validation,
    },
};

const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

/// What became of one delivery. Everything except `Failed` is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    Skipped,
    Failed,
}

/// Reacts to user lifecycle events: provisions profiles and collects orphaned avatars.
pub struct EventConsumer {
    repo: Arc<dyn UserRepository>,
    storage: Arc<dyn ObjectStore>,
    stream: Arc<dyn EventStream>,
}

impl EventConsumer {
    pub fn new(
        repo: Arc<dyn UserRepository>,
        storage: Arc<dyn ObjectStore>,
        stream: Arc<dyn EventStream>,
    ) -> Self {
        Self {
            repo,
            storage,
            stream,
        }
    }

    /// Runs one sequential loop per partition until `cancel` fires, then closes the stream.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let partitions = self.stream.partitions();
        info!(partitions, "event consumer started");

        let mut loops = JoinSet::new();
        for partition in 0..partitions {
            let consumer = Arc::clone(&self);
            let cancel = cancel.clone();
            loops.spawn(async move { consumer.partition_loop(partition, cancel).await });
        }
        while let Some(res) = loops.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "partition loop panicked");
            }
        }

        if let Err(e) = self.stream.close().await {
            warn!(error = %e, "closing event stream failed");
        }
        info!("event consumer stopped");
    }

    async fn partition_loop(&self, partition: u32, cancel: CancellationToken) {
        debug!(partition, "partition loop started");
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = self.stream.receive(partition) => r,
            };
            match received {
                // a message in hand is finished even if cancellation arrives meanwhile
                Ok(Some(delivery)) => {
                    self.process(delivery).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(partition, error = %e, "receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }
        debug!(partition, "partition loop stopped");
    }

    /// Handles one delivery and acknowledges it unless handling failed transiently.
    #[instrument(skip_all, fields(partition = delivery.partition, id = %delivery.id))]
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let outcome = match UserEvent::decode(&delivery.payload) {
            Ok(event) => {
                let event_type = event.event_type().to_string();
                match self.dispatch(event).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(event_type = %event_type, error = %format!("{e:#}"), "event handling failed");
                        Outcome::Failed
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "dropping undecodable event");
                Outcome::Skipped
            }
        };

        if outcome != Outcome::Failed {
            if let Err(e) = self.stream.ack(&delivery).await {
                warn!(error = %e, "ack failed; message will be redelivered");
            }
        }
        outcome
    }

    async fn dispatch(&self, event: UserEvent) -> anyhow::Result<Outcome> {
        match event {
            UserEvent::Created(e) => self.on_created(e).await,
            UserEvent::Updated(e) => self.on_updated(e).await,
            UserEvent::Deleted(e) => self.on_deleted(e).await,
            UserEvent::Unknown { event_type, .. } => {
                info!(event_type = %event_type, "ignoring unknown event type");
                Ok(Outcome::Skipped)
            }
        }
    }

    async fn on_created(&self, e: UserCreated) -> anyhow::Result<Outcome> {
        let email = e.email.trim().to_string();
        if email.is_empty() {
            warn!(user_id = %e.user_id, "UserCreated without email skipped");
            return Ok(Outcome::Skipped);
        }
        if !validation::is_valid_email(&email) {
            warn!(user_id = %e.user_id, "provisioning user with an unusual email address");
        }

        let user = User::provisioned(
            e.user_id,
            email,
            e.firstname.unwrap_or_default(),
            e.lastname.unwrap_or_default(),
        );
        match self.repo.create(&user).await {
            Ok(CreateOutcome::Created) => {
                info!(
                    user_id = %user.id,
                    needs_completion = user.needs_completion,
                    "user provisioned"
                );
                Ok(Outcome::Handled)
            }
            Ok(CreateOutcome::AlreadyExists) => {
                debug!(user_id = %user.id, "user already provisioned");
                Ok(Outcome::Handled)
            }
            Err(StoreError::Conflict(reason)) => {
                warn!(user_id = %user.id, reason = %reason, "UserCreated conflicts with a live user, skipped");
                Ok(Outcome::Skipped)
            }
            Err(StoreError::Backend(err)) => Err(err.context("create user")),
        }
    }

    async fn on_updated(&self, e: UserUpdated) -> anyhow::Result<Outcome> {
        if e.old_avatar_url.is_empty() || e.old_avatar_url == e.new_avatar_url {
            return Ok(Outcome::Skipped);
        }
        if self.still_referenced(e.user_id, &e.old_avatar_url).await? {
            // an older event replayed after a newer one must not delete the live avatar
            debug!(user_id = %e.user_id, "old avatar is current again, kept");
            return Ok(Outcome::Skipped);
        }
        self.delete_blob(&e.old_avatar_url).await;
        Ok(Outcome::Handled)
    }

    async fn on_deleted(&self, e: UserDeleted) -> anyhow::Result<Outcome> {
        if e.avatar_url.is_empty() {
            return Ok(Outcome::Skipped);
        }
        if self.still_referenced(e.user_id, &e.avatar_url).await? {
            debug!(user_id = %e.user_id, "avatar belongs to a live user, kept");
            return Ok(Outcome::Skipped);
        }
        self.delete_blob(&e.avatar_url).await;
        Ok(Outcome::Handled)
    }

    async fn still_referenced(&self, user_id: Uuid, url: &str) -> anyhow::Result<bool> {
        let current = self
            .repo
            .get_by_id(user_id)
            .await
            .map_err(anyhow::Error::from)
            .context("load user for avatar cleanup")?;
        Ok(current.is_some_and(|u| u.avatar_url.as_deref() == Some(url)))
    }

    async fn delete_blob(&self, url: &str) {
        match self.storage.delete_by_url(url).await {
            Ok(()) => info!(url, "orphaned avatar deleted"),
            Err(e) => warn!(url, error = %format!("{e:#}"), "avatar cleanup failed"),
        }
    }
}
