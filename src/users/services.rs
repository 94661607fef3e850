use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    dto::{AvatarUpload, UpdateUserForm, UserView},
    repo::UserRepository,
};
use crate::{
    auth::Principal,
    cache::UserCache,
    error::{ServiceError, ServiceResult},
    events::{bus::EventPublisher, UserDeleted, UserEvent, UserUpdated},
    storage::ObjectStore,
};

/// Orchestrates profile reads and writes across the store, object storage, the read
/// cache and the event channel.
///
/// Only the store write decides whether a mutation succeeded. Cache invalidation and
/// event publishing run afterwards and are logged on failure, never returned.
#[derive(Clone)]
pub struct UserService {
    repo: Arc<dyn UserRepository>,
    storage: Arc<dyn ObjectStore>,
    cache: UserCache,
    events: Arc<dyn EventPublisher>,
}

impl UserService {
    pub fn new(
        repo: Arc<dyn UserRepository>,
        storage: Arc<dyn ObjectStore>,
        cache: UserCache,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            repo,
            storage,
            cache,
            events,
        }
    }

    #[instrument(skip(self, requester, form, avatar), fields(requester = %requester.id, has_avatar = avatar.is_some()))]
    pub async fn update_user(
        &self,
        requester: &Principal,
        id: Uuid,
        form: UpdateUserForm,
        avatar: Option<AvatarUpload>,
    ) -> ServiceResult<UserView> {
        let update = form.validate()?;
        let avatar_ext = avatar.as_ref().map(AvatarUpload::extension).transpose()?;
        authorize(requester, id)?;

        let current = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User not found"))?;

        let new_avatar_url = match (avatar, avatar_ext) {
            (Some(upload), Some(ext)) => {
                let key = format!("avatars/{id}/{}.{ext}", Uuid::new_v4());
                let url = self
                    .storage
                    .upload(&key, upload.body, &upload.content_type)
                    .await
                    .map_err(ServiceError::Upstream)?;
                info!(%url, "avatar uploaded");
                Some(url)
            }
            _ => None,
        };

        let mut updated = current.clone();
        updated.apply(update);
        if let Some(url) = &new_avatar_url {
            updated.avatar_url = Some(url.clone());
        }

        let persisted = match self.repo.update(&updated).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ServiceError::not_found("User not found")),
            Err(e) => Err(ServiceError::from(e)),
        };
        if let Err(e) = persisted {
            if let Some(url) = &new_avatar_url {
                self.discard_upload(url).await;
            }
            return Err(e);
        }

        self.cache.invalidate(id).await;
        self.publish(UserEvent::Updated(UserUpdated {
            user_id: id,
            new_avatar_url: updated.avatar_url.clone().unwrap_or_default(),
            old_avatar_url: current.avatar_url.clone().unwrap_or_default(),
        }))
        .await;

        info!(user_id = %id, "user updated");
        Ok(updated.into())
    }

    #[instrument(skip(self, requester), fields(requester = %requester.id))]
    pub async fn delete_user_by_id(&self, requester: &Principal, id: Uuid) -> ServiceResult<()> {
        authorize(requester, id)?;

        let deleted = self
            .repo
            .soft_delete(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User not found"))?;

        self.cache.invalidate(id).await;
        self.publish(UserEvent::Deleted(UserDeleted {
            user_id: id,
            avatar_url: deleted.avatar_url.unwrap_or_default(),
        }))
        .await;

        info!(user_id = %id, "user deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_user_by_id(&self, id: Uuid) -> ServiceResult<UserView> {
        if let Some(view) = self.cache.get(id).await {
            return Ok(view);
        }

        let user = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User not found"))?;
        let view = UserView::from(user);
        self.cache.put(&view).await;
        Ok(view)
    }

    #[instrument(skip(self))]
    pub async fn get_all_users(&self) -> ServiceResult<Vec<UserView>> {
        let users = self.repo.list_all().await?;
        Ok(users.into_iter().map(UserView::from).collect())
    }

    async fn publish(&self, event: UserEvent) {
        if let Err(e) = self.events.publish(&event).await {
            warn!(
                event_type = event.event_type(),
                error = %format!("{e:#}"),
                "event publish failed"
            );
        }
    }

    async fn discard_upload(&self, url: &str) {
        if let Err(e) = self.storage.delete_by_url(url).await {
            warn!(url, error = %format!("{e:#}"), "orphaned avatar upload not removed");
        }
    }
}

fn authorize(requester: &Principal, target: Uuid) -> ServiceResult<()> {
    if requester.may_act_on(target) {
        Ok(())
    } else {
        Err(ServiceError::forbidden("You can only modify your own profile"))
    }
}
