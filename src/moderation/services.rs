use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    auth::Principal,
    cache::UserCache,
    error::{ServiceError, ServiceResult},
    users::{
        model::{Role, User},
        repo::UserRepository,
    },
};

/// Role changes and bans, gated by the `ADMIN > MODERATOR > USER` hierarchy.
///
/// The editor's role and ban status are read from the store rather than trusted from
/// the token, so a demotion or ban takes effect before the token expires.
#[derive(Clone)]
pub struct ModerationService {
    repo: Arc<dyn UserRepository>,
    cache: UserCache,
}

impl ModerationService {
    pub fn new(repo: Arc<dyn UserRepository>, cache: UserCache) -> Self {
        Self { repo, cache }
    }

    #[instrument(skip(self, editor), fields(editor = %editor.id))]
    pub async fn set_role(&self, editor: &Principal, id: Uuid, role_name: &str) -> ServiceResult<()> {
        let role: Role = role_name
            .parse()
            .map_err(|_| ServiceError::invalid(format!("unknown role {role_name:?}")))?;
        let editor = self.authorize(editor, id).await?;
        if !editor.role.can_moderate(role) {
            return Err(ServiceError::forbidden(format!(
                "{} cannot grant the {role} role",
                editor.role
            )));
        }

        if !self.repo.set_role(id, role).await? {
            return Err(ServiceError::not_found("User not found"));
        }
        self.cache.invalidate(id).await;
        info!(user_id = %id, %role, "role changed");
        Ok(())
    }

    #[instrument(skip(self, editor), fields(editor = %editor.id))]
    pub async fn ban(&self, editor: &Principal, id: Uuid) -> ServiceResult<()> {
        self.set_active(editor, id, false).await
    }

    #[instrument(skip(self, editor), fields(editor = %editor.id))]
    pub async fn unban(&self, editor: &Principal, id: Uuid) -> ServiceResult<()> {
        self.set_active(editor, id, true).await
    }

    async fn set_active(&self, editor: &Principal, id: Uuid, active: bool) -> ServiceResult<()> {
        self.authorize(editor, id).await?;
        if !self.repo.set_active(id, active).await? {
            return Err(ServiceError::not_found("User not found"));
        }
        self.cache.invalidate(id).await;
        info!(user_id = %id, active, "ban status changed");
        Ok(())
    }

    /// Checks that `editor` may moderate `target` and returns the editor's stored record.
    async fn authorize(&self, editor: &Principal, target: Uuid) -> ServiceResult<User> {
        if editor.id == target {
            return Err(ServiceError::forbidden("You cannot moderate yourself"));
        }

        let editor = self
            .repo
            .get_by_id(editor.id)
            .await?
            .ok_or_else(|| ServiceError::forbidden("Editor profile not found"))?;
        if !editor.active {
            return Err(ServiceError::forbidden("Your account is banned"));
        }
        if !editor.role.can_moderate(Role::User) {
            return Err(ServiceError::forbidden("Moderator role required"));
        }

        let target = self
            .repo
            .get_by_id(target)
            .await?
            .ok_or_else(|| ServiceError::not_found("User not found"))?;
        if !editor.role.can_moderate(target.role) {
            return Err(ServiceError::forbidden(format!(
                "{} cannot moderate a {}",
                editor.role, target.role
            )));
        }
        Ok(editor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{user_key, MemoryCache},
        users::memory::InMemoryUserRepository,
    };
    use std::time::Duration;

    struct Fixture {
        repo: Arc<InMemoryUserRepository>,
        cache: Arc<MemoryCache>,
        service: ModerationService,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryUserRepository::new());
        let cache = Arc::new(MemoryCache::new());
        let service = ModerationService::new(
            repo.clone(),
            UserCache::new(cache.clone(), Duration::from_secs(600), Duration::from_millis(100)),
        );
        Fixture {
            repo,
            cache,
            service,
        }
    }

    async fn user(f: &Fixture, role: Role) -> Principal {
        let id = Uuid::new_v4();
        let u = User::provisioned(id, format!("{id}@example.com"), "A".into(), "B".into());
        f.repo.create(&u).await.unwrap();
        f.repo.set_role(id, role).await.unwrap();
        Principal {
            id,
            role,
        }
    }

    async fn stored(f: &Fixture, p: &Principal) -> User {
        f.repo.get_by_id(p.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn admin_promotes_user_to_moderator() {
        let f = fixture();
        let admin = user(&f, Role::Admin).await;
        let target = user(&f, Role::User).await;
        f.cache
            .insert_raw(&user_key(target.id), "{}", Duration::from_secs(60));

        f.service.set_role(&admin, target.id, "MODERATOR").await.unwrap();
        assert_eq!(stored(&f, &target).await.role, Role::Moderator);
        assert!(!f.cache.contains(&user_key(target.id)));
    }

    #[tokio::test]
    async fn moderator_cannot_grant_or_touch_equal_rank() {
        let f = fixture();
        let moderator = user(&f, Role::Moderator).await;
        let target = user(&f, Role::User).await;
        let peer = user(&f, Role::Moderator).await;

        let err = f
            .service
            .set_role(&moderator, target.id, "MODERATOR")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let err = f.service.ban(&moderator, peer.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        assert!(stored(&f, &peer).await.active);
    }

    #[tokio::test]
    async fn ban_and_unban() {
        let f = fixture();
        let moderator = user(&f, Role::Moderator).await;
        let target = user(&f, Role::User).await;

        f.service.ban(&moderator, target.id).await.unwrap();
        assert!(!stored(&f, &target).await.active);
        f.service.unban(&moderator, target.id).await.unwrap();
        assert!(stored(&f, &target).await.active);
    }

    #[tokio::test]
    async fn self_moderation_is_forbidden() {
        let f = fixture();
        let admin = user(&f, Role::Admin).await;
        assert!(matches!(
            f.service.set_role(&admin, admin.id, "USER").await,
            Err(ServiceError::Forbidden(_))
        ));
        assert!(matches!(
            f.service.ban(&admin, admin.id).await,
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn banned_editor_is_forbidden() {
        let f = fixture();
        let admin = user(&f, Role::Admin).await;
        let moderator = user(&f, Role::Moderator).await;
        let target = user(&f, Role::User).await;
        f.service.ban(&admin, moderator.id).await.unwrap();

        // the token still claims an active moderator
        let err = f.service.ban(&moderator, target.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn plain_users_cannot_moderate() {
        let f = fixture();
        let a = user(&f, Role::User).await;
        let b = user(&f, Role::User).await;
        assert!(matches!(
            f.service.ban(&a, b.id).await,
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn unknown_role_and_missing_target() {
        let f = fixture();
        let admin = user(&f, Role::Admin).await;
        let target = user(&f, Role::User).await;
        assert!(matches!(
            f.service.set_role(&admin, target.id, "ROOT").await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            f.service.ban(&admin, Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        ));

        f.repo.soft_delete(target.id).await.unwrap();
        assert!(matches!(
            f.service.unban(&admin, target.id).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
