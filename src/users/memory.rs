use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    model::{Role, User},
    repo::{CreateOutcome, StoreError, StoreResult, UserRepository},
};

/// `UserRepository` backed by a map. Mirrors the Postgres constraints:
/// unique ids, unique email among live users, soft deletes.
#[derive(Default)]
pub struct InMemoryUserRepository {
    users: Mutex<HashMap<Uuid, User>>,
    unavailable: AtomicBool,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Raw row including soft-deleted ones.
    pub fn raw(&self, id: Uuid) -> Option<User> {
        self.lock().get(&id).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, User>> {
        self.users.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow!("store unavailable")));
        }
        Ok(())
    }

    fn update_live<F>(&self, id: Uuid, f: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut User),
    {
        self.check()?;
        let mut users = self.lock();
        match users.get_mut(&id) {
            Some(u) if !u.is_deleted() => {
                f(u);
                u.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, user: &User) -> StoreResult<CreateOutcome> {
        self.check()?;
        let mut users = self.lock();
        if users.contains_key(&user.id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        if users
            .values()
            .any(|u| !u.is_deleted() && u.email == user.email)
        {
            return Err(StoreError::Conflict("email already in use".into()));
        }
        users.insert(user.id, user.clone());
        Ok(CreateOutcome::Created)
    }

    async fn update(&self, user: &User) -> StoreResult<bool> {
        self.check()?;
        let mut users = self.lock();
        match users.get_mut(&user.id) {
            Some(existing) if !existing.is_deleted() => {
                let (created_at, email, role, active) = (
                    existing.created_at,
                    existing.email.clone(),
                    existing.role,
                    existing.active,
                );
                *existing = user.clone();
                // columns the update statement doesn't touch
                existing.created_at = created_at;
                existing.email = email;
                existing.role = role;
                existing.active = active;
                existing.deleted_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn soft_delete(&self, id: Uuid) -> StoreResult<Option<User>> {
        self.check()?;
        let mut users = self.lock();
        match users.get_mut(&id) {
            Some(u) if !u.is_deleted() => {
                let now = OffsetDateTime::now_utc();
                u.deleted_at = Some(now);
                u.updated_at = now;
                Ok(Some(u.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        self.check()?;
        Ok(self.lock().get(&id).filter(|u| !u.is_deleted()).cloned())
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.check()?;
        Ok(self
            .lock()
            .values()
            .find(|u| !u.is_deleted() && u.email == email)
            .cloned())
    }

    async fn list_all(&self) -> StoreResult<Vec<User>> {
        self.check()?;
        let mut users: Vec<User> = self
            .lock()
            .values()
            .filter(|u| !u.is_deleted())
            .cloned()
            .collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn set_role(&self, id: Uuid, role: Role) -> StoreResult<bool> {
        self.update_live(id, |u| u.role = role)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        self.update_live(id, |u| u.active = active)
    }
}
