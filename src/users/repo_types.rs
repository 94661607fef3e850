use anyhow::Context;
use sqlx::FromRow;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::model::{Gender, Role, User};

/// Row shape of the `users` table.
#[derive(Debug, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub firstname: String,
    pub lastname: String,
    pub about: String,
    pub date_of_birth: Option<Date>,
    pub gender: Option<String>,
    pub location: Option<String>,
    pub socials: Vec<String>,
    pub avatar_url: Option<String>,
    pub needs_completion: bool,
    pub role: String,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(r: UserRow) -> Result<Self, Self::Error> {
        let gender = r
            .gender
            .as_deref()
            .map(str::parse::<Gender>)
            .transpose()
            .with_context(|| format!("user {} has invalid gender", r.id))?;
        let role = r
            .role
            .parse::<Role>()
            .with_context(|| format!("user {} has invalid role", r.id))?;
        Ok(Self {
            id: r.id,
            email: r.email,
            firstname: r.firstname,
            lastname: r.lastname,
            about: r.about,
            date_of_birth: r.date_of_birth,
            gender,
            location: r.location,
            socials: r.socials,
            avatar_url: r.avatar_url,
            needs_completion: r.needs_completion,
            role,
            active: r.active,
            created_at: r.created_at,
            updated_at: r.updated_at,
            deleted_at: r.deleted_at,
        })
    }
}
