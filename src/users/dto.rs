use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::{
    model::{Gender, ProfileUpdate, Role, User},
    validation,
};
use crate::error::{ServiceError, ServiceResult};

time::serde::format_description!(dob_format, Date, "[day].[month].[year]");

/// Read model returned by the HTTP API and stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(
        with = "time::serde::rfc3339::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted_at: Option<OffsetDateTime>,

    pub email: String,
    pub firstname: String,
    pub lastname: String,
    #[serde(default)]
    pub about: String,
    #[serde(
        with = "dob_format::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub date_of_birth: Option<Date>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub socials: Vec<String>,
    pub needs_completion: bool,
    pub role: Role,
    pub active: bool,
}

impl From<User> for UserView {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            created_at: u.created_at,
            updated_at: u.updated_at,
            deleted_at: u.deleted_at,
            email: u.email,
            firstname: u.firstname,
            lastname: u.lastname,
            about: u.about,
            date_of_birth: u.date_of_birth,
            avatar_url: u.avatar_url,
            gender: u.gender,
            location: u.location,
            socials: u.socials,
            needs_completion: u.needs_completion,
            role: u.role,
            active: u.active,
        }
    }
}

/// Raw multipart fields of `PUT /users/:id`, before validation.
#[derive(Debug, Default, Clone)]
pub struct UpdateUserForm {
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    /// Accepted for compatibility; email is immutable and ignored.
    pub email: Option<String>,
    pub about: Option<String>,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub location: Option<String>,
    pub socials: Vec<String>,
}

impl UpdateUserForm {
    /// Form semantics: an absent or empty optional field clears it.
    pub fn validate(self) -> ServiceResult<ProfileUpdate> {
        Ok(ProfileUpdate {
            firstname: validation::required_name("firstname", self.firstname)?,
            lastname: validation::required_name("lastname", self.lastname)?,
            about: validation::optional_text("about", self.about, validation::ABOUT_MAX_CHARS)?,
            date_of_birth: validation::optional_dob(self.date_of_birth)?,
            gender: validation::optional_gender(self.gender)?,
            location: validation::optional_text(
                "location",
                self.location,
                validation::LOCATION_MAX_CHARS,
            )?,
            socials: validation::socials(self.socials)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AvatarUpload {
    pub body: Bytes,
    pub content_type: String,
}

impl AvatarUpload {
    /// File extension for the object key; rejects non-image uploads.
    pub fn extension(&self) -> ServiceResult<&'static str> {
        if self.body.is_empty() {
            return Err(ServiceError::invalid("avatar file is empty"));
        }
        validation::ext_from_mime(&self.content_type).ok_or_else(|| {
            ServiceError::invalid(format!(
                "unsupported avatar content type {:?}",
                self.content_type
            ))
        })
    }
}
