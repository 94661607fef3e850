use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    fn rank(self) -> u8 {
        match self {
            Role::User => 0,
            Role::Moderator => 1,
            Role::Admin => 2,
        }
    }

    /// A role may moderate strictly lower roles, and only moderators and admins moderate at all.
    pub fn can_moderate(self, other: Role) -> bool {
        self.rank() >= Role::Moderator.rank() && self.rank() > other.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Moderator => "MODERATOR",
            Role::Admin => "ADMIN",
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(Role::User),
            "MODERATOR" => Ok(Role::Moderator),
            "ADMIN" => Ok(Role::Admin),
            other => anyhow::bail!("unknown role {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
        }
    }
}

impl FromStr for Gender {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            "other" => Ok(Gender::Other),
            other => anyhow::bail!("unknown gender {other:?}"),
        }
    }
}

/// A user profile as persisted by the profile store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub firstname: String,
    pub lastname: String,
    pub about: String,
    pub date_of_birth: Option<Date>,
    pub gender: Option<Gender>,
    pub location: Option<String>,
    pub socials: Vec<String>,
    pub avatar_url: Option<String>,
    pub needs_completion: bool,
    pub role: Role,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl User {
    /// Fresh profile provisioned from an identity event.
    pub fn provisioned(id: Uuid, email: String, firstname: String, lastname: String) -> Self {
        let now = OffsetDateTime::now_utc();
        let needs_completion = is_blank_name(&firstname) || is_blank_name(&lastname);
        Self {
            id,
            email,
            firstname,
            lastname,
            about: String::new(),
            date_of_birth: None,
            gender: None,
            location: None,
            socials: Vec::new(),
            avatar_url: None,
            needs_completion,
            role: Role::User,
            active: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Applies a validated update in place. Names are always replaced.
    pub fn apply(&mut self, update: ProfileUpdate) {
        self.firstname = update.firstname;
        self.lastname = update.lastname;
        match update.about {
            Patch::Unset => {}
            Patch::Clear => self.about.clear(),
            Patch::Value(v) => self.about = v,
        }
        update.date_of_birth.apply(&mut self.date_of_birth);
        update.gender.apply(&mut self.gender);
        update.location.apply(&mut self.location);
        match update.socials {
            Patch::Unset => {}
            Patch::Clear => self.socials.clear(),
            Patch::Value(v) => self.socials = v,
        }
        self.needs_completion = is_blank_name(&self.firstname) || is_blank_name(&self.lastname);
        self.updated_at = OffsetDateTime::now_utc();
    }
}

// Some identity providers serialize a missing name as the literal "null".
fn is_blank_name(name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || name == "null"
}

/// Change to a single optional field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Patch<T> {
    /// Leave the stored value as it is.
    #[default]
    Unset,
    /// Remove the stored value.
    Clear,
    Value(T),
}

impl<T> Patch<T> {
    pub fn apply(self, slot: &mut Option<T>) {
        match self {
            Patch::Unset => {}
            Patch::Clear => *slot = None,
            Patch::Value(v) => *slot = Some(v),
        }
    }
}

/// Validated profile changes; see `UpdateUserForm::validate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub firstname: String,
    pub lastname: String,
    pub about: Patch<String>,
    pub date_of_birth: Patch<Date>,
    pub gender: Patch<Gender>,
    pub location: Patch<String>,
    pub socials: Patch<Vec<String>>,
}

impl ProfileUpdate {
    pub fn names(firstname: impl Into<String>, lastname: impl Into<String>) -> Self {
        Self {
            firstname: firstname.into(),
            lastname: lastname.into(),
            about: Patch::Unset,
            date_of_birth: Patch::Unset,
            gender: Patch::Unset,
            location: Patch::Unset,
            socials: Patch::Unset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn user() -> User {
        let mut u = User::provisioned(
            Uuid::new_v4(),
            "jane@example.com".into(),
            "Jane".into(),
            "Smith".into(),
        );
        u.about = "bio text".into();
        u.location = Some("Almaty".into());
        u.socials = vec!["https://github.com/jane".into()];
        u
    }

    #[test]
    fn needs_completion_on_provision() {
        let id = Uuid::new_v4();
        assert!(User::provisioned(id, "a@b.com".into(), "".into(), "Smith".into()).needs_completion);
        assert!(User::provisioned(id, "a@b.com".into(), "Jane".into(), "null".into()).needs_completion);
        assert!(!User::provisioned(id, "a@b.com".into(), "Jane".into(), "Smith".into()).needs_completion);
    }

    #[test]
    fn role_hierarchy() {
        assert!(Role::Admin.can_moderate(Role::Moderator));
        assert!(Role::Admin.can_moderate(Role::User));
        assert!(Role::Moderator.can_moderate(Role::User));
        assert!(!Role::Moderator.can_moderate(Role::Moderator));
        assert!(!Role::Moderator.can_moderate(Role::Admin));
        assert!(!Role::User.can_moderate(Role::User));
        assert!(!Role::Admin.can_moderate(Role::Admin));
    }

    #[test]
    fn role_and_gender_parse() {
        assert_eq!("moderator".parse::<Role>().unwrap(), Role::Moderator);
        assert!("root".parse::<Role>().is_err());
        assert_eq!("Female".parse::<Gender>().unwrap(), Gender::Female);
        assert!("robot".parse::<Gender>().is_err());
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"ADMIN\"");
    }

    #[test]
    fn patch_three_states() {
        let mut slot = Some("keep".to_string());
        Patch::Unset.apply(&mut slot);
        assert_eq!(slot.as_deref(), Some("keep"));
        Patch::Value("new".to_string()).apply(&mut slot);
        assert_eq!(slot.as_deref(), Some("new"));
        Patch::<String>::Clear.apply(&mut slot);
        assert_eq!(slot, None);
    }

    #[test]
    fn apply_update_clears_and_sets() {
        let mut u = user();
        let mut update = ProfileUpdate::names("A", "B");
        update.about = Patch::Clear;
        update.date_of_birth = Patch::Value(date!(2004 - 01 - 02));
        update.socials = Patch::Clear;

        u.apply(update);
        assert_eq!(u.firstname, "A");
        assert_eq!(u.about, "");
        assert_eq!(u.location.as_deref(), Some("Almaty"));
        assert_eq!(u.date_of_birth, Some(date!(2004 - 01 - 02)));
        assert!(u.socials.is_empty());
    }

    #[test]
    fn apply_update_recomputes_needs_completion() {
        let mut u = User::provisioned(Uuid::new_v4(), "a@b.com".into(), "".into(), "".into());
        assert!(u.needs_completion);
        u.apply(ProfileUpdate::names("A", "B"));
        assert!(!u.needs_completion);
    }
}
