use uuid::Uuid;

use crate::users::model::Role;

pub mod jwt;

pub use jwt::{AuthUser, Claims, JwtKeys};

/// The authenticated caller, as asserted by a verified bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub id: Uuid,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owners may act on their own profile; admins on anyone's.
    pub fn may_act_on(&self, target: Uuid) -> bool {
        self.id == target || self.is_admin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_or_admin() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let user = Principal {
            id: me,
            role: Role::User,
        };
        assert!(user.may_act_on(me));
        assert!(!user.may_act_on(other));

        let moderator = Principal {
            role: Role::Moderator,
            ..user
        };
        assert!(!moderator.may_act_on(other));

        let admin = Principal {
            role: Role::Admin,
            ..user
        };
        assert!(admin.may_act_on(other));
    }
}
