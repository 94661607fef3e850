use serde::Deserialize;

/// Body of `PUT /moder/role/:id`.
#[derive(Debug, Deserialize)]
pub struct SetRoleRequest {
    pub role_name: String,
}
