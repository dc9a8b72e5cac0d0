use super::{impl_entity, require};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Built-in role names
pub const ROLE_ADMIN: &str = "Admin";
pub const ROLE_EDITOR: &str = "Editor";
pub const ROLE_VIEWER: &str = "Viewer";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectStaticUser {
    pub username: String,
    pub password_hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectSsoConfig {
    pub provider: String,
    /// Name of a shared SSO config declared in the control-plane config
    pub shared_config_name: String,
    /// Encrypted provider settings
    pub encrypted_settings: String,
}

/// Maps an identity provider team to a role
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectUserGroup {
    pub sso_group: String,
    pub role: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    pub id: String,
    pub desc: String,
    pub static_admin: ProjectStaticUser,
    pub static_admin_disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sso: Option<ProjectSsoConfig>,
    pub user_groups: Vec<ProjectUserGroup>,
    pub allow_stray_as_viewer: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Project {
    fn validate_fields(&self) -> Result<()> {
        require(&self.id, "id")
    }

    /// Role bound to an SSO group, if any
    pub fn role_for_group(&self, group: &str) -> Option<&str> {
        self.user_groups
            .iter()
            .find(|g| g.sso_group == group)
            .map(|g| g.role.as_str())
    }
}

impl_entity!(Project, "Project");
