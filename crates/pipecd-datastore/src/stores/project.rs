use super::EntityStore;
use pipecd_common::model::{Project, ProjectSsoConfig, ProjectUserGroup};
use pipecd_common::{Error, Result};

impl EntityStore<Project> {
    pub async fn update_static_admin(&self, id: &str, username: &str, password_hash: &str) -> Result<Project> {
        self.update(id, |p| {
            p.static_admin.username = username.to_string();
            p.static_admin.password_hash = password_hash.to_string();
            Ok(())
        })
        .await
    }

    pub async fn set_static_admin_disabled(&self, id: &str, disabled: bool) -> Result<Project> {
        self.update(id, |p| {
            p.static_admin_disabled = disabled;
            Ok(())
        })
        .await
    }

    pub async fn update_sso(&self, id: &str, sso: &ProjectSsoConfig) -> Result<Project> {
        self.update(id, |p| {
            p.sso = Some(sso.clone());
            Ok(())
        })
        .await
    }

    /// Bind an SSO group to a role; each group maps to one role
    pub async fn add_user_group(&self, id: &str, group: &ProjectUserGroup) -> Result<Project> {
        self.update(id, |p| {
            if p.user_groups.iter().any(|g| g.sso_group == group.sso_group) {
                return Err(Error::already_exists(format!("user group {}", group.sso_group)));
            }
            p.user_groups.push(group.clone());
            Ok(())
        })
        .await
    }

    pub async fn delete_user_group(&self, id: &str, sso_group: &str) -> Result<Project> {
        self.update(id, |p| {
            let before = p.user_groups.len();
            p.user_groups.retain(|g| g.sso_group != sso_group);
            if p.user_groups.len() == before {
                return Err(Error::not_found(format!("user group {sso_group}")));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::stores::testing::filedb;
    use crate::{Commander, ProjectStore};
    use pipecd_common::model::{Project, ProjectUserGroup, ROLE_EDITOR};

    #[tokio::test]
    async fn test_rbac_groups() {
        let store = ProjectStore::new(filedb(), Commander::Ops);
        store.add(Project { id: "p".into(), ..Default::default() }).await.unwrap();

        let group = ProjectUserGroup {
            sso_group: "team/dev".into(),
            role: ROLE_EDITOR.into(),
        };
        store.add_user_group("p", &group).await.unwrap();
        assert!(store.add_user_group("p", &group).await.unwrap_err().is_already_exists());

        let p = store.get("p").await.unwrap();
        assert_eq!(p.role_for_group("team/dev"), Some(ROLE_EDITOR));

        store.delete_user_group("p", "team/dev").await.unwrap();
        assert!(store.delete_user_group("p", "team/dev").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_static_admin() {
        let store = ProjectStore::new(filedb(), Commander::Ops);
        store.add(Project { id: "p".into(), ..Default::default() }).await.unwrap();
        let p = store.update_static_admin("p", "admin", "hash").await.unwrap();
        assert_eq!(p.static_admin.username, "admin");
        assert!(store.set_static_admin_disabled("p", true).await.unwrap().static_admin_disabled);
    }
}
