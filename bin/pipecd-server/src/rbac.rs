//! Role based access control for the web API

use pipecd_common::model::{ROLE_ADMIN, ROLE_EDITOR, ROLE_VIEWER};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Application,
    Deployment,
    Event,
    Piped,
    DeploymentChain,
    Project,
    ApiKey,
    Insight,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl Action {
    const fn is_read(self) -> bool {
        matches!(self, Self::Get | Self::List)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Permission {
    pub resource: Resource,
    pub action: Action,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{:?}", self.resource, self.action)
    }
}

const fn perm(resource: Resource, action: Action) -> Option<Permission> {
    Some(Permission { resource, action })
}

/// Permission required by a web API method; `None` for unknown methods
pub fn method_permission(method: &str) -> Option<Permission> {
    use Action::{Create, Delete, Get, List, Update};
    use Resource::{ApiKey, Application, Deployment, Insight, Piped, Project};
    match method {
        "RegisterPiped" => perm(Piped, Create),
        "ListPipeds" => perm(Piped, List),
        "RecreatePipedKey" | "DeleteOldPipedKeys" | "EnablePiped" | "DisablePiped" => perm(Piped, Update),
        "AddApplication" => perm(Application, Create),
        "GetApplication" => perm(Application, Get),
        "ListApplications" | "ListUnregisteredApplications" => perm(Application, List),
        "SyncApplication" | "EnableApplication" | "DisableApplication" => perm(Application, Update),
        "DeleteApplication" => perm(Application, Delete),
        "ListDeployments" => perm(Deployment, List),
        "GetDeployment" | "GetStageLog" | "GetCommand" => perm(Deployment, Get),
        "CancelDeployment" | "SkipStage" => perm(Deployment, Update),
        "GenerateAPIKey" => perm(ApiKey, Create),
        "ListAPIKeys" => perm(ApiKey, List),
        "DisableAPIKey" => perm(ApiKey, Update),
        "EncryptSecret" => perm(Piped, Get),
        "GetInsightData" => perm(Insight, Get),
        "GetMe" => perm(Project, Get),
        _ => None,
    }
}

/// Whether a built-in role grants `p`; unknown roles grant nothing
pub fn role_allows(role: &str, p: Permission) -> bool {
    match role {
        ROLE_ADMIN => true,
        ROLE_EDITOR => {
            p.action.is_read() || !matches!(p.resource, Resource::Project | Resource::ApiKey | Resource::Piped)
        }
        ROLE_VIEWER => p.action.is_read(),
        _ => false,
    }
}

pub fn any_role_allows(roles: &[String], p: Permission) -> bool {
    roles.iter().any(|r| role_allows(r, p))
}
