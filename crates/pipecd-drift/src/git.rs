//! Git client shelling out to the `git` binary
//!
//! Every remote is mirrored once into the cache directory and refreshed with
//! `fetch`; working copies are cloned from the mirror into temporary
//! directories that live as long as the returned [`GitRepo`].

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use pipecd_common::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{info, warn};

const RETRIES: usize = 3;
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait GitRepo: Send + Sync {
    fn path(&self) -> &Path;

    fn cloned_branch(&self) -> &str;

    async fn pull(&self, branch: &str) -> Result<()>;

    /// Hash of `HEAD`
    async fn latest_commit(&self) -> Result<String>;
}

#[async_trait]
pub trait GitClient: Send + Sync {
    async fn clone_repo(&self, repo_id: &str, remote: &str, branch: &str) -> Result<Box<dyn GitRepo>>;
}

#[derive(Clone, Debug)]
pub struct GitOptions {
    pub git_path: PathBuf,
    pub username: String,
    pub email: String,
    /// Base64 encoded; embedded into HTTPS remotes together with `username`
    pub password: String,
    pub envs: Vec<(String, String)>,
    /// Mirror directory; a temporary one when unset
    pub cache_dir: Option<PathBuf>,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            git_path: PathBuf::from("git"),
            username: "piped".to_string(),
            email: "pipecd.dev@gmail.com".to_string(),
            password: String::new(),
            envs: Vec::new(),
            cache_dir: None,
        }
    }
}

pub struct Client {
    opts: GitOptions,
    cache_dir: PathBuf,
    _cache_guard: Option<TempDir>,
    repo_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// `remote` with the decoded password as HTTP credentials
pub fn include_password_remote(remote: &str, username: &str, password: &str) -> Result<String> {
    if username.is_empty() || password.is_empty() {
        return Ok(remote.to_string());
    }
    let mut url = reqwest::Url::parse(remote)
        .map_err(|e| Error::invalid_argument(format!("failed to include password: {e}")))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(password)
        .map_err(|e| Error::configuration(format!("failed to decode password: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| Error::configuration(format!("password is not utf-8: {e}")))?;
    url.set_username(username)
        .and_then(|()| url.set_password(Some(&decoded)))
        .map_err(|()| Error::invalid_argument("remote cannot carry credentials"))?;
    Ok(url.to_string())
}

/// Run git and return its combined output
///
/// Errors only name the subcommand since arguments may carry credentials.
async fn run_git(git: &Path, dir: Option<&Path>, envs: &[(String, String)], args: &[&str]) -> Result<String> {
    let mut cmd = Command::new(git);
    cmd.args(args).kill_on_drop(true);
    cmd.envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    let output = cmd
        .output()
        .await
        .map_err(|e| Error::internal(format!("failed to run {}: {e}", git.display())))?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        let sub = args.first().copied().unwrap_or_default();
        return Err(Error::internal(format!("git {sub} failed: {}", combined.trim())));
    }
    Ok(combined)
}

async fn retry<F, Fut>(what: &str, mut f: F) -> Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(out) => return Ok(out),
            Err(e) if attempt < RETRIES => {
                warn!(error = %e, attempt, "{what} failed, retrying in {RETRY_INTERVAL:?}");
                tokio::time::sleep(RETRY_INTERVAL).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

impl Client {
    pub fn new(opts: GitOptions) -> Result<Self> {
        let (cache_dir, guard) = match &opts.cache_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.clone(), None)
            }
            None => {
                let tmp = tempfile::Builder::new().prefix("gitcache").tempdir()?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
        };
        Ok(Self {
            opts,
            cache_dir,
            _cache_guard: guard,
            repo_locks: Mutex::new(HashMap::new()),
        })
    }

    fn repo_lock(&self, repo_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.repo_locks.lock().entry(repo_id.to_string()).or_default())
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        run_git(&self.opts.git_path, dir, &self.opts.envs, args).await
    }
}

#[async_trait]
impl GitClient for Client {
    async fn clone_repo(&self, repo_id: &str, remote: &str, branch: &str) -> Result<Box<dyn GitRepo>> {
        let remote = include_password_remote(remote, &self.opts.username, &self.opts.password)?;
        let mirror = self.cache_dir.join(repo_id);
        let mirror_str = mirror.to_string_lossy().into_owned();

        let lock = self.repo_lock(repo_id);
        let _guard = lock.lock().await;

        if tokio::fs::try_exists(&mirror).await? {
            info!(repo_id, "fetching to update the cache");
            retry("git fetch", || self.git(Some(&mirror), &["fetch"])).await?;
        } else {
            info!(repo_id, "cloning for the first time");
            let args = ["clone", "--mirror", remote.as_str(), mirror_str.as_str()];
            retry("git clone --mirror", || self.git(None, &args)).await?;
        }

        let dest = tempfile::Builder::new().prefix("git").tempdir()?;
        let dest_str = dest.path().to_string_lossy().into_owned();
        let mut args = vec!["clone"];
        if !branch.is_empty() {
            args.extend(["-b", branch]);
        }
        args.extend([mirror_str.as_str(), dest_str.as_str()]);
        self.git(None, &args).await?;

        let repo = Repo {
            dir: dest,
            git_path: self.opts.git_path.clone(),
            remote: remote.clone(),
            branch: branch.to_string(),
            envs: self.opts.envs.clone(),
        };
        if !self.opts.username.is_empty() {
            repo.git(&["config", "user.name", &self.opts.username]).await?;
        }
        if !self.opts.email.is_empty() {
            repo.git(&["config", "user.email", &self.opts.email]).await?;
        }
        repo.git(&["config", "gc.autoDetach", "false"]).await?;
        // The local clone points origin at the mirror
        repo.git(&["remote", "set-url", "origin", &remote]).await?;
        Ok(Box::new(repo))
    }
}

pub struct Repo {
    dir: TempDir,
    git_path: PathBuf,
    remote: String,
    branch: String,
    envs: Vec<(String, String)>,
}

impl Repo {
    async fn git(&self, args: &[&str]) -> Result<String> {
        run_git(&self.git_path, Some(self.dir.path()), &self.envs, args).await
    }
}

#[async_trait]
impl GitRepo for Repo {
    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn cloned_branch(&self) -> &str {
        &self.branch
    }

    async fn pull(&self, branch: &str) -> Result<()> {
        self.git(&["pull", &self.remote, branch]).await.map(|_| ())
    }

    async fn latest_commit(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }
}
