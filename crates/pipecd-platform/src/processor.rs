//! Manifest pre-processing
//!
//! Files listed as decryption targets may reference sealed secrets as
//! `{{ .encryptedSecrets.<name> }}`; files listed as attachment targets may
//! inline other files of the application as `{{ .attachment.<name> }}`.
//! Substitution happens in memory, the checked-out repository is never
//! touched.

use pipecd_common::{Error, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{-?\s*\.(encryptedSecrets|attachment)\.([A-Za-z0-9_-]+)\s*-?\}\}")
        .unwrap_or_else(|e| unreachable!("placeholder pattern is valid: {e}"))
});

/// Opens secrets sealed with the piped's key
pub trait SecretDecrypter: Send + Sync {
    fn decrypt(&self, encrypted: &str) -> Result<String>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretEncryption {
    pub encrypted_secrets: BTreeMap<String, String>,
    /// Files, relative to the application directory, to render secrets into
    pub decryption_targets: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Attachment {
    /// Attachment name to file path, relative to the application directory
    pub sources: BTreeMap<String, String>,
    pub targets: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ManifestProcessor {
    app_dir: PathBuf,
    secrets: BTreeMap<String, String>,
    secret_targets: Vec<String>,
    attachments: BTreeMap<String, String>,
    attachment_targets: Vec<String>,
}

/// Resolve `rel` under `base`, refusing paths that leave it
pub fn join_inside(base: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        return Err(Error::invalid_argument(format!("path {rel:?} must stay inside {}", base.display())));
    }
    Ok(base.join(rel_path))
}

fn normalize(rel: &str) -> String {
    rel.trim_start_matches("./").to_string()
}

impl ManifestProcessor {
    pub fn new(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
            ..Default::default()
        }
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    /// Decrypt every secret up front
    pub fn with_secrets(mut self, encryption: &SecretEncryption, decrypter: &dyn SecretDecrypter) -> Result<Self> {
        for (name, sealed) in &encryption.encrypted_secrets {
            let plain = decrypter
                .decrypt(sealed)
                .map_err(|e| Error::invalid_argument(format!("failed to decrypt secret {name}: {e}")))?;
            self.secrets.insert(name.clone(), plain);
        }
        self.secret_targets = encryption.decryption_targets.iter().map(|t| normalize(t)).collect();
        Ok(self)
    }

    pub fn with_attachments(mut self, attachment: &Attachment) -> Result<Self> {
        for (name, rel) in &attachment.sources {
            let path = join_inside(&self.app_dir, rel)?;
            let content = std::fs::read_to_string(&path)
                .map_err(|e| Error::invalid_argument(format!("failed to read attachment {name} ({}): {e}", path.display())))?;
            self.attachments.insert(name.clone(), content);
        }
        self.attachment_targets = attachment.targets.iter().map(|t| normalize(t)).collect();
        Ok(self)
    }

    /// Read `rel` from the application directory and render it
    pub fn read(&self, rel: &str) -> Result<String> {
        let path = join_inside(&self.app_dir, rel)?;
        let content = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("manifest {}", path.display())),
            _ => Error::from(e),
        })?;
        self.render(rel, &content)
    }

    pub fn render(&self, rel: &str, content: &str) -> Result<String> {
        let rel = normalize(rel);
        let secrets = self.secret_targets.contains(&rel);
        let attachments = self.attachment_targets.contains(&rel);
        if !secrets && !attachments {
            return Ok(content.to_string());
        }
        let mut missing = None;
        let out = PLACEHOLDER.replace_all(content, |caps: &Captures<'_>| {
            let (source, enabled) = match &caps[1] {
                "encryptedSecrets" => (&self.secrets, secrets),
                _ => (&self.attachments, attachments),
            };
            match source.get(&caps[2]) {
                Some(v) if enabled => v.clone(),
                _ => {
                    missing.get_or_insert_with(|| caps[0].to_string());
                    caps[0].to_string()
                }
            }
        });
        if let Some(placeholder) = missing {
            return Err(Error::invalid_argument(format!("{rel}: {placeholder} cannot be resolved")));
        }
        Ok(out.into_owned())
    }
}
