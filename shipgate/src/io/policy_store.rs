//! Active policy snapshot (`.shipgate/policy-pack.json`) and settings mirroring.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::core::policy::{Permissions, PolicyCatalog, PolicyPack};
use crate::io::project_state::write_atomic;

/// Resolved pack plus its content hash, replaced wholesale on apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePolicy {
    pub pack: PolicyPack,
    pub hash: String,
    #[serde(default)]
    pub applied_at: Option<String>,
}

/// SHA-256 (hex) over the canonical JSON of a resolved pack.
pub fn pack_hash(pack: &PolicyPack) -> Result<String> {
    let canonical = serde_json::to_vec(pack).context("serialize policy pack")?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

/// Receives resolved permission lists for externally consumed settings.
pub trait SettingsMirror {
    fn mirror(&self, permissions: &Permissions) -> Result<()>;
}

/// Rewrites the `permissions` object of an existing JSON settings file.
///
/// A missing file is left alone.
#[derive(Debug, Clone)]
pub struct JsonSettingsMirror {
    path: PathBuf,
}

impl JsonSettingsMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsMirror for JsonSettingsMirror {
    fn mirror(&self, permissions: &Permissions) -> Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "settings file missing, skipping mirror");
            return Ok(());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read settings {}", self.path.display()))?;
        let mut settings: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse settings {}", self.path.display()))?;
        let Some(object) = settings.as_object_mut() else {
            return Err(anyhow!(
                "settings {} is not a JSON object",
                self.path.display()
            ));
        };
        object.insert(
            "permissions".to_string(),
            json!({
                "defaultMode": "plan",
                "deny": permissions.deny,
                "ask": permissions.ask,
                "allow": permissions.allow,
            }),
        );
        let mut buf = serde_json::to_string_pretty(&settings)?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

/// Resolve `name`, hash it, mirror its permissions and persist the snapshot.
///
/// The snapshot is written last: resolution or mirror errors leave any
/// previously applied snapshot untouched.
pub fn apply_policy_pack(
    catalog: &PolicyCatalog,
    policy_path: &Path,
    name: &str,
    mirror: &dyn SettingsMirror,
) -> Result<ActivePolicy> {
    let pack = catalog.resolve(name)?;
    let active = ActivePolicy {
        hash: pack_hash(&pack)?,
        pack,
        applied_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
    };

    let mut buf = serde_json::to_string_pretty(&active)?;
    buf.push('\n');
    mirror.mirror(&active.pack.permissions)?;
    write_atomic(policy_path, &buf)?;

    info!(pack = %active.pack.name, hash = %active.hash, "policy pack applied");
    Ok(active)
}

/// Load the applied snapshot, or `None` if nothing has been applied.
pub fn active_policy(policy_path: &Path) -> Result<Option<ActivePolicy>> {
    if !policy_path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(policy_path)
        .with_context(|| format!("read active policy {}", policy_path.display()))?;
    let active: ActivePolicy = serde_json::from_str(&raw)
        .with_context(|| format!("parse active policy {}", policy_path.display()))?;
    Ok(Some(active))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::PolicyError;

    struct NoMirror;

    impl SettingsMirror for NoMirror {
        fn mirror(&self, _permissions: &Permissions) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn apply_persists_resolved_pack_and_hash() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("policy-pack.json");
        let catalog = PolicyCatalog::builtin();

        assert!(active_policy(&path).expect("load").is_none());
        let applied = apply_policy_pack(&catalog, &path, "strict", &NoMirror).expect("apply");
        let loaded = active_policy(&path).expect("load").expect("some");

        assert_eq!(loaded, applied);
        assert_eq!(loaded.pack, catalog.resolve("strict").expect("resolve"));
        assert_eq!(loaded.hash, pack_hash(&loaded.pack).expect("hash"));
        assert_eq!(loaded.hash.len(), 64);
    }

    #[test]
    fn hash_differs_between_packs() {
        let catalog = PolicyCatalog::builtin();
        let base = pack_hash(&catalog.resolve("default-balanced").expect("base")).expect("hash");
        let strict = pack_hash(&catalog.resolve("strict").expect("strict")).expect("hash");
        assert_ne!(base, strict);
    }

    #[test]
    fn failed_resolution_keeps_previous_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("policy-pack.json");
        let catalog = PolicyCatalog::builtin();
        let applied =
            apply_policy_pack(&catalog, &path, "default-balanced", &NoMirror).expect("apply");

        let err = apply_policy_pack(&catalog, &path, "nope", &NoMirror).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PolicyError>(),
            Some(&PolicyError::UnknownPack("nope".to_string()))
        );
        assert_eq!(active_policy(&path).expect("load"), Some(applied));
    }

    #[test]
    fn mirror_failure_keeps_previous_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("policy-pack.json");
        let settings = temp.path().join("settings.json");
        let catalog = PolicyCatalog::builtin();
        let applied =
            apply_policy_pack(&catalog, &path, "default-balanced", &NoMirror).expect("apply");
        fs::write(&settings, "not json").expect("write");

        let err = apply_policy_pack(&catalog, &path, "strict", &JsonSettingsMirror::new(&settings))
            .unwrap_err();
        assert!(format!("{err:#}").contains("parse settings"));
        assert_eq!(active_policy(&path).expect("load"), Some(applied));
        assert_eq!(fs::read_to_string(&settings).expect("read"), "not json");
    }

    #[test]
    fn json_mirror_rewrites_permissions_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = temp.path().join("settings.json");
        fs::write(&settings, r#"{"model": "x", "permissions": {"allow": ["*"]}}"#).expect("write");

        let pack = PolicyCatalog::builtin().resolve("strict").expect("resolve");
        JsonSettingsMirror::new(&settings)
            .mirror(&pack.permissions)
            .expect("mirror");

        let value: Value =
            serde_json::from_str(&fs::read_to_string(&settings).expect("read")).expect("parse");
        assert_eq!(value["model"], "x");
        assert_eq!(value["permissions"]["defaultMode"], "plan");
        assert_eq!(value["permissions"]["deny"][0], ".env");
        assert!(
            value["permissions"]["ask"]
                .as_array()
                .expect("array")
                .iter()
                .any(|v| v == "git push *")
        );
    }

    #[test]
    fn json_mirror_skips_missing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = temp.path().join("absent.json");
        JsonSettingsMirror::new(&settings)
            .mirror(&Permissions::default())
            .expect("mirror");
        assert!(!settings.exists());
    }
}
