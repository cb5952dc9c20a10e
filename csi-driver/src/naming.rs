//! Deterministic backend names.
//!
//! Backend object names are derived from templates such as
//! `{{.LunPrefix}}-{{.VolumeHandle}}` filled from the request's stable
//! identifiers. The resolved name is the volume (or snapshot) id, so a
//! retried CreateVolume always lands on the same backend object.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dsm_client::ObjectKind;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::NamingConfig;
use crate::error::{DriverError, DriverResult};
use crate::types::{BackendKind, params};

/// Longest LUN name DSM accepts.
pub const MAX_LUN_NAME: usize = 128;
/// Longest shared folder name DSM accepts.
pub const MAX_SHARE_NAME: usize = 64;
/// Longest snapshot and target name we generate.
pub const MAX_SHORT_NAME: usize = 64;

/// Hex digits of the hash suffix appended to truncated names.
const HASH_SUFFIX_LEN: usize = 8;

/// Placeholder keys understood by templates.
pub mod keys {
    pub const PV_NAME: &str = "PVName";
    pub const VOLUME_HANDLE: &str = "VolumeHandle";
    pub const PVC_NAME: &str = "PVCName";
    pub const PVC_NAMESPACE: &str = "PVCNamespace";
    pub const SNAPSHOT_HANDLE: &str = "SnapshotHandle";
    pub const VOLUME_SNAPSHOT_NAME: &str = "VolumeSnapshotName";
    pub const VOLUME_SNAPSHOT_NAMESPACE: &str = "VolumeSnapshotNamespace";
    pub const VOLUME_SNAPSHOT_CONTENT_NAME: &str = "VolumeSnapshotContentName";
    pub const LUN_PREFIX: &str = "LunPrefix";
    pub const SHARE_PREFIX: &str = "SharePrefix";
    pub const TARGET_PREFIX: &str = "TargetPrefix";

    pub const ALL: [&str; 11] = [
        PV_NAME,
        VOLUME_HANDLE,
        PVC_NAME,
        PVC_NAMESPACE,
        SNAPSHOT_HANDLE,
        VOLUME_SNAPSHOT_NAME,
        VOLUME_SNAPSHOT_NAMESPACE,
        VOLUME_SNAPSHOT_CONTENT_NAME,
        LUN_PREFIX,
        SHARE_PREFIX,
        TARGET_PREFIX,
    ];
}

/// Values available to a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameInputs {
    values: BTreeMap<&'static str, String>,
}

impl NameInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a value. Empty values are treated as absent.
    pub fn set(&mut self, key: &'static str, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.values.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Inputs of a CreateVolume request.
    pub fn for_volume(request_name: &str, parameters: &HashMap<String, String>) -> Self {
        let param = |key: &str| parameters.get(key).cloned().unwrap_or_default();
        let pv_name = parameters
            .get(params::PV_NAME)
            .cloned()
            .unwrap_or_else(|| request_name.to_string());

        Self::new()
            .with(keys::VOLUME_HANDLE, request_name)
            .with(keys::PV_NAME, pv_name)
            .with(keys::PVC_NAME, param(params::PVC_NAME))
            .with(keys::PVC_NAMESPACE, param(params::PVC_NAMESPACE))
    }

    /// Inputs of a CreateSnapshot request.
    pub fn for_snapshot(request_name: &str, parameters: &HashMap<String, String>) -> Self {
        let param = |key: &str| parameters.get(key).cloned().unwrap_or_default();

        Self::new()
            .with(keys::SNAPSHOT_HANDLE, request_name)
            .with(keys::VOLUME_SNAPSHOT_NAME, param(params::SNAPSHOT_NAME))
            .with(keys::VOLUME_SNAPSHOT_NAMESPACE, param(params::SNAPSHOT_NAMESPACE))
            .with(
                keys::VOLUME_SNAPSHOT_CONTENT_NAME,
                param(params::SNAPSHOT_CONTENT_NAME),
            )
    }
}

/// Turns a template plus inputs into a string. Must be deterministic and
/// free of side effects.
pub trait NameResolver: Send + Sync {
    fn resolve(&self, template: &str, inputs: &NameInputs) -> DriverResult<String>;
}

/// Resolver for Go-template style placeholders (`{{.PVCName}}`).
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    placeholder: Regex,
}

impl TemplateResolver {
    pub fn new() -> DriverResult<Self> {
        let placeholder = Regex::new(r"\{\{\s*\.(\w+)\s*\}\}")
            .map_err(|e| DriverError::Internal(format!("placeholder pattern: {e}")))?;
        Ok(Self { placeholder })
    }
}

impl NameResolver for TemplateResolver {
    fn resolve(&self, template: &str, inputs: &NameInputs) -> DriverResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;

        for caps in self.placeholder.captures_iter(template) {
            let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let key = key.as_str();
            if !keys::ALL.contains(&key) {
                return Err(DriverError::InvalidArgument(format!(
                    "unknown placeholder '{key}' in template '{template}'"
                )));
            }
            let value = inputs.get(key).ok_or_else(|| {
                DriverError::InvalidArgument(format!(
                    "no value for '{key}' in template '{template}'"
                ))
            })?;

            out.push_str(&template[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }
        out.push_str(&template[last..]);

        if out.contains("{{") || out.contains("}}") {
            return Err(DriverError::InvalidArgument(format!(
                "malformed template '{template}'"
            )));
        }
        Ok(out)
    }
}

/// Replace every character DSM rejects in object names with `-`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Shorten `name` to `max` characters, keeping it unique by replacing the
/// tail with a hash of the full name.
pub fn fit(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let keep = max.saturating_sub(HASH_SUFFIX_LEN + 1);
    // Names are ASCII after sanitize, so byte slicing is safe
    format!("{}-{}", &name[..keep], &digest[..HASH_SUFFIX_LEN])
}

/// Name derivation for every backend object the driver creates.
#[derive(Clone)]
pub struct Naming {
    config: NamingConfig,
    resolver: Arc<dyn NameResolver>,
}

impl std::fmt::Debug for Naming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Naming")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Naming {
    pub fn new(config: NamingConfig, resolver: Arc<dyn NameResolver>) -> Self {
        Self { config, resolver }
    }

    /// Naming with the built-in template resolver.
    pub fn with_templates(config: NamingConfig) -> DriverResult<Self> {
        Ok(Self::new(config, Arc::new(TemplateResolver::new()?)))
    }

    fn with_prefixes(&self, inputs: &NameInputs) -> NameInputs {
        inputs
            .clone()
            .with(keys::LUN_PREFIX, self.config.lun_prefix.clone())
            .with(keys::SHARE_PREFIX, self.config.share_prefix.clone())
            .with(keys::TARGET_PREFIX, self.config.target_prefix.clone())
    }

    fn resolve_name(&self, template: &str, inputs: &NameInputs, max: usize) -> DriverResult<String> {
        let raw = self.resolver.resolve(template, &self.with_prefixes(inputs))?;
        let name = fit(&sanitize(raw.trim()), max);
        if name.is_empty() {
            return Err(DriverError::InvalidArgument(format!(
                "template '{template}' resolved to an empty name"
            )));
        }
        Ok(name)
    }

    fn resolve_description(&self, template: &str, inputs: &NameInputs) -> String {
        match self.resolver.resolve(template, &self.with_prefixes(inputs)) {
            Ok(description) => description,
            Err(e) => {
                debug!(error = %e, "Description template not resolvable, leaving empty");
                String::new()
            }
        }
    }

    /// Backend object name, which is also the volume id.
    pub fn volume_name(&self, kind: BackendKind, inputs: &NameInputs) -> DriverResult<String> {
        match kind.object_kind() {
            ObjectKind::Lun => {
                self.resolve_name(&self.config.lun_name_template, inputs, MAX_LUN_NAME)
            }
            ObjectKind::Share => {
                self.resolve_name(&self.config.share_name_template, inputs, MAX_SHARE_NAME)
            }
        }
    }

    /// Free-text description stored on the backend object. Missing inputs
    /// yield an empty description rather than an error.
    pub fn volume_description(&self, kind: BackendKind, inputs: &NameInputs) -> String {
        match kind.object_kind() {
            ObjectKind::Lun => self.resolve_description(&self.config.lun_description_template, inputs),
            ObjectKind::Share => {
                self.resolve_description(&self.config.share_description_template, inputs)
            }
        }
    }

    /// Backend snapshot name, which is also the snapshot id.
    pub fn snapshot_name(&self, parent: ObjectKind, inputs: &NameInputs) -> DriverResult<String> {
        let template = match parent {
            ObjectKind::Lun => &self.config.lun_snapshot_name_template,
            ObjectKind::Share => &self.config.share_snapshot_name_template,
        };
        self.resolve_name(template, inputs, MAX_SHORT_NAME)
    }

    pub fn snapshot_description(&self, inputs: &NameInputs) -> String {
        self.resolve_description(&self.config.snapshot_description_template, inputs)
    }

    /// iSCSI target name for a volume.
    pub fn target_name(&self, volume_id: &str) -> String {
        let prefix = format!("{}-", self.config.target_prefix);
        let name = if volume_id.starts_with(&prefix) {
            volume_id.to_string()
        } else {
            format!("{prefix}{volume_id}")
        };
        fit(&sanitize(&name), MAX_SHORT_NAME)
    }

    /// iSCSI target IQN for a volume.
    pub fn target_iqn(&self, volume_id: &str) -> String {
        format!(
            "{}{}",
            self.config.iqn_prefix,
            self.target_name(volume_id).to_lowercase()
        )
    }

    /// Whether an array object carries the driver's name prefix for its
    /// kind. Objects without it are left out of listings.
    pub fn is_managed(&self, kind: ObjectKind, name: &str) -> bool {
        let prefix = match kind {
            ObjectKind::Lun => &self.config.lun_prefix,
            ObjectKind::Share => &self.config.share_prefix,
        };
        name.starts_with(prefix.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naming() -> Naming {
        Naming::with_templates(NamingConfig::default()).unwrap()
    }

    #[test]
    fn test_template_resolves_placeholders() {
        let resolver = TemplateResolver::new().unwrap();
        let inputs = NameInputs::new()
            .with(keys::PVC_NAME, "data")
            .with(keys::PVC_NAMESPACE, "prod");

        assert_eq!(
            resolver
                .resolve("{{.PVCNamespace}}-{{ .PVCName }}", &inputs)
                .unwrap(),
            "prod-data"
        );
        assert_eq!(resolver.resolve("static", &inputs).unwrap(), "static");
    }

    #[test]
    fn test_template_errors() {
        let resolver = TemplateResolver::new().unwrap();
        let inputs = NameInputs::new().with(keys::PVC_NAME, "data");

        // Unknown key
        assert!(resolver.resolve("{{.Bogus}}", &inputs).is_err());
        // Known key without a value
        assert!(resolver.resolve("{{.PVCNamespace}}", &inputs).is_err());
        // Unterminated placeholder
        assert!(resolver.resolve("{{.PVCName", &inputs).is_err());
    }

    #[test]
    fn test_empty_inputs_are_absent() {
        let inputs = NameInputs::new().with(keys::PVC_NAME, "");
        assert_eq!(inputs.get(keys::PVC_NAME), None);
    }

    #[test]
    fn test_volume_name_is_deterministic() {
        let naming = naming();
        let inputs = NameInputs::for_volume("pvc-1", &HashMap::new());

        let first = naming.volume_name(BackendKind::Iscsi, &inputs).unwrap();
        let second = naming.volume_name(BackendKind::Iscsi, &inputs).unwrap();
        assert_eq!(first, "k8s-csi-pvc-1");
        assert_eq!(first, second);
        assert_eq!(
            naming.volume_name(BackendKind::Smb, &inputs).unwrap(),
            "k8s-csi-pvc-1"
        );
    }

    #[test]
    fn test_volume_inputs_from_parameters() {
        let mut parameters = HashMap::new();
        parameters.insert(params::PVC_NAME.to_string(), "data".to_string());
        parameters.insert(params::PVC_NAMESPACE.to_string(), "prod".to_string());
        parameters.insert(params::PV_NAME.to_string(), "pv-9".to_string());

        let inputs = NameInputs::for_volume("pvc-1", &parameters);
        assert_eq!(inputs.get(keys::PV_NAME), Some("pv-9"));
        assert_eq!(inputs.get(keys::VOLUME_HANDLE), Some("pvc-1"));
        assert_eq!(
            naming().volume_description(BackendKind::Iscsi, &inputs),
            "prod/data"
        );

        // Without metadata the description is empty, not an error
        let bare = NameInputs::for_volume("pvc-1", &HashMap::new());
        assert_eq!(naming().volume_description(BackendKind::Iscsi, &bare), "");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("ns/pvc name"), "ns-pvc-name");
        assert_eq!(sanitize("a.b_c-d9"), "a.b_c-d9");
    }

    #[test]
    fn test_fit_truncates_with_hash() {
        let long = "x".repeat(100);
        let fitted = fit(&long, MAX_SHARE_NAME);
        assert_eq!(fitted.len(), MAX_SHARE_NAME);
        assert!(fitted.starts_with("xxxx"));
        assert_eq!(fitted, fit(&long, MAX_SHARE_NAME));

        let other = format!("{}y", "x".repeat(99));
        assert_ne!(fit(&other, MAX_SHARE_NAME), fitted);
        assert_eq!(fit("short", MAX_SHARE_NAME), "short");
    }

    #[test]
    fn test_snapshot_name() {
        let inputs = NameInputs::for_snapshot("snap-1", &HashMap::new());
        assert_eq!(
            naming().snapshot_name(ObjectKind::Lun, &inputs).unwrap(),
            "snapshot-snap-1"
        );
    }

    #[test]
    fn test_target_names() {
        let naming = naming();
        assert_eq!(naming.target_name("k8s-csi-pvc-1"), "k8s-csi-pvc-1");
        assert_eq!(naming.target_name("legacy"), "k8s-csi-legacy");
        assert_eq!(
            naming.target_iqn("k8s-csi-PVC-1"),
            "iqn.2000-01.com.synology:k8s-csi-pvc-1"
        );
    }

    #[test]
    fn test_is_managed() {
        let naming = naming();
        assert!(naming.is_managed(ObjectKind::Lun, "k8s-csi-pvc-1"));
        assert!(naming.is_managed(ObjectKind::Share, "k8s-csi-pvc-2"));
        assert!(!naming.is_managed(ObjectKind::Share, "homes"));
    }

    #[test]
    fn test_missing_volume_handle_fails() {
        let err = naming()
            .volume_name(BackendKind::Iscsi, &NameInputs::new())
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }
}
