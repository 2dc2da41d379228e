use std::fmt;
use std::path::{Component, Path};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::PipelineError;
use crate::naming::IdGenerator;

/// Fields that must be non-empty once defaults have been merged in.
const REQUIRED_FIELDS: [(&str, &str); 4] = [
    ("artifact", "repo"),
    ("artifact", "buildCmd"),
    ("config", "repo"),
    ("config", "destinationPath"),
];

const DEFAULT_TAG: &str = "master";
const DEFAULT_DOCKERFILE: &str = "Dockerfile";
const DEFAULT_IMAGE_VERSION: &str = "1.0";

/// A normalized deployment manifest.
///
/// Built by [`resolve`]: defaults first, the manifest file layered on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentManifest {
    #[serde(deserialize_with = "scalar")]
    pub name: String,
    pub artifact: ArtifactSource,
    pub config: ConfigSource,
    pub image: ImageSpec,
    pub deploy: DeploySpec,
    /// The merged document, unknown keys included.
    #[serde(skip)]
    document: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSource {
    #[serde(deserialize_with = "scalar")]
    pub repo: String,
    #[serde(deserialize_with = "scalar")]
    pub tag: String,
    #[serde(deserialize_with = "scalar")]
    pub build_cmd: String,
    #[serde(deserialize_with = "scalar")]
    pub docker_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSource {
    #[serde(deserialize_with = "scalar")]
    pub repo: String,
    #[serde(deserialize_with = "scalar")]
    pub tag: String,
    #[serde(deserialize_with = "scalar")]
    pub destination_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    #[serde(deserialize_with = "scalar")]
    pub name: String,
    #[serde(deserialize_with = "scalar")]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploySpec {
    #[serde(rename = "type")]
    pub kind: DeployKind,
    #[serde(deserialize_with = "scalar")]
    pub name: String,
    #[serde(
        default,
        deserialize_with = "optional_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub network: Option<String>,
    #[serde(
        default,
        deserialize_with = "optional_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub run_flags: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployKind {
    #[default]
    Container,
}

/// `name:version` reference of a built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub version: String,
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

impl ImageSpec {
    pub fn image_ref(&self) -> ImageRef {
        ImageRef {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

impl DeploymentManifest {
    /// The merged manifest document, including keys this crate does not
    /// interpret.
    pub fn document(&self) -> &Value {
        &self.document
    }
}

/// Resolves manifests, drawing one fresh default-name token per call.
pub struct ManifestResolver {
    ids: Arc<dyn IdGenerator>,
}

impl ManifestResolver {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self { ids }
    }

    pub fn resolve(&self, raw: &str) -> Result<DeploymentManifest, PipelineError> {
        let seed = self.ids.next_id();
        tracing::debug!(seed = %seed, "Resolving manifest");
        resolve(raw, &seed)
    }

    /// Read and resolve a manifest file.
    pub async fn resolve_file(&self, path: &Path) -> Result<DeploymentManifest, PipelineError> {
        tracing::info!(manifest = %path.display(), "Parsing manifest");
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            PipelineError::ManifestParse(format!("cannot read {}: {e}", path.display()))
        })?;
        tracing::debug!(contents = %raw, "Manifest contents");
        self.resolve(&raw)
    }
}

/// Parse `raw`, merge it over the defaults derived from `seed`, and validate.
pub fn resolve(raw: &str, seed: &str) -> Result<DeploymentManifest, PipelineError> {
    let parsed: Value =
        serde_yaml::from_str(raw).map_err(|e| PipelineError::ManifestParse(e.to_string()))?;

    let overrides = match parsed {
        Value::Null => Value::Mapping(Mapping::new()),
        mapping @ Value::Mapping(_) => mapping,
        other => {
            return Err(PipelineError::ManifestParse(format!(
                "expected a mapping at the top level, found {}",
                kind_of(&other)
            )));
        }
    };

    let mut document = defaults(seed);
    deep_merge(&mut document, overrides);

    let missing = missing_fields(&document);
    if !missing.is_empty() {
        return Err(PipelineError::ManifestValidation { fields: missing });
    }

    let mut manifest: DeploymentManifest = serde_yaml::from_value(document.clone())
        .map_err(|e| PipelineError::ManifestParse(e.to_string()))?;
    check_relative_path(
        "image.name",
        &manifest.image.name,
        "must stay inside the run workspace",
    )?;
    check_relative_path(
        "config.destinationPath",
        &manifest.config.destination_path,
        "must stay inside the artifact tree",
    )?;

    manifest.deploy.network = manifest.deploy.network.filter(|n| !n.trim().is_empty());
    manifest.deploy.run_flags = manifest.deploy.run_flags.filter(|f| !f.trim().is_empty());
    manifest.document = document;
    Ok(manifest)
}

/// Default document. Rebuilt on every call so no resolution can leak into
/// the next one.
fn defaults(seed: &str) -> Value {
    let image_name = format!("{seed}-image");
    let mut root = Mapping::new();
    root.insert("name".into(), seed.into());
    root.insert(
        "artifact".into(),
        mapping(&[("tag", DEFAULT_TAG), ("dockerFile", DEFAULT_DOCKERFILE)]),
    );
    root.insert("config".into(), mapping(&[("tag", DEFAULT_TAG)]));
    root.insert(
        "image".into(),
        mapping(&[("name", image_name.as_str()), ("version", DEFAULT_IMAGE_VERSION)]),
    );
    root.insert(
        "deploy".into(),
        mapping(&[("type", "container"), ("name", seed)]),
    );
    Value::Mapping(root)
}

fn mapping(entries: &[(&str, &str)]) -> Value {
    let mut map = Mapping::new();
    for (key, value) in entries {
        map.insert((*key).into(), (*value).into());
    }
    Value::Mapping(map)
}

/// Recursive merge: mappings merge key by key, anything else in `overlay`
/// replaces what is in `base`.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn missing_fields(document: &Value) -> Vec<String> {
    REQUIRED_FIELDS
        .iter()
        .filter(|(section, key)| !is_present(document.get(*section).and_then(|s| s.get(*key))))
        .map(|(section, key)| format!("{section}.{key}"))
        .collect()
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Number(_)) | Some(Value::Bool(_)) => true,
        _ => false,
    }
}

// `image.name` doubles as the artifact checkout directory.
fn check_relative_path(field: &str, value: &str, rule: &str) -> Result<(), PipelineError> {
    let escapes = Path::new(value).components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(PipelineError::InvalidField {
            field: field.into(),
            reason: format!("`{value}` {rule}"),
        });
    }
    Ok(())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

// YAML happily types `version: 2.0` as a float; accept any scalar as text.
fn scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a scalar, found {}",
            kind_of(&other)
        ))),
    }
}

fn optional_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected a scalar, found {}",
            kind_of(&other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::SequenceIdGenerator;

    const MINIMAL: &str = r#"
artifact:
  repo: https://example.com/app.git
  buildCmd: make
config:
  repo: https://example.com/app-config.git
  destinationPath: conf
"#;

    #[test]
    fn applies_defaults_from_seed() {
        let manifest = resolve(MINIMAL, "12345").unwrap();
        assert_eq!(manifest.name, "12345");
        assert_eq!(manifest.artifact.tag, "master");
        assert_eq!(manifest.artifact.docker_file, "Dockerfile");
        assert_eq!(manifest.config.tag, "master");
        assert_eq!(manifest.image.name, "12345-image");
        assert_eq!(manifest.image.version, "1.0");
        assert_eq!(manifest.deploy.kind, DeployKind::Container);
        assert_eq!(manifest.deploy.name, "12345");
        assert_eq!(manifest.deploy.network, None);
        assert_eq!(manifest.deploy.run_flags, None);
    }

    #[test]
    fn fully_specified_manifest_keeps_every_value() {
        let raw = r#"
name: shop
artifact:
  repo: R1
  tag: v1
  buildCmd: make dist
  dockerFile: docker/Dockerfile.prod
config:
  repo: R2
  tag: v7
  destinationPath: etc/shop
image:
  name: shop-web
  version: "2.3"
deploy:
  type: container
  name: shop-web-1
  network: backend
  runFlags: -p 8080:80 --restart always
"#;
        let manifest = resolve(raw, "99999").unwrap();
        assert_eq!(manifest.name, "shop");
        assert_eq!(manifest.artifact.repo, "R1");
        assert_eq!(manifest.artifact.tag, "v1");
        assert_eq!(manifest.artifact.build_cmd, "make dist");
        assert_eq!(manifest.artifact.docker_file, "docker/Dockerfile.prod");
        assert_eq!(manifest.config.repo, "R2");
        assert_eq!(manifest.config.tag, "v7");
        assert_eq!(manifest.config.destination_path, "etc/shop");
        assert_eq!(manifest.image.image_ref().to_string(), "shop-web:2.3");
        assert_eq!(manifest.deploy.name, "shop-web-1");
        assert_eq!(manifest.deploy.network.as_deref(), Some("backend"));
        assert_eq!(
            manifest.deploy.run_flags.as_deref(),
            Some("-p 8080:80 --restart always")
        );
    }

    #[test]
    fn resolving_twice_gives_the_same_result() {
        let first = resolve(MINIMAL, "11111").unwrap();
        let second = resolve(MINIMAL, "11111").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn each_required_field_is_reported() {
        for (field, raw) in [
            (
                "artifact.repo",
                "artifact: {buildCmd: make}\nconfig: {repo: R2, destinationPath: conf}",
            ),
            (
                "artifact.buildCmd",
                "artifact: {repo: R1}\nconfig: {repo: R2, destinationPath: conf}",
            ),
            (
                "config.repo",
                "artifact: {repo: R1, buildCmd: make}\nconfig: {destinationPath: conf}",
            ),
            (
                "config.destinationPath",
                "artifact: {repo: R1, buildCmd: make}\nconfig: {repo: R2}",
            ),
        ] {
            match resolve(raw, "1") {
                Err(PipelineError::ManifestValidation { fields }) => {
                    assert_eq!(fields, vec![field.to_string()]);
                }
                other => panic!("expected validation error for {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn empty_manifest_reports_all_required_fields() {
        let err = resolve("", "1").unwrap_err();
        let msg = err.to_string();
        for field in [
            "artifact.repo",
            "artifact.buildCmd",
            "config.repo",
            "config.destinationPath",
        ] {
            assert!(msg.contains(field), "{msg} should mention {field}");
        }
    }

    #[test]
    fn empty_strings_count_as_missing() {
        let raw = "artifact: {repo: '', buildCmd: make}\nconfig: {repo: R2, destinationPath: conf}";
        match resolve(raw, "1") {
            Err(PipelineError::ManifestValidation { fields }) => {
                assert_eq!(fields, vec!["artifact.repo".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = resolve("artifact: [unclosed", "1").unwrap_err();
        assert!(matches!(err, PipelineError::ManifestParse(_)));
    }

    #[test]
    fn top_level_sequence_is_a_parse_error() {
        let err = resolve("- a\n- b\n", "1").unwrap_err();
        assert!(matches!(err, PipelineError::ManifestParse(_)));
    }

    #[test]
    fn unsupported_deploy_type_is_rejected() {
        let raw = format!("{MINIMAL}deploy:\n  type: swarm\n");
        let err = resolve(&raw, "1").unwrap_err();
        assert!(matches!(err, PipelineError::ManifestParse(_)));
    }

    #[test]
    fn numeric_scalars_become_strings() {
        let raw = format!("{MINIMAL}image:\n  name: app\n  version: 2.5\n");
        let manifest = resolve(&raw, "1").unwrap();
        assert_eq!(manifest.image.version, "2.5");
    }

    #[test]
    fn unknown_keys_pass_through() {
        let raw = format!("{MINIMAL}owner: platform-team\ndeploy:\n  labels: {{tier: web}}\n");
        let manifest = resolve(&raw, "1").unwrap();
        let doc = manifest.document();
        assert_eq!(
            doc.get("owner").and_then(Value::as_str),
            Some("platform-team")
        );
        assert_eq!(
            doc.get("deploy")
                .and_then(|d| d.get("labels"))
                .and_then(|l| l.get("tier"))
                .and_then(Value::as_str),
            Some("web")
        );
    }

    #[test]
    fn empty_network_is_treated_as_absent() {
        let raw = format!("{MINIMAL}deploy:\n  network: ''\n  runFlags: ''\n");
        let manifest = resolve(&raw, "1").unwrap();
        assert_eq!(manifest.deploy.network, None);
        assert_eq!(manifest.deploy.run_flags, None);
    }

    #[test]
    fn destination_path_may_not_escape() {
        for dest in ["../outside", "/etc/app"] {
            let raw = format!(
                "artifact: {{repo: R1, buildCmd: make}}\nconfig: {{repo: R2, destinationPath: '{dest}'}}"
            );
            let err = resolve(&raw, "1").unwrap_err();
            assert!(
                matches!(err, PipelineError::InvalidField { ref field, .. } if field == "config.destinationPath"),
                "{dest}: {err:?}"
            );
        }
    }

    #[test]
    fn image_name_may_not_escape_workspace() {
        for name in ["../../leaked", "/opt/app", "app/../../x"] {
            let raw = format!(
                "artifact: {{repo: R1, buildCmd: make}}\nconfig: {{repo: R2, destinationPath: conf}}\nimage: {{name: '{name}'}}"
            );
            let err = resolve(&raw, "1").unwrap_err();
            assert!(
                matches!(err, PipelineError::InvalidField { ref field, .. } if field == "image.name"),
                "{name}: {err:?}"
            );
        }

        let raw = "artifact: {repo: R1, buildCmd: make}\nconfig: {repo: R2, destinationPath: conf}\nimage: {name: registry.local/app}";
        assert_eq!(resolve(raw, "1").unwrap().image.name, "registry.local/app");
    }

    #[test]
    fn deep_merge_overrides_leaves_and_keeps_siblings() {
        let mut base: Value = serde_yaml::from_str("a: {b: 1, c: 2}\nd: 3").unwrap();
        let overlay: Value = serde_yaml::from_str("a: {c: 20, e: 5}\nd: {x: 1}").unwrap();
        deep_merge(&mut base, overlay);
        let expected: Value = serde_yaml::from_str("a: {b: 1, c: 20, e: 5}\nd: {x: 1}").unwrap();
        assert_eq!(base, expected);
    }

    #[test]
    fn resolver_uses_one_token_per_call() {
        let resolver = ManifestResolver::new(Arc::new(SequenceIdGenerator::new(500)));
        let first = resolver.resolve(MINIMAL).unwrap();
        assert_eq!(first.name, "500");
        assert_eq!(first.image.name, "500-image");
        assert_eq!(first.deploy.name, "500");

        let second = resolver.resolve(MINIMAL).unwrap();
        assert_eq!(second.name, "501");
        assert_eq!(second.image.name, "501-image");
    }
}
