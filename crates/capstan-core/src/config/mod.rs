//! Validated build configuration.
//!
//! The YAML document is parsed once into a closed set of typed shapes and
//! validated immediately; afterwards the model is read-only. Unknown keys and
//! malformed shapes are rejected at load time, never deferred into execution.

pub mod step;

pub use step::{
    ArchiveSpec, CredentialRef, CredentialType, ForeachKind, LockConfig, LockScope, RunOnChange,
    StepConfig, VolumeSpec,
};

use crate::error::ConfigError;
use crate::version::{BranchPolicy, BumpPolicy, TagPattern, Version, VersionFormat};
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

const DEFAULT_PROTECTED_BRANCHES: &str = r"^(release|hotfix)/";
const DEFAULT_HOTFIX_BRANCHES: &str = r"^hotfix/(?P<id>.+)$";

/// `tag` setting: plain on/off, or an explicit tag pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagSetting {
    Enabled(bool),
    Pattern(String),
}

impl Default for TagSetting {
    fn default() -> Self {
        TagSetting::Enabled(true)
    }
}

/// The `version:` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VersionConfig {
    #[serde(default)]
    pub tag: TagSetting,

    #[serde(default)]
    pub format: VersionFormat,

    #[serde(default)]
    pub bump: BumpPolicy,

    /// Fallback version when no tag is reachable from history.
    #[serde(default)]
    pub initial: Option<String>,

    /// Pattern deriving a hotfix identifier from the branch name; needs an
    /// `id` capture group.
    #[serde(default)]
    pub hotfix_id: Option<String>,

    /// Branches restricted to patch bumps.
    #[serde(default)]
    pub protected_branches: Option<String>,
}

impl VersionConfig {
    pub fn tag_enabled(&self) -> bool {
        !matches!(self.tag, TagSetting::Enabled(false))
    }

    pub fn tag_pattern(&self) -> Result<TagPattern, ConfigError> {
        match &self.tag {
            TagSetting::Pattern(pattern) => TagPattern::new(pattern),
            TagSetting::Enabled(_) => Ok(TagPattern::default()),
        }
    }

    pub fn initial_version(&self) -> Result<Option<Version>, ConfigError> {
        self.initial
            .as_deref()
            .map(|raw| {
                Version::parse(raw, self.format)
                    .map_err(|_| ConfigError::Malformed(format!("invalid initial version '{raw}'")))
            })
            .transpose()
    }

    /// Pattern for deriving hotfix identifiers, defaulting to `hotfix/<id>`.
    pub fn hotfix_pattern(&self) -> Result<Regex, ConfigError> {
        let pattern = self.hotfix_id.as_deref().unwrap_or(DEFAULT_HOTFIX_BRANCHES);
        compile(pattern)
    }

    /// Whether the branch is a hotfix lineage.
    pub fn is_hotfix_branch(&self, branch: &str) -> Result<bool, ConfigError> {
        Ok(self.hotfix_pattern()?.is_match(branch))
    }

    /// Bump restriction for the given branch.
    pub fn branch_policy(&self, branch: &str) -> Result<BranchPolicy, ConfigError> {
        let pattern = self
            .protected_branches
            .as_deref()
            .unwrap_or(DEFAULT_PROTECTED_BRANCHES);
        if compile(pattern)?.is_match(branch) {
            Ok(BranchPolicy::patch_only())
        } else {
            Ok(BranchPolicy::unrestricted())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.tag_pattern()?;
        self.initial_version()?;
        self.hotfix_pattern()?;
        if let Some(pattern) = &self.protected_branches {
            compile(pattern)?;
        }
        Ok(())
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// A named parallel branch of work within a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub name: String,
    pub steps: Vec<StepConfig>,
}

impl VariantConfig {
    /// Node label: first declaration wins.
    pub fn node_label(&self) -> Option<&str> {
        self.steps.iter().find_map(|s| s.node_label.as_deref())
    }

    /// Whether this variant waits on the full previous phase (the default).
    pub fn wait_on_full_previous_phase(&self) -> bool {
        self.steps
            .iter()
            .find_map(|s| s.wait_on_full_previous_phase)
            .unwrap_or(true)
    }
}

/// An ordered position in the build sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub variants: Vec<VariantConfig>,
}

impl PhaseConfig {
    pub fn variant(&self, name: &str) -> Option<&VariantConfig> {
        self.variants.iter().find(|v| v.name == name)
    }
}

/// A named step list (post-submit phases, modality preparation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSteps {
    pub name: String,
    pub steps: Vec<StepConfig>,
}

/// The complete, validated configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default)]
    pub version: VersionConfig,

    #[serde(default, deserialize_with = "de_phases")]
    pub phases: Vec<PhaseConfig>,

    /// Steps run only after a successful publish.
    #[serde(default, deserialize_with = "de_named_steps")]
    pub post_submit: Vec<NamedSteps>,

    #[serde(default)]
    pub ci_locks: Vec<LockConfig>,

    /// Volumes mounted into every step.
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,

    /// Environment variables forwarded from the invoking environment.
    #[serde(default)]
    pub pass_through_environment_vars: Vec<String>,

    /// Per-modality source preparation steps.
    #[serde(default, deserialize_with = "de_named_steps")]
    pub modality_source_preparation: Vec<NamedSteps>,
}

impl BuildConfig {
    /// Parse and validate a YAML document.
    pub fn load_str(input: &str) -> Result<Self, ConfigError> {
        let config: BuildConfig = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path)?;
        Self::load_str(&input)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn modality(&self, name: &str) -> Option<&NamedSteps> {
        self.modality_source_preparation
            .iter()
            .find(|m| m.name == name)
    }

    /// Validate the whole document. Called by the loaders; also usable on
    /// programmatically constructed configs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.version.validate()?;

        let mut phase_names = HashSet::new();
        for phase in &self.phases {
            if !phase_names.insert(phase.name.as_str()) {
                return Err(ConfigError::DuplicatePhaseName {
                    phase: phase.name.clone(),
                });
            }

            let mut variant_names = HashSet::new();
            for variant in &phase.variants {
                if !variant_names.insert(variant.name.as_str()) {
                    return Err(ConfigError::Malformed(format!(
                        "phase '{}' declares variant '{}' twice",
                        phase.name, variant.name
                    )));
                }
                for (idx, s) in variant.steps.iter().enumerate() {
                    validate_step(&phase.name, &variant.name, idx, s)?;
                }
            }
        }

        self.check_gate_consistency()?;

        for lock in &self.ci_locks {
            lock.lock_name()?;
            if let Some(from) = &lock.from_phase {
                if self.phase(from).is_none() {
                    return Err(ConfigError::Malformed(format!(
                        "ci-lock scoped to unknown phase '{from}'"
                    )));
                }
            }
        }

        for named in self.post_submit.iter().chain(&self.modality_source_preparation) {
            for (idx, s) in named.steps.iter().enumerate() {
                validate_step(&named.name, &named.name, idx, s)?;
            }
        }

        Ok(())
    }

    /// A variant reused across phases must declare one consistent gate and
    /// one consistent wait setting; its executor is shared across phases, so
    /// divergent declarations would be ambiguous.
    fn check_gate_consistency(&self) -> Result<(), ConfigError> {
        let mut gates: HashMap<&str, RunOnChange> = HashMap::new();
        let mut waits: HashMap<&str, bool> = HashMap::new();

        for phase in &self.phases {
            for variant in &phase.variants {
                for s in &variant.steps {
                    if let Some(gate) = s.run_on_change {
                        match gates.get(variant.name.as_str()) {
                            Some(prev) if *prev != gate => {
                                return Err(ConfigError::ConflictingRunOnChange {
                                    variant: variant.name.clone(),
                                    first: prev.as_str().to_string(),
                                    second: gate.as_str().to_string(),
                                });
                            }
                            _ => {
                                gates.insert(variant.name.as_str(), gate);
                            }
                        }
                    }
                    if let Some(wait) = s.wait_on_full_previous_phase {
                        match waits.get(variant.name.as_str()) {
                            Some(prev) if *prev != wait => {
                                return Err(ConfigError::Malformed(format!(
                                    "variant '{}' declares conflicting wait-on-full-previous-phase settings",
                                    variant.name
                                )));
                            }
                            _ => {
                                waits.insert(variant.name.as_str(), wait);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_step(
    phase: &str,
    variant: &str,
    idx: usize,
    step: &StepConfig,
) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidStep {
        phase: phase.to_string(),
        variant: variant.to_string(),
        reason,
    };
    if step.sh.trim().is_empty() {
        return Err(invalid(format!("step {idx} has an empty command")));
    }
    if step.timeout == Some(0) {
        return Err(invalid(format!("step {idx} has a zero timeout")));
    }
    for cred in &step.with_credentials {
        cred.validate()?;
    }
    if let Some(archive) = &step.archive {
        if archive.artifacts.is_empty() {
            return Err(invalid(format!("step {idx} archives no patterns")));
        }
    }
    Ok(())
}

/// Deserialize the ordered `phases` table: phase name -> variant name ->
/// step list. Declaration order is preserved.
fn de_phases<'de, D>(de: D) -> Result<Vec<PhaseConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let mapping = serde_yaml::Mapping::deserialize(de)?;
    let mut phases = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = string_key(&key, "phase")?;
        let variants_map: serde_yaml::Mapping =
            serde_yaml::from_value(value).map_err(D::Error::custom)?;
        let mut variants = Vec::with_capacity(variants_map.len());
        for (vkey, vvalue) in variants_map {
            let vname = string_key(&vkey, "variant")?;
            let steps: Vec<StepConfig> =
                serde_yaml::from_value(vvalue).map_err(D::Error::custom)?;
            variants.push(VariantConfig { name: vname, steps });
        }
        phases.push(PhaseConfig { name, variants });
    }
    Ok(phases)
}

/// Deserialize an ordered name -> step list table.
fn de_named_steps<'de, D>(de: D) -> Result<Vec<NamedSteps>, D::Error>
where
    D: Deserializer<'de>,
{
    let mapping = serde_yaml::Mapping::deserialize(de)?;
    let mut entries = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = string_key(&key, "entry")?;
        let steps: Vec<StepConfig> = serde_yaml::from_value(value).map_err(D::Error::custom)?;
        entries.push(NamedSteps { name, steps });
    }
    Ok(entries)
}

fn string_key<E: serde::de::Error>(key: &serde_yaml::Value, what: &str) -> Result<String, E> {
    key.as_str()
        .map(str::to_string)
        .ok_or_else(|| E::custom(format!("{what} name must be a string")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version:
  tag: "v{version}"
  format: semver
  bump:
    policy: conventional-commits
    strict: true

pass-through-environment-vars:
  - HOME

volumes:
  - source: /cache
    target: /cache

ci-locks:
  - repo-name: capstan
    branch: main

phases:
  build:
    linux:
      - sh: make build
        node-label: linux-docker
      - sh: make test
        junit: ["reports/junit.xml"]
    windows:
      - sh: make build
  publish:
    linux:
      - sh: make publish ${VERSION}
        run-on-change: new-version-only

post-submit:
  announce:
    - sh: ./announce.sh ${PUBLISH_VERSION}
"#;

    #[test]
    fn test_load_preserves_phase_and_variant_order() {
        let config = BuildConfig::load_str(SAMPLE).unwrap();
        let names: Vec<_> = config.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["build", "publish"]);

        let variants: Vec<_> = config.phases[0]
            .variants
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(variants, ["linux", "windows"]);
    }

    #[test]
    fn test_version_block() {
        let config = BuildConfig::load_str(SAMPLE).unwrap();
        assert!(config.version.tag_enabled());
        assert!(config.version.bump.strict);
        let pattern = config.version.tag_pattern().unwrap();
        assert_eq!(pattern.render(&Version::new(1, 0, 0)), "v1.0.0");
    }

    #[test]
    fn test_variant_node_label_from_first_declaration() {
        let config = BuildConfig::load_str(SAMPLE).unwrap();
        let linux = config.phases[0].variant("linux").unwrap();
        assert_eq!(linux.node_label(), Some("linux-docker"));
        assert!(linux.wait_on_full_previous_phase());
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        assert!(BuildConfig::load_str("bogus-key: true").is_err());
    }

    #[test]
    fn test_conflicting_gate_across_phases() {
        let yaml = r#"
phases:
  a:
    x:
      - sh: one
        run-on-change: always
  b:
    x:
      - sh: two
        run-on-change: new-version-only
"#;
        assert!(matches!(
            BuildConfig::load_str(yaml),
            Err(ConfigError::ConflictingRunOnChange { .. })
        ));
    }

    #[test]
    fn test_duplicate_phase_detected_on_constructed_config() {
        let phase = PhaseConfig {
            name: "build".to_string(),
            variants: Vec::new(),
        };
        let config = BuildConfig {
            phases: vec![phase.clone(), phase],
            ..BuildConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePhaseName { .. })
        ));
    }

    #[test]
    fn test_lock_scoped_to_unknown_phase_rejected() {
        let yaml = r#"
ci-locks:
  - name: deploy
    from-phase: missing
phases:
  build:
    x:
      - sh: make
"#;
        assert!(BuildConfig::load_str(yaml).is_err());
    }

    #[test]
    fn test_empty_command_rejected() {
        let yaml = r#"
phases:
  build:
    x:
      - sh: "  "
"#;
        assert!(matches!(
            BuildConfig::load_str(yaml),
            Err(ConfigError::InvalidStep { .. })
        ));
    }

    #[test]
    fn test_branch_policies() {
        let version = VersionConfig::default();
        assert_eq!(
            version.branch_policy("release/1.2").unwrap(),
            BranchPolicy::patch_only()
        );
        assert_eq!(
            version.branch_policy("main").unwrap(),
            BranchPolicy::unrestricted()
        );
        assert!(version.is_hotfix_branch("hotfix/fuel").unwrap());
        assert!(!version.is_hotfix_branch("main").unwrap());
    }

    #[test]
    fn test_modality_lookup() {
        let yaml = r#"
modality-source-preparation:
  AUTOSQUASH:
    - sh: git rebase --autosquash
"#;
        let config = BuildConfig::load_str(yaml).unwrap();
        assert!(config.modality("AUTOSQUASH").is_some());
        assert!(config.modality("OTHER").is_none());
    }
}
