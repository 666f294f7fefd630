//! Artifact table registry.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use rudder_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{Registry, RegistryError};

/// One row of a registry table file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub repo: String,
    #[serde(default)]
    pub dir: String,
    pub version: semver::Version,
    pub artifact: String,
}

/// Two-way map between source versions and artifact references.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    by_source: BTreeMap<SourceID, String>,
    by_artifact: BTreeMap<String, SourceID>,
}

impl TableRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, sid: SourceID, artifact: impl Into<String>) {
        let artifact = artifact.into();
        if let Some(old) = self.by_source.insert(sid.clone(), artifact.clone()) {
            self.by_artifact.remove(&old);
        }
        self.by_artifact.insert(artifact, sid);
    }

    pub fn with(mut self, sid: SourceID, artifact: impl Into<String>) -> Self {
        self.insert(sid, artifact);
        self
    }

    pub fn len(&self) -> usize { self.by_source.len() }
    pub fn is_empty(&self) -> bool { self.by_source.is_empty() }

    pub fn from_rows(rows: Vec<ArtifactRow>) -> Self {
        let mut reg = Self::new();
        for r in rows {
            reg.insert(SourceID::new(SourceLocation::new(r.repo, r.dir), r.version), r.artifact);
        }
        reg
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let rows: Vec<ArtifactRow> = serde_yaml::from_str(text).context("parsing registry table")?;
        Ok(Self::from_rows(rows))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text)
    }
}

impl Registry for TableRegistry {
    fn get_artifact(&self, sid: &SourceID) -> Result<String, RegistryError> {
        self.by_source.get(sid).cloned().ok_or_else(|| RegistryError::UnknownSource(sid.to_string()))
    }

    fn source_for_artifact(&self, artifact: &str) -> Result<SourceID, RegistryError> {
        self.by_artifact.get(artifact).cloned().ok_or_else(|| RegistryError::UnknownArtifact(artifact.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_rows_and_maps_both_ways() {
        let yaml = r#"
- repo: github.com/acme/api
  version: 1.2.0
  artifact: docker.example/acme/api:1.2.0
- repo: github.com/acme/tools
  dir: cron
  version: 0.3.1+r42
  artifact: docker.example/acme/cron:0.3.1
"#;
        let reg = TableRegistry::from_yaml(yaml).unwrap();
        assert_eq!(reg.len(), 2);
        let sid = SourceID::new(SourceLocation::new("github.com/acme/tools", "cron"), semver::Version::parse("0.3.1+r42").unwrap());
        assert_eq!(reg.get_artifact(&sid).unwrap(), "docker.example/acme/cron:0.3.1");
        assert_eq!(reg.source_for_artifact("docker.example/acme/cron:0.3.1").unwrap(), sid);
        assert!(matches!(reg.source_for_artifact("nope"), Err(RegistryError::UnknownArtifact(_))));
    }

    #[test]
    fn build_metadata_is_part_of_the_key() {
        let loc = SourceLocation::new("r", "");
        let reg = TableRegistry::new().with(SourceID::new(loc.clone(), semver::Version::parse("1.0.0+r1").unwrap()), "img:r1");
        let other_rev = SourceID::new(loc, semver::Version::parse("1.0.0+r2").unwrap());
        assert!(matches!(reg.get_artifact(&other_rev), Err(RegistryError::UnknownSource(_))));
    }

    #[test]
    fn reinserting_a_source_drops_the_old_artifact() {
        let sid = SourceID::new(SourceLocation::new("r", ""), semver::Version::new(1, 0, 0));
        let reg = TableRegistry::new().with(sid.clone(), "img:a").with(sid.clone(), "img:b");
        assert_eq!(reg.get_artifact(&sid).unwrap(), "img:b");
        assert!(reg.source_for_artifact("img:a").is_err());
    }
}
