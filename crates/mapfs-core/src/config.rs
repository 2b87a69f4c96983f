// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mapping specification and filesystem configuration types

use crate::error::{FsError, FsResult};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// A single binding of a virtual path to a path on the underlying filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Absolute path as seen inside the mount point.
    pub path: PathBuf,
    /// Absolute path on the underlying filesystem.
    pub underlying_path: PathBuf,
    #[serde(default)]
    pub writable: bool,
}

impl Mapping {
    pub fn new(
        path: impl Into<PathBuf>,
        underlying_path: impl Into<PathBuf>,
        writable: bool,
    ) -> Self {
        Self {
            path: path.into(),
            underlying_path: underlying_path.into(),
            writable,
        }
    }

    /// Components of the virtual path below `/`.
    pub fn components(&self) -> FsResult<Vec<OsString>> {
        virtual_components(&self.path)
    }

    fn validate(&self) -> FsResult<()> {
        self.components()?;
        if !self.underlying_path.is_absolute() {
            return Err(FsError::invalid(format!(
                "underlying path {} for mapping {} is not absolute",
                self.underlying_path.display(),
                self.path.display()
            )));
        }
        Ok(())
    }
}

/// Ordered list of mappings describing one tree. Later entries win over
/// earlier ones bound to the same virtual path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingSpec(pub Vec<Mapping>);

impl MappingSpec {
    pub fn new(mappings: Vec<Mapping>) -> Self {
        Self(mappings)
    }

    pub fn push(&mut self, mapping: Mapping) {
        self.0.push(mapping);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> FsResult<()> {
        self.0.iter().try_for_each(Mapping::validate)
    }
}

impl From<Vec<Mapping>> for MappingSpec {
    fn from(mappings: Vec<Mapping>) -> Self {
        Self(mappings)
    }
}

/// Split an absolute virtual path into its components.
///
/// Works on the raw bytes, since `Path::components` folds interior `.`
/// segments away. Repeated slashes are tolerated.
pub fn virtual_components(path: &Path) -> FsResult<Vec<OsString>> {
    if !path.is_absolute() {
        return Err(FsError::invalid(format!(
            "virtual path {} is not absolute",
            path.display()
        )));
    }
    let mut components = Vec::new();
    for segment in path.as_os_str().as_bytes().split(|byte| *byte == b'/') {
        match segment {
            b"" => {}
            b"." | b".." => {
                return Err(FsError::invalid(format!(
                    "virtual path {} is not normalized",
                    path.display()
                )));
            }
            name => components.push(OsStr::from_bytes(name).to_os_string()),
        }
    }
    Ok(components)
}

/// Kernel cache lifetimes handed out with entry and attribute replies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub attr_ttl_ms: u32,
    pub entry_ttl_ms: u32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
        }
    }
}

/// Top-level filesystem configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub mappings: MappingSpec,
    pub cache: CachePolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_json_defaults_to_read_only() {
        let mapping: Mapping =
            serde_json::from_str(r#"{"path": "/a", "underlying_path": "/real/a"}"#).unwrap();
        assert!(!mapping.writable);
    }

    #[test]
    fn config_parses_with_partial_cache_policy() {
        let config: FsConfig = serde_json::from_str(
            r#"{
                "mappings": [
                    {"path": "/", "underlying_path": "/srv/root", "writable": true},
                    {"path": "/tools", "underlying_path": "/opt/tools"}
                ],
                "cache": {"attr_ttl_ms": 250}
            }"#,
        )
        .unwrap();
        assert_eq!(config.mappings.len(), 2);
        assert!(config.mappings.0[0].writable);
        assert_eq!(config.cache.attr_ttl_ms, 250);
        assert_eq!(config.cache.entry_ttl_ms, 1000);
    }

    #[test]
    fn relative_virtual_path_is_rejected() {
        let spec = MappingSpec::new(vec![Mapping::new("a", "/real/a", false)]);
        assert!(matches!(spec.validate(), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn dot_dot_components_are_rejected() {
        let spec = MappingSpec::new(vec![Mapping::new("/a/../b", "/real/b", false)]);
        assert!(matches!(spec.validate(), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn single_dot_components_are_rejected() {
        for path in ["/a/./b", "/a/.", "/./a", "/."] {
            let spec = MappingSpec::new(vec![Mapping::new(path, "/real/b", false)]);
            assert!(
                matches!(spec.validate(), Err(FsError::InvalidArgument(_))),
                "{path} was accepted"
            );
        }
        assert_eq!(
            Mapping::new("//a//b/", "/real", false).components().unwrap(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn relative_underlying_path_is_rejected() {
        let spec = MappingSpec::new(vec![Mapping::new("/a", "real/a", false)]);
        assert!(matches!(spec.validate(), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn components_skip_root() {
        let mapping = Mapping::new("/a/b/c", "/real", true);
        let components = mapping.components().unwrap();
        assert_eq!(components, vec!["a", "b", "c"]);
        assert!(Mapping::new("/", "/real", true).components().unwrap().is_empty());
    }
}
