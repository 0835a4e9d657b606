//! The project manifest (`package.json`).
//!
//! Only `name`, `version` and `config.pack` are interpreted. Everything else
//! is carried through untouched, in its existing key order, when the manifest
//! is rewritten.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::config::PackConfig;
use crate::error::PackError;

pub const DEFAULT_MANIFEST: &str = "package.json";

#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    document: Map<String, Value>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, PackError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| PackError::Manifest { path: path.to_path_buf(), source })?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, PackError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|source| PackError::ManifestFormat { path: path.to_path_buf(), source })?;
        match value {
            Value::Object(document) => Ok(Self { path: path.to_path_buf(), document }),
            _ => Err(shape(path, "top level is not an object")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn package_name(&self) -> Option<&str> {
        self.document.get("name").and_then(Value::as_str)
    }

    pub fn package_version(&self) -> Option<&str> {
        self.document.get("version").and_then(Value::as_str)
    }

    /// The `config.pack` section. Missing sections mean all defaults.
    pub fn pack_config(&self) -> Result<PackConfig, PackError> {
        let pack = match self.document.get("config") {
            None | Some(Value::Null) => return Ok(PackConfig::default()),
            Some(Value::Object(config)) => config.get("pack"),
            Some(_) => return Err(shape(&self.path, "`config` is not an object")),
        };
        match pack {
            None | Some(Value::Null) => Ok(PackConfig::default()),
            Some(pack @ Value::Object(_)) => serde_json::from_value(pack.clone())
                .map_err(|source| PackError::ManifestFormat { path: self.path.clone(), source }),
            Some(_) => Err(shape(&self.path, "`config.pack` is not an object")),
        }
    }

    /// Sets `config.pack.<key>`, creating the sections when absent.
    pub fn set_pack_value(&mut self, key: &str, value: Value) -> Result<(), PackError> {
        let config = self
            .document
            .entry("config")
            .or_insert_with(|| Value::Object(Map::new()));
        if config.is_null() {
            *config = Value::Object(Map::new());
        }
        let Value::Object(config) = config else {
            return Err(shape(&self.path, "`config` is not an object"));
        };
        let pack = config
            .entry("pack")
            .or_insert_with(|| Value::Object(Map::new()));
        if pack.is_null() {
            *pack = Value::Object(Map::new());
        }
        let Value::Object(pack) = pack else {
            return Err(shape(&self.path, "`config.pack` is not an object"));
        };
        pack.insert(key.to_string(), value);
        Ok(())
    }

    /// Two-space indented JSON with a trailing newline.
    pub fn to_pretty_string(&self) -> Result<String, serde_json::Error> {
        let mut text = serde_json::to_string_pretty(&self.document)?;
        text.push('\n');
        Ok(text)
    }

    /// Rewrites the manifest through a temp file in the same directory.
    pub fn save(&self) -> std::io::Result<()> {
        let text = self.to_pretty_string().map_err(std::io::Error::from)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn shape(path: &Path, reason: &str) -> PackError {
    PackError::ManifestShape { path: path.to_path_buf(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    #[test]
    fn missing_pack_section_means_defaults() {
        let m = Manifest::parse(Path::new("package.json"), r#"{"name": "web", "version": "1.0.0"}"#).unwrap();
        assert_eq!(m.pack_config().unwrap(), PackConfig::default());
        assert_eq!(m.package_name(), Some("web"));
        assert_eq!(m.package_version(), Some("1.0.0"));

        let m = Manifest::parse(Path::new("package.json"), r#"{"config": {"port": 80}}"#).unwrap();
        assert_eq!(m.pack_config().unwrap(), PackConfig::default());
    }

    #[test]
    fn reads_pack_section() {
        let m = Manifest::parse(
            Path::new("package.json"),
            r#"{"config": {"pack": {"prefix": "web", "prodVersion": 9}}}"#,
        )
        .unwrap();
        let config = m.pack_config().unwrap();
        assert_eq!(config.prefix.as_deref(), Some("web"));
        assert_eq!(config.counter(Environment::Production), Some(9));
    }

    #[test]
    fn malformed_sections_are_reported() {
        let m = Manifest::parse(Path::new("p.json"), r#"{"config": "nope"}"#).unwrap();
        assert!(matches!(m.pack_config(), Err(PackError::ManifestShape { .. })));

        assert!(matches!(
            Manifest::parse(Path::new("p.json"), "[1, 2]"),
            Err(PackError::ManifestShape { .. })
        ));
        assert!(matches!(
            Manifest::parse(Path::new("p.json"), "{ not json"),
            Err(PackError::ManifestFormat { .. })
        ));
    }

    #[test]
    fn rewrite_keeps_other_keys_in_order() {
        let mut m = Manifest::parse(
            Path::new("package.json"),
            r#"{"name": "web", "scripts": {"build": "vite"}, "version": "1.0.0"}"#,
        )
        .unwrap();
        m.set_pack_value("testVersion", Value::from(1u64)).unwrap();

        let text = m.to_pretty_string().unwrap();
        assert!(text.ends_with("}\n"));
        let name = text.find("\"name\"").unwrap();
        let scripts = text.find("\"scripts\"").unwrap();
        let config = text.find("\"config\"").unwrap();
        assert!(name < scripts && scripts < config);
        assert!(text.contains("\"testVersion\": 1"));
    }

    #[test]
    fn save_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        std::fs::write(&path, r#"{"name":"web","config":{"pack":{"prefix":"web"}}}"#).unwrap();

        let mut m = Manifest::load(&path).unwrap();
        m.set_pack_value("prodVersion", Value::from(3u64)).unwrap();
        m.save().unwrap();

        let reloaded = Manifest::load(&path).unwrap().pack_config().unwrap();
        assert_eq!(reloaded.prefix.as_deref(), Some("web"));
        assert_eq!(reloaded.prod_version, Some(3));
    }
}
