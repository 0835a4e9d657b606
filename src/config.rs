//! Naming configuration read from the `config.pack` section of the manifest.

use chrono::{Datelike, NaiveDate};
use clap::ValueEnum;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Which version counter a run reads and advances.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Environment {
    Test,
    Production,
}

impl Environment {
    /// `NODE_ENV=production` selects production; anything else, or nothing, is test.
    pub fn from_node_env(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("production") => Environment::Production,
            _ => Environment::Test,
        }
    }

    /// Key of this environment's counter inside `config.pack`.
    pub fn counter_key(self) -> &'static str {
        match self {
            Environment::Test => "testVersion",
            Environment::Production => "prodVersion",
        }
    }

    pub fn default_target(self) -> &'static str {
        match self {
            Environment::Test => "测试",
            Environment::Production => "正式",
        }
    }
}

/// The `config.pack` section as written by users. Every field is optional.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackConfig {
    pub prefix: Option<String>,
    pub target: Option<String>,
    pub version_prefix: Option<String>,
    #[serde(default, deserialize_with = "lenient_counter")]
    pub test_version: Option<u64>,
    #[serde(default, deserialize_with = "lenient_counter")]
    pub prod_version: Option<u64>,
    pub suffix: Option<String>,
    pub date: Option<String>,
}

impl PackConfig {
    pub fn counter(&self, env: Environment) -> Option<u64> {
        match env {
            Environment::Test => self.test_version,
            Environment::Production => self.prod_version,
        }
    }
}

/// Counters are usually integers, but hand-edited manifests often carry `"3"`.
fn lenient_counter<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("version counter {n} is not a non-negative integer"))),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| D::Error::custom(format!("version counter {s:?}: {e}"))),
        Some(other) => Err(D::Error::custom(format!("version counter has unexpected type: {other}"))),
    }
}

/// Fully resolved naming segments, defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingPlan {
    pub prefix: String,
    pub target: String,
    pub date: String,
    pub version_prefix: String,
    pub suffix: String,
}

impl NamingPlan {
    pub fn resolve(config: &PackConfig, env: Environment, today: NaiveDate) -> Self {
        Self {
            prefix: config.prefix.clone().unwrap_or_default(),
            target: config
                .target
                .clone()
                .unwrap_or_else(|| env.default_target().to_string()),
            date: config.date.clone().unwrap_or_else(|| default_date(today)),
            version_prefix: config.version_prefix.clone().unwrap_or_default(),
            suffix: config.suffix.clone().unwrap_or_else(|| "zip".to_string()),
        }
    }

    /// `<prefix>-<target><date><versionPrefix><version>.<suffix>`; an empty prefix drops its dash.
    pub fn file_name(&self, version: u64) -> String {
        let mut name = String::new();
        if !self.prefix.is_empty() {
            name.push_str(&self.prefix);
            name.push('-');
        }
        name.push_str(&self.target);
        name.push_str(&self.date);
        name.push_str(&self.version_prefix);
        name.push_str(&version.to_string());
        name.push('.');
        name.push_str(&self.suffix);
        name
    }
}

/// Month and day without padding, e.g. `1-15`.
pub fn default_date(today: NaiveDate) -> String {
    format!("{}-{}", today.month(), today.day())
}

/// `<name>@<version>.zip` for the package naming scheme. Scope separators become dashes.
pub fn package_file_name(name: &str, version: &str) -> String {
    format!("{}@{}.zip", name.replace('/', "-"), version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jan15() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    #[test]
    fn defaults_follow_environment() {
        let plan = NamingPlan::resolve(&PackConfig::default(), Environment::Test, jan15());
        assert_eq!(plan.file_name(1), "测试1-151.zip");

        let plan = NamingPlan::resolve(&PackConfig::default(), Environment::Production, jan15());
        assert_eq!(plan.file_name(4), "正式1-154.zip");
    }

    #[test]
    fn every_segment_is_joined_in_order() {
        let config = PackConfig {
            prefix: Some("shop".into()),
            target: Some("staging".into()),
            version_prefix: Some("v".into()),
            suffix: Some("tar.zip".into()),
            date: Some("-2024-".into()),
            ..PackConfig::default()
        };
        let plan = NamingPlan::resolve(&config, Environment::Test, jan15());
        assert_eq!(plan.file_name(12), "shop-staging-2024-v12.tar.zip");
    }

    #[test]
    fn counters_accept_numbers_and_strings() {
        let config: PackConfig =
            serde_json::from_str(r#"{"testVersion": 3, "prodVersion": " 7 "}"#).unwrap();
        assert_eq!(config.counter(Environment::Test), Some(3));
        assert_eq!(config.counter(Environment::Production), Some(7));

        let config: PackConfig = serde_json::from_str(r#"{"prefix": "x"}"#).unwrap();
        assert_eq!(config.counter(Environment::Test), None);

        assert!(serde_json::from_str::<PackConfig>(r#"{"testVersion": -1}"#).is_err());
        assert!(serde_json::from_str::<PackConfig>(r#"{"testVersion": "abc"}"#).is_err());
    }

    #[test]
    fn node_env_switch() {
        assert_eq!(Environment::from_node_env(Some("production")), Environment::Production);
        assert_eq!(Environment::from_node_env(Some("development")), Environment::Test);
        assert_eq!(Environment::from_node_env(None), Environment::Test);
    }

    #[test]
    fn package_names_are_flattened() {
        assert_eq!(package_file_name("@acme/web", "1.2.0"), "@acme-web@1.2.0.zip");
    }
}
