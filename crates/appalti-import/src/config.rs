use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use appalti_core::CodeMaps;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Roll back everything on the first failure.
    #[default]
    AbortBatch,
    /// Undo only the failing document and carry on.
    SkipDocument,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown error policy `{0}` (expected `abort` or `skip`)")]
pub struct UnknownErrorPolicy(String);

impl FromStr for ErrorPolicy {
    type Err = UnknownErrorPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" | "abort-batch" => Ok(Self::AbortBatch),
            "skip" | "skip-document" => Ok(Self::SkipDocument),
            _ => Err(UnknownErrorPolicy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: "appalti".to_string(),
            password: "appalti".to_string(),
            database: "portale_appalti".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let options = match &self.url {
            Some(url) => PgConnectOptions::from_str(url).context("parsing DATABASE_URL")?,
            None => PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.user)
                .password(&self.password)
                .database(&self.database),
        };
        Ok(options
            .application_name(crate::CRATE_NAME)
            .options([("client_encoding", "UTF8")]))
    }

    /// Connection target with the password left out, for logs.
    pub fn display_target(&self) -> String {
        match &self.url {
            Some(_) => "DATABASE_URL".to_string(),
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportConfig {
    pub database: DatabaseConfig,
    pub on_error: ErrorPolicy,
    pub dry_run: bool,
    pub code_maps_path: Option<PathBuf>,
}

impl ImportConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset and empty values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = DatabaseConfig::default();
        let port = match get("DB_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("parsing DB_PORT `{raw}`"))?,
            None => defaults.port,
        };
        let on_error = match get("APPALTI_ON_ERROR") {
            Some(raw) => raw.parse().context("parsing APPALTI_ON_ERROR")?,
            None => ErrorPolicy::default(),
        };
        Ok(Self {
            database: DatabaseConfig {
                url: get("DATABASE_URL"),
                host: get("DB_HOST").unwrap_or(defaults.host),
                port,
                user: get("DB_USER").unwrap_or(defaults.user),
                password: get("DB_PASSWORD").unwrap_or(defaults.password),
                database: get("DB_NAME").unwrap_or(defaults.database),
            },
            on_error,
            dry_run: get("APPALTI_DRY_RUN")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            code_maps_path: get("APPALTI_CODE_MAPS").map(PathBuf::from),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CodeMapsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    natura_principale: Vec<CodeMapEntry>,
    #[serde(default)]
    criterio_aggiudicazione: Vec<CodeMapEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct CodeMapEntry {
    text: String,
    code: String,
}

/// Default code maps, with entries from the YAML file at `path` layered on top.
pub fn load_code_maps(path: Option<&Path>) -> Result<CodeMaps> {
    let mut maps = CodeMaps::default();
    let Some(path) = path else {
        return Ok(maps);
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: CodeMapsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    for entry in file.natura_principale {
        maps.nature.insert(entry.text, entry.code);
    }
    for entry in file.criterio_aggiudicazione {
        maps.award_criterion.insert(entry.text, entry.code);
    }
    Ok(maps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = ImportConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ImportConfig::default());
        assert_eq!(config.database.display_target(), "appalti@127.0.0.1:5432/portale_appalti");
    }

    #[test]
    fn discrete_variables_and_flags() {
        let config = ImportConfig::from_lookup(lookup(&[
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "6543"),
            ("DB_NAME", "gare"),
            ("APPALTI_ON_ERROR", "skip"),
            ("APPALTI_DRY_RUN", "1"),
            ("APPALTI_CODE_MAPS", "rules/codes.yaml"),
            ("DATABASE_URL", ""),
        ]))
        .unwrap();
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.database.database, "gare");
        assert_eq!(config.database.url, None);
        assert_eq!(config.on_error, ErrorPolicy::SkipDocument);
        assert!(config.dry_run);
        assert_eq!(config.code_maps_path, Some(PathBuf::from("rules/codes.yaml")));
    }

    #[test]
    fn database_url_builds_options() {
        let config = ImportConfig::from_lookup(lookup(&[(
            "DATABASE_URL",
            "postgres://u:p@example.org:5499/other",
        )]))
        .unwrap();
        let options = config.database.connect_options().unwrap();
        assert_eq!(options.get_host(), "example.org");
        assert_eq!(options.get_port(), 5499);
        assert_eq!(options.get_database(), Some("other"));
        assert_eq!(config.database.display_target(), "DATABASE_URL");
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(ImportConfig::from_lookup(lookup(&[("DB_PORT", "not-a-port")])).is_err());
        let err = ImportConfig::from_lookup(lookup(&[("APPALTI_ON_ERROR", "retry")])).unwrap_err();
        assert!(format!("{err:#}").contains("unknown error policy `retry`"));
    }

    #[test]
    fn error_policy_parsing() {
        assert_eq!("abort".parse::<ErrorPolicy>(), Ok(ErrorPolicy::AbortBatch));
        assert_eq!(" Skip ".parse::<ErrorPolicy>(), Ok(ErrorPolicy::SkipDocument));
        assert_eq!("skip-document".parse::<ErrorPolicy>(), Ok(ErrorPolicy::SkipDocument));
        assert!("ignore".parse::<ErrorPolicy>().is_err());
    }

    #[test]
    fn code_map_overrides_extend_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codes.yaml");
        std::fs::write(
            &path,
            r#"
version: 1
natura_principale:
  - { text: "Servizi e forniture", code: "services" }
  - { text: "Lavori", code: "public-works" }
criterio_aggiudicazione:
  - { text: "Offerta economicamente più vantaggiosa", code: "quality" }
"#,
        )
        .unwrap();

        let maps = load_code_maps(Some(&path)).unwrap();
        assert_eq!(maps.nature.canonical("Servizi e forniture"), Some("services"));
        assert_eq!(maps.nature.canonical("Lavori"), Some("public-works"));
        assert_eq!(maps.nature.canonical("Forniture"), Some("goods"));
        assert_eq!(
            maps.award_criterion.canonical("Offerta economicamente più vantaggiosa"),
            Some("quality")
        );
    }

    #[test]
    fn code_maps_without_file_are_defaults() {
        assert_eq!(load_code_maps(None).unwrap(), CodeMaps::default());
    }

    #[test]
    fn unreadable_code_map_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_code_maps(Some(&dir.path().join("missing.yaml"))).unwrap_err();
        assert!(format!("{err:#}").contains("missing.yaml"));
    }
}
