//! Layered configuration loading.
//!
//! Sources are merged in order, later ones overriding earlier ones:
//! 1. `configuration/base.{yaml,yml,json}`
//! 2. `configuration/{environment}.{yaml,yml,json}`
//! 3. `APP_`-prefixed environment variables, with `__` between nested keys
//!    (`APP_WORKERS__COUNT=4`).

use std::io;
use std::path::{Path, PathBuf};

use config::ConfigError;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory holding the configuration files, relative to the base path.
const CONFIGURATION_DIR: &str = "configuration";

/// Stem of the file every environment builds upon.
const BASE_FILE_STEM: &str = "base";

/// Extensions tried, in order, for every configuration file.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

const ENV_PREFIX: &str = "APP";

const ENV_PREFIX_SEPARATOR: &str = "_";

const ENV_KEY_SEPARATOR: &str = "__";

const ENV_LIST_SEPARATOR: &str = ",";

/// Configuration roots loadable with [`load_config`].
pub trait Config {
    /// Keys whose environment variable values are split on commas into lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to read the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("failed to determine the runtime environment: {0}")]
    Environment(#[from] io::Error),

    #[error("configuration directory `{}` does not exist", .0.display())]
    MissingConfigurationDirectory(PathBuf),

    #[error("no `{stem}` configuration file found, tried {tried}")]
    ConfigurationFileMissing { stem: String, tried: String },

    #[error("configuration file `{}` is invalid: {source}", .path.display())]
    ConfigurationFileLoad { path: PathBuf, source: ConfigError },

    #[error("failed to merge configuration sources: {0}")]
    Builder(#[source] ConfigError),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] ConfigError),
}

/// Loads `T` from the current directory for the environment named by `APP_ENVIRONMENT`.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    let environment = Environment::load()?;

    load_config_from(&base_path, environment)
}

/// Loads `T` from `base_path` for an explicit `environment`.
pub fn load_config_from<T>(base_path: &Path, environment: Environment) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let directory = base_path.join(CONFIGURATION_DIR);
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(directory));
    }

    let mut builder = config::Config::builder();
    for stem in [BASE_FILE_STEM, environment.as_str()] {
        let path = find_configuration_file(&directory, stem)?;
        check_file_parses(&path)?;
        builder = builder.add_source(config::File::from(path));
    }

    let mut environment_source = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_KEY_SEPARATOR)
        .try_parsing(true);
    if !T::LIST_PARSE_KEYS.is_empty() {
        environment_source = environment_source.list_separator(ENV_LIST_SEPARATOR);
        for key in T::LIST_PARSE_KEYS {
            environment_source = environment_source.with_list_parse_key(key);
        }
    }

    builder
        .add_source(environment_source)
        .build()
        .map_err(LoadConfigError::Builder)?
        .try_deserialize()
        .map_err(LoadConfigError::Deserialization)
}

fn find_configuration_file(directory: &Path, stem: &str) -> Result<PathBuf, LoadConfigError> {
    let candidates: Vec<PathBuf> = CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .collect();

    if let Some(path) = candidates.iter().find(|path| path.is_file()) {
        return Ok(path.clone());
    }

    let tried = candidates
        .iter()
        .map(|path| format!("`{}`", path.display()))
        .collect::<Vec<_>>()
        .join(", ");

    Err(LoadConfigError::ConfigurationFileMissing {
        stem: stem.to_string(),
        tried,
    })
}

/// Parses a single file on its own, so that a syntax error is reported with its path.
fn check_file_parses(path: &Path) -> Result<(), LoadConfigError> {
    config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map(|_| ())
        .map_err(|source| LoadConfigError::ConfigurationFileLoad {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    impl Config for Sample {
        const LIST_PARSE_KEYS: &'static [&'static str] = &[];
    }

    fn write_configuration(files: &[(&str, &str)]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let directory = root.path().join(CONFIGURATION_DIR);
        fs::create_dir(&directory).unwrap();
        for (file, contents) in files {
            fs::write(directory.join(file), contents).unwrap();
        }

        root
    }

    #[test]
    fn environment_file_overrides_base() {
        let root = write_configuration(&[
            ("base.yaml", "name: base\ncount: 1\n"),
            ("dev.yaml", "count: 7\n"),
        ]);

        let sample: Sample = load_config_from(root.path(), Environment::Dev).unwrap();

        assert_eq!(sample.name, "base");
        assert_eq!(sample.count, 7);
    }

    #[test]
    fn json_files_are_supported() {
        let root = write_configuration(&[
            ("base.json", r#"{"name": "json", "count": 3}"#),
            ("prod.json", "{}"),
        ]);

        let sample: Sample = load_config_from(root.path(), Environment::Prod).unwrap();

        assert_eq!(sample.name, "json");
        assert_eq!(sample.count, 3);
    }

    #[test]
    fn missing_directory_is_reported() {
        let root = tempfile::tempdir().unwrap();

        let err = load_config_from::<Sample>(root.path(), Environment::Dev).unwrap_err();

        assert!(matches!(err, LoadConfigError::MissingConfigurationDirectory(_)));
    }

    #[test]
    fn missing_environment_file_lists_attempted_paths() {
        let root = write_configuration(&[("base.yaml", "name: base\ncount: 1\n")]);

        let err = load_config_from::<Sample>(root.path(), Environment::Prod).unwrap_err();

        match err {
            LoadConfigError::ConfigurationFileMissing { stem, tried } => {
                assert_eq!(stem, "prod");
                assert!(tried.contains("prod.yaml"));
                assert!(tried.contains("prod.json"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unparsable_file_is_reported_with_its_path() {
        let root = write_configuration(&[("base.yaml", "name: [unclosed\n"), ("dev.yaml", "{}\n")]);

        let err = load_config_from::<Sample>(root.path(), Environment::Dev).unwrap_err();

        assert!(matches!(err, LoadConfigError::ConfigurationFileLoad { .. }));
        assert!(err.to_string().contains("base.yaml"));
    }
}
