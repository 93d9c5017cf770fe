//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use rustc_hash::FxHashSet;
use serde::Deserialize;

use crate::{exposition, runner};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error for IO operations when reading config directory
    #[error("Failed to read config directory: {0}")]
    Io(#[from] std::io::Error),
    /// Two queries share a name
    #[error("Duplicate query name found: {0}")]
    DuplicateQueryName(String),
    /// A query interval is not a positive number of seconds up to one year
    #[error("Query {query} has invalid interval_seconds {value}, must be positive and at most one year")]
    InvalidInterval {
        /// Query name
        query: String,
        /// Configured value
        value: f64,
    },
    /// A query timeout is not a positive number of seconds up to one year
    #[error("Query {query} has invalid timeout_seconds {value}, must be positive and at most one year")]
    InvalidTimeout {
        /// Query name
        query: String,
        /// Configured value
        value: f64,
    },
    /// A query names no value column
    #[error("Query {0} has no value_columns")]
    NoValueColumns(String),
    /// Error when no config files found in directory
    #[error("No .yaml config files found in directory: {0}")]
    NoConfigFiles(PathBuf),
    /// Error when `connect_string` is defined in multiple config files
    #[error("connect_string cannot be defined in multiple config files")]
    ConflictingConnectString,
    /// Error when exposition is defined in multiple config files
    #[error("exposition cannot be defined in multiple config files")]
    ConflictingExposition,
    /// Error getting metadata for config path
    #[error("Failed to get metadata for config path {path:?}: {source}")]
    Metadata {
        /// Config path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error reading directory entries
    #[error("Failed to read directory entries from {path:?}: {source}")]
    ReadDir {
        /// Directory path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error reading directory entry
    #[error("Failed to read directory entry in {dir:?}: {source}")]
    ReadDirEntry {
        /// Directory path
        dir: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

/// Main configuration struct for this program
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Connection URL of the data source, e.g. `postgres://user@host/db`.
    /// The command line and environment take precedence.
    pub connect_string: Option<String>,
    /// The HTTP endpoint scrapers read from
    #[serde(default)]
    pub exposition: exposition::Config,
    /// The queries to run
    #[serde(default)]
    pub queries: Vec<runner::Config>,
}

/// Partial configuration used for merging multiple config files
///
/// All fields are optional -- or admit an empty construction -- to allow
/// partial configs that only specify certain sections. This is used internally
/// for directory-based config overlay.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    /// Connection URL of the data source.
    pub connect_string: Option<String>,
    /// The HTTP endpoint scrapers read from.
    pub exposition: Option<exposition::Config>,
    /// The queries to run.
    #[serde(default)]
    pub queries: Vec<runner::Config>,
}

impl Config {
    /// Parse and validate a single YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid or any query fails
    /// [`Config::validate`].
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a Config from a `PartialConfig`, using defaults for missing fields
    ///
    /// # Errors
    ///
    /// Returns an error if any query fails [`Config::validate`].
    pub fn from_partial(partial: PartialConfig) -> Result<Self, Error> {
        let config = Self {
            connect_string: partial.connect_string,
            exposition: partial.exposition.unwrap_or_default(),
            queries: partial.queries,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every query definition.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    ///
    /// * Two queries share a name
    /// * An interval or timeout is not a positive number of seconds up to one
    ///   year
    /// * A query has no value columns
    pub fn validate(&self) -> Result<(), Error> {
        check_duplicate_query_names(&self.queries)?;
        for query in &self.queries {
            if query.interval().is_none() {
                return Err(Error::InvalidInterval {
                    query: query.name.clone(),
                    value: query.interval_seconds,
                });
            }
            if let Some(value) = query.timeout_seconds
                && query.timeout().is_none()
            {
                return Err(Error::InvalidTimeout {
                    query: query.name.clone(),
                    value,
                });
            }
            if query.value_columns.is_empty() {
                return Err(Error::NoValueColumns(query.name.clone()));
            }
        }
        Ok(())
    }

    /// Merge two `PartialConfig` instances together
    ///
    /// Singletons (`connect_string`, exposition) are only allowed once in ANY
    /// configs. Queries are appended; a duplicated name is an error. Ordering
    /// of config file reads does not matter beyond the order of queries.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    ///
    /// * Any singleton field is defined in multiple partials
    /// * Duplicate query names are found
    fn merge_partial(
        mut base: PartialConfig,
        overlay: PartialConfig,
    ) -> Result<PartialConfig, Error> {
        if base.connect_string.is_some() && overlay.connect_string.is_some() {
            return Err(Error::ConflictingConnectString);
        }
        if overlay.connect_string.is_some() {
            base.connect_string = overlay.connect_string;
        }

        if base.exposition.is_some() && overlay.exposition.is_some() {
            return Err(Error::ConflictingExposition);
        }
        if overlay.exposition.is_some() {
            base.exposition = overlay.exposition;
        }

        base.queries.extend(overlay.queries);
        check_duplicate_query_names(&base.queries)?;

        Ok(base)
    }
}

fn check_duplicate_query_names(queries: &[runner::Config]) -> Result<(), Error> {
    let mut seen = FxHashSet::default();
    for query in queries {
        if !seen.insert(query.name.as_str()) {
            return Err(Error::DuplicateQueryName(query.name.clone()));
        }
    }
    Ok(())
}

/// Load configuration from a path (file or directory)
///
/// If the path points to a file, loads and parses that single config. If the
/// path points to a directory, composes all .yaml files by combining
/// them. Singletons must be defined at most once across files. The result is
/// validated either way.
///
/// # Errors
///
/// Returns an error if:
///
/// * Path does not exist or cannot be read
/// * No .yaml files found in directory
/// * Config files contain invalid YAML
/// * Any singleton field defined in multiple files
/// * Any query definition is invalid
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let metadata = fs::metadata(path).map_err(|source| Error::Metadata {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;

    if metadata.is_file() {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Config::from_yaml(&contents)
    } else if metadata.is_dir() {
        load_directory_configs(path)
    } else {
        Err(Error::Io(io::Error::new(
            ErrorKind::InvalidInput,
            "Path is neither a file nor a directory",
        )))
    }
}

fn load_directory_configs(dir: &Path) -> Result<Config, Error> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(|source| Error::ReadDir {
        path: dir.to_path_buf(),
        source: Box::new(source),
    })? {
        let entry = entry.map_err(|source| Error::ReadDirEntry {
            dir: dir.to_path_buf(),
            source: Box::new(source),
        })?;
        let path = entry.path();

        let is_yaml_file = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml")
            && !path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with('.'));
        if is_yaml_file {
            paths.push(path);
        }
    }
    // Directory order is platform dependent, query order should not be.
    paths.sort();

    let mut merged: Option<PartialConfig> = None;
    for path in paths {
        let contents = fs::read_to_string(&path).map_err(|source| Error::ReadFile {
            path: path.clone(),
            source: Box::new(source),
        })?;
        let partial: PartialConfig = serde_yaml::from_str(&contents)?;

        merged = Some(match merged {
            None => partial,
            Some(acc) => Config::merge_partial(acc, partial)?,
        });
    }

    match merged {
        Some(partial) => Config::from_partial(partial),
        None => Err(Error::NoConfigFiles(dir.to_path_buf())),
    }
}
