//! Server configuration.
//!
//! Settings are read from an INI file (path via `--config`) whose sections
//! mirror the structs below, then overridden by environment variables of the
//! form `QPY_<SECTION>__<KEY>`. All sizes are plain byte counts.

use std::path::PathBuf;
use std::time::Duration;

use config::Config;
use config::Environment;
use config::File;
use config::FileFormat;
use qpy_protocol::DEFAULT_MAX_PACKAGE_SIZE;
use qpy_protocol::MAX_MAIN_SIZE;
use qpy_protocol::MIB;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebserviceSettings {
    pub listen_address: String,
    pub listen_port: u16,
    pub max_package_size: u64,
    pub allow_lms_packages: bool,
}

impl WebserviceSettings {
    /// The `main` part cap is fixed, not configurable.
    pub fn max_main_size(&self) -> u64 {
        MAX_MAIN_SIZE
    }
}

impl Default for WebserviceSettings {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 9020,
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            allow_lms_packages: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// One OS process per worker; rlimits and time limits apply.
    Process,
    /// Runtime on a thread of the server process. Debugging only: no
    /// isolation, no time or memory enforcement.
    Thread,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_workers: usize,
    /// Aggregate memory budget across all live workers.
    pub max_memory: u64,
    /// Reservation (and address-space rlimit) for a single worker.
    pub per_worker_memory: u64,
    pub max_cpu_time_seconds_per_call: f64,
    pub kind: WorkerKind,
    /// Path of the worker executable; defaults to `qpy-worker` next to the
    /// server binary.
    pub executable: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_workers: 8,
            max_memory: 500 * MIB,
            per_worker_memory: 200 * MIB,
            max_cpu_time_seconds_per_call: 10.0,
            kind: WorkerKind::Process,
            executable: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackageCacheSettings {
    pub size: u64,
    pub directory: PathBuf,
}

impl Default for PackageCacheSettings {
    fn default() -> Self {
        Self {
            size: 5 * MIB,
            directory: PathBuf::from("cache/packages"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepoIndexCacheSettings {
    pub size: u64,
    pub directory: PathBuf,
}

impl Default for RepoIndexCacheSettings {
    fn default() -> Self {
        Self {
            size: 20 * MIB,
            directory: PathBuf::from("cache/repo_index"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CollectorSettings {
    /// Directory watched for `.qpy` archives; disabled when unset or empty.
    pub local_directory: Option<PathBuf>,
    /// Whitespace-separated repository base URLs.
    pub repositories: String,
    pub repository_update_interval_seconds: Option<u64>,
}

impl CollectorSettings {
    pub fn local_directory(&self) -> Option<&PathBuf> {
        self.local_directory
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn repository_urls(&self) -> Vec<String> {
        self.repositories
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn repository_update_interval(&self) -> Duration {
        Duration::from_secs(self.repository_update_interval_seconds.unwrap_or(90))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub webservice: WebserviceSettings,
    pub worker: WorkerSettings,
    pub cache_package: PackageCacheSettings,
    pub cache_repo_index: RepoIndexCacheSettings,
    pub collector: CollectorSettings,
}

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("failed to read configuration: {0}")]
    Config(#[from] config::ConfigError),
}

impl Settings {
    /// Loads settings from the optional INI file and the environment.
    /// Environment keys use the section as the first path element, e.g.
    /// `QPY_WEBSERVICE__LISTEN_PORT=9000`.
    pub fn load(config_file: Option<&std::path::Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            info!("reading config file '{}'", path.display());
            builder = builder.add_source(
                File::from(path).format(FileFormat::Ini).required(true),
            );
        }
        let config = builder
            .add_source(Environment::with_prefix("QPY").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_without_a_config_file() {
        let settings = Settings::load(None).expect("load");
        assert_eq!(settings.webservice.listen_port, 9020);
        assert_eq!(settings.worker.max_workers, 8);
        assert_eq!(settings.webservice.max_package_size, DEFAULT_MAX_PACKAGE_SIZE);
        assert!(settings.collector.local_directory().is_none());
    }

    #[test]
    fn reads_ini_sections() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "[webservice]\nlisten_port = 9000\nallow_lms_packages = false\n\n\
             [worker]\nmax_workers = 2\n\n\
             [collector]\nrepositories = https://repo.example/a/ https://repo.example/b/\n"
        )
        .expect("write");

        let settings = Settings::load(Some(file.path())).expect("load");
        assert_eq!(settings.webservice.listen_port, 9000);
        assert!(!settings.webservice.allow_lms_packages);
        assert_eq!(settings.worker.max_workers, 2);
        assert_eq!(
            settings.collector.repository_urls(),
            vec![
                "https://repo.example/a/".to_string(),
                "https://repo.example/b/".to_string(),
            ]
        );
    }
}
