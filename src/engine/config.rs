use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::engine::{error::JudgeError, limits::LimitDefaults};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct JudgerConfig {
    pub bind_addr: SocketAddr,
    pub judge_token: String,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub sandbox_image: String,
    pub sandbox_workdir: String,
    pub sandbox_data_dir: String,
    pub test_data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub checker_dir: PathBuf,
    pub languages_path: Option<PathBuf>,
    pub limit_defaults: LimitDefaults,
    pub default_output_limit: u64,
    pub compile_file_size: u64,
    pub docker_timeout: Duration,
    pub checker_timeout: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl JudgerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
            judge_token: env::var("JUDGE_TOKEN").unwrap_or_else(|_| "dev-token".to_string()),
            worker_count: env_parse("WORKER_COUNT", 4usize),
            queue_capacity: env_parse("QUEUE_CAPACITY", 64usize),
            sandbox_image: env_string("SANDBOX_IMAGE", "judgebox:latest"),
            sandbox_workdir: env_string("SANDBOX_WORKDIR", "/judgebox"),
            sandbox_data_dir: env_string("SANDBOX_DATA_DIR", "/data"),
            test_data_dir: env_parse("TEST_DATA_DIR", PathBuf::from("./test_data")),
            temp_dir: env_parse("TEMP_DIR", PathBuf::from("./temp")),
            checker_dir: env_parse("CHECKER_DIR", PathBuf::from("./checkers")),
            languages_path: env::var("LANGUAGES_PATH").ok().map(PathBuf::from),
            limit_defaults: LimitDefaults {
                cpu_time_secs: env_parse("DEFAULT_CPU_TIME", 1),
                real_time_secs: env_parse("DEFAULT_REAL_TIME", 5),
                memory_mb: env_parse("DEFAULT_MEMORY_MB", 64),
                file_size_bytes: env_parse("DEFAULT_FILE_SIZE", 256 * MIB),
                cpu_to_real_factor: env_parse("CPU_TO_REAL_TIME_FACTOR", 3),
            },
            default_output_limit: env_parse("DEFAULT_OUTPUT_LIMIT", 10 * MIB),
            compile_file_size: env_parse("COMPILE_FILE_SIZE", 128 * MIB),
            docker_timeout: Duration::from_secs(env_parse("DOCKER_TIMEOUT_SECS", 120)),
            checker_timeout: Duration::from_secs(env_parse("CHECKER_TIMEOUT_SECS", 10)),
            log_level: env_string("LOG_LEVEL", "info"),
            log_format: env_parse("LOG_FORMAT", LogFormat::Compact),
        }
    }

    /// Creates the host directories the judge writes to and makes every
    /// host path absolute, as bind mounts require.
    pub fn prepare_dirs(&mut self) -> Result<(), JudgeError> {
        self.test_data_dir = ensure_dir(&self.test_data_dir)?;
        self.temp_dir = ensure_dir(&self.temp_dir)?;
        self.checker_dir = canonical(&self.checker_dir)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" | "text" | "pretty" => Ok(Self::Compact),
            _ => Err(format!("unsupported log format: {s}")),
        }
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, JudgeError> {
    std::fs::create_dir_all(path).map_err(|err| {
        JudgeError::Configuration(format!("cannot create {}: {err}", path.display()))
    })?;
    canonical(path)
}

fn canonical(path: &Path) -> Result<PathBuf, JudgeError> {
    path.canonicalize()
        .map_err(|err| JudgeError::Configuration(format!("cannot resolve {}: {err}", path.display())))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_format() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn unset_variables_fall_back() {
        assert_eq!(env_parse("JUDGEBOX_TEST_UNSET_VARIABLE", 42u64), 42);
        assert_eq!(env_string("JUDGEBOX_TEST_UNSET_VARIABLE", "x"), "x");
    }

    #[test]
    fn prepares_missing_directories() {
        let root = tempfile::tempdir().unwrap();
        let mut config = JudgerConfig::from_env();
        config.test_data_dir = root.path().join("data");
        config.temp_dir = root.path().join("nested/temp");
        config.checker_dir = root.path().to_path_buf();

        config.prepare_dirs().unwrap();

        assert!(config.test_data_dir.is_absolute());
        assert!(config.temp_dir.is_dir());
    }

    #[test]
    fn missing_checker_dir_is_a_configuration_error() {
        let root = tempfile::tempdir().unwrap();
        let mut config = JudgerConfig::from_env();
        config.test_data_dir = root.path().join("data");
        config.temp_dir = root.path().join("temp");
        config.checker_dir = root.path().join("absent");

        assert!(matches!(config.prepare_dirs(), Err(JudgeError::Configuration(_))));
    }
}
