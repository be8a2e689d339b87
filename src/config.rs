use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::rules::RuleSet;

pub const DEFAULT_CONFIG_PATH: &str = ".pr-buildbot.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration loaded from .pr-buildbot.toml.
/// Every field is optional; missing sections fall back to defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default)]
    pub ci: CiConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub reporters: ReportersConfig,

    /// Timeout applied to every outbound REST call
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github: GitHubConfig::default(),
            ci: CiConfig::default(),
            store: StoreConfig::default(),
            reporters: ReportersConfig::default(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

/// How pull request events reach intake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IntakeMethod {
    #[default]
    Hooks,
    Polling,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
    /// GitHub API token. If None, falls back to GITHUB_TOKEN env var.
    pub token: Option<String>,
    /// REST API base; override for GitHub Enterprise
    #[serde(default = "default_github_api")]
    pub api_url: String,
    /// Owner of the watched repositories
    #[serde(default)]
    pub owner: String,
    /// The bot's own login, addressed in `@bot retest` and `@bot ignore`
    #[serde(default)]
    pub bot_handle: String,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub method: IntakeMethod,
    /// Users allowed to request retests; empty means anyone
    #[serde(default)]
    pub retry_whitelist: Vec<String>,
    #[serde(default)]
    pub skip_file_listing: bool,
    /// Polling interval in milliseconds (polling method only)
    #[serde(default = "default_github_frequency")]
    pub frequency_ms: u64,
    /// Webhook listener port (hooks method only)
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_allowed_ips")]
    pub allowed_ips: Vec<IpAddr>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: default_github_api(),
            owner: String::new(),
            bot_handle: String::new(),
            repos: Vec::new(),
            method: IntakeMethod::default(),
            retry_whitelist: Vec::new(),
            skip_file_listing: false,
            frequency_ms: default_github_frequency(),
            port: default_port(),
            allowed_ips: default_allowed_ips(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CiConfig {
    /// Base URL of the Jenkins server, e.g. http://jenkins.example.com:8080
    #[serde(default)]
    pub url: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    /// Remote build token used when a project does not set its own
    pub token: Option<String>,
    /// Default project for repositories without an entry in `projects`
    pub project: Option<String>,
    /// File rules for the default project
    #[serde(default)]
    pub rules: RuleSet,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    /// Build polling interval in milliseconds
    #[serde(default = "default_ci_frequency")]
    pub frequency_ms: u64,
    /// How long a triggered build may stay unlisted before its job is
    /// abandoned and the pull becomes buildable again
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_secs: u64,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: None,
            pass: None,
            token: None,
            project: None,
            rules: RuleSet::default(),
            projects: Vec::new(),
            frequency_ms: default_ci_frequency(),
            pending_timeout_secs: default_pending_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    /// Source repository this project builds
    pub repo: String,
    pub token: Option<String>,
    #[serde(default)]
    pub rules: RuleSet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportersConfig {
    #[serde(default)]
    pub phpcs: PhpCsConfig,
    #[serde(default)]
    pub phpunit: PhpUnitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhpCsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_phpcs_artifact")]
    pub artifact: String,
}

impl Default for PhpCsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            artifact: default_phpcs_artifact(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhpUnitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_phpunit_artifact")]
    pub artifact: String,
    /// Maximum number of failures quoted in the summary comment
    #[serde(default = "default_failure_limit")]
    pub failure_limit: usize,
}

impl Default for PhpUnitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            artifact: default_phpunit_artifact(),
            failure_limit: default_failure_limit(),
        }
    }
}

/// The CI project that builds a repository, with its token and rules.
#[derive(Debug, Clone)]
pub struct ResolvedProject {
    pub name: String,
    pub token: Option<String>,
    pub rules: RuleSet,
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_github_frequency() -> u64 {
    75_000
}

fn default_ci_frequency() -> u64 {
    10_000
}

fn default_pending_timeout() -> u64 {
    1800
}

fn default_port() -> u16 {
    8888
}

/// Local requests plus GitHub's published hook addresses.
fn default_allowed_ips() -> Vec<IpAddr> {
    ["127.0.0.1", "207.97.227.253", "50.57.128.197", "108.171.174.178"]
        .iter()
        .filter_map(|ip| ip.parse().ok())
        .collect()
}

fn default_store_path() -> String {
    "pr-buildbot.db".to_string()
}

fn default_phpcs_artifact() -> String {
    "artifacts/phpcs.csv".to_string()
}

fn default_phpunit_artifact() -> String {
    "artifacts/junit.xml".to_string()
}

fn default_failure_limit() -> usize {
    3
}

impl Config {
    /// Load configuration from `path`, or from .pr-buildbot.toml in the
    /// current directory. Returns default config if the default file doesn't
    /// exist; an explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load_from(default_path)?
                } else {
                    Config::default()
                }
            }
        };

        if config.github.token.is_none() {
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                config.github.token = Some(token);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a specific path (useful for testing).
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.github.bot_handle.is_empty() {
            return Err(ConfigError::Invalid("github.bot_handle must be set".to_string()));
        }
        if self.github.owner.is_empty() {
            return Err(ConfigError::Invalid("github.owner must be set".to_string()));
        }
        if self.ci.url.is_empty() {
            return Err(ConfigError::Invalid("ci.url must be set".to_string()));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid("http_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn pending_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ci.pending_timeout_secs).unwrap_or(i64::MAX))
    }

    /// Resolve the CI project for a repository: an explicit `[[ci.projects]]`
    /// entry wins, otherwise the default `ci.project` applies to every repo.
    pub fn resolve_project(&self, repo: &str) -> Option<ResolvedProject> {
        if let Some(project) = self.ci.projects.iter().find(|p| p.repo == repo) {
            return Some(ResolvedProject {
                name: project.name.clone(),
                token: project.token.clone().or_else(|| self.ci.token.clone()),
                rules: project.rules.clone(),
            });
        }
        self.ci.project.as_ref().map(|name| ResolvedProject {
            name: name.clone(),
            token: self.ci.token.clone(),
            rules: self.ci.rules.clone(),
        })
    }
}
