use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the rackline service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub region: RegionConfig,
    #[serde(default)]
    pub paths: PathConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub health: HealthCheckConfig,
    #[serde(default)]
    pub commands: CommandConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    /// Region controller base URLs, e.g. `http://region.example:5240/`.
    pub urls: Vec<String>,
    /// URL the region should use to reach this rack.
    #[serde(default)]
    pub advertised_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "default_secret_path")]
    pub secret_path: PathBuf,
    #[serde(default = "default_boot_images_dir")]
    pub boot_images_dir: PathBuf,
    #[serde(default = "default_dhcp_config_dir")]
    pub dhcp_config_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            lock_dir: default_lock_dir(),
            secret_path: default_secret_path(),
            boot_images_dir: default_boot_images_dir(),
            dhcp_config_dir: default_dhcp_config_dir(),
        }
    }
}

/// Certificate material presented during the TLS upgrade. Absent means an
/// ephemeral self-signed identity is generated at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_low")]
    pub interval_low_secs: u64,
    #[serde(default = "default_interval_mid")]
    pub interval_mid_secs: u64,
    #[serde(default = "default_interval_high")]
    pub interval_high_secs: u64,
    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_low_secs: default_interval_low(),
            interval_mid_secs: default_interval_mid(),
            interval_high_secs: default_interval_high(),
            warmup_secs: default_warmup(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            ping_timeout_secs: default_ping_timeout(),
        }
    }
}

/// External commands the dispatcher shells out to.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_import_command")]
    pub boot_image_importer: String,
    #[serde(default = "default_helper_command")]
    pub helper: String,
    #[serde(default = "default_service_unit")]
    pub service_unit: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            boot_image_importer: default_import_command(),
            helper: default_helper_command(),
            service_unit: default_service_unit(),
        }
    }
}

impl Config {
    /// Load configuration from RACKLINE_CONFIG or the packaged default path.
    pub fn load_from_env() -> Result<Self> {
        Self::load(env_config_path())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("unable to read config {}", path.display()))?;
        let config: Config = toml::from_str(&data)
            .with_context(|| format!("invalid TOML config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.region.urls.is_empty() {
            bail!("region.urls must name at least one region controller");
        }
        for url in &self.region.urls {
            if reqwest::Url::parse(url).is_err() {
                bail!("region URL '{url}' is not a valid URL");
            }
        }
        if self.polling.interval_low_secs == 0 {
            bail!("polling.interval_low_secs must be > 0");
        }
        if self.polling.interval_low_secs > self.polling.interval_mid_secs
            || self.polling.interval_mid_secs > self.polling.interval_high_secs
        {
            bail!("polling intervals must be ordered low <= mid <= high");
        }
        if self.health.ping_timeout_secs >= self.health.interval_secs {
            bail!("health.ping_timeout_secs must be shorter than the check interval");
        }
        Ok(())
    }

    pub fn pool_config(&self) -> crate::rpc::pool::PoolConfig {
        crate::rpc::pool::PoolConfig {
            interval_low: Duration::from_secs(self.polling.interval_low_secs),
            interval_mid: Duration::from_secs(self.polling.interval_mid_secs),
            interval_high: Duration::from_secs(self.polling.interval_high_secs),
            warmup: Duration::from_secs(self.polling.warmup_secs),
        }
    }

    pub fn health_config(&self) -> crate::rpc::health::HealthConfig {
        crate::rpc::health::HealthConfig {
            interval: Duration::from_secs(self.health.interval_secs),
            ping_timeout: Duration::from_secs(self.health.ping_timeout_secs),
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RACKLINE_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("/etc/rackline/rackline.toml")
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/rackline")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/run/lock")
}

fn default_secret_path() -> PathBuf {
    PathBuf::from("/var/lib/rackline/secret")
}

fn default_boot_images_dir() -> PathBuf {
    PathBuf::from("/var/lib/rackline/boot-resources")
}

fn default_dhcp_config_dir() -> PathBuf {
    PathBuf::from("/var/lib/rackline/dhcpd")
}

fn default_interval_low() -> u64 {
    1
}

fn default_interval_mid() -> u64 {
    5
}

fn default_interval_high() -> u64 {
    30
}

fn default_warmup() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    30
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_import_command() -> String {
    "/usr/lib/rackline/import-boot-images".into()
}

fn default_helper_command() -> String {
    "/usr/lib/rackline/helper".into()
}

fn default_service_unit() -> String {
    "rackline".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(doc: &str) -> Config {
        toml::from_str(doc).unwrap()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse(
            r#"
            [region]
            urls = ["http://region.example:5240/"]
            "#,
        );
        config.validate().unwrap();
        assert_eq!(config.polling.interval_low_secs, 1);
        assert_eq!(config.polling.interval_high_secs, 30);
        assert_eq!(config.paths.lock_dir, PathBuf::from("/run/lock"));
        assert!(config.tls.is_none());
    }

    #[test]
    fn rejects_empty_region_list() {
        let config = parse(
            r#"
            [region]
            urls = []
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_disordered_intervals() {
        let config = parse(
            r#"
            [region]
            urls = ["http://region.example:5240/"]

            [polling]
            interval_low_secs = 10
            interval_mid_secs = 5
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_urls() {
        let config = parse(
            r#"
            [region]
            urls = ["not a url"]
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn full_config_round_trips() {
        let config = parse(
            r#"
            [region]
            urls = ["http://r1.example:5240/", "http://r2.example:5240/"]
            advertised_url = "http://rack-1.example:5248/"

            [paths]
            lock_dir = "/tmp/locks"

            [tls]
            cert_path = "/etc/rackline/rack.crt"
            key_path = "/etc/rackline/rack.key"

            [health]
            interval_secs = 60
            ping_timeout_secs = 15
            "#,
        );
        config.validate().unwrap();
        assert_eq!(config.region.urls.len(), 2);
        assert_eq!(config.health_config().interval, Duration::from_secs(60));
        assert!(config.tls.is_some());
    }
}
