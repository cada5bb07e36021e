use proxy::config::ProxyConfig;
use serde::Deserialize;
use std::fs::File;

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

/// Which control-plane client backs the [`cluster::ClusterClient`] trait.
/// The orchestrator-native client is deployment-specific and wired in by
/// the deployment's build; `env` reads `<NAME>_SERVICE_HOST`-style
/// variables and suits development and single-service setups.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusterProvider {
    #[default]
    Env,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub provider: ClusterProvider,
}

#[derive(Debug, Deserialize)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    pub proxy: ProxyConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy::config::{ConnectionConfig, Listener};
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://key@sentry.example.com/1
            cluster:
                provider: env
            proxy:
                listener: { host: 0.0.0.0, port: 8080 }
                base_url: https://edge.example.com
                mods:
                    default:
                        kind: service
                        name: torrent-web-seeder
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(config.common.metrics.as_ref().unwrap().statsd_port, 8125);
        assert_eq!(config.cluster.provider, ClusterProvider::Env);
        assert_eq!(
            config.proxy.listener,
            Listener {
                host: "0.0.0.0".into(),
                port: 8080
            }
        );
        assert!(matches!(
            config.proxy.mods.get("default"),
            Some(ConnectionConfig::Service(_))
        ));
    }

    #[test]
    fn minimal_config() {
        let tmp = write_tmp_file("proxy:\n    mods: {}\n");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert!(config.common.metrics.is_none());
        assert!(config.common.logging.is_none());
    }
}
