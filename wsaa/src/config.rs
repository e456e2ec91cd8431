// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::signer::SigningCredentials;

/// The WSAA deployment to request tickets from.
///
/// Tickets are only accepted by services in the same environment they were issued in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    /// The testing environment, which AFIP calls "homologación".
    #[default]
    #[serde(alias = "homologation")]
    Staging,
}

impl Environment {
    /// The `loginCms` endpoint for this environment.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Environment::Production => "https://wsaa.afip.gov.ar/ws/services/LoginCms",
            Environment::Staging => "https://wsaahomo.afip.gov.ar/ws/services/LoginCms",
        }
    }
}

/// Configuration for the ticket issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The environment to request tickets from; the default is "staging".
    #[serde(default)]
    pub environment: Environment,

    /// Send requests to this URL rather than the environment's `loginCms` endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// The directory in which issued tickets are cached; the default is the current directory.
    ///
    /// Each service gets its own file, named after the service.
    #[serde(default = "default_cache_directory")]
    pub cache_directory: PathBuf,

    /// The amount of time to wait for the authority to respond before giving up.
    ///
    /// Requests are never retried; if this elapses the issuance fails. Given in seconds;
    /// the default is 30.
    #[serde(default = "default_request_timeout", with = "seconds")]
    pub request_timeout: Duration,

    /// The longest ticket lifetime that will be accepted from the authority.
    ///
    /// WSAA issues tickets valid for twelve hours. Responses claiming the ticket is valid for
    /// longer than this are rejected rather than cached. Given in seconds; the default is
    /// 86400 (24 hours).
    #[serde(default = "default_max_ticket_lifetime", with = "seconds")]
    pub max_ticket_lifetime: Duration,

    /// The certificate and private key used to sign login ticket requests. The certificate
    /// must be one registered with AFIP for the services tickets will be requested for.
    pub credentials: SigningCredentials,
}

impl Config {
    /// The URL login ticket requests are submitted to.
    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| self.environment.endpoint())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            endpoint: None,
            cache_directory: default_cache_directory(),
            request_timeout: default_request_timeout(),
            max_ticket_lifetime: default_max_ticket_lifetime(),
            credentials: SigningCredentials::pkcs12("wsaa.certificate.p12", None),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_ticket_lifetime() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

/// (De)serialize a [`Duration`] as a whole number of seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Load the configuration file at `path`.
///
/// # Errors
///
/// Returns an error if the file can't be read, isn't valid, or references a password file
/// that can't be read.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            tracing::error!(
                %error,
                example = %Config::default(),
                "Failed to parse configuration loaded from {path:?}"
            );
        })
        .context("configuration file is invalid")
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::TempDir;

    use super::*;
    use crate::signer::CertificateSource;

    #[test]
    fn minimal_config_uses_defaults() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
            [credentials]
            format = "pem"
            certificate = "wsaa.crt"
            private_key = "wsaa.key"
            "#,
        )?;

        assert_eq!(Environment::Staging, config.environment);
        assert_eq!(
            "https://wsaahomo.afip.gov.ar/ws/services/LoginCms",
            config.endpoint()
        );
        assert_eq!(PathBuf::from("."), config.cache_directory);
        assert_eq!(Duration::from_secs(30), config.request_timeout);
        assert_eq!(
            CertificateSource::Pem {
                certificate: "wsaa.crt".into(),
                private_key: "wsaa.key".into()
            },
            config.credentials.source
        );
        Ok(())
    }

    #[test]
    fn environment_selects_endpoint() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
            environment = "production"
            [credentials]
            format = "pkcs12"
            path = "wsaa.p12"
            "#,
        )?;
        assert_eq!(
            "https://wsaa.afip.gov.ar/ws/services/LoginCms",
            config.endpoint()
        );

        let config: Config = toml::from_str(
            r#"
            environment = "homologation"
            endpoint = "http://localhost:8080/ws/services/LoginCms"
            [credentials]
            format = "pkcs12"
            path = "wsaa.p12"
            "#,
        )?;
        assert_eq!(Environment::Staging, config.environment);
        assert_eq!("http://localhost:8080/ws/services/LoginCms", config.endpoint());
        Ok(())
    }

    #[test]
    fn default_config_round_trips() -> Result<()> {
        let directory = TempDir::new()?;
        let path = directory.path().join("wsaa.toml");
        std::fs::write(&path, Config::default().to_string())?;

        let config = load_config(&path)?;

        assert_eq!(Config::default().endpoint(), config.endpoint());
        assert_eq!(
            Config::default().max_ticket_lifetime,
            config.max_ticket_lifetime
        );
        Ok(())
    }

    #[test]
    fn durations_are_seconds() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
            request_timeout = 5
            max_ticket_lifetime = 43200
            [credentials]
            format = "pkcs12"
            path = "wsaa.p12"
            "#,
        )?;

        assert_eq!(Duration::from_secs(5), config.request_timeout);
        assert_eq!(Duration::from_secs(43200), config.max_ticket_lifetime);
        let rendered = config.to_string();
        assert!(rendered.contains("request_timeout = 5\n"), "{rendered}");
        assert!(rendered.contains("max_ticket_lifetime = 43200\n"), "{rendered}");

        let nested = r#"
            [request_timeout]
            secs = 5
            nanos = 0
            [credentials]
            format = "pkcs12"
            path = "wsaa.p12"
            "#;
        assert!(toml::from_str::<Config>(nested).is_err());
        Ok(())
    }

    #[test]
    fn invalid_config() -> Result<()> {
        let directory = TempDir::new()?;
        let path = directory.path().join("wsaa.toml");
        std::fs::write(&path, "environment = \"moon\"\n")?;

        assert!(load_config(&path).is_err());
        assert!(load_config(&directory.path().join("missing.toml")).is_err());
        Ok(())
    }
}
