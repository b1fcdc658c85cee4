//! URL parsing for storage backends.
//!
//! Patterns are tried in a fixed order so that the generic `https://` forms
//! never shadow each other.

use object_store::path::Path;
use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{AzureConfig, GcsConfig, LocalConfig, S3Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Azure,
    Local,
}

const PATTERNS: &[(Backend, &str)] = &[
    (
        Backend::S3,
        r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
    ),
    (
        Backend::S3,
        r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$",
    ),
    (
        Backend::S3,
        r"^[sS]3[aA]?::(?P<protocol>https?)://(?P<endpoint>[^:/]+):(?P<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
    ),
    (
        Backend::S3,
        r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
    ),
    (
        Backend::Gcs,
        r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$",
    ),
    (
        Backend::Gcs,
        r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+))?$",
    ),
    (
        Backend::Gcs,
        r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$",
    ),
    (
        Backend::Azure,
        r"^abfss?://(?P<container>[a-z0-9\-]+)@(?P<account>[a-z0-9]+)\.dfs\.core\.windows\.net(/(?P<key>.+))?$",
    ),
    (
        Backend::Azure,
        r"^https://(?P<account>[a-z0-9]+)\.(blob|dfs)\.core\.windows\.net/(?P<container>[a-z0-9\-]+)(/(?P<key>.+))?$",
    ),
    (Backend::Local, r"^file://(?P<path>.*)$"),
    (Backend::Local, r"^file:(?P<path>.*)$"),
    (Backend::Local, r"^/(?P<path>.*)$"),
];

static MATCHERS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .map(|(backend, pattern)| (*backend, Regex::new(pattern).expect("static pattern compiles")))
        .collect()
});

/// Backend configuration parsed from a storage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
    Local(LocalConfig),
}

fn group(caps: &Captures, name: &str) -> Option<String> {
    caps.name(name).map(|m| m.as_str().to_string())
}

fn key(caps: &Captures) -> Option<Path> {
    caps.name("key").map(|m| Path::from(m.as_str()))
}

impl BackendConfig {
    /// Parse a storage URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        let Some((backend, caps)) = MATCHERS
            .iter()
            .find_map(|(backend, regex)| regex.captures(url).map(|caps| (*backend, caps)))
        else {
            return InvalidUrlSnafu { url }.fail();
        };

        let config = match backend {
            Backend::S3 => BackendConfig::S3(Self::s3_from(&caps)),
            Backend::Gcs => BackendConfig::Gcs(GcsConfig {
                bucket: group(&caps, "bucket").unwrap_or_default(),
                key: key(&caps),
            }),
            Backend::Azure => BackendConfig::Azure(AzureConfig {
                account: group(&caps, "account").unwrap_or_default(),
                container: group(&caps, "container").unwrap_or_default(),
                key: key(&caps),
            }),
            Backend::Local => {
                let path = group(&caps, "path").unwrap_or_default();
                let path = if path.starts_with('/') {
                    path
                } else {
                    format!("/{path}")
                };
                BackendConfig::Local(LocalConfig { path, key: None })
            }
        };
        Ok(config)
    }

    fn s3_from(caps: &Captures) -> S3Config {
        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| group(caps, "region"));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            let host = group(caps, "endpoint")?;
            let port = group(caps, "port").unwrap_or_else(|| "443".to_string());
            let protocol = group(caps, "protocol").unwrap_or_else(|| "https".to_string());
            Some(format!("{protocol}://{host}:{port}"))
        });

        S3Config {
            endpoint,
            region,
            bucket: group(caps, "bucket").unwrap_or_default(),
            key: key(caps),
        }
    }

    /// Object key prefix applied to every relative path.
    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Azure(azure) => azure.key.as_ref(),
            BackendConfig::Local(local) => local.key.as_ref(),
        }
    }
}
