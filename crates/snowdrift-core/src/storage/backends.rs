//! Backend-specific connection settings and object store construction.
//!
//! Storage options from the pipeline config are passed to the cloud builders
//! as configuration keys, after the environment has been read, so explicit
//! options win.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey};
use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};
use object_store::gcp::{GoogleCloudStorageBuilder, GoogleConfigKey};
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use tracing::debug;

use crate::error::{BackendSetupSnafu, IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Custom endpoint (MinIO, LocalStack); forces path-style requests.
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: String,
    pub key: Option<Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsConfig {
    pub bucket: String,
    pub key: Option<Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    pub key: Option<Path>,
}

/// A directory on the local filesystem. The path is the root itself, so
/// there is no separate key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
    pub key: Option<Path>,
}

fn config_keys<K>(options: &HashMap<String, String>) -> Result<Vec<(K, String)>, object_store::Error>
where
    K: FromStr<Err = object_store::Error>,
{
    options
        .iter()
        .map(|(key, value)| Ok((key.parse()?, value.clone())))
        .collect()
}

fn with_key(base: String, key: Option<&Path>) -> String {
    match key {
        Some(key) => format!("{base}/{key}"),
        None => base,
    }
}

impl StorageProvider {
    pub(super) async fn connect(
        config: BackendConfig,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let (object_store, canonical_url) = match &config {
            BackendConfig::S3(s3) => s3_store(s3, &options)?,
            BackendConfig::Gcs(gcs) => gcs_store(gcs, &options)?,
            BackendConfig::Azure(azure) => azure_store(azure, &options)?,
            BackendConfig::Local(local) => {
                tokio::fs::create_dir_all(&local.path).await.context(IoSnafu)?;
                let store = LocalFileSystem::new_with_prefix(&local.path).context(ObjectStoreSnafu)?;
                (Arc::new(store) as Arc<dyn ObjectStore>, format!("file://{}", local.path))
            }
        };
        debug!("Connected storage root {canonical_url}");

        Ok(Self {
            config,
            object_store,
            canonical_url,
            storage_options: options,
        })
    }
}

type Connected = (Arc<dyn ObjectStore>, String);

fn s3_store(config: &S3Config, options: &HashMap<String, String>) -> Result<Connected, StorageError> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&config.bucket)
        .with_retry(RetryConfig::default());
    if let Some(region) = &config.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &config.endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(true);
    }
    let keys = config_keys::<AmazonS3ConfigKey>(options).context(BackendSetupSnafu { backend: "S3" })?;
    for (key, value) in keys {
        builder = builder.with_config(key, value);
    }

    let base = match (&config.endpoint, &config.region) {
        (Some(endpoint), _) => format!("s3::{endpoint}/{}", config.bucket),
        (None, Some(region)) => format!("https://s3.{region}.amazonaws.com/{}", config.bucket),
        (None, None) => format!("https://s3.amazonaws.com/{}", config.bucket),
    };
    let store = builder.build().context(BackendSetupSnafu { backend: "S3" })?;
    Ok((Arc::new(store), with_key(base, config.key.as_ref())))
}

fn gcs_store(config: &GcsConfig, options: &HashMap<String, String>) -> Result<Connected, StorageError> {
    let mut builder = GoogleCloudStorageBuilder::from_env()
        .with_bucket_name(&config.bucket)
        .with_retry(RetryConfig::default());
    if let Ok(service_account_key) = std::env::var("GOOGLE_SERVICE_ACCOUNT_KEY") {
        debug!("Using GCS service account key from environment");
        builder = builder.with_service_account_key(&service_account_key);
    }
    let keys = config_keys::<GoogleConfigKey>(options).context(BackendSetupSnafu { backend: "GCS" })?;
    for (key, value) in keys {
        builder = builder.with_config(key, value);
    }

    let base = format!("https://{}.storage.googleapis.com", config.bucket);
    let store = builder.build().context(BackendSetupSnafu { backend: "GCS" })?;
    Ok((Arc::new(store), with_key(base, config.key.as_ref())))
}

fn azure_store(
    config: &AzureConfig,
    options: &HashMap<String, String>,
) -> Result<Connected, StorageError> {
    let mut builder = MicrosoftAzureBuilder::from_env()
        .with_account(&config.account)
        .with_container_name(&config.container)
        .with_retry(RetryConfig::default());
    let keys = config_keys::<AzureConfigKey>(options).context(BackendSetupSnafu { backend: "Azure" })?;
    for (key, value) in keys {
        builder = builder.with_config(key, value);
    }

    let base = format!(
        "https://{}.blob.core.windows.net/{}",
        config.account, config.container
    );
    let store = builder.build().context(BackendSetupSnafu { backend: "Azure" })?;
    Ok((Arc::new(store), with_key(base, config.key.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_s3_option_is_rejected() {
        let options = HashMap::from([("not_a_real_option".to_string(), "x".to_string())]);
        assert!(config_keys::<AmazonS3ConfigKey>(&options).is_err());
    }

    #[test]
    fn test_known_s3_option_parses() {
        let options = HashMap::from([("aws_region".to_string(), "eu-west-1".to_string())]);
        let keys = config_keys::<AmazonS3ConfigKey>(&options).unwrap();
        assert_eq!(keys, vec![(AmazonS3ConfigKey::Region, "eu-west-1".to_string())]);
    }

    #[test]
    fn test_canonical_url_with_key() {
        assert_eq!(
            with_key("s3::http://localhost:9000/inv".into(), Some(&Path::from("daily"))),
            "s3::http://localhost:9000/inv/daily"
        );
        assert_eq!(with_key("file:///data".into(), None), "file:///data");
    }

    #[tokio::test]
    async fn test_local_root_is_created() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().join("nested/root");
        let config = BackendConfig::Local(LocalConfig {
            path: root.to_string_lossy().into_owned(),
            key: None,
        });

        let provider = StorageProvider::connect(config, HashMap::new()).await.unwrap();
        assert!(root.is_dir());
        assert_eq!(provider.url(), format!("file://{}", root.display()));
    }
}
