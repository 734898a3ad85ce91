use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::debug;

use crate::{check_key, BucketError, BucketStore};

/// Where warehouse tables land in an S3-compatible bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Every key is stored under this prefix, e.g. `prod/warehouse`.
    pub prefix: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            prefix: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
        }
    }

    fn static_credentials(&self) -> Option<Credentials> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => {
                Some(Credentials::new(id, secret, None, None, "salesflow-static"))
            }
            _ => None,
        }
    }

    /// Prefix with surrounding slashes removed; `None` when nothing is left.
    fn normalized_prefix(&self) -> Result<Option<String>, BucketError> {
        let Some(prefix) = self.prefix.as_deref().map(|p| p.trim_matches('/')) else {
            return Ok(None);
        };
        if prefix.is_empty() {
            return Ok(None);
        }
        check_key(prefix)?;
        Ok(Some(prefix.to_string()))
    }
}

/// S3-compatible backend. A single `PutObject` replaces the object atomically.
#[derive(Clone)]
pub struct S3BucketStore {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3BucketStore {
    pub async fn new(config: S3Config) -> Result<Self, BucketError> {
        if config.bucket.trim().is_empty() {
            return Err(BucketError::Configuration("S3 bucket name is empty".into()));
        }
        let prefix = config.normalized_prefix()?;
        let client = build_client(&config).await;
        debug!(bucket = %config.bucket, prefix = ?prefix, "configured S3 warehouse bucket");
        Ok(Self {
            client,
            bucket: config.bucket,
            prefix,
        })
    }

    fn object_key(&self, key: &str) -> Result<String, BucketError> {
        check_key(key)?;
        Ok(join_key(self.prefix.as_deref(), key))
    }
}

async fn build_client(config: &S3Config) -> Client {
    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
    if let Some(credentials) = config.static_credentials() {
        loader = loader.credentials_provider(SharedCredentialsProvider::new(credentials));
    }
    let shared = loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&shared)
        .force_path_style(config.force_path_style);
    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    Client::from_conf(builder.build())
}

fn join_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}/{key}"),
        None => key.to_string(),
    }
}

#[async_trait]
impl BucketStore for S3BucketStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BucketError> {
        let object_key = self.object_key(key)?;
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| BucketError::from_sdk(format!("put {object_key}: {err}")))?;
        debug!(bucket = %self.bucket, key = %object_key, size, "stored object");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        let object_key = self.object_key(key)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    BucketError::NotFound(key.to_string())
                } else {
                    BucketError::from_sdk(format!("get {object_key}: {err}"))
                }
            })?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|err| BucketError::from_sdk(format!("read {object_key}: {err}")))?;
        Ok(body.into_bytes())
    }

    fn describe(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("s3://{}/{prefix}", self.bucket),
            None => format!("s3://{}", self.bucket),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_joined_under_the_prefix() {
        assert_eq!(join_key(None, "a/b.parquet"), "a/b.parquet");
        assert_eq!(join_key(Some("prod"), "a/b.parquet"), "prod/a/b.parquet");
    }

    #[test]
    fn prefix_is_trimmed_and_validated() {
        let mut config = S3Config::new("warehouse", "us-east-1");
        assert_eq!(config.normalized_prefix().ok(), Some(None));

        config.prefix = Some("/prod/tables/".into());
        assert_eq!(config.normalized_prefix().ok(), Some(Some("prod/tables".into())));

        config.prefix = Some("/".into());
        assert_eq!(config.normalized_prefix().ok(), Some(None));

        config.prefix = Some("prod/../other".into());
        assert!(matches!(
            config.normalized_prefix(),
            Err(BucketError::Configuration(_))
        ));
    }

    #[test]
    fn static_credentials_need_both_halves() {
        let mut config = S3Config::new("warehouse", "us-east-1");
        config.access_key_id = Some("id".into());
        assert!(config.static_credentials().is_none());
        config.secret_access_key = Some("secret".into());
        assert!(config.static_credentials().is_some());
    }
}
