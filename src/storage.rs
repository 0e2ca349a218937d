//! Storage layer for published media
//!
//! Uploads downloaded files into a public container of an S3 compatible
//! object store (AWS S3, Cloudflare R2, MinIO) and hands back their URLs.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use aws_types::region::Region;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Region used for custom endpoints when the connection string names none.
pub const DEFAULT_REGION: &str = "auto";

/// Region used for plain AWS when the connection string names none.
pub const AWS_DEFAULT_REGION: &str = "us-east-1";

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection string missing, malformed or incomplete
    #[error("Configuration error: {0}")]
    Config(String),
    /// Container lookup or creation failed
    #[error("Container error: {0}")]
    Container(String),
    /// Public read access could not be granted on a new container
    #[error("Access policy error: {0}")]
    AccessPolicy(String),
    /// Writing the object failed
    #[error("Upload error: {0}")]
    Upload(String),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The store does not implement the requested operation
    #[error("Not supported by the store: {0}")]
    Unsupported(String),
    /// The upload was aborted by the cancellation token
    #[error("upload cancelled")]
    Cancelled,
}

/// Parsed object storage connection string.
///
/// Format: `;`-separated `Key=Value` pairs with case-insensitive keys:
/// `AccessKeyId` and `SecretAccessKey` are required, `Endpoint`, `Region`
/// and `PublicUrl` are optional.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageConnection {
    /// Custom endpoint; enables path-style addressing
    pub endpoint: Option<String>,
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Region name
    pub region: String,
    /// Base URL the container's objects are publicly served under
    pub public_url: Option<String>,
}

impl std::fmt::Debug for StorageConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConnection")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &"[MASKED]")
            .field("secret_access_key", &"[MASKED]")
            .field("region", &self.region)
            .field("public_url", &self.public_url)
            .finish()
    }
}

impl StorageConnection {
    /// Parse a connection string.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Config` if the string is empty, a segment is not
    /// a `Key=Value` pair, or a required key is missing.
    pub fn parse(connection_string: &str) -> Result<Self, StorageError> {
        if connection_string.trim().is_empty() {
            return Err(StorageError::Config(
                "storage connection string is empty".into(),
            ));
        }

        let mut endpoint = None;
        let mut access_key_id = None;
        let mut secret_access_key = None;
        let mut region = None;
        let mut public_url = None;

        for segment in connection_string.split(';').map(str::trim) {
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                StorageError::Config(format!("malformed connection string segment: {segment}"))
            })?;
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim_end_matches('/').to_string()),
                "accesskeyid" => access_key_id = Some(value),
                "secretaccesskey" => secret_access_key = Some(value),
                "region" => region = Some(value),
                "publicurl" => public_url = Some(value.trim_end_matches('/').to_string()),
                other => debug!(key = %other, "Ignoring unknown connection string key"),
            }
        }

        let endpoint = endpoint.filter(|v| !v.is_empty());
        let region = match (region.filter(|v| !v.is_empty()), &endpoint) {
            (Some(region), _) => region,
            (None, Some(_)) => DEFAULT_REGION.to_string(),
            (None, None) => AWS_DEFAULT_REGION.to_string(),
        };
        if endpoint.is_none() && region == DEFAULT_REGION {
            return Err(StorageError::Config(format!(
                "Region '{DEFAULT_REGION}' requires an Endpoint"
            )));
        }

        Ok(Self {
            endpoint,
            access_key_id: access_key_id
                .filter(|v| !v.is_empty())
                .ok_or_else(|| StorageError::Config("AccessKeyId is missing".into()))?,
            secret_access_key: secret_access_key
                .filter(|v| !v.is_empty())
                .ok_or_else(|| StorageError::Config("SecretAccessKey is missing".into()))?,
            region,
            public_url: public_url.filter(|v| !v.is_empty()),
        })
    }

    /// Publicly resolvable URL of `key` inside `container`.
    #[must_use]
    pub fn object_url(&self, container: &str, key: &str) -> String {
        if let Some(base) = &self.public_url {
            return format!("{base}/{key}");
        }
        if let Some(endpoint) = &self.endpoint {
            return format!("{endpoint}/{container}/{key}");
        }
        format!("https://{container}.s3.{}.amazonaws.com/{key}", self.region)
    }
}

/// Low level operations on a single container.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the container this store writes to
    fn container(&self) -> String;
    /// Whether the container already exists
    async fn container_exists(&self) -> Result<bool, StorageError>;
    /// Create the container; succeeds if it already belongs to us
    async fn create_container(&self) -> Result<(), StorageError>;
    /// Allow anonymous reads of the container's objects
    ///
    /// Returns [`StorageError::Unsupported`] when the store has no bucket
    /// policies.
    async fn grant_public_read(&self) -> Result<(), StorageError>;
    /// Stream a local file into `key`, replacing any existing object
    async fn put_file(&self, path: &Path, key: &str) -> Result<(), StorageError>;
    /// Public URL of `key`
    fn public_url(&self, key: &str) -> String;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    connection: StorageConnection,
}

impl S3ObjectStore {
    /// Create an S3 client from a connection string.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string is invalid.
    pub async fn connect(connection_string: &str, bucket: &str) -> Result<Self, StorageError> {
        let connection = StorageConnection::parse(connection_string)?;
        if bucket.trim().is_empty() {
            return Err(StorageError::Config("container name is empty".into()));
        }

        let credentials = Credentials::new(
            &connection.access_key_id,
            &connection.secret_access_key,
            None,
            None,
            "connection-string",
        );

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(connection.region.clone()))
            .load()
            .await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &connection.endpoint {
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config.build()),
            bucket: bucket.to_string(),
            connection,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn container(&self) -> String {
        self.bucket.clone()
    }

    async fn container_exists(&self) -> Result<bool, StorageError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => Ok(false),
            Err(e) => Err(StorageError::Container(DisplayErrorContext(&e).to_string())),
        }
    }

    async fn create_container(&self) -> Result<(), StorageError> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        let region = self.connection.region.as_str();
        if region != DEFAULT_REGION && region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(()),
            // Lost a race against another instance creating the same bucket
            Err(SdkError::ServiceError(err)) if err.err().is_bucket_already_owned_by_you() => Ok(()),
            Err(e) => Err(StorageError::Container(DisplayErrorContext(&e).to_string())),
        }
    }

    async fn grant_public_read(&self) -> Result<(), StorageError> {
        // New AWS buckets block public policies by default. R2 and MinIO have
        // no such block and answer NotImplemented.
        if let Err(e) = self
            .client
            .delete_public_access_block()
            .bucket(&self.bucket)
            .send()
            .await
        {
            match policy_error(e) {
                StorageError::Unsupported(detail) => {
                    debug!(bucket = %self.bucket, "No public access block to remove: {detail}");
                }
                err => return Err(err),
            }
        }

        self.client
            .put_bucket_policy()
            .bucket(&self.bucket)
            .policy(public_read_policy(&self.bucket))
            .send()
            .await
            .map_err(policy_error)?;

        Ok(())
    }

    async fn put_file(&self, path: &Path, key: &str) -> Result<(), StorageError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::Upload(format!("{}: {e}", path.display())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type_for(path))
            .send()
            .await
            .map_err(|e| StorageError::Upload(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        self.connection.object_url(&self.bucket, key)
    }
}

fn policy_error<E>(err: E) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let code = err.code().map(str::to_string);
    classify_policy_failure(code.as_deref(), DisplayErrorContext(err).to_string())
}

/// Map an access-policy failure by its S3 error code.
fn classify_policy_failure(code: Option<&str>, detail: String) -> StorageError {
    match code {
        Some("NotImplemented") => StorageError::Unsupported(detail),
        _ => StorageError::AccessPolicy(detail),
    }
}

/// Bucket policy allowing anonymous reads of objects, without listing.
#[must_use]
pub fn public_read_policy(bucket: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "PublicReadGetObject",
            "Effect": "Allow",
            "Principal": "*",
            "Action": ["s3:GetObject"],
            "Resource": [format!("arn:aws:s3:::{bucket}/*")]
        }]
    })
    .to_string()
}

/// MIME type sent with the object, derived from the file extension.
#[must_use]
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp4") => "video/mp4",
        Some("m4a") => "audio/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

/// A file that has been published to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAsset {
    /// Object name inside the container
    pub blob_name: String,
    /// Publicly resolvable URL
    pub public_url: String,
}

/// Uploads local files into a container that is guaranteed to exist.
pub struct StorageUploader {
    store: Arc<dyn ObjectStore>,
}

impl StorageUploader {
    /// Wrap `store`, creating its container if absent and granting public
    /// read access on its objects.
    ///
    /// Safe to call on every startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be checked or created.
    pub async fn new(store: Arc<dyn ObjectStore>) -> Result<Self, StorageError> {
        let uploader = Self { store };
        uploader.ensure_container().await?;
        Ok(uploader)
    }

    /// Create the container if it does not exist yet, then (re)apply public
    /// read access.
    ///
    /// A store without bucket policies only logs a warning: public access
    /// then has to be configured on the store itself. For a container that
    /// already existed, any policy failure is a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be checked or created, or if
    /// a freshly created container cannot be made public.
    pub async fn ensure_container(&self) -> Result<(), StorageError> {
        let container = self.store.container();
        let created = if self.store.container_exists().await? {
            debug!(container = %container, "Storage container exists");
            false
        } else {
            info!(container = %container, "Creating public storage container");
            self.store.create_container().await?;
            true
        };

        match self.store.grant_public_read().await {
            Ok(()) => debug!(container = %container, "Public read access granted"),
            Err(StorageError::Unsupported(detail)) => warn!(
                container = %container,
                "Store has no bucket policies, public read must be configured on the store: {detail}"
            ),
            Err(e) if !created => {
                warn!(container = %container, "Could not refresh public read access: {e}");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Name of the target container.
    #[must_use]
    pub fn container(&self) -> String {
        self.store.container()
    }

    /// Upload `path` under `blob_name`, overwriting any existing object.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the write fails or
    /// `cancellation_token` fires first.
    pub async fn upload(
        &self,
        path: &Path,
        blob_name: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<UploadedAsset, StorageError> {
        debug!(path = %path.display(), blob_name = %blob_name, "Uploading file");

        cancellation_token
            .run_until_cancelled(self.store.put_file(path, blob_name))
            .await
            .ok_or(StorageError::Cancelled)??;

        Ok(UploadedAsset {
            blob_name: blob_name.to_string(),
            public_url: self.store.public_url(blob_name),
        })
    }
}
