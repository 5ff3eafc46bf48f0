//! S3-compatible storage backend using AWS SDK.
//!
//! Also serves Google Cloud Storage through its S3-interoperable XML API.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, ListedObject, ObjectMeta, ObjectStream, StorageBackend, StreamingUpload,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use futures::StreamExt;
use larder_core::CacheUri;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Minimum part size for S3 multipart uploads (5 MiB).
/// S3 requires all parts except the last to be at least 5 MB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Maximum buffer size before spilling to temp file (64 MiB).
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Endpoint of the Google Cloud Storage XML API.
pub const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Marker included in lazy-credentials errors so they can be reported as
/// configuration problems instead of transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "larder-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "larder-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// This avoids constructor-time side effects (notably TLS/native-root initialization)
/// in environments where no root certificates are available.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

/// Classify an SDK error as configuration, transient, or permanent.
fn map_s3_operation_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure credentials explicitly or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            status >= 500 || status == 429 || status == 408
        }
        _ => false,
    };
    if transient {
        StorageError::Unavailable(format!("{err:?}"))
    } else {
        StorageError::S3(Box::new(err))
    }
}

/// Connection settings for an S3-compatible bucket.
#[derive(Clone, Debug, Default)]
pub struct S3Options {
    pub bucket: String,
    /// Key prefix inside the bucket.
    pub prefix: Option<String>,
    pub region: Option<String>,
    /// Custom endpoint (MinIO, GCS interop, ...). Bare `host:port` means http.
    pub endpoint: Option<String>,
    /// Use `endpoint/bucket/key` URLs instead of `bucket.endpoint/key`.
    pub force_path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl S3Options {
    /// Build options from an `s3://bucket/prefix?region=..&endpoint=..` URI.
    pub fn from_uri(uri: &CacheUri) -> StorageResult<Self> {
        if uri.authority().is_empty() {
            return Err(StorageError::Config(format!("missing bucket in {uri}")));
        }
        Ok(Self {
            bucket: uri.authority().to_string(),
            prefix: uri.prefix().map(str::to_string),
            region: uri.param("region").map(str::to_string),
            endpoint: uri.param("endpoint").map(str::to_string),
            force_path_style: uri.bool_param("force_path_style")?.unwrap_or(false),
            access_key_id: None,
            secret_access_key: None,
        })
    }

    /// Build options for a `gs://bucket/prefix` URI.
    ///
    /// Requests go to the GCS XML API, which requires HMAC keys as credentials.
    pub fn from_gcs_uri(uri: &CacheUri) -> StorageResult<Self> {
        let mut options = Self::from_uri(uri)?;
        options.endpoint = Some(
            options
                .endpoint
                .take()
                .unwrap_or_else(|| GCS_ENDPOINT.to_string()),
        );
        options.region = Some(options.region.take().unwrap_or_else(|| "auto".to_string()));
        options.force_path_style = true;
        Ok(options)
    }

    /// Attach explicit credentials.
    pub fn with_credentials(
        mut self,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    ) -> Self {
        self.access_key_id = access_key_id;
        self.secret_access_key = secret_access_key;
        self
    }
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
    region: String,
    name: &'static str,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    pub async fn new(options: S3Options) -> StorageResult<Self> {
        Self::with_name(options, "s3").await
    }

    /// Create a backend reporting `name` in logs and metrics.
    pub async fn with_name(options: S3Options, name: &'static str) -> StorageResult<Self> {
        let S3Options {
            bucket,
            prefix,
            region,
            endpoint,
            force_path_style,
            access_key_id,
            secret_access_key,
        } = options;

        if bucket.is_empty() {
            return Err(StorageError::Config("s3 bucket must not be empty".to_string()));
        }
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "larder-config");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region.clone()));
        }

        let normalized_endpoint = endpoint.map(|endpoint_url| {
            let endpoint_lower = endpoint_url.to_lowercase();
            if endpoint_lower.starts_with("http://") || endpoint_lower.starts_with("https://") {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);

            // Plain-http endpoints (local MinIO) get an HTTP-only client so
            // startup does not depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        let stored_endpoint = match &normalized_endpoint {
            Some(url) => url.clone(),
            None => format!("s3.{resolved_region}.amazonaws.com"),
        };

        let normalized_prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client,
            bucket,
            prefix: normalized_prefix,
            endpoint: stored_endpoint,
            region: resolved_region,
            name,
        })
    }

    /// Bucket this backend writes to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Endpoint requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from a full object key.
    fn strip_prefix(prefix: Option<&str>, full_key: &str) -> String {
        match prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full_key)
                .to_string(),
            None => full_key.to_string(),
        }
    }

    /// Convert an AWS SDK error to StorageError, mapping 404 to NotFound.
    fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let SdkError::ServiceError(ref service_err) = err
            && service_err.raw().status().as_u16() == 404
        {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }
}

fn to_offset_date_time(dt: &aws_sdk_s3::primitives::DateTime) -> Option<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.secs()).ok()
}

#[async_trait]
impl StorageBackend for S3Backend {
    #[instrument(skip(self), fields(backend = self.name))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified: output.last_modified().and_then(to_offset_date_time),
        })
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
            .into_bytes();

        Ok(bytes)
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn get_stream(&self, key: &str, offset: u64) -> StorageResult<ByteStream> {
        let mut request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key));
        if offset > 0 {
            request = request.range(format!("bytes={offset}-"));
        }
        let output = request
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        // Stream the body instead of collecting it; dropping the stream
        // closes the connection.
        let reader_stream = ReaderStream::new(output.body.into_async_read());
        let stream = reader_stream.map(|result| result.map_err(StorageError::Io));

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = self.name, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let full_key = self.full_key(key);

        let create_output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let upload_id = create_output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        Ok(Box::new(S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: full_key,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            bytes_written: 0,
            buffer: Vec::with_capacity(MIN_PART_SIZE),
            spill_file: None,
            spill_bytes: 0,
            spill_read_pos: 0,
            completed: false,
        }))
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // delete_object succeeds on missing keys, so check first to report NotFound.
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn list_stream(&self, prefix: &str) -> StorageResult<ObjectStream> {
        let full_prefix = self.full_key(prefix);
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let prefix_to_strip = self.prefix.clone();

        let stream = async_stream::try_stream! {
            let mut continuation_token: Option<String> = None;

            loop {
                let mut request = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&full_prefix);

                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }

                let output = request
                    .send()
                    .await
                    .map_err(map_s3_operation_error)?;

                for obj in output.contents() {
                    if let Some(obj_key) = obj.key() {
                        yield ListedObject {
                            key: S3Backend::strip_prefix(prefix_to_strip.as_deref(), obj_key),
                            meta: ObjectMeta {
                                size: obj.size().unwrap_or(0).max(0) as u64,
                                last_modified: obj.last_modified().and_then(to_offset_date_time),
                            },
                        };
                    }
                }

                if output.is_truncated() == Some(true) {
                    continuation_token = output.next_continuation_token().map(|s| s.to_string());
                } else {
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        self.name
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn health_check(&self) -> StorageResult<()> {
        let marker_key = self.full_key(".larder-health-check");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&marker_key)
            .body(Bytes::from_static(b"health-check").into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&marker_key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(ref se)) if se.raw().status().as_u16() == 404 => Ok(()),
            Err(e) => Err(map_s3_operation_error(e)),
        }
    }
}

/// Streaming upload for S3 backend using multipart upload.
///
/// Buffers incoming data to meet S3's 5 MB minimum part size requirement.
/// If the buffer exceeds 64 MiB, data spills to a temporary file to bound memory usage.
struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<aws_sdk_s3::types::CompletedPart>,
    part_number: i32,
    bytes_written: u64,
    buffer: Vec<u8>,
    spill_file: Option<tokio::fs::File>,
    spill_bytes: usize,
    /// Position of next byte to read from spill file.
    spill_read_pos: usize,
    /// Set once the multipart upload is completed or aborted.
    completed: bool,
}

impl S3Upload {
    /// Upload a single part to S3 and track it.
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let upload_output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(self.part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let completed_part = aws_sdk_s3::types::CompletedPart::builder()
            .e_tag(upload_output.e_tag().unwrap_or_default())
            .part_number(self.part_number)
            .build();

        self.parts.push(completed_part);
        self.part_number += 1;

        Ok(())
    }

    async fn abort_multipart(&self) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }
}

#[async_trait]
impl StreamingUpload for S3Upload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

        self.bytes_written += data.len() as u64;

        if let Some(ref mut file) = self.spill_file {
            file.write_all(&data).await?;
            self.spill_bytes += data.len();
        } else {
            self.buffer.extend_from_slice(&data);

            if self.buffer.len() > MAX_BUFFER_SIZE {
                let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
                file.write_all(&self.buffer).await?;
                self.spill_bytes = self.buffer.len();
                self.buffer.clear();
                self.buffer.shrink_to_fit();
                self.spill_file = Some(file);
                tracing::debug!(
                    key = %self.key,
                    spill_bytes = self.spill_bytes,
                    "S3 upload spilled to temp file due to buffer overflow"
                );
            }
        }

        // Upload full parts from the spill file, tracking the read position
        // rather than rewriting the file.
        while self.spill_bytes - self.spill_read_pos >= MIN_PART_SIZE {
            let Some(file) = self.spill_file.as_mut() else {
                break;
            };
            file.seek(std::io::SeekFrom::Start(self.spill_read_pos as u64))
                .await?;
            let mut part_data = vec![0u8; MIN_PART_SIZE];
            file.read_exact(&mut part_data).await?;
            // Later writes append, so move back to the end.
            file.seek(std::io::SeekFrom::End(0)).await?;
            self.spill_read_pos += MIN_PART_SIZE;
            self.upload_part(Bytes::from(part_data)).await?;
        }

        while self.buffer.len() >= MIN_PART_SIZE && self.spill_file.is_none() {
            let part_data: Vec<u8> = self.buffer.drain(..MIN_PART_SIZE).collect();
            self.upload_part(Bytes::from(part_data)).await?;
        }

        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        // The last part may be any size, including < 5 MB.
        let mut final_data = Vec::new();

        if let Some(mut file) = self.spill_file.take() {
            let remaining = self.spill_bytes - self.spill_read_pos;
            if remaining > 0 {
                file.seek(std::io::SeekFrom::Start(self.spill_read_pos as u64))
                    .await?;
                final_data.reserve(remaining);
                file.take(remaining as u64)
                    .read_to_end(&mut final_data)
                    .await?;
            }
        }

        final_data.extend_from_slice(&self.buffer);
        self.buffer.clear();

        if !final_data.is_empty() {
            self.upload_part(Bytes::from(final_data)).await?;
        }

        // Multipart uploads need at least one non-empty part; fall back to a
        // plain PutObject for empty objects.
        if self.parts.is_empty() {
            if let Err(e) = self.abort_multipart().await {
                tracing::warn!(
                    key = %self.key,
                    upload_id = %self.upload_id,
                    error = %e,
                    "Failed to abort multipart upload for zero-byte object"
                );
            }
            self.completed = true;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            return Ok(self.bytes_written);
        }

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        self.completed = true;

        Ok(self.bytes_written)
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.completed = true;
        self.abort_multipart().await
    }
}

impl Drop for S3Upload {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // Uploaded parts are billed until aborted, so schedule the abort on
        // the runtime the upload was created on.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                "Dropped multipart upload outside a runtime, parts left for bucket lifecycle rules"
            );
            return;
        };
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        let upload_id = self.upload_id.clone();
        handle.spawn(async move {
            if let Err(e) = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::warn!(
                    key = %key,
                    upload_id = %upload_id,
                    error = %e,
                    "Failed to abort dropped multipart upload"
                );
            }
        });
    }
}
