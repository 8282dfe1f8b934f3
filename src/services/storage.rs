use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::time::Duration;

/// Object storage as used by the pipeline and the upload route.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `data` at `path`. With `overwrite == false` an existing object is left untouched
    /// and [`StorageError::AlreadyExists`] is returned.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: &[u8],
        content_type: &str,
        overwrite: bool,
    ) -> Result<(), StorageError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    region: Region,
    credentials: Credentials,
    public_base_url: String,
}

impl R2Client {
    pub fn new(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(bucket.with_path_style())
    }
}

#[async_trait]
impl ObjectStore for R2Client {
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket(bucket)?.get_object(path).await?;
        match response.status_code() {
            200 => Ok(response.to_vec()),
            404 => Err(StorageError::NotFound(format!("{bucket}/{path}"))),
            code => Err(StorageError::Status { code, path: format!("{bucket}/{path}") }),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: &[u8],
        content_type: &str,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        let handle = self.bucket(bucket)?;

        if !overwrite {
            let (_, code) = handle.head_object(path).await?;
            if code == 200 {
                return Err(StorageError::AlreadyExists(format!("{bucket}/{path}")));
            }
        }

        let response = handle
            .put_object_with_content_type(path, data, content_type)
            .await?;
        match response.status_code() {
            200 => Ok(()),
            code => Err(StorageError::Status { code, path: format!("{bucket}/{path}") }),
        }
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/{}/{}", self.public_base_url, bucket, path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage returned HTTP {code} for {path}")]
    Status { code: u16, path: String },

    #[error("Storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
