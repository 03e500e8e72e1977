//! S3 object store backend

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;

use super::{ObjectStore, StoreError, StoredObject, WritePrecondition};

/// Object store over a single well-known bucket
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(config: &aws_config::SdkConfig, bucket: impl Into<String>) -> Self {
        Self {
            client: S3Client::new(config),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_no_such_key())
                {
                    return Ok(None);
                }
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("failed to get object '{}'", key));
            }
        };

        let etag = response.e_tag().unwrap_or_default().to_string();
        let body = response
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read body of '{}'", key))?;

        Ok(Some(StoredObject {
            body: body.into_bytes().to_vec(),
            etag,
        }))
    }

    async fn put(
        &self,
        key: &str,
        body: &[u8],
        precondition: WritePrecondition,
    ) -> Result<String, StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body.to_vec().into());

        match precondition {
            WritePrecondition::None => {}
            WritePrecondition::IfAbsent => {
                request = request.if_none_match("*");
            }
            WritePrecondition::IfMatch(etag) => {
                request = request.if_match(etag);
            }
        }

        match request.send().await {
            Ok(out) => Ok(out.e_tag().unwrap_or_default().to_string()),
            Err(err) => {
                // 412: precondition failed; 409: concurrent conditional write
                let status = err.raw_response().map(|r| r.status().as_u16());
                if matches!(status, Some(412) | Some(409)) {
                    return Err(StoreError::PreconditionFailed {
                        key: key.to_string(),
                    });
                }
                Err(StoreError::Other(
                    anyhow::Error::new(err)
                        .context(format!("failed to put object '{}'", key)),
                ))
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to delete object '{}'", key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(anyhow::Error::new)
                .with_context(|| format!("failed to list prefix '{}'", prefix))?;

            if let Some(contents) = response.contents {
                keys.extend(contents.into_iter().filter_map(|o| o.key));
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }
}
