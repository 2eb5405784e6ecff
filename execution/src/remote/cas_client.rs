// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_oncecell::OnceCell;
use bytes::Bytes;
use futures::StreamExt;
use grpc_util::retry::{retry_call, status_is_retryable, RetryConfig};
use grpc_util::status_to_str;
use hashing::{Digest, HashFunction};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::bytestream::byte_stream_client::ByteStreamClient;
use remexec::capabilities_client::CapabilitiesClient;
use remexec::content_addressable_storage_client::ContentAddressableStorageClient;
use store::StorageConfig;
use tonic::transport::Channel;
use tonic::{Code, Request};

use crate::blob::ArtifactBlob;
use crate::remote::config::ExecutionConfiguration;

/// Per-entry overhead to assume when packing digests or blobs into a batch
/// request: field tags, the hex hash, sizes and the instance name amortized.
const BATCH_ENTRY_OVERHEAD: usize = 128;

/// Greedily pack items into batches so that no batch's weight exceeds
/// `max_total`. Items heavier than the limit are returned separately; they
/// must take the streaming path.
pub(crate) fn pack_by_size<T: Clone, F: Fn(&T) -> usize>(
    items: &[T],
    weight: F,
    max_total: usize,
) -> (Vec<Vec<T>>, Vec<T>) {
    let mut batches = vec![];
    let mut oversize = vec![];
    let mut current = vec![];
    let mut current_weight = 0_usize;

    for item in items {
        let item_weight = weight(item);
        if item_weight > max_total {
            oversize.push(item.clone());
        } else {
            if current_weight + item_weight > max_total && !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_weight = 0;
            }
            current_weight += item_weight;
            current.push(item.clone());
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    (batches, oversize)
}

/// Client of the remote CAS and ByteStream services: batched availability
/// queries, batched or streamed transfers in both directions, and the
/// split/splice extension.
#[derive(Clone)]
pub struct RemoteCasClient {
    instance_name: String,
    hash_function: HashFunction,
    retry: RetryConfig,
    config: ExecutionConfiguration,
    storage_config: Arc<StorageConfig>,
    cas: ContentAddressableStorageClient<Channel>,
    bytestream: ByteStreamClient<Channel>,
    capabilities: CapabilitiesClient<Channel>,
    capabilities_cell: Arc<OnceCell<remexec::ServerCapabilities>>,
}

impl RemoteCasClient {
    pub fn new(
        channel: Channel,
        instance_name: String,
        hash_function: HashFunction,
        retry: RetryConfig,
        config: ExecutionConfiguration,
        storage_config: Arc<StorageConfig>,
    ) -> RemoteCasClient {
        RemoteCasClient {
            instance_name,
            hash_function,
            retry,
            config,
            storage_config,
            cas: ContentAddressableStorageClient::new(channel.clone()),
            bytestream: ByteStreamClient::new(channel.clone()),
            capabilities: CapabilitiesClient::new(channel),
            capabilities_cell: Arc::new(OnceCell::new()),
        }
    }

    pub async fn capabilities(&self) -> Result<&remexec::ServerCapabilities, String> {
        self.capabilities_cell
            .get_or_try_init(async {
                let request = remexec::GetCapabilitiesRequest {
                    instance_name: self.instance_name.clone(),
                };
                let client = self.capabilities.clone();
                retry_call(
                    self.retry,
                    request,
                    move |request, _| {
                        let mut client = client.clone();
                        async move { client.get_capabilities(request).await }
                    },
                    status_is_retryable,
                )
                .await
                .map(|response| response.into_inner())
                .map_err(status_to_str)
            })
            .await
    }

    pub async fn blob_split_support(&self) -> bool {
        matches!(
            self.capabilities().await,
            Ok(caps) if caps.cache_capabilities.as_ref().is_some_and(|c| c.blob_split_support)
        )
    }

    pub async fn blob_splice_support(&self) -> bool {
        matches!(
            self.capabilities().await,
            Ok(caps) if caps.cache_capabilities.as_ref().is_some_and(|c| c.blob_splice_support)
        )
    }

    /// The effective per-batch content limit: the configured one, tightened
    /// by whatever the server advertises.
    pub async fn max_batch_total_bytes(&self) -> usize {
        let advertised = match self.capabilities().await {
            Ok(caps) => caps
                .cache_capabilities
                .as_ref()
                .map(|c| c.max_batch_total_size_bytes as usize)
                .unwrap_or(0),
            Err(_) => 0,
        };
        let configured = self
            .config
            .max_batch_transfer_bytes
            .min(self.config.max_grpc_message_bytes);
        if advertised == 0 {
            configured
        } else {
            configured.min(advertised)
        }
    }

    /// Batched FindMissingBlobs. A failed batch is defensively reported as
    /// entirely missing: over-uploading is always safe, skipping is not.
    pub async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, String> {
        // Restore full digests (with the tree flag) from the wire form.
        let by_hex: HashMap<String, Digest> = digests
            .iter()
            .map(|digest| (digest.hash.to_hex(), *digest))
            .collect();

        let (batches, oversize) = pack_by_size(
            digests,
            |_| BATCH_ENTRY_OVERHEAD,
            self.config.max_grpc_message_bytes,
        );
        debug_assert!(oversize.is_empty());

        let mut missing = vec![];
        for batch in batches {
            let request = remexec::FindMissingBlobsRequest {
                instance_name: self.instance_name.clone(),
                blob_digests: batch.iter().map(protos::digest_to_proto).collect(),
            };
            let client = self.cas.clone();
            let response = retry_call(
                self.retry,
                (client, request),
                move |(mut client, request), _| async move {
                    client.find_missing_blobs(request).await
                },
                status_is_retryable,
            )
            .await;

            match response {
                Ok(response) => {
                    for digest in response.into_inner().missing_blob_digests {
                        match by_hex.get(&digest.hash) {
                            Some(original) => missing.push(*original),
                            None => {
                                return Err(format!(
                                    "Server reported digest {} missing which was never queried",
                                    digest.hash
                                ))
                            }
                        }
                    }
                }
                Err(status) => {
                    log::warn!(
                        "FindMissingBlobs failed ({}); treating {} digests as missing",
                        status_to_str(status),
                        batch.len(),
                    );
                    missing.extend(batch);
                }
            }
        }
        Ok(missing)
    }

    /// Upload blobs, batching where the limits allow and streaming the rest.
    /// Returns the number of uploaded blobs.
    pub async fn batch_update(&self, blobs: Vec<ArtifactBlob>) -> Result<usize, String> {
        let max_batch = self.max_batch_total_bytes().await;
        let (batches, oversize) = pack_by_size(
            &blobs,
            |blob| blob.len() + BATCH_ENTRY_OVERHEAD,
            max_batch,
        );

        let mut uploaded = 0_usize;
        let mut pending: Vec<ArtifactBlob> = vec![];
        for batch in batches {
            let (ok, failed) = self.batch_update_once(batch).await?;
            uploaded += ok;
            pending.extend(failed);
        }

        // Retry whatever a batch response did not confirm; once a full pass
        // makes no progress, fall back to per-blob streaming.
        while !pending.is_empty() {
            let attempt: Vec<ArtifactBlob> = std::mem::take(&mut pending);
            let before = attempt.len();
            let (batches, _) = pack_by_size(
                &attempt,
                |blob| blob.len() + BATCH_ENTRY_OVERHEAD,
                max_batch,
            );
            for batch in batches {
                let (ok, failed) = self.batch_update_once(batch).await?;
                uploaded += ok;
                pending.extend(failed);
            }
            if pending.len() == before {
                log::debug!(
                    "Batch upload made no progress on {} blobs; falling back to streaming",
                    pending.len(),
                );
                break;
            }
        }

        for blob in pending.into_iter().chain(oversize) {
            self.write_blob_stream(&blob).await?;
            uploaded += 1;
        }
        Ok(uploaded)
    }

    /// One BatchUpdateBlobs round trip. Returns the number of confirmed
    /// uploads and the blobs that must be retried.
    async fn batch_update_once(
        &self,
        blobs: Vec<ArtifactBlob>,
    ) -> Result<(usize, Vec<ArtifactBlob>), String> {
        let mut requests = Vec::with_capacity(blobs.len());
        for blob in &blobs {
            requests.push(remexec::batch_update_blobs_request::Request {
                digest: Some(protos::digest_to_proto(blob.digest())),
                data: blob.bytes().await?,
                compressor: remexec::compressor::Value::Identity as i32,
            });
        }
        let request = remexec::BatchUpdateBlobsRequest {
            instance_name: self.instance_name.clone(),
            requests,
        };

        let client = self.cas.clone();
        let response = retry_call(
            self.retry,
            (client, request),
            move |(mut client, request), _| async move { client.batch_update_blobs(request).await },
            status_is_retryable,
        )
        .await
        .map_err(status_to_str)?;

        let mut confirmed: HashMap<String, bool> = HashMap::new();
        for entry in response.into_inner().responses {
            let ok = entry.status.map(|status| status.code == 0).unwrap_or(false);
            if let Some(digest) = entry.digest {
                confirmed.insert(digest.hash, ok);
            }
        }

        let mut uploaded = 0;
        let mut failed = vec![];
        for blob in blobs {
            match confirmed.get(&blob.digest().hash.to_hex()) {
                Some(true) => uploaded += 1,
                // Failed, or absent from the response: retry that subset.
                _ => failed.push(blob),
            }
        }
        Ok((uploaded, failed))
    }

    /// Download blobs, batching small ones and streaming the rest. Contents
    /// are digest-verified; blobs above the in-memory threshold are spooled
    /// into the controlled temp space.
    pub async fn batch_read(&self, digests: &[Digest]) -> Result<Vec<ArtifactBlob>, String> {
        let max_batch = self.max_batch_total_bytes().await;
        let (batches, oversize) = pack_by_size(
            digests,
            |digest| digest.size_bytes + BATCH_ENTRY_OVERHEAD,
            max_batch,
        );

        let mut blobs = vec![];
        for batch in batches {
            let request = remexec::BatchReadBlobsRequest {
                instance_name: self.instance_name.clone(),
                digests: batch.iter().map(protos::digest_to_proto).collect(),
                acceptable_compressors: vec![remexec::compressor::Value::Identity as i32],
            };
            let client = self.cas.clone();
            let response = retry_call(
                self.retry,
                (client, request),
                move |(mut client, request), _| async move {
                    client.batch_read_blobs(request).await
                },
                status_is_retryable,
            )
            .await
            .map_err(status_to_str)?;

            let mut by_hex: HashMap<String, Bytes> = HashMap::new();
            for entry in response.into_inner().responses {
                let ok = entry.status.map(|status| status.code == 0).unwrap_or(false);
                if let (true, Some(digest)) = (ok, entry.digest) {
                    by_hex.insert(digest.hash, entry.data);
                }
            }

            for digest in batch {
                match by_hex.remove(&digest.hash.to_hex()) {
                    Some(data) => {
                        let actual = if digest.is_tree {
                            self.hash_function.hash_tree_data(&data)
                        } else {
                            self.hash_function.hash_blob_data(&data)
                        };
                        if actual.hash != digest.hash {
                            return Err(format!(
                                "Remote CAS gave wrong digest: expected {}, got {}",
                                digest.hash, actual.hash
                            ));
                        }
                        blobs.push(self.wrap_content(digest, data)?);
                    }
                    // Missing from the batch response: stream it instead.
                    None => blobs.push(self.read_blob_stream(&digest).await?),
                }
            }
        }

        for digest in oversize {
            blobs.push(self.read_blob_stream(&digest).await?);
        }
        Ok(blobs)
    }

    pub async fn read_blob(&self, digest: &Digest) -> Result<ArtifactBlob, String> {
        let mut blobs = self.batch_read(std::slice::from_ref(digest)).await?;
        blobs
            .pop()
            .ok_or_else(|| format!("Blob {} not found remotely", digest.hash))
    }

    /// Upload one blob through the ByteStream interface.
    pub async fn write_blob_stream(&self, blob: &ArtifactBlob) -> Result<(), String> {
        let digest = *blob.digest();
        let len = digest.size_bytes;
        let resource_name = format!(
            "{}{}uploads/{}/blobs/{}/{}",
            &self.instance_name,
            if self.instance_name.is_empty() { "" } else { "/" },
            uuid::Uuid::new_v4(),
            digest.hash,
            len,
        );
        let chunk_size = self.config.stream_chunk_bytes;
        let blob = blob.clone();

        let client = self.bytestream.clone();
        let response = retry_call(
            self.retry,
            (blob, resource_name),
            move |(blob, resource_name), _| {
                let mut client = client.clone();
                async move {
                    let bytes = blob
                        .bytes()
                        .await
                        .map_err(tonic::Status::failed_precondition)?;
                    let stream = async_stream::stream! {
                        if bytes.is_empty() {
                            // An empty upload still needs one (finishing)
                            // write request.
                            yield protos::gen::google::bytestream::WriteRequest {
                                resource_name: resource_name.clone(),
                                write_offset: 0,
                                finish_write: true,
                                data: Bytes::new(),
                            };
                            return;
                        }
                        let mut offset = 0_usize;
                        while offset < bytes.len() {
                            let end = (offset + chunk_size).min(bytes.len());
                            yield protos::gen::google::bytestream::WriteRequest {
                                resource_name: resource_name.clone(),
                                write_offset: offset as i64,
                                finish_write: end == bytes.len(),
                                data: bytes.slice(offset..end),
                            };
                            offset = end;
                        }
                    };
                    client.write(Request::new(stream)).await
                }
            },
            status_is_retryable,
        )
        .await
        .map_err(status_to_str)?;

        let committed = response.into_inner().committed_size;
        if committed != len as i64 {
            return Err(format!(
                "Uploading blob {}: want committed size {len} but got {committed}",
                digest.hash
            ));
        }
        Ok(())
    }

    /// Download one blob through the ByteStream interface, verifying its
    /// digest.
    pub async fn read_blob_stream(&self, digest: &Digest) -> Result<ArtifactBlob, String> {
        let resource_name = format!(
            "{}{}blobs/{}/{}",
            &self.instance_name,
            if self.instance_name.is_empty() { "" } else { "/" },
            digest.hash,
            digest.size_bytes,
        );
        let request = protos::gen::google::bytestream::ReadRequest {
            resource_name,
            read_offset: 0,
            // 0 means no limit.
            read_limit: 0,
        };

        let client = self.bytestream.clone();
        let data = retry_call(
            self.retry,
            (client, request),
            move |(mut client, request), _| async move {
                let mut stream = client.read(request).await?.into_inner();
                let mut data = Vec::new();
                while let Some(response) = stream.next().await {
                    data.extend_from_slice(&response?.data);
                }
                Ok::<_, tonic::Status>(data)
            },
            status_is_retryable,
        )
        .await
        .map_err(|status| {
            if status.code() == Code::NotFound {
                format!("Blob {} not found remotely", digest.hash)
            } else {
                status_to_str(status)
            }
        })?;

        let actual = if digest.is_tree {
            self.hash_function.hash_tree_data(&data)
        } else {
            self.hash_function.hash_blob_data(&data)
        };
        if actual.hash != digest.hash {
            return Err(format!(
                "Remote CAS gave wrong digest: expected {}, got {}",
                digest.hash, actual.hash
            ));
        }
        self.wrap_content(*digest, Bytes::from(data))
    }

    /// Keep small downloads in memory; spool large ones into the controlled
    /// temp space.
    fn wrap_content(&self, digest: Digest, data: Bytes) -> Result<ArtifactBlob, String> {
        if data.len() <= self.config.in_memory_blob_limit_bytes {
            return Ok(ArtifactBlob::from_parts(digest, data, false));
        }
        let parent = self
            .storage_config
            .ephemeral_root()
            .join("tmp-workspaces")
            .join("remote-read");
        std::fs::create_dir_all(&parent)
            .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        let mut file = tempfile::Builder::new()
            .tempfile_in(&parent)
            .map_err(|e| format!("Failed to create temp file: {e}"))?;
        file.write_all(&data)
            .map_err(|e| format!("Failed to spool blob to disk: {e}"))?;
        // The file lives until the last clone of the blob is dropped.
        Ok(ArtifactBlob::from_temp_file(digest, file.into_temp_path(), false))
    }

    pub async fn split_blob(&self, digest: &Digest) -> Result<Vec<Digest>, String> {
        let request = remexec::SplitBlobRequest {
            instance_name: self.instance_name.clone(),
            blob_digest: Some(protos::digest_to_proto(digest)),
            chunking_algorithm: remexec::chunking_algorithm::Value::Fastcdc as i32,
        };
        let client = self.cas.clone();
        let response = retry_call(
            self.retry,
            (client, request),
            move |(mut client, request), _| async move { client.split_blob(request).await },
            status_is_retryable,
        )
        .await
        .map_err(status_to_str)?;

        response
            .into_inner()
            .chunk_digests
            .iter()
            .map(|chunk| protos::digest_from_proto(chunk, false, self.hash_function.hash_type()))
            .collect()
    }

    pub async fn splice_blob(
        &self,
        digest: &Digest,
        chunks: Vec<Digest>,
    ) -> Result<Digest, String> {
        let request = remexec::SpliceBlobRequest {
            instance_name: self.instance_name.clone(),
            blob_digest: Some(protos::digest_to_proto(digest)),
            chunk_digests: chunks.iter().map(protos::digest_to_proto).collect(),
        };
        let client = self.cas.clone();
        let response = retry_call(
            self.retry,
            (client, request),
            move |(mut client, request), _| async move { client.splice_blob(request).await },
            status_is_retryable,
        )
        .await
        .map_err(status_to_str)?;

        protos::require_digest(
            response.into_inner().blob_digest.as_ref(),
            digest.is_tree,
            self.hash_function.hash_type(),
        )
    }
}
