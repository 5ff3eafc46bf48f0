//! Action Cache semantics.
//!
//! Entries are validated lazily: an entry is only served while every blob it
//! references is still present in the CAS.

use super::{CacheEx, require_digest};
use crate::error::{CacheError, CacheResult};
use crate::metrics::{AC_HITS, AC_MISSES, AC_STALE, AC_UPDATES, CAS_BYTES_READ};
use crate::proto::reapi::{self, ActionResult};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use larder_core::Digest;
use larder_storage::{BlobStore, StorageError};
use prost::Message;
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

/// Which referenced blobs a client wants inlined into the result.
#[derive(Clone, Debug, Default)]
pub struct InlineOptions {
    pub stdout: bool,
    pub stderr: bool,
    pub output_files: HashSet<String>,
}

impl InlineOptions {
    fn any(&self) -> bool {
        self.stdout || self.stderr || !self.output_files.is_empty()
    }
}

impl From<&reapi::GetActionResultRequest> for InlineOptions {
    fn from(request: &reapi::GetActionResultRequest) -> Self {
        Self {
            stdout: request.inline_stdout,
            stderr: request.inline_stderr,
            output_files: request.inline_output_files.iter().cloned().collect(),
        }
    }
}

impl CacheEx {
    /// Look up an action result.
    ///
    /// Missing, undecodable and stale entries are all reported as NotFound.
    #[instrument(skip_all, fields(action = %action))]
    pub async fn get_action_result(
        &self,
        action: &Digest,
        inline: &InlineOptions,
    ) -> CacheResult<ActionResult> {
        let entry = match self.backend.get_action_entry(action).await {
            Ok(entry) => entry,
            Err(StorageError::NotFound(_)) => {
                AC_MISSES.inc();
                return Err(CacheError::NotFound(format!("action {action}")));
            }
            Err(e) => return Err(e.into()),
        };

        let mut result = match ActionResult::decode(entry) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Undecodable Action Cache entry, treating as missing");
                AC_STALE.inc();
                return Err(CacheError::NotFound(format!("action {action}")));
            }
        };

        let referenced = match referenced_digests(&result) {
            Ok(referenced) => referenced,
            Err(e) => {
                warn!(error = %e, "Action Cache entry references a malformed digest");
                AC_STALE.inc();
                return Err(CacheError::NotFound(format!("action {action}")));
            }
        };

        if !self.all_present(referenced).await? {
            debug!("Action Cache entry references missing blobs");
            AC_STALE.inc();
            return Err(CacheError::NotFound(format!(
                "action {action} references missing outputs"
            )));
        }

        if inline.any() {
            self.inline_outputs(&mut result, inline).await?;
        }

        AC_HITS.inc();
        Ok(result)
    }

    /// Store or overwrite an action result. Last writer wins.
    #[instrument(skip_all, fields(action = %action))]
    pub async fn update_action_result(
        &self,
        action: &Digest,
        result: ActionResult,
    ) -> CacheResult<ActionResult> {
        if !self.limits.ac_update_enabled {
            return Err(CacheError::PermissionDenied(
                "Action Cache updates are disabled".to_string(),
            ));
        }
        let entry = Bytes::from(result.encode_to_vec());
        self.backend.put_action_entry(action, entry).await?;
        AC_UPDATES.inc();
        Ok(result)
    }

    /// Check existence of every digest, with bounded concurrency.
    async fn all_present(&self, digests: Vec<Digest>) -> CacheResult<bool> {
        let backend = self.backend.clone();
        let missing = futures::stream::iter(digests)
            .map(|digest| {
                let backend = backend.clone();
                async move { backend.blob_exists(&digest).await }
            })
            .buffer_unordered(self.limits.existence_check_concurrency)
            .try_filter(|present| futures::future::ready(!present))
            .boxed()
            .try_next()
            .await?;
        Ok(missing.is_none())
    }

    /// Inline requested outputs while the batch budget allows.
    async fn inline_outputs(
        &self,
        result: &mut ActionResult,
        inline: &InlineOptions,
    ) -> CacheResult<()> {
        let mut budget = self.limits.max_batch_total_size;

        if inline.stdout
            && result.stdout_raw.is_empty()
            && let Some(digest) = inlinable(result.stdout_digest.as_ref(), budget)
        {
            result.stdout_raw = self.read_for_inline(&digest).await?;
            budget -= digest.size_bytes();
        }

        if inline.stderr
            && result.stderr_raw.is_empty()
            && let Some(digest) = inlinable(result.stderr_digest.as_ref(), budget)
        {
            result.stderr_raw = self.read_for_inline(&digest).await?;
            budget -= digest.size_bytes();
        }

        for file in &mut result.output_files {
            if !inline.output_files.contains(&file.path) || !file.contents.is_empty() {
                continue;
            }
            if let Some(digest) = inlinable(file.digest.as_ref(), budget) {
                file.contents = self.read_for_inline(&digest).await?;
                budget -= digest.size_bytes();
            }
        }
        Ok(())
    }

    async fn read_for_inline(&self, digest: &Digest) -> CacheResult<Bytes> {
        match self.backend.read_blob(digest).await {
            Ok(data) => {
                CAS_BYTES_READ.inc_by(data.len() as u64);
                Ok(data)
            }
            Err(StorageError::NotFound(_)) => {
                // Removed after validation; the entry is stale now.
                AC_STALE.inc();
                Err(CacheError::NotFound(format!("output blob {digest} vanished")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn inlinable(digest: Option<&reapi::Digest>, budget: u64) -> Option<Digest> {
    let digest = digest?.to_digest().ok()?;
    (digest.size_bytes() <= budget).then_some(digest)
}

/// Every CAS digest an action result depends on.
pub fn referenced_digests(result: &ActionResult) -> CacheResult<Vec<Digest>> {
    let mut digests = Vec::new();
    for file in &result.output_files {
        digests.push(require_digest(file.digest.as_ref(), "output_files.digest")?);
    }
    for dir in &result.output_directories {
        digests.push(require_digest(
            dir.tree_digest.as_ref(),
            "output_directories.tree_digest",
        )?);
        if dir.root_directory_digest.is_some() {
            digests.push(require_digest(
                dir.root_directory_digest.as_ref(),
                "output_directories.root_directory_digest",
            )?);
        }
    }
    if result.stdout_digest.is_some() {
        digests.push(require_digest(result.stdout_digest.as_ref(), "stdout_digest")?);
    }
    if result.stderr_digest.is_some() {
        digests.push(require_digest(result.stderr_digest.as_ref(), "stderr_digest")?);
    }
    digests.retain(|d| !d.is_empty());
    Ok(digests)
}
