// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{ops::Range, sync::Arc};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    hash::{self, HashContext},
    update::prefs::{
        self, KEY_MANIFEST_METADATA_SIZE, KEY_RESUMED_UPDATE_FAILURES,
        KEY_UPDATE_CHECK_RESPONSE_HASH, KEY_UPDATE_STATE_NEXT_DATA_LENGTH,
        KEY_UPDATE_STATE_NEXT_DATA_OFFSET, KEY_UPDATE_STATE_NEXT_OPERATION,
        KEY_UPDATE_STATE_SHA_256_CONTEXT, KEY_UPDATE_STATE_SIGNATURE_BLOB,
        KEY_UPDATE_STATE_SIGNED_SHA_256_CONTEXT, Prefs, PrefsExt,
    },
};

/// Marker stored in place of the next operation index when the persisted
/// state must not be resumed from.
pub const UPDATE_STATE_OPERATION_INVALID: i64 = -1;

/// Resuming is abandoned after this many failed resume attempts.
pub const MAX_RESUMED_UPDATE_FAILURES: i64 = 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing resume state field: {0}")]
    MissingField(&'static str),
    #[error("Invalid resume state field: {key} = {value}")]
    InvalidField { key: &'static str, value: i64 },
    #[error("Failed to restore {0}")]
    HashContext(&'static str, #[source] hash::Error),
    #[error("Checkpoint store error")]
    Prefs(#[from] prefs::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Check whether an interrupted update can be continued. `response_hash`
/// identifies the update currently being offered and must match the one
/// recorded when the interrupted update started.
pub fn can_resume(prefs: &dyn Prefs, response_hash: &str) -> bool {
    match check_resumable(prefs, response_hash) {
        Ok(()) => true,
        Err(reason) => {
            debug!("Cannot resume update: {reason}");
            false
        }
    }
}

fn check_resumable(prefs: &dyn Prefs, response_hash: &str) -> std::result::Result<(), String> {
    let get_i64 = |key| prefs.get_i64(key).map_err(|e| e.to_string());

    match get_i64(KEY_UPDATE_STATE_NEXT_OPERATION)? {
        Some(n) if n != UPDATE_STATE_OPERATION_INVALID && n > 0 => {}
        n => return Err(format!("next operation is {n:?}")),
    }

    let interrupted_hash = prefs
        .get_string(KEY_UPDATE_CHECK_RESPONSE_HASH)
        .map_err(|e| e.to_string())?
        .unwrap_or_default();
    if interrupted_hash.is_empty() || interrupted_hash != response_hash {
        return Err(format!(
            "response hash {interrupted_hash:?} does not match {response_hash:?}",
        ));
    }

    if let Some(failures) = get_i64(KEY_RESUMED_UPDATE_FAILURES)?
        && failures > MAX_RESUMED_UPDATE_FAILURES
    {
        return Err(format!("too many resume failures ({failures})"));
    }

    match get_i64(KEY_UPDATE_STATE_NEXT_DATA_OFFSET)? {
        Some(n) if n >= 0 => {}
        n => return Err(format!("next data offset is {n:?}")),
    }

    let context = prefs
        .get(KEY_UPDATE_STATE_SHA_256_CONTEXT)
        .map_err(|e| e.to_string())?;
    if context.is_none_or(|c| c.is_empty()) {
        return Err("hash context is empty".to_owned());
    }

    match get_i64(KEY_MANIFEST_METADATA_SIZE)? {
        Some(n) if n > 0 => {}
        n => return Err(format!("metadata size is {n:?}")),
    }

    Ok(())
}

/// Invalidate the persisted progress. A quick reset only invalidates the
/// next operation index, which is enough to prevent resuming. A full reset
/// clears all fields.
pub fn reset_update_progress(prefs: &dyn Prefs, quick: bool) -> Result<()> {
    prefs.set_i64(KEY_UPDATE_STATE_NEXT_OPERATION, UPDATE_STATE_OPERATION_INVALID)?;

    if !quick {
        prefs.set_string(KEY_UPDATE_CHECK_RESPONSE_HASH, "")?;
        prefs.set_i64(KEY_UPDATE_STATE_NEXT_DATA_OFFSET, -1)?;
        prefs.set_i64(KEY_UPDATE_STATE_NEXT_DATA_LENGTH, 0)?;
        prefs.set(KEY_UPDATE_STATE_SHA_256_CONTEXT, b"")?;
        prefs.set(KEY_UPDATE_STATE_SIGNED_SHA_256_CONTEXT, b"")?;
        prefs.set(KEY_UPDATE_STATE_SIGNATURE_BLOB, b"")?;
        prefs.set_i64(KEY_MANIFEST_METADATA_SIZE, -1)?;
        prefs.set_i64(KEY_RESUMED_UPDATE_FAILURES, 0)?;
    }

    Ok(())
}

/// State restored from a checkpoint when resuming an interrupted update.
#[derive(Clone, Debug)]
pub struct ResumeState {
    pub next_operation: u64,
    /// Offset of the next unconsumed byte, relative to the end of the
    /// metadata.
    pub buffer_offset: u64,
    pub hash_context: HashContext,
    /// Only present if the interrupted update reached the signature.
    pub signed_hash_context: Option<HashContext>,
    /// Only present if the interrupted update reached the signature.
    pub signature_blob: Option<Vec<u8>>,
    pub metadata_size: u64,
}

/// Reads and writes the progress fields for a single update attempt.
pub struct CheckpointStore {
    prefs: Arc<dyn Prefs>,
    /// Buffer offset at the last checkpoint that wrote the data fields.
    last_buffer_offset: Option<u64>,
}

impl CheckpointStore {
    pub fn new(prefs: Arc<dyn Prefs>) -> Self {
        Self {
            prefs,
            last_buffer_offset: None,
        }
    }

    pub fn prefs(&self) -> &dyn Prefs {
        &*self.prefs
    }

    /// Invalidate the persisted progress. The next checkpoint rewrites all
    /// fields.
    pub fn reset(&mut self, quick: bool) -> Result<()> {
        self.last_buffer_offset = None;
        reset_update_progress(&*self.prefs, quick)
    }

    /// Record that operations before `next_operation` have been applied.
    /// The data fields are only rewritten when the buffer offset moved, and
    /// the next operation index is always written last so that an
    /// interruption in between leaves the state unresumable.
    pub fn checkpoint(
        &mut self,
        next_operation: u64,
        buffer_offset: u64,
        hash_context: &HashContext,
        next_data_length: u64,
    ) -> Result<()> {
        if self.last_buffer_offset != Some(buffer_offset) {
            self.reset(true)?;
            self.prefs
                .set(KEY_UPDATE_STATE_SHA_256_CONTEXT, &hash_context.to_bytes())?;
            self.prefs
                .set_i64(KEY_UPDATE_STATE_NEXT_DATA_OFFSET, to_i64(buffer_offset))?;
            self.last_buffer_offset = Some(buffer_offset);

            self.prefs
                .set_i64(KEY_UPDATE_STATE_NEXT_DATA_LENGTH, to_i64(next_data_length))?;
        }

        self.prefs
            .set_i64(KEY_UPDATE_STATE_NEXT_OPERATION, to_i64(next_operation))?;

        Ok(())
    }

    pub fn save_metadata_size(&self, metadata_size: u64) -> Result<()> {
        self.prefs
            .set_i64(KEY_MANIFEST_METADATA_SIZE, to_i64(metadata_size))?;
        Ok(())
    }

    /// Persist the signature blob and the hash of everything preceding it,
    /// since the blob is not seen again if the update is resumed later.
    pub fn save_signature(&self, blob: &[u8], signed_hash_context: &HashContext) -> Result<()> {
        self.prefs.set(KEY_UPDATE_STATE_SIGNATURE_BLOB, blob)?;
        self.prefs.set(
            KEY_UPDATE_STATE_SIGNED_SHA_256_CONTEXT,
            &signed_hash_context.to_bytes(),
        )?;
        Ok(())
    }

    /// Load the state of an interrupted update. Returns [`None`] if there is
    /// no resumable progress and the update is starting from scratch. Each
    /// successful load counts as a resume failure until the update finishes.
    pub fn load_resume_state(&mut self) -> Result<Option<ResumeState>> {
        let next_operation = match self.prefs.get_i64(KEY_UPDATE_STATE_NEXT_OPERATION)? {
            Some(n) if n != UPDATE_STATE_OPERATION_INVALID && n > 0 => n as u64,
            _ => return Ok(None),
        };

        let buffer_offset = self
            .get_non_negative(KEY_UPDATE_STATE_NEXT_DATA_OFFSET, "next data offset")?;

        let signed_hash_context = self
            .get_optional_bytes(KEY_UPDATE_STATE_SIGNED_SHA_256_CONTEXT)?
            .map(|c| HashContext::from_bytes(&c))
            .transpose()
            .map_err(|e| Error::HashContext("signed hash context", e))?;
        let signature_blob = self.get_optional_bytes(KEY_UPDATE_STATE_SIGNATURE_BLOB)?;

        let hash_context = self
            .get_optional_bytes(KEY_UPDATE_STATE_SHA_256_CONTEXT)?
            .ok_or(Error::MissingField("hash context"))?;
        let hash_context = HashContext::from_bytes(&hash_context)
            .map_err(|e| Error::HashContext("hash context", e))?;

        let metadata_size = self.get_non_negative(KEY_MANIFEST_METADATA_SIZE, "metadata size")?;
        if metadata_size == 0 {
            return Err(Error::InvalidField {
                key: KEY_MANIFEST_METADATA_SIZE,
                value: 0,
            });
        }

        let failures = self
            .prefs
            .get_i64(KEY_RESUMED_UPDATE_FAILURES)?
            .map_or(1, |n| n + 1);
        self.prefs.set_i64(KEY_RESUMED_UPDATE_FAILURES, failures)?;

        // The data fields on disk already match the restored offset.
        self.last_buffer_offset = Some(buffer_offset);

        Ok(Some(ResumeState {
            next_operation,
            buffer_offset,
            hash_context,
            signed_hash_context,
            signature_blob,
            metadata_size,
        }))
    }

    fn get_non_negative(&self, key: &'static str, name: &'static str) -> Result<u64> {
        match self.prefs.get_i64(key)? {
            Some(n) if n >= 0 => Ok(n as u64),
            Some(n) => Err(Error::InvalidField { key, value: n }),
            None => Err(Error::MissingField(name)),
        }
    }

    fn get_optional_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.prefs.get(key)?.filter(|v| !v.is_empty()))
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or_else(|_| {
        warn!("Value {value} does not fit in checkpoint field");
        i64::MAX
    })
}

/// Byte ranges of the payload that must be streamed to resume an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumePoint {
    pub metadata_size: u64,
    /// Offset of the next unconsumed byte, relative to the end of the
    /// metadata.
    pub data_offset: u64,
}

impl ResumePoint {
    /// Read the resume point from a store that passed [`can_resume()`].
    pub fn from_prefs(prefs: &dyn Prefs) -> Result<Self> {
        let metadata_size = prefs
            .get_i64(KEY_MANIFEST_METADATA_SIZE)?
            .filter(|n| *n > 0)
            .ok_or(Error::MissingField("metadata size"))?;
        let data_offset = prefs
            .get_i64(KEY_UPDATE_STATE_NEXT_DATA_OFFSET)?
            .filter(|n| *n >= 0)
            .ok_or(Error::MissingField("next data offset"))?;

        Ok(Self {
            metadata_size: metadata_size as u64,
            data_offset: data_offset as u64,
        })
    }

    /// The metadata is always re-sent so the manifest can be parsed again.
    /// Everything before the resume offset in the blob section is skipped.
    pub fn ranges(&self, payload_size: u64) -> [Range<u64>; 2] {
        let resume_offset = self
            .metadata_size
            .saturating_add(self.data_offset)
            .min(payload_size);

        [0..self.metadata_size.min(payload_size), resume_offset..payload_size]
    }
}
