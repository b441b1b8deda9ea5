// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Streaming payload applier.
//!
//! The payload is fed in arbitrarily sized chunks through
//! [`PayloadApplier::write()`]. Once the header and manifest have been
//! received and validated, the install operations are applied strictly in
//! order, each as soon as its data blob is fully buffered. Progress is
//! checkpointed after every operation so that an interrupted update can be
//! resumed by a later process.

use std::{
    fs::{File, OpenOptions},
    io, mem,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    crypto,
    format::payload::{
        self, FULL_PAYLOAD_MINOR_VERSION, HEADER_SIZE, Partition, SUPPORTED_MINOR_VERSION,
    },
    hash::{self, HashContext},
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, InstallOperation, PartitionInfo, install_operation::Type,
    },
    update::{
        checkpoint::{self, CheckpointStore},
        operation,
        patch::{BspatchApplier, PatchApplier},
        plan::InstallPlan,
        prefs::Prefs,
        terminator::ExitBlocker,
    },
    util::{self, NumBytes},
};

/// Progress is logged every time it crosses one of this many chunks.
const PROGRESS_LOG_MAX_CHUNKS: u64 = 10;
/// Progress is logged at least this often, regardless of chunks.
const PROGRESS_LOG_TIMEOUT: Duration = Duration::from_secs(30);
/// Share of the overall progress given to downloaded bytes.
const PROGRESS_DOWNLOAD_WEIGHT: u64 = 50;
/// Share of the overall progress given to applied operations.
const PROGRESS_OPERATIONS_WEIGHT: u64 = 50;

/// Error categories reported to telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ParseError,
    MetadataSizeMismatch,
    MetadataSignatureError,
    ManifestValidationError,
    OperationHashMismatch,
    OperationExecutionError,
    SourcePartitionMismatch,
    PayloadSizeMismatch,
    PayloadHashMismatch,
    PubKeySignatureError,
    StateInitializationError,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse payload header")]
    Header(#[source] payload::Error),
    #[error("Failed to parse manifest")]
    ManifestParse(#[source] payload::Error),
    #[error("Metadata size is {actual}, but expected {expected}")]
    MetadataSizeMismatch { expected: u64, actual: u64 },
    #[error("Missing mandatory metadata signature")]
    MissingMetadataSignature,
    #[error("Failed to verify metadata signature")]
    MetadataSignature(#[source] crypto::Error),
    #[error("No public key at {0:?} or in install plan")]
    MissingPublicKey(PathBuf),
    #[error("Manifest has invalid block size: {0}")]
    InvalidBlockSize(u32),
    #[error("Full payload contains old partition info")]
    FullPayloadHasOldInfo,
    #[error("Manifest has minor version {actual}, but expected {expected}")]
    UnsupportedMinorVersion { expected: u32, actual: u32 },
    #[error("Missing mandatory hash for operation #{0}")]
    MissingOperationHash(u64),
    #[error("Operation #{index} has hash {actual}, but expected {expected}")]
    OperationHashMismatch {
        index: u64,
        expected: String,
        actual: String,
    },
    #[error("Invalid signature operation #{index}: {reason}")]
    InvalidSignatureOperation { index: u64, reason: &'static str },
    #[error("Failed to perform {op_type:?} operation #{index}")]
    Operation {
        index: u64,
        op_type: Option<Type>,
        #[source]
        source: operation::Error,
    },
    #[error("Current {partition} partition hash {actual} does not match payload source {expected}")]
    SourcePartitionMismatch {
        partition: Partition,
        expected: String,
        actual: String,
    },
    #[error("Payload size is {actual}, but expected {expected}")]
    PayloadSizeMismatch { expected: u64, actual: u64 },
    #[error("Payload hash is {actual}, but expected {expected}")]
    PayloadHashMismatch { expected: String, actual: String },
    #[error("Public key exists, but the payload has no signature")]
    MissingSignatureBlob,
    #[error("Payload signature was received without the hash it covers")]
    MissingSignedHash,
    #[error("Failed to load public key")]
    LoadPublicKey(#[source] crypto::Error),
    #[error("Failed to verify payload signature")]
    PayloadSignature(#[source] payload::Error),
    #[error("Failed to initialize update state")]
    StateInitialization(#[source] checkpoint::Error),
    #[error("Resume point #{next} is past the last operation #{total}")]
    ResumeOutOfRange { next: u64, total: u64 },
    #[error("Update cancelled: {0}")]
    Cancelled(String),
    #[error("Failed to open device: {0:?}")]
    DeviceOpen(PathBuf, #[source] io::Error),
    #[error("Failed to sync {0} device")]
    DeviceSync(Partition, #[source] io::Error),
    #[error("{0} device is closed")]
    DeviceClosed(Partition),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Header(_) | Self::ManifestParse(_) => ErrorKind::ParseError,
            Self::MetadataSizeMismatch { .. } => ErrorKind::MetadataSizeMismatch,
            Self::MissingMetadataSignature
            | Self::MetadataSignature(_)
            | Self::MissingPublicKey(_) => ErrorKind::MetadataSignatureError,
            Self::InvalidBlockSize(_)
            | Self::FullPayloadHasOldInfo
            | Self::UnsupportedMinorVersion { .. } => ErrorKind::ManifestValidationError,
            Self::MissingOperationHash(_) | Self::OperationHashMismatch { .. } => {
                ErrorKind::OperationHashMismatch
            }
            Self::InvalidSignatureOperation { .. }
            | Self::Operation { .. }
            | Self::DeviceOpen(_, _)
            | Self::DeviceSync(_, _)
            | Self::DeviceClosed(_) => ErrorKind::OperationExecutionError,
            Self::SourcePartitionMismatch { .. } => ErrorKind::SourcePartitionMismatch,
            Self::PayloadSizeMismatch { .. } => ErrorKind::PayloadSizeMismatch,
            Self::PayloadHashMismatch { .. } => ErrorKind::PayloadHashMismatch,
            Self::MissingSignatureBlob
            | Self::MissingSignedHash
            | Self::LoadPublicKey(_)
            | Self::PayloadSignature(_) => ErrorKind::PubKeySignatureError,
            Self::StateInitialization(_) | Self::ResumeOutOfRange { .. } => {
                ErrorKind::StateInitializationError
            }
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Outcome of a successful [`PayloadApplier::write()`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// Nothing could be applied yet. More data is needed.
    NeedMoreData,
    /// The manifest was parsed or at least one operation was applied, but
    /// operations remain.
    Progress,
    /// All operations have been applied.
    Done,
}

/// Receives verification failures that were ignored because hash checks are
/// not mandatory.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, kind: ErrorKind);
}

/// Reporter that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, kind: ErrorKind) {
        warn!("Ignored error: {kind:?}");
    }
}

/// Checked before every operation. Returns the reason if the update should
/// be cancelled.
pub trait CancelPredicate: Send + Sync {
    fn should_cancel(&self) -> Option<String>;
}

impl CancelPredicate for AtomicBool {
    fn should_cancel(&self) -> Option<String> {
        self.load(Ordering::SeqCst)
            .then(|| "Received cancel signal".to_owned())
    }
}

#[derive(Debug)]
struct Progress {
    total_bytes_received: u64,
    overall: u64,
    last_chunk: u64,
    next_forced_log: Instant,
}

impl Progress {
    fn new() -> Self {
        Self {
            total_bytes_received: 0,
            overall: 0,
            last_chunk: 0,
            next_forced_log: Instant::now() + PROGRESS_LOG_TIMEOUT,
        }
    }
}

pub struct PayloadApplier {
    plan: InstallPlan,
    rootfs: Option<File>,
    kernel: Option<File>,
    checkpoints: CheckpointStore,
    patcher: Arc<dyn PatchApplier>,
    cancel: Option<Arc<dyn CancelPredicate>>,
    reporter: Arc<dyn ErrorReporter>,
    exit_blocker: Arc<ExitBlocker>,

    /// Received bytes that have not been consumed yet.
    buffer: Vec<u8>,
    /// Offset of the first byte of `buffer`, relative to the end of the
    /// metadata.
    buffer_offset: u64,
    metadata_size: Option<u64>,
    /// Set once the manifest has been parsed and validated.
    manifest: Option<DeltaArchiveManifest>,
    block_size: u32,
    next_operation: u64,
    num_rootfs_operations: u64,
    num_total_operations: u64,
    /// Hash of every consumed byte, in order.
    hash: HashContext,
    /// Snapshot of `hash` right before the signature blob.
    signed_hash: Option<HashContext>,
    signature_blob: Option<Vec<u8>>,
    /// Set by [`Self::close()`].
    final_hash: Option<[u8; hash::DIGEST_SIZE]>,
    progress: Progress,
}

impl PayloadApplier {
    /// Create an applier that writes to already opened devices.
    pub fn new(plan: InstallPlan, rootfs: File, kernel: File, prefs: Arc<dyn Prefs>) -> Self {
        Self {
            plan,
            rootfs: Some(rootfs),
            kernel: Some(kernel),
            checkpoints: CheckpointStore::new(prefs),
            patcher: Arc::new(BspatchApplier::default()),
            cancel: None,
            reporter: Arc::new(LogReporter),
            exit_blocker: Arc::new(ExitBlocker::new()),
            buffer: vec![],
            buffer_offset: 0,
            metadata_size: None,
            manifest: None,
            block_size: 0,
            next_operation: 0,
            num_rootfs_operations: 0,
            num_total_operations: 0,
            hash: HashContext::new(),
            signed_hash: None,
            signature_blob: None,
            final_hash: None,
            progress: Progress::new(),
        }
    }

    /// Open the rootfs and kernel devices for reading and writing and create
    /// an applier for them. The devices must already exist.
    pub fn open(
        plan: InstallPlan,
        rootfs_path: &Path,
        kernel_path: &Path,
        prefs: Arc<dyn Prefs>,
    ) -> Result<Self> {
        let open = |path: &Path| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| Error::DeviceOpen(path.to_owned(), e))
        };

        let rootfs = open(rootfs_path)?;
        let kernel = open(kernel_path)?;

        Ok(Self::new(plan, rootfs, kernel, prefs))
    }

    pub fn with_patch_applier(mut self, patcher: Arc<dyn PatchApplier>) -> Self {
        self.patcher = patcher;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<dyn CancelPredicate>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_exit_blocker(mut self, exit_blocker: Arc<ExitBlocker>) -> Self {
        self.exit_blocker = exit_blocker;
        self
    }

    pub fn plan(&self) -> &InstallPlan {
        &self.plan
    }

    /// The manifest, once it has been received and validated.
    pub fn manifest(&self) -> Option<&DeltaArchiveManifest> {
        self.manifest.as_ref()
    }

    pub fn metadata_size(&self) -> Option<u64> {
        self.metadata_size
    }

    pub fn next_operation(&self) -> u64 {
        self.next_operation
    }

    pub fn num_total_operations(&self) -> u64 {
        self.num_total_operations
    }

    /// Size and hash of the new kernel and rootfs images, in that order.
    /// Only available once the manifest is valid and if it describes both.
    pub fn new_partition_info(&self) -> Option<(&PartitionInfo, &PartitionInfo)> {
        let manifest = self.manifest.as_ref()?;

        Some((
            manifest.new_kernel_info.as_ref()?,
            manifest.new_rootfs_info.as_ref()?,
        ))
    }

    /// Overall progress percentage.
    pub fn overall_progress(&self) -> u64 {
        self.progress.overall
    }

    /// Check whether an interrupted update can be continued. See
    /// [`checkpoint::can_resume()`].
    pub fn can_resume(prefs: &dyn Prefs, response_hash: &str) -> bool {
        checkpoint::can_resume(prefs, response_hash)
    }

    /// Reset the persisted progress. See [`checkpoint::reset_update_progress()`].
    pub fn reset_update_progress(
        prefs: &dyn Prefs,
        quick: bool,
    ) -> std::result::Result<(), checkpoint::Error> {
        checkpoint::reset_update_progress(prefs, quick)
    }

    fn report(&self, kind: ErrorKind) {
        self.reporter.report(kind);
    }

    /// Get the operation at `index` and the partition it applies to.
    fn operation(&self, index: u64) -> Option<(Partition, &InstallOperation)> {
        let manifest = self.manifest.as_ref()?;

        if index < self.num_rootfs_operations {
            manifest
                .install_operations
                .get(index as usize)
                .map(|op| (Partition::Rootfs, op))
        } else {
            manifest
                .kernel_install_operations
                .get((index - self.num_rootfs_operations) as usize)
                .map(|op| (Partition::Kernel, op))
        }
    }

    /// Move bytes from `data` into the buffer until it holds `max` bytes.
    fn copy_data_to_buffer(&mut self, data: &mut &[u8], max: u64) {
        let space = max.saturating_sub(self.buffer.len() as u64);
        let n = (data.len() as u64).min(space) as usize;

        self.buffer.extend_from_slice(&data[..n]);
        *data = &data[n..];
    }

    /// Hash and drop the buffered bytes.
    fn discard_buffer(&mut self, advance_offset: bool) {
        let buffer = mem::take(&mut self.buffer);

        if advance_offset {
            self.buffer_offset += buffer.len() as u64;
        }

        self.hash.update(&buffer);
    }

    /// Feed the next chunk of the payload. Chunks may be of any size, and
    /// whatever cannot be used yet is buffered.
    pub fn write(&mut self, mut data: &[u8]) -> Result<WriteStatus> {
        self.progress.total_bytes_received += data.len() as u64;
        self.update_overall_progress(false, "Completed ");

        let mut progressed = false;

        while self.manifest.is_none() {
            // Read up to the header size at first, then up to the full
            // metadata size once it is known.
            let reading_header = self.metadata_size.is_none();
            let limit = self.metadata_size.unwrap_or(HEADER_SIZE as u64);
            self.copy_data_to_buffer(&mut data, limit);

            let Some(manifest) = self.parse_metadata()? else {
                // If the header was just parsed, try the manifest too.
                if reading_header && self.metadata_size.is_some() {
                    continue;
                }

                return Ok(WriteStatus::NeedMoreData);
            };

            self.on_manifest_valid(manifest)?;
            progressed = true;
        }

        while self.next_operation < self.num_total_operations {
            if let Some(reason) = self.cancel.as_ref().and_then(|c| c.should_cancel()) {
                return Err(Error::Cancelled(reason));
            }

            let index = self.next_operation;
            let (partition, op) = self
                .operation(index)
                .map(|(p, op)| (p, op.clone()))
                .ok_or(Error::ResumeOutOfRange {
                    next: index,
                    total: self.num_total_operations,
                })?;

            self.copy_data_to_buffer(&mut data, op.data_length());

            let op_type = operation::operation_type(&op).map_err(|e| Error::Operation {
                index,
                op_type: None,
                source: e,
            })?;

            if !self.can_perform_operation(&op, op_type) {
                return Ok(if progressed {
                    WriteStatus::Progress
                } else {
                    WriteStatus::NeedMoreData
                });
            }

            // Operation hashes are only trusted if the metadata containing
            // them was signed.
            if !self.plan.metadata_signature.is_empty()
                && let Err(e) = self.validate_operation_hash(&op)
            {
                if self.plan.hash_checks_mandatory {
                    error!("Mandatory operation hash check failed: {e}");
                    return Err(e);
                }

                warn!("Ignoring operation validation error: {e}");
                self.report(e.kind());
            }

            // Exit is unblocked once this operation and its checkpoint are
            // complete.
            let exit_blocker = self.exit_blocker.clone();
            let _unblock = exit_blocker.unblock_on_drop();

            // A non-idempotent operation interrupted midway cannot be
            // retried, so the persisted progress is invalidated first.
            if !operation::is_idempotent(&op) {
                exit_blocker.set_blocked(true);
                self.checkpoints
                    .reset(true)
                    .map_err(Error::StateInitialization)?;
            }

            self.perform_operation(index, partition, &op, op_type)?;

            self.next_operation += 1;
            self.update_overall_progress(false, "Completed ");
            self.checkpoint_update_progress();
            progressed = true;
        }

        if !data.is_empty() {
            debug!("Ignoring {} after the last operation", NumBytes(data.len()));
        }

        Ok(WriteStatus::Done)
    }

    /// Returns the manifest once the full metadata is buffered and has passed
    /// the header, size, and signature checks.
    fn parse_metadata(&mut self) -> Result<Option<DeltaArchiveManifest>> {
        let metadata_size = match self.metadata_size {
            Some(size) => size,
            None => {
                let Some(info) = payload::parse_header(&self.buffer).map_err(Error::Header)?
                else {
                    return Ok(None);
                };

                // Check this immediately, before waiting for the manifest to
                // be downloaded.
                if self.plan.hash_checks_mandatory && self.plan.metadata_size != info.metadata_size
                {
                    error!(
                        "Mandatory metadata size ({}) is missing or incorrect, actual = {}",
                        self.plan.metadata_size, info.metadata_size,
                    );
                    return Err(Error::MetadataSizeMismatch {
                        expected: self.plan.metadata_size,
                        actual: info.metadata_size,
                    });
                }

                self.metadata_size = Some(info.metadata_size);
                info.metadata_size
            }
        };

        if (self.buffer.len() as u64) < metadata_size {
            return Ok(None);
        }

        if self.plan.metadata_size == metadata_size {
            info!("Metadata size in payload matches expected value");
        } else {
            warn!(
                "Ignoring missing or incorrect metadata size ({}) since validation is not mandatory. \
                 Trusting metadata size in payload: {metadata_size}",
                self.plan.metadata_size,
            );
            self.report(ErrorKind::MetadataSizeMismatch);
        }

        if let Err(e) = self.validate_metadata_signature(metadata_size as usize) {
            if self.plan.hash_checks_mandatory {
                error!("Mandatory metadata signature validation failed: {e}");
                return Err(e);
            }

            warn!("Ignoring metadata signature validation failure: {e}");
            self.report(e.kind());
        }

        let manifest = payload::decode_manifest(&self.buffer[HEADER_SIZE..metadata_size as usize])
            .map_err(Error::ManifestParse)?;

        Ok(Some(manifest))
    }

    fn validate_metadata_signature(&self, metadata_size: usize) -> Result<()> {
        if self.plan.metadata_signature.is_empty() {
            if self.plan.hash_checks_mandatory {
                return Err(Error::MissingMetadataSignature);
            }

            warn!("Cannot validate metadata since the signature is empty");
            self.report(ErrorKind::MetadataSignatureError);
            return Ok(());
        }

        let key = self
            .public_key()
            .map_err(Error::MetadataSignature)?
            .ok_or_else(|| Error::MissingPublicKey(self.plan.public_key_path().to_owned()))?;
        let digest = hash::sha256(&self.buffer[..metadata_size]);

        crypto::verify_sha256_digest(&key, &digest, &self.plan.metadata_signature)
            .map_err(Error::MetadataSignature)?;

        info!("Metadata signature matches value in install plan");

        Ok(())
    }

    /// Load the public key from the key file or, if there is no key file,
    /// from the install plan.
    fn public_key(&self) -> std::result::Result<Option<RsaPublicKey>, crypto::Error> {
        let key_path = self.plan.public_key_path();

        if key_path.exists() {
            info!("Using public key file: {key_path:?}");
            return crypto::read_public_key_file(key_path).map(Some);
        }

        if !self.plan.public_key_rsa.is_empty() {
            info!("Using public key from install plan");
            return crypto::decode_base64_public_key(&self.plan.public_key_rsa).map(Some);
        }

        Ok(None)
    }

    fn validate_manifest(&self, manifest: &DeltaArchiveManifest) -> Result<()> {
        if manifest.block_size() == 0 {
            return Err(Error::InvalidBlockSize(0));
        }

        let minor_version = manifest.minor_version();

        if self.plan.is_full_update {
            if manifest.old_kernel_info.is_some() || manifest.old_rootfs_info.is_some() {
                error!("Purported full payload contains old partition info");
                return Err(Error::FullPayloadHasOldInfo);
            }

            if minor_version != FULL_PAYLOAD_MINOR_VERSION {
                return Err(Error::UnsupportedMinorVersion {
                    expected: FULL_PAYLOAD_MINOR_VERSION,
                    actual: minor_version,
                });
            }
        } else if minor_version != SUPPORTED_MINOR_VERSION {
            return Err(Error::UnsupportedMinorVersion {
                expected: SUPPORTED_MINOR_VERSION,
                actual: minor_version,
            });
        }

        Ok(())
    }

    fn on_manifest_valid(&mut self, manifest: DeltaArchiveManifest) -> Result<()> {
        self.validate_manifest(&manifest)?;

        let (num_rootfs, num_kernel) = payload::operation_counts(&manifest);
        self.block_size = manifest.block_size();
        self.num_rootfs_operations = num_rootfs;
        self.num_total_operations = num_rootfs + num_kernel;

        log_partition_info(&manifest);
        self.manifest = Some(manifest);

        // The metadata is part of the payload hash.
        self.discard_buffer(false);

        if let Some(size) = self.metadata_size
            && let Err(e) = self.checkpoints.save_metadata_size(size)
        {
            warn!("Unable to save the manifest metadata size: {e}");
        }

        self.prime_update_state()?;

        if self.next_operation > 0 {
            self.update_overall_progress(true, "Resuming after ");
        }

        info!("Starting to apply update payload operations");

        Ok(())
    }

    /// Restore the state of an interrupted update or, if starting fresh,
    /// verify that the payload applies to the current partitions.
    fn prime_update_state(&mut self) -> Result<()> {
        let Some(state) = self
            .checkpoints
            .load_resume_state()
            .map_err(Error::StateInitialization)?
        else {
            return self.verify_source_partitions();
        };

        if state.next_operation > self.num_total_operations {
            return Err(Error::ResumeOutOfRange {
                next: state.next_operation,
                total: self.num_total_operations,
            });
        }

        info!(
            "Resuming update at operation #{} and data offset {}",
            state.next_operation, state.buffer_offset,
        );

        self.next_operation = state.next_operation;
        self.buffer_offset = state.buffer_offset;
        self.hash = state.hash_context;
        self.signed_hash = state.signed_hash_context;
        self.signature_blob = state.signature_blob;
        self.metadata_size = Some(state.metadata_size);

        // Count what does not need to be downloaded again.
        self.progress.total_bytes_received += state.buffer_offset;

        Ok(())
    }

    fn verify_source_partitions(&self) -> Result<()> {
        info!("Verifying source partitions");

        let Some(manifest) = &self.manifest else {
            return Ok(());
        };

        let partitions = [
            (Partition::Kernel, &manifest.old_kernel_info, &self.plan.kernel_hash),
            (Partition::Rootfs, &manifest.old_rootfs_info, &self.plan.rootfs_hash),
        ];

        for (partition, info, current_hash) in partitions {
            let Some(info) = info else {
                continue;
            };

            let expected_hash = info.hash();
            if current_hash.is_empty() || current_hash.as_slice() != expected_hash {
                let expected = util::hash_to_base64(expected_hash);
                let actual = util::hash_to_base64(current_hash);

                error!(
                    "The payload contains a {partition} delta that must be applied over a \
                     {partition} with hash {expected}, but the current {partition} has hash \
                     {actual}. This payload was built for a different source image.",
                );

                return Err(Error::SourcePartitionMismatch {
                    partition,
                    expected,
                    actual,
                });
            }
        }

        Ok(())
    }

    fn can_perform_operation(&self, op: &InstallOperation, op_type: Type) -> bool {
        if !operation::has_data_blob(op_type) {
            return true;
        }

        if op.data_offset() < self.buffer_offset {
            error!(
                "Data for operation #{} at {} was already discarded (buffer offset {})",
                self.next_operation,
                op.data_offset(),
                self.buffer_offset,
            );
            return false;
        }

        op.data_offset().saturating_add(op.data_length())
            <= self.buffer_offset + self.buffer.len() as u64
    }

    fn validate_operation_hash(&self, op: &InstallOperation) -> Result<()> {
        let index = self.next_operation;

        let Some(expected) = op.data_sha256_hash.as_deref().filter(|h| !h.is_empty()) else {
            // Operations without data have nothing to hash. The rest of the
            // operation is covered by the metadata signature.
            if op.data_length() == 0 {
                return Ok(());
            }

            // The signature operation cannot contain its own hash.
            let signatures_offset = self.manifest.as_ref().and_then(|m| m.signatures_offset);
            if signatures_offset == Some(op.data_offset()) {
                info!("Skipping hash verification for signature operation #{index}");
                return Ok(());
            }

            if self.plan.hash_checks_mandatory {
                return Err(Error::MissingOperationHash(index));
            }

            warn!("Cannot validate operation #{index} since it has no hash");
            self.report(ErrorKind::OperationHashMismatch);
            return Ok(());
        };

        let actual = hash::sha256(&self.buffer[..op.data_length() as usize]);
        if actual.as_slice() != expected {
            error!(
                "Hash mismatch for {} at offset {} for operation #{index}",
                NumBytes(op.data_length()),
                op.data_offset(),
            );

            return Err(Error::OperationHashMismatch {
                index,
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        Ok(())
    }

    fn is_signature_operation(&self, op: &InstallOperation, op_type: Type) -> bool {
        op_type == Type::Replace
            && self
                .manifest
                .as_ref()
                .and_then(|m| m.signatures_offset)
                .is_some_and(|offset| offset == op.data_offset())
    }

    /// Capture the payload signature instead of writing it to a device.
    fn extract_signature(&mut self, op: &InstallOperation) -> Result<()> {
        let index = self.next_operation;
        let invalid = |reason| Error::InvalidSignatureOperation { index, reason };

        let signatures_size = self.manifest.as_ref().and_then(|m| m.signatures_size);
        if signatures_size != Some(op.data_length()) {
            return Err(invalid("size does not match manifest"));
        }
        if self.signature_blob.is_some() {
            return Err(invalid("signature was already extracted"));
        }

        let blob = self.buffer[..op.data_length() as usize].to_vec();
        let signed_hash = self.hash.clone();

        if let Err(e) = self.checkpoints.save_signature(&blob, &signed_hash) {
            warn!("Unable to store the signature blob: {e}");
        }

        info!(
            "Extracted signature data of size {} at {}",
            blob.len(),
            op.data_offset(),
        );

        self.signature_blob = Some(blob);
        self.signed_hash = Some(signed_hash);

        Ok(())
    }

    fn perform_operation(
        &mut self,
        index: u64,
        partition: Partition,
        op: &InstallOperation,
        op_type: Type,
    ) -> Result<()> {
        let wrap = |e: operation::Error| Error::Operation {
            index,
            op_type: Some(op_type),
            source: e,
        };

        if self.is_signature_operation(op, op_type) {
            self.extract_signature(op)?;
            self.discard_buffer(true);
            return Ok(());
        }

        let target = match partition {
            Partition::Rootfs => self.rootfs.as_ref(),
            Partition::Kernel => self.kernel.as_ref(),
        }
        .ok_or(Error::DeviceClosed(partition))?;

        match op_type {
            Type::Replace | Type::ReplaceBz => {
                operation::apply_replace(target, op, self.block_size, &self.buffer).map_err(wrap)?;
            }
            Type::Move => {
                operation::apply_move(target, op, self.block_size).map_err(wrap)?;
            }
            Type::Bsdiff => {
                operation::apply_bsdiff(target, op, self.block_size, &self.buffer, &*self.patcher)
                    .map_err(wrap)?;
            }
        }

        if operation::has_data_blob(op_type) {
            self.discard_buffer(true);
        }

        Ok(())
    }

    fn checkpoint_update_progress(&mut self) {
        self.exit_blocker.set_blocked(true);

        let next_data_length = self
            .operation(self.next_operation)
            .map_or(0, |(_, op)| op.data_length());

        if let Err(e) = self.checkpoints.checkpoint(
            self.next_operation,
            self.buffer_offset,
            &self.hash,
            next_data_length,
        ) {
            warn!("Unable to checkpoint update progress: {e}");
        }
    }

    fn update_overall_progress(&mut self, mut force_log: bool, prefix: &str) {
        let payload_size = self.plan.payload_size;
        let mut new_progress = 0;
        let mut operations_weight = PROGRESS_OPERATIONS_WEIGHT;

        // Without a known payload size, operations carry the full weight.
        if payload_size > 0 {
            new_progress += util::int_ratio(
                self.progress.total_bytes_received,
                payload_size,
                PROGRESS_DOWNLOAD_WEIGHT,
            )
            .min(PROGRESS_DOWNLOAD_WEIGHT);
        } else {
            operations_weight += PROGRESS_DOWNLOAD_WEIGHT;
        }

        if self.num_total_operations > 0 {
            new_progress += util::int_ratio(
                self.next_operation,
                self.num_total_operations,
                operations_weight,
            );
        }

        if new_progress < self.progress.overall {
            warn!(
                "Progress counter receded from {}% down to {new_progress}%",
                self.progress.overall,
            );
            force_log = true;
        }
        self.progress.overall = new_progress;

        let now = Instant::now();
        let chunk = new_progress * PROGRESS_LOG_MAX_CHUNKS / 100;

        if force_log || chunk > self.progress.last_chunk || now > self.progress.next_forced_log {
            self.progress.next_forced_log = now + PROGRESS_LOG_TIMEOUT;
            self.log_progress(prefix);
        }

        self.progress.last_chunk = chunk;
    }

    fn log_progress(&self, prefix: &str) {
        let (total_operations, operations_percent) = if self.num_total_operations > 0 {
            (
                self.num_total_operations.to_string(),
                format!(
                    " ({}%)",
                    util::int_ratio(self.next_operation, self.num_total_operations, 100),
                ),
            )
        } else {
            ("?".to_owned(), String::new())
        };

        let payload_size = self.plan.payload_size;
        let received = self.progress.total_bytes_received;
        let (total_bytes, bytes_percent) = if payload_size > 0 {
            (
                payload_size.to_string(),
                format!(" ({}%)", util::int_ratio(received, payload_size, 100)),
            )
        } else {
            ("?".to_owned(), String::new())
        };

        info!(
            "{prefix}{}/{total_operations} operations{operations_percent}, \
             {received}/{total_bytes} bytes downloaded{bytes_percent}, \
             overall progress {}%",
            self.next_operation, self.progress.overall,
        );
    }

    /// Sync and release both devices and finalize the payload hash. Any
    /// unconsumed data is discarded.
    pub fn close(&mut self) -> Result<()> {
        let mut result = Ok(());

        for (partition, file) in [
            (Partition::Kernel, self.kernel.take()),
            (Partition::Rootfs, self.rootfs.take()),
        ] {
            if let Some(file) = file
                && let Err(e) = file.sync_all()
            {
                error!("Unable to sync {partition} device: {e}");
                result = Err(Error::DeviceSync(partition, e));
            }
        }

        if self.final_hash.is_none() {
            self.final_hash = Some(self.hash.clone().finish());
        }

        if !self.buffer.is_empty() {
            info!("Discarding {} of unused downloaded data", NumBytes(self.buffer.len()));
            self.buffer = vec![];
        }

        result
    }

    /// Verify the consumed payload against the expected size and hash, then
    /// verify the payload signature if a public key is available. An empty
    /// `expected_hash` skips only the hash comparison.
    pub fn verify_payload(&self, expected_hash: &[u8], expected_size: u64) -> Result<()> {
        info!("Verifying payload");

        let size = self.metadata_size.unwrap_or(0) + self.buffer_offset;
        if size != expected_size {
            return Err(Error::PayloadSizeMismatch {
                expected: expected_size,
                actual: size,
            });
        }

        let actual_hash = self
            .final_hash
            .unwrap_or_else(|| self.hash.clone().finish());
        if expected_hash.is_empty() {
            warn!("No expected payload hash; payload hash is {}", hex::encode(actual_hash));
            self.report(ErrorKind::PayloadHashMismatch);
        } else if actual_hash.as_slice() != expected_hash {
            return Err(Error::PayloadHashMismatch {
                expected: hex::encode(expected_hash),
                actual: hex::encode(actual_hash),
            });
        }

        let Some(key) = self.public_key().map_err(Error::LoadPublicKey)? else {
            warn!(
                "Not verifying signed payload: missing public key: {:?}",
                self.plan.public_key_path(),
            );
            return Ok(());
        };

        let blob = self
            .signature_blob
            .as_ref()
            .ok_or(Error::MissingSignatureBlob)?;
        let signed_hash = self
            .signed_hash
            .clone()
            .ok_or(Error::MissingSignedHash)?
            .finish();

        if let Err(e) = payload::verify_signature_blob(blob, &signed_hash, &key) {
            error!("Public key verification failed, thus update failed");
            return Err(Error::PayloadSignature(e));
        }

        info!("Payload hash matches value in payload signature");

        Ok(())
    }
}

fn log_partition_info(manifest: &DeltaArchiveManifest) {
    let infos: [(&str, &Option<PartitionInfo>); 4] = [
        ("old_kernel_info", &manifest.old_kernel_info),
        ("old_rootfs_info", &manifest.old_rootfs_info),
        ("new_kernel_info", &manifest.new_kernel_info),
        ("new_rootfs_info", &manifest.new_rootfs_info),
    ];

    for (tag, info) in infos {
        if let Some(info) = info {
            info!(
                "PartitionInfo {tag} sha256: {} size: {}",
                util::hash_to_base64(info.hash()),
                info.size(),
            );
        }
    }
}
