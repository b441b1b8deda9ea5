// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use assert_matches::assert_matches;
use base64::{Engine, engine::general_purpose::STANDARD};
use bzip2::{Compression, write::BzEncoder};
use pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;

use abapply::{
    format::{
        extent::Positions,
        payload::{BuiltPayload, FULL_PAYLOAD_MINOR_VERSION, HEADER_SIZE, Partition, PayloadBuilder},
    },
    protobuf::chromeos_update_engine::{
        Extent, InstallOperation, PartitionInfo, install_operation::Type,
    },
    stream::{ReadAt, WriteAt},
    update::{
        applier::{Error, ErrorKind, ErrorReporter, PayloadApplier, WriteStatus},
        checkpoint::{self, ResumePoint},
        patch::{self, PatchApplier},
        plan::InstallPlan,
        prefs::{
            KEY_RESUMED_UPDATE_FAILURES, KEY_UPDATE_CHECK_RESPONSE_HASH, MemoryPrefs, Prefs,
            PrefsExt,
        },
        terminator::ExitBlocker,
    },
};

const BLOCK_SIZE: u32 = 4096;
const PARTITION_BLOCKS: u64 = 16;
const RESPONSE_HASH: &str = "test-response";

fn test_key() -> RsaPrivateKey {
    let data = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/data/TEST_KEY_DO_NOT_USE_payload.key",
    ));

    RsaPrivateKey::from_pkcs8_pem(data).unwrap()
}

fn test_public_key_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/TEST_KEY_DO_NOT_USE_payload.pub.pem")
}

fn extent(start_block: u64, num_blocks: u64) -> Extent {
    Extent {
        start_block: Some(start_block),
        num_blocks: Some(num_blocks),
    }
}

fn operation(op_type: Type, src: Vec<Extent>, dst: Vec<Extent>) -> InstallOperation {
    InstallOperation {
        r#type: Some(op_type.into()),
        src_extents: src,
        dst_extents: dst,
        ..Default::default()
    }
}

fn block_offset(block: u64) -> usize {
    (block * u64::from(BLOCK_SIZE)) as usize
}

/// Patch applier that XORs the source bytes with the patch contents.
struct XorPatcher;

impl PatchApplier for XorPatcher {
    fn apply(
        &self,
        target: &File,
        patch_path: &Path,
        src: &Positions,
        dst: &Positions,
    ) -> Result<(), patch::Error> {
        let patch = fs::read(patch_path)?;

        let mut old = vec![];
        for position in &src.0 {
            let mut buf = vec![0u8; position.length as usize];
            if let Some(offset) = position.offset {
                target.read_exact_at(&mut buf, offset)?;
            }
            old.extend_from_slice(&buf);
        }

        let new = patch
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ old.get(i).copied().unwrap_or(0))
            .collect::<Vec<_>>();

        let mut remain = new.as_slice();
        for position in &dst.0 {
            let (chunk, rest) = remain.split_at(position.length as usize);
            if let Some(offset) = position.offset {
                target.write_all_at(chunk, offset)?;
            }
            remain = rest;
        }

        Ok(())
    }
}

/// Patch applier that fails as if the process was killed midway.
struct FailingPatcher;

impl PatchApplier for FailingPatcher {
    fn apply(
        &self,
        _target: &File,
        _patch_path: &Path,
        _src: &Positions,
        _dst: &Positions,
    ) -> Result<(), patch::Error> {
        Err(io::Error::other("Interrupted").into())
    }
}

#[derive(Default)]
struct RecordingReporter(Mutex<Vec<ErrorKind>>);

impl RecordingReporter {
    fn kinds(&self) -> Vec<ErrorKind> {
        self.0.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, kind: ErrorKind) {
        self.0.lock().unwrap().push(kind);
    }
}

struct Devices {
    rootfs: File,
    kernel: File,
}

impl Devices {
    fn new(rootfs: &[u8], kernel: &[u8]) -> Self {
        let mut result = Self {
            rootfs: tempfile::tempfile().unwrap(),
            kernel: tempfile::tempfile().unwrap(),
        };
        result.rootfs.write_all(rootfs).unwrap();
        result.kernel.write_all(kernel).unwrap();
        result
    }

    fn zeroed() -> Self {
        let size = block_offset(PARTITION_BLOCKS);
        Self::new(&vec![0u8; size], &vec![0u8; size])
    }

    fn applier(&self, plan: InstallPlan, prefs: Arc<dyn Prefs>) -> PayloadApplier {
        PayloadApplier::new(
            plan,
            self.rootfs.try_clone().unwrap(),
            self.kernel.try_clone().unwrap(),
            prefs,
        )
        .with_patch_applier(Arc::new(XorPatcher))
    }

    fn read(file: &File) -> Vec<u8> {
        let mut buf = vec![0u8; block_offset(PARTITION_BLOCKS)];
        file.read_exact_at(&mut buf, 0).unwrap();
        buf
    }

    fn rootfs(&self) -> Vec<u8> {
        Self::read(&self.rootfs)
    }

    fn kernel(&self) -> Vec<u8> {
        Self::read(&self.kernel)
    }
}

/// Prepare prefs the way an update driver does before starting a new update.
fn fresh_prefs() -> Arc<MemoryPrefs> {
    let prefs = Arc::new(MemoryPrefs::new());
    checkpoint::reset_update_progress(&*prefs, false).unwrap();
    prefs
        .set_string(KEY_UPDATE_CHECK_RESPONSE_HASH, RESPONSE_HASH)
        .unwrap();
    prefs
}

fn write_all_chunked(
    applier: &mut PayloadApplier,
    data: &[u8],
    chunk_size: usize,
) -> Result<WriteStatus, Error> {
    let mut status = WriteStatus::NeedMoreData;

    for chunk in data.chunks(chunk_size) {
        status = applier.write(chunk)?;
    }

    Ok(status)
}

fn signed_plan(payload: &BuiltPayload) -> InstallPlan {
    InstallPlan {
        hash_checks_mandatory: true,
        metadata_size: payload.metadata_size,
        metadata_signature: payload.metadata_signature.clone().unwrap(),
        public_key_path: Some(test_public_key_path()),
        payload_size: payload.data.len() as u64,
        payload_hash: payload.hash.to_vec(),
        response_hash: RESPONSE_HASH.to_owned(),
        ..Default::default()
    }
}

fn unsigned_plan(payload: &BuiltPayload, is_full_update: bool) -> InstallPlan {
    InstallPlan {
        is_full_update,
        metadata_size: payload.metadata_size,
        public_key_path: Some(PathBuf::from("/nonexistent/update-payload-key.pub.pem")),
        payload_size: payload.data.len() as u64,
        payload_hash: payload.hash.to_vec(),
        response_hash: RESPONSE_HASH.to_owned(),
        ..Default::default()
    }
}

fn full_payload(key: Option<&RsaPrivateKey>) -> (BuiltPayload, Vec<u8>) {
    let data = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect::<Vec<_>>();

    let mut builder = PayloadBuilder::new(BLOCK_SIZE, FULL_PAYLOAD_MINOR_VERSION);
    builder.add_operation(
        Partition::Rootfs,
        operation(Type::Replace, vec![], vec![extent(10, 1)]),
        data.clone(),
    );

    (builder.build(key).unwrap(), data)
}

const OLD_ROOTFS_HASH: [u8; 32] = [0x11; 32];
const OLD_KERNEL_HASH: [u8; 32] = [0x22; 32];
const BSDIFF_LENGTH: usize = 4000;

fn old_rootfs() -> Vec<u8> {
    (0..PARTITION_BLOCKS)
        .flat_map(|b| vec![b as u8 + 1; BLOCK_SIZE as usize])
        .collect()
}

fn bz_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(vec![], Compression::best());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// A delta payload exercising every operation type, plus the expected device
/// contents after it is applied over [`old_rootfs()`] and a zeroed kernel.
fn delta_payload(key: Option<&RsaPrivateKey>) -> (BuiltPayload, Vec<u8>, Vec<u8>) {
    let kernel_data = b"kernel!".repeat(700);

    let mut builder = PayloadBuilder::new(BLOCK_SIZE, 1);
    builder
        .set_partition_info(
            Partition::Rootfs,
            Some(PartitionInfo {
                size: Some(block_offset(PARTITION_BLOCKS) as u64),
                hash: Some(OLD_ROOTFS_HASH.to_vec()),
            }),
            None,
        )
        .set_partition_info(
            Partition::Kernel,
            Some(PartitionInfo {
                size: Some(block_offset(PARTITION_BLOCKS) as u64),
                hash: Some(OLD_KERNEL_HASH.to_vec()),
            }),
            None,
        )
        .add_operation(
            Partition::Rootfs,
            operation(Type::Move, vec![extent(0, 2)], vec![extent(5, 2)]),
            vec![],
        )
        .add_operation(
            Partition::Rootfs,
            InstallOperation {
                src_length: Some(u64::from(BLOCK_SIZE)),
                dst_length: Some(BSDIFF_LENGTH as u64),
                ..operation(Type::Bsdiff, vec![extent(2, 1)], vec![extent(8, 1)])
            },
            vec![0x5a; BSDIFF_LENGTH],
        )
        // Overlapping source and destination.
        .add_operation(
            Partition::Rootfs,
            operation(Type::Move, vec![extent(10, 2)], vec![extent(11, 2)]),
            vec![],
        )
        .add_operation(
            Partition::Kernel,
            operation(Type::ReplaceBz, vec![], vec![extent(0, 2)]),
            bz_compress(&kernel_data),
        );

    let payload = builder.build(key).unwrap();

    let old = old_rootfs();
    let mut rootfs = old.clone();
    rootfs.copy_within(..block_offset(2), block_offset(5));
    for (i, b) in rootfs[block_offset(8)..block_offset(9)].iter_mut().enumerate() {
        *b = if i < BSDIFF_LENGTH { 3 ^ 0x5a } else { 0 };
    }
    rootfs[block_offset(11)..block_offset(13)]
        .copy_from_slice(&old[block_offset(10)..block_offset(12)]);

    let mut kernel = vec![0u8; block_offset(PARTITION_BLOCKS)];
    kernel[..kernel_data.len()].copy_from_slice(&kernel_data);

    (payload, rootfs, kernel)
}

fn delta_plan(payload: &BuiltPayload) -> InstallPlan {
    InstallPlan {
        rootfs_hash: OLD_ROOTFS_HASH.to_vec(),
        kernel_hash: OLD_KERNEL_HASH.to_vec(),
        ..signed_plan(payload)
    }
}

#[test]
fn full_replace_at_block_offset() {
    let (payload, data) = full_payload(None);
    let devices = Devices::zeroed();
    let prefs = fresh_prefs();
    let mut applier = devices.applier(unsigned_plan(&payload, true), prefs);

    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    applier.close().unwrap();
    applier
        .verify_payload(&payload.hash, payload.data.len() as u64)
        .unwrap();

    let rootfs = devices.rootfs();
    assert_eq!(&rootfs[40960..40960 + data.len()], data.as_slice());
    assert!(rootfs[..40960].iter().all(|b| *b == 0));
    assert!(rootfs[40960 + data.len()..].iter().all(|b| *b == 0));
    assert_eq!(applier.overall_progress(), 100);
}

#[test]
fn need_more_data_until_header_complete() {
    let (payload, _) = full_payload(None);
    let devices = Devices::zeroed();
    let mut applier = devices.applier(unsigned_plan(&payload, true), fresh_prefs());

    assert_matches!(
        applier.write(&payload.data[..HEADER_SIZE - 1]),
        Ok(WriteStatus::NeedMoreData)
    );
    assert_eq!(applier.metadata_size(), None);

    assert_matches!(
        applier.write(&payload.data[HEADER_SIZE - 1..HEADER_SIZE]),
        Ok(WriteStatus::NeedMoreData)
    );
    assert_eq!(applier.metadata_size(), Some(payload.metadata_size));
    assert!(applier.manifest().is_none());

    let metadata_end = payload.metadata_size as usize;
    assert_matches!(
        applier.write(&payload.data[HEADER_SIZE..metadata_end]),
        Ok(WriteStatus::Progress)
    );
    assert!(applier.manifest().is_some());
    assert_eq!(applier.next_operation(), 0);

    assert_matches!(
        applier.write(&payload.data[metadata_end..]),
        Ok(WriteStatus::Done)
    );
}

#[test]
fn delta_all_operation_types() {
    let key = test_key();
    let (payload, expected_rootfs, expected_kernel) = delta_payload(Some(&key));
    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let prefs = fresh_prefs();
    let mut applier = devices.applier(delta_plan(&payload), prefs.clone());

    assert_matches!(
        write_all_chunked(&mut applier, &payload.data, 1000),
        Ok(WriteStatus::Done)
    );
    applier.close().unwrap();
    applier
        .verify_payload(&payload.hash, payload.data.len() as u64)
        .unwrap();

    assert_eq!(devices.rootfs(), expected_rootfs);
    assert_eq!(devices.kernel(), expected_kernel);

    // Every operation was checkpointed, including the signature operation.
    assert_eq!(applier.num_total_operations(), 5);
    assert!(checkpoint::can_resume(&*prefs, RESPONSE_HASH));
}

#[test]
fn chunk_size_does_not_matter() {
    let key = test_key();
    let (payload, expected_rootfs, expected_kernel) = delta_payload(Some(&key));

    for chunk_size in [1, 7, 4096, payload.data.len()] {
        let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
        let mut applier = devices.applier(delta_plan(&payload), fresh_prefs());

        assert_matches!(
            write_all_chunked(&mut applier, &payload.data, chunk_size),
            Ok(WriteStatus::Done)
        );
        applier.close().unwrap();
        applier
            .verify_payload(&payload.hash, payload.data.len() as u64)
            .unwrap();

        assert_eq!(devices.rootfs(), expected_rootfs, "Chunk size: {chunk_size}");
        assert_eq!(devices.kernel(), expected_kernel, "Chunk size: {chunk_size}");
    }
}

#[test]
fn resume_after_each_operation() {
    let key = test_key();
    let (payload, expected_rootfs, expected_kernel) = delta_payload(Some(&key));
    let payload_size = payload.data.len() as u64;

    for stop_at in 1..=5 {
        let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
        let prefs = fresh_prefs();

        // Interrupt the first attempt once `stop_at` operations are done. A
        // move operation is applied in the same write as the operation
        // before it, so more operations may have completed.
        {
            let mut applier = devices.applier(delta_plan(&payload), prefs.clone());

            for byte in payload.data.chunks(1) {
                applier.write(byte).unwrap();
                if applier.next_operation() >= stop_at {
                    break;
                }
            }

            assert!(applier.next_operation() >= stop_at);
        }

        assert!(checkpoint::can_resume(&*prefs, RESPONSE_HASH), "Stopped at: {stop_at}");
        assert!(!checkpoint::can_resume(&*prefs, "other-response"));

        let point = ResumePoint::from_prefs(&*prefs).unwrap();
        assert_eq!(point.metadata_size, payload.metadata_size);

        let mut applier = devices.applier(delta_plan(&payload), prefs.clone());
        let mut status = WriteStatus::NeedMoreData;

        for range in point.ranges(payload_size) {
            if range.is_empty() {
                continue;
            }

            let data = &payload.data[range.start as usize..range.end as usize];
            status = write_all_chunked(&mut applier, data, 512).unwrap();
        }

        assert_eq!(status, WriteStatus::Done, "Stopped at: {stop_at}");
        applier.close().unwrap();
        applier.verify_payload(&payload.hash, payload_size).unwrap();

        assert_eq!(devices.rootfs(), expected_rootfs, "Stopped at: {stop_at}");
        assert_eq!(devices.kernel(), expected_kernel, "Stopped at: {stop_at}");
        assert_eq!(prefs.get_i64(KEY_RESUMED_UPDATE_FAILURES).unwrap(), Some(1));
    }
}

#[test]
fn resume_reapplies_completed_idempotent_operation() {
    let key = test_key();
    let (payload, expected_rootfs, expected_kernel) = delta_payload(Some(&key));
    let payload_size = payload.data.len() as u64;
    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let prefs = fresh_prefs();

    // The move runs as soon as the manifest is complete. The bsdiff after it
    // still needs its data.
    {
        let mut applier = devices.applier(delta_plan(&payload), prefs.clone());

        for byte in payload.data.chunks(1) {
            applier.write(byte).unwrap();
            if applier.next_operation() > 0 {
                break;
            }
        }

        assert_eq!(applier.next_operation(), 1);
    }

    // The bsdiff reached the device, but the process died before the
    // checkpoint was updated.
    let range = block_offset(8)..block_offset(9);
    devices
        .rootfs
        .write_all_at(&expected_rootfs[range.clone()], range.start as u64)
        .unwrap();

    let point = ResumePoint::from_prefs(&*prefs).unwrap();
    let mut applier = devices.applier(delta_plan(&payload), prefs.clone());
    let mut status = WriteStatus::NeedMoreData;

    for range in point.ranges(payload_size) {
        if range.is_empty() {
            continue;
        }

        let data = &payload.data[range.start as usize..range.end as usize];
        status = write_all_chunked(&mut applier, data, 512).unwrap();
    }

    assert_eq!(status, WriteStatus::Done);
    applier.close().unwrap();
    applier.verify_payload(&payload.hash, payload_size).unwrap();

    assert_eq!(devices.rootfs(), expected_rootfs);
    assert_eq!(devices.kernel(), expected_kernel);
}

#[test]
fn interrupted_non_idempotent_operation_is_not_resumable() {
    let mut builder = PayloadBuilder::new(BLOCK_SIZE, 1);
    builder
        .add_operation(
            Partition::Rootfs,
            operation(Type::Replace, vec![], vec![extent(0, 1)]),
            vec![0xaa; BLOCK_SIZE as usize],
        )
        // Patches a block in place.
        .add_operation(
            Partition::Rootfs,
            InstallOperation {
                src_length: Some(u64::from(BLOCK_SIZE)),
                dst_length: Some(u64::from(BLOCK_SIZE)),
                ..operation(Type::Bsdiff, vec![extent(3, 1)], vec![extent(3, 1)])
            },
            vec![0x5a; 16],
        );
    let payload = builder.build(None).unwrap();

    let devices = Devices::zeroed();
    let prefs = fresh_prefs();
    let mut applier = devices
        .applier(unsigned_plan(&payload, false), prefs.clone())
        .with_patch_applier(Arc::new(FailingPatcher));

    let replace_end = payload.metadata_size as usize + BLOCK_SIZE as usize;
    assert_matches!(
        applier.write(&payload.data[..replace_end]),
        Ok(WriteStatus::Progress)
    );
    assert_eq!(applier.next_operation(), 1);
    assert!(checkpoint::can_resume(&*prefs, RESPONSE_HASH));

    let error = applier.write(&payload.data[replace_end..]).unwrap_err();
    assert_matches!(
        error,
        Error::Operation {
            index: 1,
            op_type: Some(Type::Bsdiff),
            ..
        }
    );
    assert!(!checkpoint::can_resume(&*prefs, RESPONSE_HASH));
}

#[test]
fn interrupted_before_first_operation_is_not_resumable() {
    let (payload, _) = full_payload(None);
    let devices = Devices::zeroed();
    let prefs = fresh_prefs();

    {
        let mut applier = devices.applier(unsigned_plan(&payload, true), prefs.clone());
        applier
            .write(&payload.data[..payload.metadata_size as usize])
            .unwrap();
        assert_eq!(applier.next_operation(), 0);
    }

    assert!(!checkpoint::can_resume(&*prefs, RESPONSE_HASH));
}

#[test]
fn flipped_blob_byte_mandatory() {
    let key = test_key();
    let (mut payload, _, _) = delta_payload(Some(&key));
    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let mut applier = devices.applier(delta_plan(&payload), fresh_prefs());

    // First byte of the bsdiff operation's blob.
    payload.data[payload.metadata_size as usize] ^= 0xff;

    let error = applier.write(&payload.data).unwrap_err();
    assert_matches!(error, Error::OperationHashMismatch { index: 1, .. });
    assert_eq!(error.kind(), ErrorKind::OperationHashMismatch);
    assert_eq!(applier.next_operation(), 1);
}

#[test]
fn flipped_blob_byte_not_mandatory() {
    let key = test_key();
    let (mut payload, _, _) = delta_payload(Some(&key));
    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let reporter = Arc::new(RecordingReporter::default());
    let plan = InstallPlan {
        hash_checks_mandatory: false,
        ..delta_plan(&payload)
    };
    let mut applier = devices
        .applier(plan, fresh_prefs())
        .with_reporter(reporter.clone());

    payload.data[payload.metadata_size as usize] ^= 0xff;

    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    assert_eq!(reporter.kinds(), [ErrorKind::OperationHashMismatch]);

    applier.close().unwrap();
    assert_matches!(
        applier.verify_payload(&payload.hash, payload.data.len() as u64),
        Err(Error::PayloadHashMismatch { .. })
    );
}

#[test]
fn metadata_size_mismatch() {
    let key = test_key();
    let (payload, _, _) = delta_payload(Some(&key));

    // Fatal as soon as the header is parsed.
    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let plan = InstallPlan {
        metadata_size: payload.metadata_size + 1,
        ..delta_plan(&payload)
    };
    let mut applier = devices.applier(plan, fresh_prefs());
    let error = applier.write(&payload.data[..HEADER_SIZE]).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::MetadataSizeMismatch);

    // Only reported if hash checks are not mandatory.
    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let reporter = Arc::new(RecordingReporter::default());
    let plan = InstallPlan {
        hash_checks_mandatory: false,
        metadata_size: 0,
        ..delta_plan(&payload)
    };
    let mut applier = devices
        .applier(plan, fresh_prefs())
        .with_reporter(reporter.clone());
    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    assert_eq!(reporter.kinds(), [ErrorKind::MetadataSizeMismatch]);
}

#[test]
fn metadata_signature_mismatch() {
    let key = test_key();
    let (payload, _, _) = delta_payload(Some(&key));

    let mut bad_signature = payload.metadata_signature.clone().unwrap();
    bad_signature[0] ^= 0xff;

    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let plan = InstallPlan {
        metadata_signature: bad_signature.clone(),
        ..delta_plan(&payload)
    };
    let mut applier = devices.applier(plan, fresh_prefs());
    let error = applier.write(&payload.data).unwrap_err();
    assert_matches!(error, Error::MetadataSignature(_));
    assert_eq!(error.kind(), ErrorKind::MetadataSignatureError);
    assert!(applier.manifest().is_none());

    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let reporter = Arc::new(RecordingReporter::default());
    let plan = InstallPlan {
        hash_checks_mandatory: false,
        metadata_signature: bad_signature,
        ..delta_plan(&payload)
    };
    let mut applier = devices
        .applier(plan, fresh_prefs())
        .with_reporter(reporter.clone());
    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    assert_eq!(reporter.kinds(), [ErrorKind::MetadataSignatureError]);
}

#[test]
fn missing_metadata_signature_mandatory() {
    let (payload, _) = full_payload(None);
    let devices = Devices::zeroed();
    let plan = InstallPlan {
        hash_checks_mandatory: true,
        ..unsigned_plan(&payload, true)
    };
    let mut applier = devices.applier(plan, fresh_prefs());

    assert_matches!(
        applier.write(&payload.data),
        Err(Error::MissingMetadataSignature)
    );
}

#[test]
fn manifest_validation() {
    // Full plan, but the payload is a delta.
    let (payload, _, _) = delta_payload(None);
    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let mut applier = devices.applier(unsigned_plan(&payload, true), fresh_prefs());
    let error = applier.write(&payload.data).unwrap_err();
    assert_matches!(error, Error::FullPayloadHasOldInfo);
    assert_eq!(error.kind(), ErrorKind::ManifestValidationError);

    // Delta plan, but the payload has the full payload minor version.
    let (payload, _) = full_payload(None);
    let devices = Devices::zeroed();
    let mut applier = devices.applier(unsigned_plan(&payload, false), fresh_prefs());
    let error = applier.write(&payload.data).unwrap_err();
    assert_matches!(
        error,
        Error::UnsupportedMinorVersion {
            expected: 1,
            actual: 0,
        }
    );
    assert_eq!(error.kind(), ErrorKind::ManifestValidationError);
}

#[test]
fn source_partition_mismatch() {
    let (payload, _, _) = delta_payload(None);
    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let plan = InstallPlan {
        rootfs_hash: OLD_ROOTFS_HASH.to_vec(),
        kernel_hash: vec![0x33; 32],
        ..unsigned_plan(&payload, false)
    };
    let mut applier = devices.applier(plan, fresh_prefs());

    let error = applier.write(&payload.data).unwrap_err();
    assert_matches!(
        error,
        Error::SourcePartitionMismatch {
            partition: Partition::Kernel,
            ..
        }
    );
    assert_eq!(error.kind(), ErrorKind::SourcePartitionMismatch);
    assert_eq!(devices.rootfs(), old_rootfs());

    // A missing source hash never matches.
    let plan = InstallPlan {
        rootfs_hash: vec![],
        kernel_hash: OLD_KERNEL_HASH.to_vec(),
        ..unsigned_plan(&payload, false)
    };
    let mut applier = devices.applier(plan, fresh_prefs());
    assert_matches!(
        applier.write(&payload.data),
        Err(Error::SourcePartitionMismatch {
            partition: Partition::Rootfs,
            ..
        })
    );
}

#[test]
fn payload_verification() {
    let key = test_key();
    let (payload, _) = full_payload(Some(&key));
    let devices = Devices::zeroed();
    let plan = InstallPlan {
        is_full_update: true,
        ..signed_plan(&payload)
    };
    let mut applier = devices.applier(plan, fresh_prefs());
    let size = payload.data.len() as u64;

    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    applier.close().unwrap();

    applier.verify_payload(&payload.hash, size).unwrap();
    assert_matches!(
        applier.verify_payload(&payload.hash, size + 1),
        Err(Error::PayloadSizeMismatch { .. })
    );
    assert_matches!(
        applier.verify_payload(&[0u8; 32], size),
        Err(Error::PayloadHashMismatch { .. })
    );
}

#[test]
fn payload_verification_without_expected_hash() {
    let (payload, _) = full_payload(None);
    let devices = Devices::zeroed();
    let reporter = Arc::new(RecordingReporter::default());
    let plan = InstallPlan {
        public_key_path: Some(test_public_key_path()),
        payload_hash: vec![],
        ..unsigned_plan(&payload, true)
    };
    let mut applier = devices
        .applier(plan, fresh_prefs())
        .with_reporter(reporter.clone());
    let size = payload.data.len() as u64;

    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    applier.close().unwrap();

    // Size and signature are still checked.
    assert_matches!(
        applier.verify_payload(&[], size + 1),
        Err(Error::PayloadSizeMismatch { .. })
    );
    assert_matches!(
        applier.verify_payload(&[], size),
        Err(Error::MissingSignatureBlob)
    );
    assert_eq!(
        reporter.kinds(),
        [ErrorKind::MetadataSignatureError, ErrorKind::PayloadHashMismatch],
    );

    let key = test_key();
    let (payload, _) = full_payload(Some(&key));
    let plan = InstallPlan {
        is_full_update: true,
        payload_hash: vec![],
        ..signed_plan(&payload)
    };
    let mut applier = devices.applier(plan, fresh_prefs());

    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    applier.close().unwrap();
    applier
        .verify_payload(&[], payload.data.len() as u64)
        .unwrap();
}

#[test]
fn public_key_from_plan() {
    let key = test_key();
    let encoded_key = STANDARD.encode(fs::read(test_public_key_path()).unwrap());
    let (payload, _) = full_payload(Some(&key));
    let plan = InstallPlan {
        is_full_update: true,
        public_key_path: Some(PathBuf::from("/nonexistent/update-payload-key.pub.pem")),
        public_key_rsa: encoded_key.clone(),
        ..signed_plan(&payload)
    };

    let devices = Devices::zeroed();
    let mut applier = devices.applier(plan.clone(), fresh_prefs());
    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    applier.close().unwrap();
    applier
        .verify_payload(&payload.hash, payload.data.len() as u64)
        .unwrap();

    // Signed metadata cannot be checked without any key.
    let plan = InstallPlan {
        public_key_rsa: String::new(),
        ..plan
    };
    let mut applier = devices.applier(plan, fresh_prefs());
    let error = applier.write(&payload.data).unwrap_err();
    assert_matches!(error, Error::MissingPublicKey(_));
    assert_eq!(error.kind(), ErrorKind::MetadataSignatureError);

    // The key from the plan still requires a signed payload.
    let (payload, _) = full_payload(None);
    let plan = InstallPlan {
        public_key_rsa: encoded_key,
        ..unsigned_plan(&payload, true)
    };
    let devices = Devices::zeroed();
    let mut applier = devices.applier(plan, fresh_prefs());
    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    applier.close().unwrap();
    assert_matches!(
        applier.verify_payload(&payload.hash, payload.data.len() as u64),
        Err(Error::MissingSignatureBlob)
    );
}

#[test]
fn new_partition_info() {
    let info = |size: u64, byte: u8| PartitionInfo {
        size: Some(size),
        hash: Some(vec![byte; 32]),
    };
    let kernel_info = info(u64::from(BLOCK_SIZE), 0x44);
    let rootfs_info = info(block_offset(2) as u64, 0x55);

    let mut builder = PayloadBuilder::new(BLOCK_SIZE, FULL_PAYLOAD_MINOR_VERSION);
    builder
        .set_partition_info(Partition::Kernel, None, Some(kernel_info.clone()))
        .set_partition_info(Partition::Rootfs, None, Some(rootfs_info.clone()))
        .add_operation(
            Partition::Rootfs,
            operation(Type::Replace, vec![], vec![extent(0, 1)]),
            vec![1u8; BLOCK_SIZE as usize],
        );
    let payload = builder.build(None).unwrap();

    let devices = Devices::zeroed();
    let mut applier = devices.applier(unsigned_plan(&payload, true), fresh_prefs());
    assert_eq!(applier.new_partition_info(), None);

    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    assert_eq!(
        applier.new_partition_info(),
        Some((&kernel_info, &rootfs_info)),
    );

    // Both partitions must be described.
    let mut builder = PayloadBuilder::new(BLOCK_SIZE, FULL_PAYLOAD_MINOR_VERSION);
    builder
        .set_partition_info(Partition::Rootfs, None, Some(rootfs_info))
        .add_operation(
            Partition::Rootfs,
            operation(Type::Replace, vec![], vec![extent(0, 1)]),
            vec![1u8; BLOCK_SIZE as usize],
        );
    let payload = builder.build(None).unwrap();

    let mut applier = devices.applier(unsigned_plan(&payload, true), fresh_prefs());
    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    assert_eq!(applier.new_partition_info(), None);
}

#[test]
fn unsigned_payload_with_public_key() {
    let (payload, _) = full_payload(None);
    let devices = Devices::zeroed();
    let plan = InstallPlan {
        public_key_path: Some(test_public_key_path()),
        ..unsigned_plan(&payload, true)
    };
    let mut applier = devices.applier(plan, fresh_prefs());

    assert_matches!(applier.write(&payload.data), Ok(WriteStatus::Done));
    applier.close().unwrap();

    let error = applier
        .verify_payload(&payload.hash, payload.data.len() as u64)
        .unwrap_err();
    assert_matches!(error, Error::MissingSignatureBlob);
    assert_eq!(error.kind(), ErrorKind::PubKeySignatureError);
}

#[test]
fn cancel_before_operation() {
    let (payload, _) = full_payload(None);
    let devices = Devices::zeroed();
    let cancel = Arc::new(AtomicBool::new(false));
    let mut applier = devices
        .applier(unsigned_plan(&payload, true), fresh_prefs())
        .with_cancel(cancel.clone());

    let metadata_end = payload.metadata_size as usize;
    assert_matches!(
        applier.write(&payload.data[..metadata_end]),
        Ok(WriteStatus::Progress)
    );

    cancel.store(true, Ordering::SeqCst);

    let error = applier.write(&payload.data[metadata_end..]).unwrap_err();
    assert_matches!(error, Error::Cancelled(_));
    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert_eq!(applier.next_operation(), 0);
    assert!(devices.rootfs().iter().all(|b| *b == 0));
}

#[test]
fn exit_unblocked_between_writes() {
    let (payload, _, _) = delta_payload(Some(&test_key()));
    let devices = Devices::new(&old_rootfs(), &vec![0u8; block_offset(PARTITION_BLOCKS)]);
    let exit_blocker = Arc::new(ExitBlocker::new());
    let mut applier = devices
        .applier(delta_plan(&payload), fresh_prefs())
        .with_exit_blocker(exit_blocker.clone());

    for chunk in payload.data.chunks(100) {
        applier.write(chunk).unwrap();
        assert!(!exit_blocker.is_blocked());
    }

    assert_eq!(applier.next_operation(), applier.num_total_operations());
}

#[test]
fn unknown_operation_type() {
    let mut builder = PayloadBuilder::new(BLOCK_SIZE, FULL_PAYLOAD_MINOR_VERSION);
    builder.add_operation(
        Partition::Rootfs,
        InstallOperation {
            r#type: Some(42),
            dst_extents: vec![extent(0, 1)],
            ..Default::default()
        },
        vec![1u8; 16],
    );
    let payload = builder.build(None).unwrap();

    let devices = Devices::zeroed();
    let mut applier = devices.applier(unsigned_plan(&payload, true), fresh_prefs());

    let error = applier.write(&payload.data).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::OperationExecutionError);
}
