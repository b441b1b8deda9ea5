// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read},
};

use prost::Message;
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes, byteorder::big_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    crypto,
    format::extent::SPARSE_HOLE,
    hash,
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, Extent, InstallOperation, PartitionInfo, Signatures,
        install_operation::Type, signatures::Signature,
    },
    stream::FromReader,
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";
pub const HEADER_SIZE: usize = std::mem::size_of::<RawHeader>();

/// The only payload major version this applier understands.
pub const SUPPORTED_MAJOR_VERSION: u64 = 1;
/// Minor version that all delta payloads must carry.
pub const SUPPORTED_MINOR_VERSION: u32 = 1;
/// Reserved minor version for full payloads.
pub const FULL_PAYLOAD_MINOR_VERSION: u32 = 0;

/// Version recorded in each [`Signature`] message.
const SIGNATURE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid payload magic: {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("Unsupported payload major version: {0}")]
    UnsupportedMajorVersion(u64),
    #[error("Manifest size {0} exceeds integer bounds")]
    ManifestTooLarge(u64),
    #[error("Payload contains no valid signatures")]
    NoSignatures,
    #[error("Signature blob size {actual} does not match reserved size {expected}")]
    SignatureSizeMismatch { expected: u64, actual: u64 },
    // Wrapped errors.
    #[error("Failed to decode manifest")]
    ManifestDecode(#[source] prost::DecodeError),
    #[error("Failed to decode signatures")]
    SignaturesDecode(#[source] prost::DecodeError),
    #[error("Failed to read payload data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the payload header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`PAYLOAD_MAGIC`].
    magic: [u8; 4],
    /// Major version. [`SUPPORTED_MAJOR_VERSION`] is the only version
    /// supported.
    major_version: big_endian::U64,
    /// Size of the serialized manifest that follows the header.
    manifest_size: big_endian::U64,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &self.magic)
            .field("major_version", &self.major_version.get())
            .field("manifest_size", &self.manifest_size.get())
            .finish()
    }
}

impl RawHeader {
    fn validate(&self) -> Result<()> {
        if self.magic != *PAYLOAD_MAGIC {
            return Err(Error::InvalidMagic(self.magic));
        }

        if self.major_version.get() != SUPPORTED_MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(self.major_version.get()));
        }

        Ok(())
    }
}

/// Fixed-size header fields that precede the manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub major_version: u64,
    pub manifest_size: u64,
    /// Size of the header plus the manifest.
    pub metadata_size: u64,
}

impl HeaderInfo {
    fn from_raw(header: &RawHeader) -> Result<Self> {
        header.validate()?;

        let manifest_size = header.manifest_size.get();
        let metadata_size = manifest_size
            .checked_add(HEADER_SIZE as u64)
            .ok_or(Error::ManifestTooLarge(manifest_size))?;

        Ok(Self {
            major_version: header.major_version.get(),
            manifest_size,
            metadata_size,
        })
    }
}

/// Parse and validate the fixed header at the start of `data`. Returns
/// [`None`] if `data` does not contain the full header yet.
pub fn parse_header(data: &[u8]) -> Result<Option<HeaderInfo>> {
    let Ok((header, _)) = RawHeader::read_from_prefix(data) else {
        return Ok(None);
    };

    HeaderInfo::from_raw(&header).map(Some)
}

pub fn decode_manifest(data: &[u8]) -> Result<DeltaArchiveManifest> {
    DeltaArchiveManifest::decode(data).map_err(Error::ManifestDecode)
}

/// Number of rootfs and kernel operations. Rootfs operations are applied
/// first.
pub fn operation_counts(manifest: &DeltaArchiveManifest) -> (u64, u64) {
    (
        manifest.install_operations.len() as u64,
        manifest.kernel_install_operations.len() as u64,
    )
}

#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub info: HeaderInfo,
    pub manifest: DeltaArchiveManifest,
}

impl PayloadHeader {
    pub fn is_full_update(&self) -> bool {
        self.manifest.old_kernel_info.is_none() && self.manifest.old_rootfs_info.is_none()
    }
}

impl<R: Read> FromReader<R> for PayloadHeader {
    type Error = Error;

    /// Read the header and manifest. After this function returns, the reader
    /// is positioned at the start of the blob section.
    fn from_reader(mut reader: R) -> Result<Self> {
        let header = RawHeader::read_from_io(&mut reader)
            .map_err(|e| Error::DataRead("header", e))?;
        let info = HeaderInfo::from_raw(&header)?;

        let mut manifest_raw = vec![];
        reader
            .by_ref()
            .take(info.manifest_size)
            .read_to_end(&mut manifest_raw)
            .map_err(|e| Error::DataRead("manifest", e))?;

        if manifest_raw.len() as u64 != info.manifest_size {
            return Err(Error::DataRead(
                "manifest",
                io::Error::from(io::ErrorKind::UnexpectedEof),
            ));
        }

        let manifest = decode_manifest(&manifest_raw)?;

        Ok(Self { info, manifest })
    }
}

/// Sign `digest` and wrap the signature in a [`Signatures`] message.
fn sign_to_signatures(digest: &[u8], key: &RsaPrivateKey) -> Result<Signatures> {
    let data = crypto::sign_sha256_digest(key, digest)?;

    Ok(Signatures {
        signatures: vec![Signature {
            version: Some(SIGNATURE_VERSION),
            data: Some(data),
        }],
    })
}

/// Verify `digest` against a serialized [`Signatures`] message. One valid
/// signature is sufficient.
pub fn verify_signature_blob(blob: &[u8], digest: &[u8], key: &RsaPublicKey) -> Result<()> {
    let signatures = Signatures::decode(blob).map_err(Error::SignaturesDecode)?;
    let mut last_error = None;

    for signature in &signatures.signatures {
        let Some(data) = &signature.data else {
            continue;
        };

        match crypto::verify_sha256_digest(key, digest, data) {
            Ok(()) => return Ok(()),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.map_or(Error::NoSignatures, Error::from))
}

/// Which target device an operation applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partition {
    Rootfs,
    Kernel,
}

impl Partition {
    pub fn name(self) -> &'static str {
        match self {
            Self::Rootfs => "rootfs",
            Self::Kernel => "kernel",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fully assembled payload.
#[derive(Clone)]
pub struct BuiltPayload {
    pub data: Vec<u8>,
    pub manifest: DeltaArchiveManifest,
    /// Size of the header plus the manifest.
    pub metadata_size: u64,
    /// Raw RSA signature of the metadata, if the payload was signed.
    pub metadata_signature: Option<Vec<u8>>,
    /// SHA-256 of the entire payload.
    pub hash: [u8; hash::DIGEST_SIZE],
}

impl fmt::Debug for BuiltPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltPayload")
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .field("manifest", &self.manifest)
            .field("metadata_size", &self.metadata_size)
            .field(
                "metadata_signature",
                &self.metadata_signature.as_ref().map(hex::encode),
            )
            .field("hash", &hex::encode(self.hash))
            .finish()
    }
}

/// Assembles payloads in memory. The blob section is laid out in operation
/// order (rootfs first) with no gaps, and each operation with data gets its
/// offset, length, and SHA-256 filled in.
#[derive(Clone, Debug)]
pub struct PayloadBuilder {
    rootfs: Vec<(InstallOperation, Vec<u8>)>,
    kernel: Vec<(InstallOperation, Vec<u8>)>,
    manifest: DeltaArchiveManifest,
}

impl PayloadBuilder {
    pub fn new(block_size: u32, minor_version: u32) -> Self {
        Self {
            rootfs: vec![],
            kernel: vec![],
            manifest: DeltaArchiveManifest {
                block_size: Some(block_size),
                minor_version: Some(minor_version),
                ..Default::default()
            },
        }
    }

    pub fn block_size(&self) -> u32 {
        self.manifest.block_size()
    }

    /// Set the expected partition image before and after the update. Full
    /// payloads must not set `old`.
    pub fn set_partition_info(
        &mut self,
        partition: Partition,
        old: Option<PartitionInfo>,
        new: Option<PartitionInfo>,
    ) -> &mut Self {
        match partition {
            Partition::Rootfs => {
                self.manifest.old_rootfs_info = old;
                self.manifest.new_rootfs_info = new;
            }
            Partition::Kernel => {
                self.manifest.old_kernel_info = old;
                self.manifest.new_kernel_info = new;
            }
        }
        self
    }

    /// Append an operation. `data` is the operation's blob and may be empty
    /// for operations that do not reference the blob section.
    pub fn add_operation(
        &mut self,
        partition: Partition,
        operation: InstallOperation,
        data: impl Into<Vec<u8>>,
    ) -> &mut Self {
        let entry = (operation, data.into());

        match partition {
            Partition::Rootfs => self.rootfs.push(entry),
            Partition::Kernel => self.kernel.push(entry),
        }
        self
    }

    /// Assemble the payload. If `key` is specified, the metadata is signed
    /// and a signature operation is appended to the kernel operations.
    pub fn build(mut self, key: Option<&RsaPrivateKey>) -> Result<BuiltPayload> {
        let mut blobs = vec![];

        let mut place = |entries: Vec<(InstallOperation, Vec<u8>)>| {
            entries
                .into_iter()
                .map(|(mut op, data)| {
                    if !data.is_empty() {
                        op.data_offset = Some(blobs.len() as u64);
                        op.data_length = Some(data.len() as u64);
                        if op.data_sha256_hash.is_none() {
                            op.data_sha256_hash = Some(hash::sha256(&data).to_vec());
                        }
                        blobs.extend_from_slice(&data);
                    }
                    op
                })
                .collect::<Vec<_>>()
        };

        self.manifest.install_operations = place(self.rootfs);
        self.manifest.kernel_install_operations = place(self.kernel);

        // The size of the signature message must be known before the manifest
        // is serialized since the offset and size are part of the signed data.
        // A signature's size only depends on the key size.
        let signatures_size = match key {
            Some(k) => {
                let dummy = sign_to_signatures(&hash::sha256(b""), k)?;
                let size = dummy.encoded_len() as u64;
                let block_size = u64::from(self.manifest.block_size());

                self.manifest.signatures_offset = Some(blobs.len() as u64);
                self.manifest.signatures_size = Some(size);

                let op = InstallOperation {
                    r#type: Some(Type::Replace.into()),
                    data_offset: Some(blobs.len() as u64),
                    data_length: Some(size),
                    dst_extents: vec![Extent {
                        start_block: Some(SPARSE_HOLE),
                        num_blocks: Some(size.div_ceil(block_size)),
                    }],
                    ..Default::default()
                };
                self.manifest.kernel_install_operations.push(op);

                Some(size)
            }
            None => None,
        };

        let manifest_raw = self.manifest.encode_to_vec();
        let header = RawHeader {
            magic: *PAYLOAD_MAGIC,
            major_version: SUPPORTED_MAJOR_VERSION.into(),
            manifest_size: (manifest_raw.len() as u64).into(),
        };

        let mut data = Vec::with_capacity(HEADER_SIZE + manifest_raw.len() + blobs.len());
        data.extend_from_slice(header.as_bytes());
        data.extend_from_slice(&manifest_raw);

        let metadata_size = data.len() as u64;
        let metadata_signature = key
            .map(|k| crypto::sign_sha256_digest(k, &hash::sha256(&data)))
            .transpose()?;

        data.extend_from_slice(&blobs);

        if let (Some(k), Some(expected)) = (key, signatures_size) {
            let signatures = sign_to_signatures(&hash::sha256(&data), k)?;
            let signatures_raw = signatures.encode_to_vec();

            if signatures_raw.len() as u64 != expected {
                return Err(Error::SignatureSizeMismatch {
                    expected,
                    actual: signatures_raw.len() as u64,
                });
            }

            data.extend_from_slice(&signatures_raw);
        }

        let hash = hash::sha256(&data);

        Ok(BuiltPayload {
            data,
            manifest: self.manifest,
            metadata_size,
            metadata_signature,
            hash,
        })
    }
}
