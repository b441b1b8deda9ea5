// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Appliers for individual install operations. All of them write directly to
//! the target device.

use std::{
    fs::File,
    io::{self, Write},
};

use bzip2::write::BzDecoder;
use thiserror::Error;
use tracing::trace;

use crate::{
    format::extent::{self, ExtentRanges, Positions},
    protobuf::chromeos_update_engine::{InstallOperation, install_operation::Type},
    stream::{self, ExtentWriter, ReadAt, WriteAt},
    update::patch::{self, PatchApplier},
};

const PATCH_FILE_PREFIX: &str = "au_patch.";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown operation type: {0}")]
    UnknownType(i32),
    #[error("Source has {src} blocks, but destination has {dst} blocks")]
    BlockCountMismatch { src: u64, dst: u64 },
    #[error("Operation has no destination extents")]
    NoDestination,
    #[error("Data is {actual} bytes, but operation requires {expected} bytes")]
    DataTooShort { expected: u64, actual: u64 },
    #[error("Failed to {0}")]
    Io(&'static str, #[source] io::Error),
    #[error("Extent error")]
    Extent(#[from] extent::Error),
    #[error("Failed to apply patch")]
    Patch(#[from] patch::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Get the operation type, rejecting values this applier does not know.
pub fn operation_type(op: &InstallOperation) -> Result<Type> {
    let raw = op.r#type.unwrap_or_default();
    Type::try_from(raw).map_err(|_| Error::UnknownType(raw))
}

/// Whether the operation only reads its data blob and never the target.
pub fn has_data_blob(op_type: Type) -> bool {
    op_type != Type::Move
}

/// Whether the operation can be interrupted and repeated safely. This is the
/// case if none of the source blocks are also destination blocks. Operations
/// that read nothing from the target are always idempotent.
pub fn is_idempotent(op: &InstallOperation) -> bool {
    if op.src_extents.is_empty() {
        return true;
    }

    let mut src_ranges = ExtentRanges::new();
    src_ranges.add_extents(&op.src_extents);
    let block_count = src_ranges.blocks();
    src_ranges.subtract_extents(&op.dst_extents);

    block_count == src_ranges.blocks()
}

fn blob<'a>(op: &InstallOperation, data: &'a [u8]) -> Result<&'a [u8]> {
    let length = op.data_length();

    usize::try_from(length)
        .ok()
        .and_then(|n| data.get(..n))
        .ok_or(Error::DataTooShort {
            expected: length,
            actual: data.len() as u64,
        })
}

/// Write the (possibly bzip2-compressed) data blob to the destination
/// extents. The remainder of the last written block is zero-filled.
pub fn apply_replace(
    target: impl WriteAt,
    op: &InstallOperation,
    block_size: u32,
    data: &[u8],
) -> Result<()> {
    let data = blob(op, data)?;
    let mut writer = ExtentWriter::new(target, &op.dst_extents, block_size);

    match operation_type(op)? {
        Type::ReplaceBz => {
            let mut decoder = BzDecoder::new(&mut writer);
            decoder
                .write_all(data)
                .and_then(|()| decoder.finish())
                .map_err(|e| Error::Io("decompress data", e))?;
        }
        _ => {
            writer
                .write_all(data)
                .map_err(|e| Error::Io("write data", e))?;
        }
    }

    let written = writer
        .finish()
        .map_err(|e| Error::Io("pad final block", e))?;
    trace!("Replaced {written} bytes");

    Ok(())
}

/// Copy the source extents to the destination extents through memory.
/// Overlapping source and destination ranges are not handled specially.
pub fn apply_move(target: impl ReadAt + WriteAt, op: &InstallOperation, block_size: u32) -> Result<()> {
    let src_blocks = extent::total_blocks(&op.src_extents).unwrap_or(u64::MAX);
    let dst_blocks = extent::total_blocks(&op.dst_extents).unwrap_or(u64::MAX);
    if src_blocks != dst_blocks {
        return Err(Error::BlockCountMismatch {
            src: src_blocks,
            dst: dst_blocks,
        });
    }

    let buf = stream::read_extents(&target, &op.src_extents, block_size)
        .map_err(|e| Error::Io("read source extents", e))?;

    let mut writer = ExtentWriter::new(&target, &op.dst_extents, block_size);
    writer
        .write_all(&buf)
        .and_then(|()| writer.finish())
        .map_err(|e| Error::Io("write destination extents", e))?;

    Ok(())
}

/// Apply a binary diff with an external patch tool. The patch is read from a
/// temporary file. If the destination length is not block aligned, the rest
/// of the final destination block is zero-filled afterwards.
pub fn apply_bsdiff(
    target: &File,
    op: &InstallOperation,
    block_size: u32,
    data: &[u8],
    patcher: &dyn PatchApplier,
) -> Result<()> {
    let data = blob(op, data)?;

    let src_positions = Positions::from_extents(&op.src_extents, block_size, op.src_length())?;
    let dst_positions = Positions::from_extents(&op.dst_extents, block_size, op.dst_length())?;

    let mut patch_file = tempfile::Builder::new()
        .prefix(PATCH_FILE_PREFIX)
        .tempfile()
        .map_err(|e| Error::Io("create patch file", e))?;
    patch_file
        .write_all(data)
        .and_then(|()| patch_file.flush())
        .map_err(|e| Error::Io("write patch file", e))?;

    patcher.apply(target, patch_file.path(), &src_positions, &dst_positions)?;

    let remainder = op.dst_length() % u64::from(block_size);
    if remainder != 0 {
        let last = op.dst_extents.last().ok_or(Error::NoDestination)?;
        let index = op.dst_extents.len() - 1;

        if let (Some(offset), length) = extent::byte_range(index, last, block_size)? {
            let padding = u64::from(block_size) - remainder;
            stream::write_zeros_at(target, offset + length - padding, padding)
                .map_err(|e| Error::Io("zero final block", e))?;
        }
    }

    Ok(())
}
