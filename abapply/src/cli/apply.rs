// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{Read, Seek, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

use crate::{
    cli::{status, warning},
    update::{
        applier::{PayloadApplier, WriteStatus},
        checkpoint::ResumePoint,
        patch::{BspatchApplier, DEFAULT_BSPATCH_PATH},
        plan::InstallPlan,
        prefs::{FilePrefs, KEY_UPDATE_CHECK_RESPONSE_HASH, Prefs, PrefsExt},
        terminator::ExitBlocker,
    },
    util::{self, NumBytes},
};

fn read_plan(path: Option<&Path>) -> Result<InstallPlan> {
    let Some(path) = path else {
        return Ok(InstallPlan::default());
    };

    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read install plan TOML: {path:?}"))?;
    let plan = toml_edit::de::from_str(&data)
        .with_context(|| format!("Failed to parse install plan TOML: {path:?}"))?;

    Ok(plan)
}

/// Decide which byte ranges of the payload to stream. Stale progress from a
/// different update is discarded.
fn plan_ranges(prefs: &dyn Prefs, plan: &InstallPlan, payload_size: u64) -> Result<Vec<Range<u64>>> {
    if PayloadApplier::can_resume(prefs, &plan.response_hash) {
        let point = ResumePoint::from_prefs(prefs).context("Failed to read resume point")?;

        status!(
            "Resuming update at data offset {} after {} of metadata",
            point.data_offset,
            NumBytes(point.metadata_size),
        );

        return Ok(point.ranges(payload_size).to_vec());
    }

    PayloadApplier::reset_update_progress(prefs, false)
        .context("Failed to reset update progress")?;
    prefs
        .set_string(KEY_UPDATE_CHECK_RESPONSE_HASH, &plan.response_hash)
        .context("Failed to save response hash")?;

    Ok(vec![0..payload_size])
}

pub fn apply_main(
    cli: &ApplyCli,
    cancel_signal: &Arc<AtomicBool>,
    exit_blocker: &Arc<ExitBlocker>,
) -> Result<()> {
    let mut plan = read_plan(cli.plan.as_deref())?;
    if let Some(path) = &cli.public_key {
        plan.public_key_path = Some(path.clone());
    }

    let mut reader = File::open(&cli.payload)
        .with_context(|| format!("Failed to open payload for reading: {:?}", cli.payload))?;
    let payload_size = reader
        .seek(SeekFrom::End(0))
        .with_context(|| format!("Failed to get file size: {:?}", cli.payload))?;

    if plan.payload_size == 0 {
        plan.payload_size = payload_size;
    }

    let prefs: Arc<dyn Prefs> = Arc::new(
        FilePrefs::new(&cli.prefs)
            .with_context(|| format!("Failed to open prefs directory: {:?}", cli.prefs))?,
    );

    let ranges = plan_ranges(&*prefs, &plan, payload_size)?;

    let mut applier = PayloadApplier::open(plan.clone(), &cli.rootfs, &cli.kernel, prefs.clone())
        .context("Failed to open target devices")?
        .with_patch_applier(Arc::new(BspatchApplier::new(&cli.patch_tool)))
        .with_cancel(cancel_signal.clone())
        .with_exit_blocker(exit_blocker.clone());

    let mut buf = vec![0u8; cli.chunk_size];
    let mut status = WriteStatus::NeedMoreData;

    for range in ranges {
        reader
            .seek(SeekFrom::Start(range.start))
            .with_context(|| format!("Failed to seek payload to {}", range.start))?;

        let mut remaining = range.end - range.start;

        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;

            reader
                .read_exact(&mut buf[..n])
                .with_context(|| format!("Failed to read payload: {:?}", cli.payload))?;

            status = applier
                .write(&buf[..n])
                .map_err(|e| {
                    let kind = e.kind();
                    anyhow::Error::new(e).context(format!("Failed to apply payload ({kind:?})"))
                })?;

            remaining -= n as u64;
        }
    }

    applier.close().context("Failed to close target devices")?;

    if status != WriteStatus::Done {
        bail!(
            "Payload ended after {} of {} operations",
            applier.next_operation(),
            applier.num_total_operations(),
        );
    }

    if plan.payload_hash.is_empty() {
        warning!("Install plan has no payload hash; only verifying size and signature");
    }

    applier
        .verify_payload(&plan.payload_hash, plan.payload_size)
        .map_err(|e| {
            let kind = e.kind();
            anyhow::Error::new(e).context(format!("Failed to verify payload ({kind:?})"))
        })?;

    if let Some((kernel, rootfs)) = applier.new_partition_info() {
        for (name, info) in [("kernel", kernel), ("rootfs", rootfs)] {
            info!(
                "New {name}: {} with hash {}",
                NumBytes(info.size()),
                util::hash_to_base64(info.hash()),
            );
        }
    }

    PayloadApplier::reset_update_progress(&*prefs, false)
        .context("Failed to reset update progress")?;

    info!("Applied {} operations", applier.num_total_operations());
    status!("Update applied successfully");

    Ok(())
}

fn parse_chunk_size(value: &str) -> Result<usize> {
    let size: usize = value.parse().context("Not a number")?;
    if size == 0 {
        bail!("Chunk size must be non-zero");
    }

    Ok(size)
}

/// Apply an update payload to the inactive rootfs and kernel devices.
///
/// Progress is saved to the prefs directory after each operation. If the
/// same update (identified by the response hash in the install plan) is
/// applied again after an interruption, it resumes where it left off.
#[derive(Debug, Parser)]
pub struct ApplyCli {
    /// Path to payload binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub payload: PathBuf,

    /// Path to target rootfs device.
    #[arg(long, value_name = "DEVICE", value_parser)]
    pub rootfs: PathBuf,

    /// Path to target kernel device.
    #[arg(long, value_name = "DEVICE", value_parser)]
    pub kernel: PathBuf,

    /// Path to install plan TOML.
    ///
    /// If omitted, hash checks are not mandatory and no metadata signature,
    /// source hashes, or payload hash are known.
    #[arg(long, value_name = "FILE", value_parser)]
    pub plan: Option<PathBuf>,

    /// Directory for persisting update progress.
    #[arg(long, value_name = "DIR", value_parser)]
    pub prefs: PathBuf,

    /// Number of bytes to feed to the applier at a time.
    #[arg(long, value_name = "BYTES", value_parser = parse_chunk_size, default_value = "131072")]
    pub chunk_size: usize,

    /// bspatch-compatible program for applying binary diffs.
    #[arg(long, value_name = "PROGRAM", value_parser, default_value = DEFAULT_BSPATCH_PATH)]
    pub patch_tool: PathBuf,

    /// Public key for verifying signatures. Overrides the install plan.
    #[arg(long, value_name = "FILE", value_parser)]
    pub public_key: Option<PathBuf>,
}
