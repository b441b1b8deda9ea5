// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    format::payload::{self, PayloadHeader},
    stream::FromReader,
    util::NumBytes,
};

pub fn open_header(path: &Path) -> Result<PayloadHeader> {
    let reader = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open payload for reading: {path:?}"))?;
    let header = PayloadHeader::from_reader(reader)
        .with_context(|| format!("Failed to read payload header: {path:?}"))?;

    Ok(header)
}

pub fn info_main(cli: &InfoCli) -> Result<()> {
    let header = open_header(&cli.input)?;

    if cli.summary {
        let manifest = &header.manifest;
        let (num_rootfs, num_kernel) = payload::operation_counts(manifest);

        println!(
            "Type: {}",
            if header.is_full_update() { "full" } else { "delta" },
        );
        println!("Metadata size: {}", NumBytes(header.info.metadata_size));
        println!("Block size: {}", NumBytes(manifest.block_size()));
        println!("Minor version: {}", manifest.minor_version());
        println!("Rootfs operations: {num_rootfs}");
        println!("Kernel operations: {num_kernel}");
        println!("Signed: {}", manifest.signatures_offset.is_some());
    } else {
        println!("{header:#?}");
    }

    Ok(())
}

/// Show the header and manifest of a payload.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to payload binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Show a short summary instead of the full manifest.
    #[arg(long)]
    pub summary: bool,
}
