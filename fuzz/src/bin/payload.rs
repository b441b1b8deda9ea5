// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use abapply::{
        format::{extent::Positions, payload::PayloadHeader},
        stream::FromReader,
        update::operation,
    };
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let reader = Cursor::new(data);
                let Ok(header) = PayloadHeader::from_reader(reader) else {
                    return;
                };

                let manifest = &header.manifest;
                let block_size = manifest.block_size();
                if block_size == 0 {
                    return;
                }

                for op in manifest
                    .install_operations
                    .iter()
                    .chain(&manifest.kernel_install_operations)
                {
                    let _ = operation::operation_type(op);
                    let _ = operation::is_idempotent(op);
                    let _ = Positions::from_extents(&op.src_extents, block_size, op.src_length());
                    let _ = Positions::from_extents(&op.dst_extents, block_size, op.dst_length());
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
