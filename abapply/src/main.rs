// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use abapply::update::terminator::ExitBlocker;
use tracing::error;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    // The first signal cancels the update between operations. A repeated
    // signal exits immediately, unless a non-idempotent operation or a
    // checkpoint write is in progress.
    let cancel_signal = Arc::new(AtomicBool::new(false));
    let exit_blocker = Arc::new(ExitBlocker::new());
    {
        let signal = cancel_signal.clone();
        let blocker = exit_blocker.clone();

        ctrlc::set_handler(move || {
            if signal.swap(true, Ordering::SeqCst) && blocker.request_exit() {
                std::process::exit(130);
            }
        })
        .expect("Failed to set signal handler");
    }

    match abapply::cli::args::main(&LOGGING_INITIALIZED, &cancel_signal, &exit_blocker) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
                error!("{e:?}");
            } else {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
