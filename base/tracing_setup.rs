// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Logic for setting up a `tracing` subscriber according to our preferences.

use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

/// Custom panic hook that logs instead of directly writing to stderr.
///
/// This means it includes a timestamp and is filterable like any other event.
fn panic_hook(p: &std::panic::PanicHookInfo) {
    let payload: Option<&str> = if let Some(s) = p.payload().downcast_ref::<&str>() {
        Some(*s)
    } else if let Some(s) = p.payload().downcast_ref::<String>() {
        Some(s)
    } else {
        None
    };
    error!(
        target: std::env!("CARGO_CRATE_NAME"),
        location = p.location().map(tracing::field::display),
        payload = payload.map(tracing::field::display),
        backtrace = %std::backtrace::Backtrace::force_capture(),
        "panic",
    );
}

/// Installs the global subscriber, the `log` bridge, and the panic hook.
///
/// The filter is controlled by `WORKER_LOG`, defaulting to `info`.
pub fn install() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .with_env_var("WORKER_LOG")
        .from_env_lossy();
    tracing_log::LogTracer::init().unwrap();

    let sub = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new()
            .with_writer(std::io::stderr)
            .with_filter(filter),
    );
    tracing::subscriber::set_global_default(sub).unwrap();
    let default_panic_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |p| {
        panic_hook(p);
        default_panic_hook(p);
    }));
}
