// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::sync::{atomic::AtomicBool, atomic::Ordering};

#[doc(hidden)]
pub use log as _log;

#[macro_export]
macro_rules! info {
    ($msg:literal, $($arg:tt)+) => {
        awg_log::_log::info!(target: concat!("awg.rust::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        awg_log::_log::info!(target: concat!("awg.rust::", module_path!()), $msg);
    };
}

#[macro_export]
macro_rules! warn {
    ($msg:literal, $($arg:tt)+) => {
        awg_log::_log::warn!(target: concat!("awg.rust::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        awg_log::_log::warn!(target: concat!("awg.rust::", module_path!()), $msg);
    };
}

#[macro_export]
macro_rules! debug {
    ($msg:literal, $($arg:tt)+) => {
        awg_log::_log::debug!(target: concat!("awg.rust::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        awg_log::_log::debug!(target: concat!("awg.rust::", module_path!()), $msg);
    };
}

/// Log a diagnostic message at info level if diagnostics logging is enabled.
///
/// Used for the per-poll status of compile and upload jobs, which is too
/// chatty for the regular info level.
#[macro_export]
macro_rules! diagnostic {
    ($msg:literal, $($arg:tt)+) => {
        if awg_log::is_diagnostics_enabled() {
             awg_log::_log::info!(target: concat!("awg.rust::", module_path!()), $msg, $($arg)+);
        }
    };
    ($msg:literal) => {
        if awg_log::is_diagnostics_enabled() {
            awg_log::_log::info!(target: concat!("awg.rust::", module_path!()), $msg);
        }
    };
}

static DIAGNOSTICS_ENABLED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_diagnostics_enabled() -> bool {
    DIAGNOSTICS_ENABLED.load(Ordering::Acquire)
}

/// Initialize the logging.
///
/// This function is meant to be called once at the start of the program.
/// It does not install a concrete logger: the embedding application chooses
/// the `log` backend. Only the diagnostics flag is set here.
pub fn init_logging(with_diagnostics: bool) {
    DIAGNOSTICS_ENABLED.store(with_diagnostics, Ordering::Release);
}
