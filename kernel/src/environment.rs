// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Information about the environment the kernel core runs in: how many
//! cores we support and which core the calling context executes on.

use spin::Once;

/// Maximum number of cores (hardware threads) we support.
pub const MAX_CORES: usize = 8;

/// The platform's processor-identity service.
///
/// The registered function must return a stable id in `0..MAX_CORES` and
/// must be called with preemption/migration disabled for the duration of
/// the lookup (the platform decides how to guarantee that).
static CORE_ID_PROVIDER: Once<fn() -> usize> = Once::new();

/// Register the platform's processor-identity service.
///
/// May be called at most once, before the first allocation; later calls
/// are ignored.
pub fn set_core_id_provider(provider: fn() -> usize) {
    CORE_ID_PROVIDER.call_once(|| provider);
}

/// The core id of the current core (hardware thread).
///
/// Without a registered provider, hosted builds fall back to an id that is
/// pinned to the calling thread for its lifetime; bare-metal builds assume
/// core 0.
pub fn core_id() -> usize {
    if let Some(provider) = CORE_ID_PROVIDER.get() {
        let id = provider();
        assert!(id < MAX_CORES, "core id {} exceeds MAX_CORES", id);
        return id;
    }

    fallback_core_id()
}

#[cfg(not(target_os = "none"))]
fn fallback_core_id() -> usize {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

    std::thread_local! {
        static THREAD_CORE_ID: usize =
            NEXT_ID.fetch_add(1, Ordering::Relaxed) % MAX_CORES;
    }

    THREAD_CORE_ID.with(|id| *id)
}

#[cfg(target_os = "none")]
fn fallback_core_id() -> usize {
    0
}
