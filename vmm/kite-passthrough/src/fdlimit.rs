//! Process descriptor-budget policy.
//!
//! Every interrupt vector costs an event fd, so a device with a large MSI-X
//! table can blow straight through the default open-file limit mid-setup.
//! The estimate starts at a baseline covering the VMM's own descriptors and
//! grows with each capability initialized; the soft limit (and, where the
//! process may, the hard limit) is raised to match.

use std::sync::Mutex;

use log::warn;

use crate::lock;

/// Descriptors assumed in use before any interrupt vector is allocated.
const BASELINE: libc::rlim_t = 128;

/// Running estimate of the process's descriptor need.
static NEEDED: Mutex<libc::rlim_t> = Mutex::new(BASELINE);

/// Grows the descriptor estimate by `nr_vectors` and raises the open-file
/// limit to cover it.
///
/// Failure to raise the limit is a warning, not an error: setup continues
/// and may still fit under the existing limit. Safe to call repeatedly.
pub(crate) fn reserve(nr_vectors: usize) {
    let needed = {
        let mut estimate = lock(&NEEDED);
        *estimate += nr_vectors as libc::rlim_t;
        *estimate
    };

    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes the passed struct and has no other effects.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } < 0 {
        warn!(
            "failed to read the open-file limit: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    if limit.rlim_cur >= needed {
        return;
    }

    let raised = libc::rlimit {
        rlim_cur: needed,
        rlim_max: limit.rlim_max.max(needed),
    };
    // SAFETY: setrlimit only adjusts this process's resource limits.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } == 0 {
        return;
    }

    // Raising the hard limit needs privilege; settle for the soft limit
    // capped at the existing hard limit.
    let capped = libc::rlimit {
        rlim_cur: needed.min(limit.rlim_max),
        rlim_max: limit.rlim_max,
    };
    // SAFETY: as above.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &capped) } < 0 || capped.rlim_cur < needed {
        warn!(
            "could not raise the open-file limit to {needed}; \
             interrupt setup may exhaust descriptors"
        );
    }
}
