use std::sync::{Mutex, MutexGuard};

use url::Url;

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Guarded state in gavel is updated in single assignments or inserts, so a
/// poisoned guard still holds a consistent value.
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(state = %what, "Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

/// Rate-limit key for a URL: its lower-cased host.
///
/// Returns `None` for URLs without a host.
pub fn domain_key(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    url.host_str().map(|h| h.to_ascii_lowercase())
}
