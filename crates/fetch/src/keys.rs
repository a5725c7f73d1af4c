//! Store key layout
//!
//! Queue keys look like `[namespace:]queue:<name>`; the schedule and dead
//! sets live at `[namespace:]<set>`.

const QUEUE_SEGMENT: &str = "queue:";

/// Prefix a key with the namespace, if any
pub fn namespaced(namespace: Option<&str>, key: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}:{key}"),
        _ => key.to_string(),
    }
}

/// Store key of a named queue
pub fn queue_key(namespace: Option<&str>, name: &str) -> String {
    namespaced(namespace, &format!("{QUEUE_SEGMENT}{name}"))
}

/// Queue name of a queue key: everything after the last `queue:` segment
pub fn queue_name(key: &str) -> &str {
    key.rfind(QUEUE_SEGMENT)
        .map_or(key, |idx| &key[idx + QUEUE_SEGMENT.len()..])
}
