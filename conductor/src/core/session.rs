//! Executor session identifiers.

use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};

/// `sess-<yyyymmddHHMMSS>-<6 lowercase alphanumerics>`.
pub fn build_session_id(at: DateTime<Utc>, short_id: &str) -> String {
    format!("sess-{}-{short_id}", at.format("%Y%m%d%H%M%S"))
}

/// Fresh session id for a spawn happening now.
pub fn new_session_id() -> String {
    build_session_id(Utc::now(), &generate_short_id())
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_timestamp_and_suffix() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("time");
        assert_eq!(build_session_id(at, "abc123"), "sess-20260304050607-abc123");
    }

    #[test]
    fn fresh_ids_differ() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("sess-"));
        assert_eq!(a.len(), "sess-20260101000000-abcdef".len());
    }
}
