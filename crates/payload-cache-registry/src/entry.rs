//! Cache file name codec.
//!
//! A cached entry is fully described by its file name:
//!
//! ```text
//! <prefix>.<timestamp_ms>.<key>[.<schema_version>].<ext>
//! ```
//!
//! so the registry index can be rebuilt from a directory listing without
//! reading any file content. Neither the prefix, the key nor the extension
//! may contain a `.`, which keeps decoding the exact inverse of encoding.

/// Key given to entries migrated from the legacy single-file layout.
pub(crate) const LEGACY_KEY: &str = "legacy";

/// One cached file known to a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CachedEntry {
    pub key: String,
    pub timestamp_ms: i64,
    pub filename: String,
    pub schema_version: Option<u32>,
}

impl CachedEntry {
    pub fn new(
        prefix: &str,
        extension: &str,
        key: &str,
        timestamp_ms: i64,
        schema_version: Option<u32>,
    ) -> Self {
        Self {
            key: key.to_string(),
            timestamp_ms,
            filename: Self::filename_for(prefix, extension, key, timestamp_ms, schema_version),
            schema_version,
        }
    }

    pub fn filename_for(
        prefix: &str,
        extension: &str,
        key: &str,
        timestamp_ms: i64,
        schema_version: Option<u32>,
    ) -> String {
        match schema_version {
            Some(version) => format!("{prefix}.{timestamp_ms}.{key}.{version}.{extension}"),
            None => format!("{prefix}.{timestamp_ms}.{key}.{extension}"),
        }
    }

    /// Decode a file name produced by [`CachedEntry::filename_for`].
    ///
    /// Returns `None` for names that belong to another prefix or extension,
    /// or that are not in the exact form `filename_for` produces.
    pub fn from_filename(prefix: &str, extension: &str, filename: &str) -> Option<Self> {
        let parts: Vec<&str> = filename.split('.').collect();
        let (timestamp, key, version) = match parts.as_slice() {
            [p, ts, key, ext] if *p == prefix && *ext == extension => (*ts, *key, None),
            [p, ts, key, version, ext] if *p == prefix && *ext == extension => {
                (*ts, *key, Some(version.parse::<u32>().ok()?))
            }
            _ => return None,
        };

        if !is_valid_segment(key) {
            return None;
        }
        let timestamp_ms = timestamp.parse::<i64>().ok()?;

        // Names like `payload.007.k.json` parse but would never be written.
        if Self::filename_for(prefix, extension, key, timestamp_ms, version) != filename {
            return None;
        }

        Some(Self {
            key: key.to_string(),
            timestamp_ms,
            filename: filename.to_string(),
            schema_version: version,
        })
    }
}

/// A prefix, key or extension that can be embedded in a cache file name.
pub(crate) fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains(['.', '/', '\\', '\0'])
        && !segment.ends_with("-tmp")
        && !segment.ends_with("-new")
        && !segment.ends_with("-old")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_prefix_timestamp_key_and_extension() {
        let entry = CachedEntry::new("payload", "json", "a1b2", 1_700_000_000_123, None);
        assert_eq!(entry.filename, "payload.1700000000123.a1b2.json");

        let versioned = CachedEntry::new("last_session", "json", "s1", 42, Some(2));
        assert_eq!(versioned.filename, "last_session.42.s1.2.json");
    }

    #[test]
    fn decoding_inverts_encoding() {
        for version in [None, Some(0), Some(7)] {
            let entry = CachedEntry::new("payload", "json", "k", -5, version);
            let decoded = CachedEntry::from_filename("payload", "json", &entry.filename);
            assert_eq!(decoded, Some(entry));
        }
    }

    #[test]
    fn rejects_foreign_and_malformed_names() {
        let cases = [
            "payload.json",
            "last_session.1.k.json",
            "payload.1.k.txt",
            "payload.notanumber.k.json",
            "payload.1.k.v2.json",
            "payload.1.k.json-tmp",
            "payload.1.a.b.c.json",
            "pending_calls.json",
        ];
        for name in cases {
            assert_eq!(CachedEntry::from_filename("payload", "json", name), None, "{name}");
        }
    }

    #[test]
    fn rejects_non_canonical_numbers() {
        let cases = [
            "payload.007.k.json",
            "payload.+7.k.json",
            "payload.-0.k.json",
            "payload.7.k.+2.json",
            "payload.7.k.02.json",
        ];
        for name in cases {
            assert_eq!(CachedEntry::from_filename("payload", "json", name), None, "{name}");
        }
        assert!(CachedEntry::from_filename("payload", "json", "payload.7.k.2.json").is_some());
    }

    #[test]
    fn segments_cannot_smuggle_separators() {
        assert!(is_valid_segment("3f2a9c"));
        assert!(!is_valid_segment(""));
        assert!(!is_valid_segment("a.b"));
        assert!(!is_valid_segment("a/b"));
        assert!(!is_valid_segment("draft-tmp"));
    }
}
