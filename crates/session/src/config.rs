use serde::{Deserialize, Serialize};

/// Session behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seed the next session with the committed clean entities after a
    /// successful commit.
    pub retain_identity_map: bool,
    /// Sweep every clean entity for changes before committing.
    pub detect_changes_on_commit: bool,
    /// Deepest cascade followed by persist and remove.
    pub max_cascade_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retain_identity_map: true,
            detect_changes_on_commit: true,
            max_cascade_depth: 256,
        }
    }
}

impl SessionConfig {
    pub const RETAIN_IDENTITY_MAP: &'static str = "DOCUNIT_RETAIN_IDENTITY_MAP";
    pub const DETECT_CHANGES_ON_COMMIT: &'static str = "DOCUNIT_DETECT_CHANGES_ON_COMMIT";
    pub const MAX_CASCADE_DEPTH: &'static str = "DOCUNIT_MAX_CASCADE_DEPTH";

    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = parse(&lookup, Self::RETAIN_IDENTITY_MAP, parse_flag) {
            config.retain_identity_map = v;
        }
        if let Some(v) = parse(&lookup, Self::DETECT_CHANGES_ON_COMMIT, parse_flag) {
            config.detect_changes_on_commit = v;
        }
        if let Some(v) = parse(&lookup, Self::MAX_CASCADE_DEPTH, |raw| {
            raw.parse::<usize>().ok().filter(|depth| *depth > 0)
        }) {
            config.max_cascade_depth = v;
        }
        config
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parser: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = parser(raw.trim());
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "ignoring unparsable setting; using default");
    }
    parsed
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        assert_eq!(SessionConfig::from_lookup(lookup(&[])), SessionConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = SessionConfig::from_lookup(lookup(&[
            (SessionConfig::RETAIN_IDENTITY_MAP, "false"),
            (SessionConfig::DETECT_CHANGES_ON_COMMIT, "0"),
            (SessionConfig::MAX_CASCADE_DEPTH, "8"),
        ]));
        assert!(!config.retain_identity_map);
        assert!(!config.detect_changes_on_commit);
        assert_eq!(config.max_cascade_depth, 8);
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        let config = SessionConfig::from_lookup(lookup(&[
            (SessionConfig::RETAIN_IDENTITY_MAP, "maybe"),
            (SessionConfig::MAX_CASCADE_DEPTH, "0"),
        ]));
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"detect_changes_on_commit": false}"#).unwrap();
        assert!(config.retain_identity_map);
        assert!(!config.detect_changes_on_commit);
    }
}
