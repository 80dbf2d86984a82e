//! Glob-based ignore patterns over relative, slash-separated paths

use glob::{MatchOptions, Pattern};
use treesync_types::{Error, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Ordered set of shell-style globs
///
/// Patterns are matched against the whole relative path, not the file name,
/// so `logs/*.log` only covers files directly under `logs/` and `*` never
/// crosses a `/`. Use `**/` to match at any depth.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    /// Compile `patterns`, failing on the first invalid glob
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|raw| {
                let raw = raw.as_ref();
                Pattern::new(raw)
                    .map_err(|e| Error::config(format!("invalid ignore pattern '{}': {}", raw, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    /// A set that ignores nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether `relative_path` matches any pattern
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_with(relative_path, MATCH_OPTIONS))
    }

    /// Number of patterns
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the set has no patterns
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The patterns in their original order
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Pattern::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("logs/*.log", "logs/app.log", true)]
    #[case("logs/*.log", "logs/old/app.log", false)]
    #[case("logs/*.log", "app.log", false)]
    #[case("*.cfg", "user.cfg", true)]
    #[case("*.cfg", "conf/user.cfg", false)]
    #[case("**/*.cfg", "conf/user.cfg", true)]
    #[case("**/*.cfg", "user.cfg", true)]
    #[case(".autoupdate", ".autoupdate", true)]
    #[case("*.autoupdatetmpfile", "game.exe.autoupdatetmpfile", true)]
    #[case("saves/**", "saves/slot1/data.bin", true)]
    fn test_matches_full_relative_path(
        #[case] pattern: &str,
        #[case] path: &str,
        #[case] ignored: bool,
    ) {
        let set = IgnoreSet::new([pattern]).unwrap();
        assert_eq!(set.is_ignored(path), ignored);
    }

    #[test]
    fn test_empty_set_ignores_nothing() {
        let set = IgnoreSet::empty();
        assert!(set.is_empty());
        assert!(!set.is_ignored("anything.txt"));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = IgnoreSet::new(["[unclosed"]).unwrap_err();
        assert_eq!(err.kind(), treesync_types::ErrorKind::Config);
    }

    #[test]
    fn test_patterns_keep_order() {
        let set = IgnoreSet::new(["b/*", "a/*"]).unwrap();
        assert_eq!(set.patterns().collect::<Vec<_>>(), vec!["b/*", "a/*"]);
        assert_eq!(set.len(), 2);
    }
}
