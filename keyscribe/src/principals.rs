// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Narrowing the principals requested in a certificate.
//!
//! Patterns are shell-style globs (`*`, `?`, `[...]`) matched case-sensitively against the whole
//! principal. A principal survives if it matches the include pattern (when one is set) and does
//! not match the exclude pattern (when one is set).

use glob::{MatchOptions, Pattern};

use crate::error::PatternError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// The raw inputs to a principal filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrincipalSpec {
    pub candidates: Vec<String>,
    pub include: Option<String>,
    pub exclude: Option<String>,
}

impl PrincipalSpec {
    /// Apply the include and exclude patterns to the candidates.
    pub fn filter(&self) -> Result<Vec<String>, PatternError> {
        let filter = PrincipalFilter::new(self.include.as_deref(), self.exclude.as_deref())?;
        Ok(filter.apply(&self.candidates))
    }
}

/// Compiled include and exclude patterns.
#[derive(Debug, Clone, Default)]
pub struct PrincipalFilter {
    include: Option<Pattern>,
    exclude: Option<Pattern>,
}

impl PrincipalFilter {
    /// Compile the patterns. Empty patterns are the same as no pattern.
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self, PatternError> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Returns true if the principal passes both patterns.
    pub fn matches(&self, principal: &str) -> bool {
        let included = self
            .include
            .as_ref()
            .is_none_or(|pattern| pattern.matches_with(principal, MATCH_OPTIONS));
        let excluded = self
            .exclude
            .as_ref()
            .is_some_and(|pattern| pattern.matches_with(principal, MATCH_OPTIONS));
        included && !excluded
    }

    /// Filter the candidates, preserving their order and any duplicates.
    pub fn apply(&self, candidates: &[String]) -> Vec<String> {
        candidates
            .iter()
            .filter(|principal| self.matches(principal))
            .cloned()
            .collect()
    }
}

/// Filter `candidates` with the given include and exclude patterns.
pub fn filter(
    candidates: &[String],
    include: Option<&str>,
    exclude: Option<&str>,
) -> Result<Vec<String>, PatternError> {
    Ok(PrincipalFilter::new(include, exclude)?.apply(candidates))
}

fn compile(pattern: Option<&str>) -> Result<Option<Pattern>, PatternError> {
    pattern
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| {
            Pattern::new(pattern).map_err(|source| PatternError::Invalid {
                pattern: pattern.to_string(),
                source,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use proptest::prelude::*;

    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn include_only() -> Result<()> {
        let candidates = names(&["web-1", "web-2", "db-1"]);
        assert_eq!(
            names(&["web-1", "web-2"]),
            filter(&candidates, Some("web-*"), None)?
        );
        Ok(())
    }

    #[test]
    fn exclude_after_include() -> Result<()> {
        let candidates = names(&["web-1", "web-2", "web-10", "db-1"]);
        assert_eq!(
            names(&["web-2", "web-10"]),
            filter(&candidates, Some("web-*"), Some("web-1"))?
        );
        assert_eq!(
            names(&["web-2"]),
            filter(&candidates, Some("web-*"), Some("web-1*"))?
        );
        Ok(())
    }

    #[test]
    fn exclude_only() -> Result<()> {
        let candidates = names(&["root", "alice", "admin"]);
        assert_eq!(names(&["alice"]), filter(&candidates, None, Some("[ar]*"))?);
        Ok(())
    }

    #[test]
    fn empty_patterns_match_everything() -> Result<()> {
        let candidates = names(&["b", "a", "b"]);
        assert_eq!(candidates, filter(&candidates, Some(""), Some(""))?);
        assert_eq!(candidates, filter(&candidates, None, None)?);
        Ok(())
    }

    #[test]
    fn case_sensitive() -> Result<()> {
        let candidates = names(&["Web-1", "web-1"]);
        assert_eq!(names(&["web-1"]), filter(&candidates, Some("web-?"), None)?);
        Ok(())
    }

    #[test]
    fn anchored() -> Result<()> {
        let candidates = names(&["web", "web-1", "my-web"]);
        assert_eq!(names(&["web"]), filter(&candidates, Some("web"), None)?);
        Ok(())
    }

    // Principals are not paths; '/' is an ordinary character.
    #[test]
    fn separators_are_not_special() -> Result<()> {
        let candidates = names(&["team/web", "team/db/primary"]);
        assert_eq!(candidates, filter(&candidates, Some("team/*"), None)?);
        Ok(())
    }

    #[test]
    fn invalid_pattern() {
        let result = PrincipalFilter::new(Some("web-[1"), None);
        assert!(
            matches!(result, Err(PatternError::Invalid { pattern, .. }) if pattern == "web-[1")
        );
        let result = PrincipalFilter::new(None, Some("[]"));
        assert!(result.is_err());
    }

    #[test]
    fn principal_spec_filter() -> Result<()> {
        let spec = PrincipalSpec {
            candidates: names(&["web-1", "web-2", "db-1"]),
            include: Some("*-1".into()),
            exclude: Some("db-*".into()),
        };
        assert_eq!(names(&["web-1"]), spec.filter()?);
        Ok(())
    }

    proptest! {
        #[test]
        fn filtering_is_idempotent(
            candidates in prop::collection::vec("[a-c]{1,3}", 0..16),
            include in prop::option::of("[a-c?]{0,2}\\*?[a-c]?"),
            exclude in prop::option::of("[a-c?]{0,2}\\*?[a-c]?"),
        ) {
            let filter = PrincipalFilter::new(include.as_deref(), exclude.as_deref()).unwrap();
            let once = filter.apply(&candidates);
            let twice = filter.apply(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn no_patterns_is_identity(candidates in prop::collection::vec("[ -~]{0,8}", 0..16)) {
            prop_assert_eq!(&candidates, &filter(&candidates, None, None).unwrap());
        }
    }
}
