//! Bot-pattern matching over commit author names.
//!
//! Patterns come in three flavours (exact, wildcard, regex); exclusion
//! patterns protect matching authors from removal. Wildcard patterns are
//! compiled down to anchored regexes.

use codegauge_db::{BotPatternRow, BotPatternType};
use regex::Regex;
use tracing::warn;

enum CompiledMatcher {
    Exact(String),
    Regex(Regex),
}

struct CompiledPattern {
    matcher: CompiledMatcher,
    is_exclusion: bool,
}

/// Compiled set of bot patterns for one repository (its own + global ones).
pub struct BotMatcher {
    patterns: Vec<CompiledPattern>,
}

impl BotMatcher {
    /// Compile pattern rows; rows with invalid regexes are skipped with a
    /// warning rather than failing the whole pipeline.
    pub fn compile(rows: &[BotPatternRow]) -> Self {
        let mut patterns = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(pattern_type) = row.pattern_type() else {
                warn!("Skipping bot pattern {} with unknown type '{}'", row.id, row.pattern_type);
                continue;
            };
            let matcher = match pattern_type {
                BotPatternType::Exact => CompiledMatcher::Exact(row.pattern.clone()),
                BotPatternType::Wildcard => match Regex::new(&wildcard_to_regex(&row.pattern)) {
                    Ok(re) => CompiledMatcher::Regex(re),
                    Err(e) => {
                        warn!("Skipping unparsable wildcard pattern '{}': {}", row.pattern, e);
                        continue;
                    }
                },
                BotPatternType::Regex => match Regex::new(&row.pattern) {
                    Ok(re) => CompiledMatcher::Regex(re),
                    Err(e) => {
                        warn!("Skipping invalid regex pattern '{}': {}", row.pattern, e);
                        continue;
                    }
                },
            };
            patterns.push(CompiledPattern {
                matcher,
                is_exclusion: row.is_exclusion,
            });
        }
        Self { patterns }
    }

    /// Whether an author should be treated as a bot: matches at least one
    /// inclusion pattern and no exclusion pattern.
    pub fn is_bot(&self, author: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            let hit = match &pattern.matcher {
                CompiledMatcher::Exact(p) => p == author,
                CompiledMatcher::Regex(re) => re.is_match(author),
            };
            if hit {
                if pattern.is_exclusion {
                    return false;
                }
                matched = true;
            }
        }
        matched
    }
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(id: i64, pattern: &str, kind: &str, is_exclusion: bool) -> BotPatternRow {
        BotPatternRow {
            id,
            repository_id: None,
            pattern: pattern.to_string(),
            pattern_type: kind.to_string(),
            is_exclusion,
        }
    }

    #[test]
    fn test_wildcard_match() {
        let matcher = BotMatcher::compile(&[pattern(1, "*bot*", "wildcard", false)]);
        assert!(matcher.is_bot("dependabot[bot]"));
        assert!(matcher.is_bot("renovate-bot"));
        assert!(!matcher.is_bot("alice"));
    }

    #[test]
    fn test_exact_match() {
        let matcher = BotMatcher::compile(&[pattern(1, "ci-runner", "exact", false)]);
        assert!(matcher.is_bot("ci-runner"));
        assert!(!matcher.is_bot("ci-runner-2"));
    }

    #[test]
    fn test_exclusion_protects() {
        let matcher = BotMatcher::compile(&[
            pattern(1, "*bot*", "wildcard", false),
            pattern(2, "botond", "exact", true),
        ]);
        assert!(matcher.is_bot("dependabot[bot]"));
        // a human whose name merely contains "bot"
        assert!(!matcher.is_bot("botond"));
    }

    #[test]
    fn test_invalid_regex_skipped() {
        let matcher = BotMatcher::compile(&[
            pattern(1, "([", "regex", false),
            pattern(2, "real-bot", "exact", false),
        ]);
        assert!(matcher.is_bot("real-bot"));
    }
}
