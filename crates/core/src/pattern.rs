use globset::{GlobBuilder, GlobMatcher};

use crate::error::PipelineError;

/// Case-insensitive pattern where `*` is the only wildcard. Every other
/// character, including `?`, `[` and `{`, is literal.
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    raw: String,
    matcher: GlobMatcher,
}

impl WildcardPattern {
    /// Matches when the whole candidate fits the pattern.
    pub fn full(raw: &str) -> Result<Self, PipelineError> {
        Self::build(raw, false)
    }

    /// Matches when the pattern occurs anywhere in the candidate.
    pub fn contains(raw: &str) -> Result<Self, PipelineError> {
        Self::build(raw, true)
    }

    fn build(raw: &str, substring: bool) -> Result<Self, PipelineError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(malformed(raw, "pattern is empty"));
        }
        if trimmed.chars().all(|ch| ch == '*') {
            return Err(malformed(raw, "pattern has no literal text and would match everything"));
        }

        let body = normalize(trimmed)
            .split('*')
            .map(globset::escape)
            .collect::<Vec<_>>()
            .join("*");
        let mut glob = if substring {
            format!("*{body}*")
        } else {
            body
        };
        // A run of stars is one wildcard; `**` would otherwise be read as a
        // recursive path component.
        while glob.contains("**") {
            glob = glob.replace("**", "*");
        }

        let matcher = GlobBuilder::new(&glob)
            .case_insensitive(true)
            .literal_separator(false)
            .backslash_escape(false)
            .build()
            .map_err(|err| malformed(raw, err))?
            .compile_matcher();

        Ok(Self {
            raw: trimmed.to_string(),
            matcher,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.matcher.is_match(normalize(candidate))
    }
}

/// An ordered list of full-match patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternList {
    patterns: Vec<WildcardPattern>,
}

impl PatternList {
    /// Compiles every pattern; malformed entries are reported and skipped.
    pub fn compile<I, S>(raw: I, warnings: &mut Vec<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns = Vec::new();
        for entry in raw {
            match WildcardPattern::full(entry.as_ref()) {
                Ok(pattern) => patterns.push(pattern),
                Err(err) => warnings.push(err.to_string()),
            }
        }
        Self { patterns }
    }

    pub fn first_match(&self, candidate: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|pattern| pattern.is_match(candidate))
            .map(WildcardPattern::raw)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

// globset normalizes `\` to `/` in Windows candidates; do the same on every
// platform so registry and task paths compare consistently.
fn normalize(value: &str) -> String {
    value.replace('\\', "/")
}

fn malformed(raw: &str, reason: impl ToString) -> PipelineError {
    PipelineError::Match {
        pattern: raw.to_string(),
        reason: reason.to_string(),
    }
}
