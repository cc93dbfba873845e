//! Per-handler file-name filters: glob or extended regex, optionally negated.

use globset::{Glob, GlobMatcher};
use regex::{Regex, RegexBuilder};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("unterminated regex pattern (missing closing '/')")]
    UnterminatedRegex,
    #[error("unknown regex flag '{0}'")]
    UnknownFlag(char),
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("invalid glob: {0}")]
    Glob(#[from] globset::Error),
}

enum Matcher {
    Regex(Regex),
    Glob(GlobMatcher),
}

/// One compiled filter entry: a matcher plus its negation bit.
pub struct Pattern {
    matcher: Matcher,
    negated: bool,
}

impl Pattern {
    /// Compile one pattern token: an optional leading `!`, then either
    /// `/REGEX/FLAGS` (`FLAGS` subset of `b`, `i`) or a literal glob.
    pub fn compile(spec: &str) -> Result<Self, PatternError> {
        let (negated, rest) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };

        let matcher = if let Some(body) = rest.strip_prefix('/') {
            let close = body.rfind('/').ok_or(PatternError::UnterminatedRegex)?;
            let (expr, flags) = body.split_at(close);
            let flags = &flags[1..]; // drop the closing '/'

            let mut basic = false;
            let mut case_insensitive = false;
            for c in flags.chars() {
                match c {
                    'b' => basic = true,
                    'i' => case_insensitive = true,
                    other => return Err(PatternError::UnknownFlag(other)),
                }
            }

            // `regex` only speaks extended syntax; "basic" mode maps to
            // escaping the handful of ERE-only metacharacters in the
            // expression up front rather than carrying a second engine.
            let expr = if basic { escape_ere_only(expr) } else { expr.to_string() };

            let re = RegexBuilder::new(&expr)
                .case_insensitive(case_insensitive)
                .build()?;
            Matcher::Regex(re)
        } else {
            Matcher::Glob(Glob::new(rest)?.compile_matcher())
        };

        Ok(Pattern { matcher, negated })
    }

    fn is_match(&self, name: &str) -> bool {
        match &self.matcher {
            Matcher::Regex(re) => re.is_match(name),
            Matcher::Glob(g) => g.is_match(name),
        }
    }
}

/// Escapes the ERE-only metacharacters `+ ? | ( ) { }` so a "basic syntax"
/// pattern behaves like POSIX BRE under an ERE engine.
fn escape_ere_only(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    for c in expr.chars() {
        if matches!(c, '+' | '?' | '|' | '(' | ')' | '{' | '}') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// The ordered collection of patterns filtering by basename.
///
/// Matching rule: a name matches iff it matches at least one positive
/// pattern and no negative pattern; if no positive patterns exist, it is
/// accepted unless a negative matches.
#[derive(Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn new() -> Self {
        PatternSet { patterns: Vec::new() }
    }

    pub fn push(&mut self, spec: &str) -> Result<(), PatternError> {
        self.patterns.push(Pattern::compile(spec)?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Matches using the basename of `path`, never the full path.
    pub fn matches_path(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        self.matches_name(name)
    }

    pub fn matches_name(&self, name: &str) -> bool {
        let has_positive = self.patterns.iter().any(|p| !p.negated);
        let positive_hit = self
            .patterns
            .iter()
            .any(|p| !p.negated && p.is_match(name));
        let negative_hit = self
            .patterns
            .iter()
            .any(|p| p.negated && p.is_match(name));

        if negative_hit {
            return false;
        }
        if has_positive {
            return positive_hit;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_everything_with_no_patterns() {
        let set = PatternSet::new();
        assert!(set.matches_name("anything"));
    }

    #[test]
    fn negated_regex_rejects_matching_names() {
        let mut set = PatternSet::new();
        set.push(r"!/\.tmp$/").unwrap();
        assert!(set.matches_name("keep"));
        assert!(!set.matches_name("x.tmp"));
    }

    #[test]
    fn positive_glob_requires_a_match() {
        let mut set = PatternSet::new();
        set.push("*.rs").unwrap();
        assert!(set.matches_name("main.rs"));
        assert!(!set.matches_name("README.md"));
    }

    #[test]
    fn unterminated_regex_is_a_configuration_error() {
        assert!(matches!(
            Pattern::compile("/unterminated"),
            Err(PatternError::UnterminatedRegex)
        ));
    }

    #[test]
    fn unknown_flag_is_a_configuration_error() {
        assert!(matches!(
            Pattern::compile("/foo/z"),
            Err(PatternError::UnknownFlag('z'))
        ));
    }

    #[test]
    fn case_insensitive_flag() {
        let mut set = PatternSet::new();
        set.push("/readme/i").unwrap();
        assert!(set.matches_name("README"));
        assert!(set.matches_name("readme"));
    }

    #[test]
    fn matches_basename_not_full_path() {
        let mut set = PatternSet::new();
        set.push("*.log").unwrap();
        assert!(set.matches_path(Path::new("/var/log/app/out.log")));
        assert!(!set.matches_path(Path::new("/var/log.d/app/out.txt")));
    }
}
