//! Token ranges and range vectors.
//!
//! A query addresses one or more token ranges. A range vector is ordered,
//! disjoint and ascending; paging trims the first range forward as
//! partitions are delivered.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::keys::Token;

/// One end of a token range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBound {
    pub token: Token,
    pub inclusive: bool,
}

impl TokenBound {
    pub fn inclusive(token: Token) -> TokenBound {
        TokenBound {
            token,
            inclusive: true,
        }
    }

    pub fn exclusive(token: Token) -> TokenBound {
        TokenBound {
            token,
            inclusive: false,
        }
    }
}

/// A possibly-unbounded interval of tokens. `None` bounds are infinite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: Option<TokenBound>,
    pub end: Option<TokenBound>,
}

impl TokenRange {
    /// The whole ring: `(-inf, +inf)`.
    pub fn full() -> TokenRange {
        TokenRange {
            start: None,
            end: None,
        }
    }

    pub fn new(start: Option<TokenBound>, end: Option<TokenBound>) -> TokenRange {
        TokenRange { start, end }
    }

    pub fn contains(&self, token: Token) -> bool {
        let above = match self.start {
            None => true,
            Some(b) if b.inclusive => token >= b.token,
            Some(b) => token > b.token,
        };
        let below = match self.end {
            None => true,
            Some(b) if b.inclusive => token <= b.token,
            Some(b) => token < b.token,
        };
        above && below
    }

    /// This range trimmed to start strictly after `token`. Used when a page
    /// resumes after the last delivered partition.
    pub fn starting_after(&self, token: Token) -> TokenRange {
        TokenRange {
            start: Some(TokenBound::exclusive(token)),
            end: self.end,
        }
    }

    /// Whether `other` is this range with a possibly-advanced start bound.
    pub fn extends_to_same_end(&self, other: &TokenRange) -> bool {
        if self.end != other.end {
            return false;
        }
        compare_start_bounds(&other.start, &self.start) != Ordering::Less
    }
}

/// Ordered, disjoint, ascending list of token ranges.
pub type RangeVector = Vec<TokenRange>;

/// Compare two start bounds. `None` is minus infinity; at equal tokens an
/// inclusive bound starts earlier than an exclusive one.
fn compare_start_bounds(a: &Option<TokenBound>, b: &Option<TokenBound>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a
            .token
            .cmp(&b.token)
            .then_with(|| match (a.inclusive, b.inclusive) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => Ordering::Equal,
            }),
    }
}

/// Whether `requested` is a suffix of `stored`: all but the first requested
/// range match exactly, and the first requested range is the matching stored
/// range with an equal-or-advanced start.
pub fn is_range_suffix(stored: &[TokenRange], requested: &[TokenRange]) -> bool {
    if requested.is_empty() || requested.len() > stored.len() {
        return false;
    }
    let suffix = &stored[stored.len() - requested.len()..];
    if suffix[1..] != requested[1..] {
        return false;
    }
    suffix[0].extends_to_same_end(&requested[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_range_contains_everything() {
        let r = TokenRange::full();
        assert!(r.contains(Token::MIN));
        assert!(r.contains(Token(0)));
        assert!(r.contains(Token::MAX));
    }

    #[test]
    fn test_bound_inclusivity() {
        let r = TokenRange::new(
            Some(TokenBound::exclusive(Token(10))),
            Some(TokenBound::inclusive(Token(20))),
        );
        assert!(!r.contains(Token(10)));
        assert!(r.contains(Token(11)));
        assert!(r.contains(Token(20)));
        assert!(!r.contains(Token(21)));
    }

    #[test]
    fn test_starting_after_excludes_token() {
        let r = TokenRange::full().starting_after(Token(5));
        assert!(!r.contains(Token(5)));
        assert!(r.contains(Token(6)));
    }

    #[test]
    fn test_suffix_exact_match() {
        let stored = vec![TokenRange::full()];
        let requested = vec![TokenRange::full()];
        assert!(is_range_suffix(&stored, &requested));
    }

    #[test]
    fn test_suffix_with_advanced_first_range() {
        let stored = vec![
            TokenRange::new(None, Some(TokenBound::inclusive(Token(100)))),
            TokenRange::new(Some(TokenBound::exclusive(Token(100))), None),
        ];
        let requested = vec![
            stored[0].starting_after(Token(50)),
            stored[1].clone(),
        ];
        assert!(is_range_suffix(&stored, &requested));

        // Dropping the first stored range entirely is also a valid suffix.
        let tail = vec![stored[1].clone()];
        assert!(is_range_suffix(&stored, &tail));
    }

    #[test]
    fn test_suffix_rejects_retreating_start() {
        let stored = vec![TokenRange::full().starting_after(Token(50))];
        let requested = vec![TokenRange::full()];
        assert!(!is_range_suffix(&stored, &requested));
    }

    #[test]
    fn test_suffix_rejects_longer_request() {
        let stored = vec![TokenRange::full()];
        let requested = vec![TokenRange::full(), TokenRange::full()];
        assert!(!is_range_suffix(&stored, &requested));
    }
}
