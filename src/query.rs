//! Free-text query compilation into FTS5 match expressions.
//!
//! Both the in-memory token index and the SQLite repository consume the same
//! [`MatchExpression`], so sanitisation rules live in exactly one place.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters the FTS5 grammar treats specially; each is replaced with a space.
const RESERVED: &[char] = &['/', '\\', ':', '"'];

/// An already tokenised query: phrases to include and phrases to exclude.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub terms: Vec<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

impl SearchQuery {
    pub fn new<T, E>(terms: T, exclusions: E) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            terms: terms.into_iter().map(Into::into).collect(),
            exclusions: exclusions.into_iter().map(Into::into).collect(),
        }
    }

    /// A query with inclusion terms only.
    pub fn terms<T>(terms: T) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self::new(terms, Vec::<String>::new())
    }

    pub fn compile(&self) -> MatchExpression {
        compile(self)
    }
}

/// Raised when an expression cannot be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// A phrase sanitised down to nothing searchable.
    #[error("Phrase {0:?} contains no searchable tokens")]
    EmptyPhrase(String),

    /// The full-text engine rejected the expression.
    #[error("Malformed match expression: {0}")]
    Syntax(String),
}

/// One sanitised, quote-escaped phrase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Phrase(String);

impl Phrase {
    fn sanitize(token: &str) -> Self {
        let spaced: String = token
            .chars()
            .map(|c| if RESERVED.contains(&c) { ' ' } else { c })
            .collect();
        Self(spaced.replace('\'', "''"))
    }

    /// Phrase text without the surrounding quotes.
    pub fn text(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Phrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

/// A compiled query.
///
/// An empty inclusion set with exclusions present uses a match-all left operand: it
/// selects every document the exclusion group does not match. With no inclusions and no
/// exclusions the expression matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchExpression {
    include: Vec<Phrase>,
    exclude: Vec<Phrase>,
}

impl MatchExpression {
    pub fn include(&self) -> &[Phrase] {
        &self.include
    }

    pub fn exclude(&self) -> &[Phrase] {
        &self.exclude
    }

    /// True when the expression can never match anything.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// True when the left operand is "every document".
    pub fn matches_all(&self) -> bool {
        self.include.is_empty() && !self.exclude.is_empty()
    }

    /// Inclusion phrases joined with `AND`.
    pub fn inclusion(&self) -> Option<String> {
        join(&self.include, " AND ")
    }

    /// Exclusion phrases joined with `OR`, without the negation.
    pub fn exclusion(&self) -> Option<String> {
        join(&self.exclude, " OR ")
    }

    /// The FTS5 `MATCH` string, when the expression has a concrete left operand.
    pub fn to_fts(&self) -> Option<String> {
        let inclusion = self.inclusion()?;
        Some(match self.exclusion() {
            Some(exclusion) => format!("{inclusion} NOT ({exclusion})"),
            None => inclusion,
        })
    }
}

impl fmt::Display for MatchExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.to_fts(), self.exclusion()) {
            (Some(fts), _) => f.write_str(&fts),
            (None, Some(exclusion)) => write!(f, "* NOT ({exclusion})"),
            (None, None) => f.write_str("<empty>"),
        }
    }
}

fn join(phrases: &[Phrase], operator: &str) -> Option<String> {
    if phrases.is_empty() {
        return None;
    }
    Some(
        phrases
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(operator),
    )
}

/// Compile a query into a match expression.
pub fn compile(query: &SearchQuery) -> MatchExpression {
    MatchExpression {
        include: query.terms.iter().map(|t| Phrase::sanitize(t)).collect(),
        exclude: query.exclusions.iter().map(|t| Phrase::sanitize(t)).collect(),
    }
}
