//! In-memory full-text index over masked filenames.
//!
//! Tokenisation follows SQLite's `unicode61` tokenizer closely enough that a compiled
//! [`MatchExpression`] selects the same files here as it does against the repository:
//! tokens are runs of alphanumeric characters, compared case-insensitively with
//! diacritics removed, and a phrase matches when its tokens appear consecutively.

use std::collections::{BTreeSet, HashMap};

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::query::{MatchExpression, Phrase, QueryError};

/// A full-text index the share cache can rebuild and swap wholesale.
pub trait FullTextIndex: Send + Sync {
    /// Build an index over the given document keys. Result order follows this order.
    fn build<'a, I>(documents: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
        Self: Sized;

    /// Keys of every document matching `expr`, in index order.
    fn search(&self, expr: &MatchExpression) -> Result<Vec<&str>, QueryError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split text into lowercase alphanumeric tokens with diacritics stripped.
pub fn tokenize(text: &str) -> Vec<String> {
    // Decompose, then drop the combining marks: "é" folds to "e" as in unicode61
    let folded: String = text.nfd().filter(|&c| !is_combining_mark(c)).collect();
    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Posting-list index: token -> ascending document ids, plus each document's token
/// sequence for phrase verification.
#[derive(Debug, Default)]
pub struct TokenIndex {
    postings: HashMap<String, Vec<usize>>,
    documents: Vec<String>,
    tokens: Vec<Vec<String>>,
}

impl TokenIndex {
    fn add(&mut self, key: &str) {
        let id = self.documents.len();
        let tokens = tokenize(key);

        for token in &tokens {
            let list = self.postings.entry(token.clone()).or_default();
            if list.last() != Some(&id) {
                list.push(id);
            }
        }

        self.documents.push(key.to_string());
        self.tokens.push(tokens);
    }

    /// Documents containing `phrase` as consecutive tokens.
    fn phrase_matches(&self, phrase: &[String]) -> BTreeSet<usize> {
        // Intersect posting lists starting from the rarest token
        let mut lists = Vec::with_capacity(phrase.len());
        for token in phrase {
            match self.postings.get(token) {
                Some(list) => lists.push(list),
                None => return BTreeSet::new(),
            }
        }
        lists.sort_by_key(|list| list.len());

        let Some((first, rest)) = lists.split_first() else {
            return BTreeSet::new();
        };

        first
            .iter()
            .copied()
            .filter(|id| rest.iter().all(|list| list.binary_search(id).is_ok()))
            .filter(|&id| {
                self.tokens[id]
                    .windows(phrase.len())
                    .any(|window| window == phrase)
            })
            .collect()
    }

    fn phrase_tokens(phrase: &Phrase) -> Vec<String> {
        tokenize(phrase.text())
    }
}

impl FullTextIndex for TokenIndex {
    fn build<'a, I>(documents: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut index = Self::default();
        for key in documents {
            index.add(key);
        }
        index
    }

    fn search(&self, expr: &MatchExpression) -> Result<Vec<&str>, QueryError> {
        if expr.is_empty() {
            return Ok(Vec::new());
        }

        let mut matched: BTreeSet<usize> = if expr.matches_all() {
            (0..self.documents.len()).collect()
        } else {
            let mut acc: Option<BTreeSet<usize>> = None;
            for phrase in expr.include() {
                let tokens = Self::phrase_tokens(phrase);
                if tokens.is_empty() {
                    return Err(QueryError::EmptyPhrase(phrase.text().to_string()));
                }
                let hits = self.phrase_matches(&tokens);
                acc = Some(match acc {
                    Some(prev) => prev.intersection(&hits).copied().collect(),
                    None => hits,
                });
                if acc.as_ref().is_some_and(BTreeSet::is_empty) {
                    return Ok(Vec::new());
                }
            }
            acc.unwrap_or_default()
        };

        for phrase in expr.exclude() {
            let tokens = Self::phrase_tokens(phrase);
            if tokens.is_empty() {
                continue;
            }
            for id in self.phrase_matches(&tokens) {
                matched.remove(&id);
            }
        }

        Ok(matched
            .into_iter()
            .map(|id| self.documents[id].as_str())
            .collect())
    }

    fn len(&self) -> usize {
        self.documents.len()
    }
}
