//! Tokenizing, edit distance and synonym expansion for tool search.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Weight of a term added by synonym expansion relative to the caller's own.
pub const SYNONYM_WEIGHT: f64 = 0.5;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "as", "at", "by", "for", "from", "in", "into", "is", "it", "of", "on", "or",
    "the", "this", "to", "with",
];

/// Words treated as interchangeable in queries.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["create", "add", "new", "make", "insert"],
    &["delete", "remove", "destroy", "drop", "erase"],
    &["get", "fetch", "read", "retrieve", "load", "show"],
    &["list", "enumerate", "browse", "all"],
    &["search", "find", "query", "lookup", "grep"],
    &["update", "edit", "modify", "change", "patch"],
    &["write", "save", "store", "put"],
    &["send", "post", "publish", "notify"],
    &["run", "execute", "exec", "invoke", "call"],
    &["file", "document", "doc"],
    &["directory", "folder", "dir"],
    &["repo", "repository", "project"],
    &["issue", "ticket", "bug"],
    &["message", "chat", "dm"],
    &["user", "member", "account", "person"],
    &["image", "picture", "photo", "screenshot"],
    &["database", "db", "sql", "table"],
    &["url", "link", "page", "website"],
];

static SYNONYMS: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
    for group in SYNONYM_GROUPS {
        for word in group.iter() {
            let entry = map.entry(*word).or_default();
            for other in group.iter().filter(|o| *o != word) {
                if !entry.contains(other) {
                    entry.push(*other);
                }
            }
        }
    }
    map
});

/// Split `text` into lowercase terms.
///
/// Breaks on anything that is not alphanumeric and on lower-to-upper case
/// changes, so `createIssue`, `create_issue` and `create-issue` all yield
/// `["create", "issue"]`. Stop words are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;

    for c in text.chars() {
        if !c.is_alphanumeric() {
            flush(&mut current, &mut tokens);
            prev = None;
            continue;
        }
        if prev.is_some_and(|p| p.is_lowercase()) && c.is_uppercase() {
            flush(&mut current, &mut tokens);
        }
        current.extend(c.to_lowercase());
        prev = Some(c);
    }
    flush(&mut current, &mut tokens);

    tokens
}

fn flush(current: &mut String, tokens: &mut Vec<String>) {
    if !current.is_empty() && !STOP_WORDS.contains(&current.as_str()) {
        tokens.push(current.clone());
    }
    current.clear();
}

/// A weighted search term.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTerm {
    pub text: String,
    pub weight: f64,
}

/// Caller terms at full weight followed by their synonyms at
/// [`SYNONYM_WEIGHT`]. A word appears once, at its highest weight.
pub fn expand_synonyms(tokens: &[String]) -> Vec<QueryTerm> {
    let mut terms: Vec<QueryTerm> = Vec::new();
    for token in tokens {
        if !terms.iter().any(|t| &t.text == token) {
            terms.push(QueryTerm {
                text: token.clone(),
                weight: 1.0,
            });
        }
    }

    let originals = terms.len();
    for i in 0..originals {
        let Some(synonyms) = SYNONYMS.get(terms[i].text.as_str()) else {
            continue;
        };
        for synonym in synonyms {
            if !terms.iter().any(|t| t.text == *synonym) {
                terms.push(QueryTerm {
                    text: synonym.to_string(),
                    weight: SYNONYM_WEIGHT,
                });
            }
        }
    }
    terms
}

/// Levenshtein edit distance between two strings.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    // Single-row DP
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity: 1.0 for identical strings, 0.0 for nothing shared.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

/// Edits tolerated when fuzzy-matching a term of this length.
pub fn max_edits(term: &str) -> usize {
    match term.chars().count() {
        0..=3 => 0,
        4..=7 => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_splits_case_and_separators() {
        assert_eq!(tokenize("createIssue"), vec!["create", "issue"]);
        assert_eq!(tokenize("create_issue"), vec!["create", "issue"]);
        assert_eq!(tokenize("Read the FILE-contents v2"), vec!["read", "file", "contents", "v2"]);
        assert!(tokenize("  --  ").is_empty());
    }

    #[test]
    fn test_stop_words_dropped() {
        assert_eq!(tokenize("send a message to the channel"), vec!["send", "message", "channel"]);
    }

    #[test]
    fn test_synonym_expansion_keeps_originals_first() {
        let terms = expand_synonyms(&["remove".to_string(), "file".to_string()]);
        assert_eq!(terms[0], QueryTerm { text: "remove".to_string(), weight: 1.0 });
        assert_eq!(terms[1].text, "file");
        assert!(terms.iter().any(|t| t.text == "delete" && t.weight == SYNONYM_WEIGHT));
        assert!(terms.iter().any(|t| t.text == "document"));
    }

    #[test]
    fn test_synonym_does_not_downgrade_original() {
        let terms = expand_synonyms(&["create".to_string(), "add".to_string()]);
        let add = terms.iter().find(|t| t.text == "add").unwrap();
        assert_eq!(add.weight, 1.0);
        assert_eq!(terms.iter().filter(|t| t.text == "add").count(), 1);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("isue", "issue"), 1);
        assert_eq!(similarity("same", "same"), 1.0);
    }

    #[test]
    fn test_max_edits_grows_with_length() {
        assert_eq!(max_edits("get"), 0);
        assert_eq!(max_edits("issue"), 1);
        assert_eq!(max_edits("repository"), 2);
    }
}
