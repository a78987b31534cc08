// Tag derivation (§4.3): basename tokens from touched files, normalized
// concepts, and normalized title words, sorted, deduplicated, stopword-free.

use crate::utils::text::{basename_tokens, normalize_words, STOPWORDS};
use std::collections::BTreeSet;

pub fn derive_tags(title: &str, concepts: &[String], files_read: &[String], files_modified: &[String]) -> String {
    let mut tags: BTreeSet<String> = BTreeSet::new();

    for path in files_read.iter().chain(files_modified.iter()) {
        for token in basename_tokens(path) {
            insert_if_significant(&mut tags, token);
        }
    }

    for concept in concepts {
        for token in normalize_words([concept.as_str()]) {
            insert_if_significant(&mut tags, token);
        }
    }

    for token in normalize_words([title]) {
        insert_if_significant(&mut tags, token);
    }

    tags.into_iter().collect::<Vec<_>>().join(" ")
}

fn insert_if_significant(tags: &mut BTreeSet<String>, token: String) {
    if !STOPWORDS.contains(&token.as_str()) {
        tags.insert(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_sorted_unique_tags_from_all_sources() {
        let tags = derive_tags(
            "Fix the login bug",
            &["authentication".to_string()],
            &["src/auth/login.rs".to_string()],
            &["src/auth/session.rs".to_string()],
        );
        let parts: Vec<&str> = tags.split(' ').collect();
        let mut sorted = parts.clone();
        sorted.sort();
        assert_eq!(parts, sorted);

        assert!(tags.contains("login"));
        assert!(tags.contains("session"));
        assert!(tags.contains("authentication"));
        assert!(tags.contains("bug"));
    }

    #[test]
    fn stopwords_are_excluded() {
        let tags = derive_tags("the bug in the file", &[], &[], &[]);
        assert!(!tags.split(' ').any(|t| t == "the" || t == "in"));
    }

    #[test]
    fn duplicate_tokens_across_sources_collapse() {
        let tags = derive_tags("login", &["login".to_string()], &["login.rs".to_string()], &[]);
        assert_eq!(tags, "login");
    }

    #[test]
    fn empty_inputs_produce_empty_tags() {
        assert_eq!(derive_tags("", &[], &[], &[]), "");
    }
}
