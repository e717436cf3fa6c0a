use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref WORD: Regex = Regex::new(r"\p{L}+").expect("valid regex");
}

/// Compiles the word matcher up front so the first request does not pay for it.
pub fn init() {
    lazy_static::initialize(&WORD);
}

/// The words of `text` as found, with their byte positions.
pub fn word_matches(text: &str) -> impl Iterator<Item = regex::Match<'_>> + '_ {
    WORD.find_iter(text)
}

/// Iterate over the normalized words of `text`: maximal runs of Unicode letters, lowercased.
pub fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    word_matches(text).map(|m| m.as_str().to_lowercase())
}

/// Count the occurrences of every normalized word in `text`.
pub fn word_counts(text: &str) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for word in words(text) {
        *counts.entry(word).or_insert(0) += 1;
    }
    counts
}
