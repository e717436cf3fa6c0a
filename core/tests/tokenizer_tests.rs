use gallery_core::tokenizer::{init, word_counts, words};

#[test]
fn it_folds_case_and_keeps_unicode_letters() {
    init();
    let counts = word_counts("Übermut tut selten GUT. Übermut!");
    assert_eq!(counts.get("übermut"), Some(&2));
    assert_eq!(counts.get("gut"), Some(&1));
    assert!(!counts.contains_key("Übermut"));
}

#[test]
fn it_splits_on_digits_and_punctuation() {
    let toks: Vec<String> = words("abc123def ghi-jkl 42").collect();
    assert_eq!(toks, vec!["abc", "def", "ghi", "jkl"]);
}

#[test]
fn it_is_empty_without_letters() {
    assert!(word_counts("").is_empty());
    assert!(word_counts("1234 !?  -- 5").is_empty());
}

#[test]
fn it_is_deterministic() {
    let text = "Der Bär, der bär, DER BÄR";
    assert_eq!(word_counts(text), word_counts(text));
    assert_eq!(word_counts(text).get("bär"), Some(&3));
    assert_eq!(word_counts(text).get("der"), Some(&3));
}
