use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Position of a quote in the cache's dense quote array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot(pub u32);

impl Slot {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub slot: Slot,
    pub count: u32, // occurrences of the word in this quote
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WordEntry {
    /// Occurrences across all quotes; always the sum of `occurrences[..].count`.
    pub total: u32,
    pub occurrences: Vec<Occurrence>, // unordered
}

/// Inverted index from normalized word to the quotes containing it.
#[derive(Debug, Default)]
pub struct WordIndex {
    words: HashMap<String, WordEntry>,
}

impl WordIndex {
    pub fn new() -> Self { Self::default() }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn get(&self, word: &str) -> Option<&WordEntry> {
        self.words.get(word)
    }

    /// Record the words of a quote newly placed at `slot`.
    pub fn add(&mut self, slot: Slot, counts: &HashMap<String, u32>) {
        for (word, &count) in counts {
            let entry = self.words.entry(word.clone()).or_default();
            entry.total += count;
            entry.occurrences.push(Occurrence { slot, count });
        }
    }

    /// Apply the delta between the old and the new word counts of the quote at `slot`.
    pub fn replace(&mut self, slot: Slot, old: &HashMap<String, u32>, new: HashMap<String, u32>) {
        let mut fresh = new;
        for word in old.keys() {
            let Some(entry) = self.words.get_mut(word) else { continue };
            let Some(pos) = entry.occurrences.iter().position(|o| o.slot == slot) else { continue };
            entry.total = entry.total.saturating_sub(entry.occurrences[pos].count);
            let drop_word = match fresh.remove(word) {
                Some(count) => {
                    entry.occurrences[pos].count = count;
                    entry.total += count;
                    false
                }
                None if entry.total == 0 => true,
                None => {
                    entry.occurrences.swap_remove(pos);
                    false
                }
            };
            if drop_word {
                self.words.remove(word);
            }
        }
        self.add(slot, &fresh);
    }

    /// Forget the quote at `slot`, whose words were `counts`.
    pub fn remove(&mut self, slot: Slot, counts: &HashMap<String, u32>) {
        for word in counts.keys() {
            let Some(entry) = self.words.get_mut(word) else { continue };
            if let Some(pos) = entry.occurrences.iter().position(|o| o.slot == slot) {
                entry.total = entry.total.saturating_sub(entry.occurrences[pos].count);
                entry.occurrences.swap_remove(pos);
            }
            if entry.occurrences.is_empty() {
                self.words.remove(word);
            }
        }
    }

    /// Point the occurrences of a quote that moved from `from` to `to` at its new slot.
    pub fn relink(&mut self, from: Slot, to: Slot, counts: &HashMap<String, u32>) {
        for word in counts.keys() {
            if let Some(entry) = self.words.get_mut(word) {
                for occ in entry.occurrences.iter_mut().filter(|o| o.slot == from) {
                    occ.slot = to;
                }
            }
        }
    }

    /// Sum-of-shares relevance per slot: for every distinct query word, each quote
    /// containing it gains `local count / global count`.
    pub fn relevance(&self, query: &HashMap<String, u32>, slots: usize) -> Vec<f32> {
        let mut scores = vec![0.0f32; slots];
        for word in query.keys() {
            let Some(entry) = self.words.get(word) else { continue };
            for occ in &entry.occurrences {
                if let Some(score) = scores.get_mut(occ.slot.index()) {
                    *score += occ.count as f32 / entry.total as f32;
                }
            }
        }
        scores
    }

    /// The word counts the index currently attributes to `slot`.
    pub fn counts_at(&self, slot: Slot) -> HashMap<String, u32> {
        self.words
            .iter()
            .flat_map(move |(word, entry)| {
                entry.occurrences.iter().filter(move |o| o.slot == slot).map(move |o| (word.clone(), o.count))
            })
            .collect()
    }

    /// Checks conservation (`total` is the sum of local counts), that no entry is
    /// empty, and that every occurrence points below `slots` at most once per word.
    pub fn check(&self, slots: usize) -> Result<(), String> {
        for (word, entry) in &self.words {
            if entry.occurrences.is_empty() {
                return Err(format!("word {word:?} has an empty occurrence list"));
            }
            let sum: u32 = entry.occurrences.iter().map(|o| o.count).sum();
            if sum != entry.total {
                return Err(format!("word {word:?}: total {} but occurrences sum to {sum}", entry.total));
            }
            let mut seen = std::collections::HashSet::new();
            for occ in &entry.occurrences {
                if occ.slot.index() >= slots {
                    return Err(format!("word {word:?} references dead slot {}", occ.slot));
                }
                if occ.count == 0 {
                    return Err(format!("word {word:?} has a zero count at {}", occ.slot));
                }
                if !seen.insert(occ.slot) {
                    return Err(format!("word {word:?} lists slot {} twice", occ.slot));
                }
            }
        }
        Ok(())
    }
}
