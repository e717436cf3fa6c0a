//! The in-memory mirror of the backing store.
//!
//! [`CacheState`] owns the dense quote and teacher arrays, the word index and
//! the per-user vote ledgers, and implements every mutation without any
//! locking. [`QuoteCache`] wraps it in a [`MajorMinorLock`]: mutations take the
//! major (exclusive) mode, reads take the minor (shared) mode and hand out
//! clones so no caller ever holds a reference into the live arrays.
//!
//! A quote's position in `quotes` is its [`Slot`]. The word index refers to
//! quotes by slot, so deleting a quote swap-removes it and then rewrites every
//! reference to the old last slot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Entity, Error, Result};
use crate::index::{Slot, WordIndex};
use crate::lock::{MajorGuard, MajorMinorLock, MinorGuard};
use crate::model::{
    rating_in_range, OwnVote, Quote, QuoteDraft, QuoteId, Snapshot, Teacher, TeacherId, User, UserId,
    RATING_MAX, RATING_MIN,
};
use crate::tokenizer::word_counts;

/// A slot together with the id of the quote that occupied it when the handle
/// was taken. Resolving checks the pairing instead of trusting the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuoteHandle {
    pub slot: Slot,
    pub id: QuoteId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ballot {
    quote_id: QuoteId,
    rating: u8,
}

#[derive(Debug, Default)]
pub struct CacheState {
    quotes: Vec<Quote>,
    quote_slots: HashMap<QuoteId, Slot>,
    teachers: Vec<Teacher>,
    users: Vec<User>,
    /// Vote ledgers, created on a user's first vote.
    ballots: HashMap<UserId, Vec<Ballot>>,
    words: WordIndex,
}

impl CacheState {
    pub fn clear(&mut self) {
        self.quotes.clear();
        self.quote_slots.clear();
        self.teachers.clear();
        self.users.clear();
        self.ballots.clear();
        self.words.clear();
    }

    /// Replaces the whole state with `snapshot`, going through the same insert
    /// paths as single runtime writes. Leaves the state empty on failure.
    pub fn load(&mut self, snapshot: Snapshot) -> Result<()> {
        self.clear();
        if let Err(err) = self.load_records(snapshot) {
            self.clear();
            return Err(err);
        }
        Ok(())
    }

    fn load_records(&mut self, snapshot: Snapshot) -> Result<()> {
        // users first: popularity is normalized by the user count
        for user in snapshot.users {
            self.add_user(user)?;
        }
        for teacher in snapshot.teachers {
            self.insert_teacher(teacher)?;
        }
        for record in &snapshot.quotes {
            self.insert_quote(Quote::from_record(record))?;
        }
        for vote in snapshot.votes {
            self.apply_vote(vote.user_id, vote.quote_id, vote.rating)?;
        }
        Ok(())
    }

    fn add_user(&mut self, user: User) -> Result<()> {
        if user.id == 0 {
            return Err(Error::invalid("user id must be positive"));
        }
        if self.users.iter().any(|u| u.id == user.id) {
            return Err(Error::invalid(format!("user {} is already cached", user.id)));
        }
        self.users.push(user);
        Ok(())
    }

    fn slot_of(&self, id: QuoteId) -> Result<Slot> {
        self.quote_slots.get(&id).copied().ok_or(Error::not_found(Entity::Quote, id))
    }

    fn teacher_position(&self, id: TeacherId) -> Result<usize> {
        self.teachers
            .iter()
            .position(|t| t.id == id)
            .ok_or(Error::not_found(Entity::Teacher, id))
    }

    pub fn insert_quote(&mut self, mut quote: Quote) -> Result<QuoteHandle> {
        if quote.id == 0 {
            return Err(Error::invalid("quote id must be positive"));
        }
        if self.quote_slots.contains_key(&quote.id) {
            return Err(Error::invalid(format!("quote {} is already cached", quote.id)));
        }
        let position = self.quotes.len();
        let slot = u32::try_from(position).map(Slot).map_err(|_| Error::SlotOverflow(position))?;

        let counts = word_counts(&quote.text);
        quote.own_vote = OwnVote::Unresolved;
        quote.relevance = 0.0;
        let handle = QuoteHandle { slot, id: quote.id };
        self.quotes.push(quote);
        self.quote_slots.insert(handle.id, slot);
        self.words.add(slot, &counts);
        debug!(quote_id = handle.id, %slot, words = counts.len(), "cached quote");
        Ok(handle)
    }

    /// Rewrites teacher, context and text of quote `id` and applies the word delta.
    pub fn update_quote(&mut self, id: QuoteId, draft: &QuoteDraft) -> Result<Quote> {
        let slot = self.slot_of(id)?;
        let quote = &mut self.quotes[slot.index()];
        let old = word_counts(&quote.text);
        quote.text = draft.text.clone();
        quote.context = draft.context.clone();
        quote.teacher_id = draft.teacher_id;
        let snapshot = quote.clone();
        self.words.replace(slot, &old, word_counts(&draft.text));
        debug!(quote_id = id, %slot, "updated cached quote");
        Ok(snapshot)
    }

    /// Swap-removes quote `id` and relinks the quote that moved into its slot.
    pub fn delete_quote(&mut self, id: QuoteId) -> Result<Quote> {
        let slot = self.slot_of(id)?;
        let last = Slot((self.quotes.len() - 1) as u32);

        let removed = self.quotes.swap_remove(slot.index());
        self.quote_slots.remove(&id);
        self.words.remove(slot, &word_counts(&removed.text));

        if slot != last {
            let moved = &self.quotes[slot.index()];
            self.quote_slots.insert(moved.id, slot);
            self.words.relink(last, slot, &word_counts(&moved.text));
        }

        for ledger in self.ballots.values_mut() {
            ledger.retain(|b| b.quote_id != id);
        }
        debug!(quote_id = id, %slot, moved_from = %last, "removed cached quote");
        Ok(removed)
    }

    pub fn insert_teacher(&mut self, teacher: Teacher) -> Result<()> {
        if teacher.id == 0 {
            return Err(Error::invalid("teacher id must be positive"));
        }
        if self.teachers.iter().any(|t| t.id == teacher.id) {
            return Err(Error::invalid(format!("teacher {} is already cached", teacher.id)));
        }
        debug!(teacher_id = teacher.id, "cached teacher");
        self.teachers.push(teacher);
        Ok(())
    }

    pub fn update_teacher(&mut self, teacher: Teacher) -> Result<()> {
        let pos = self.teacher_position(teacher.id)?;
        self.teachers[pos] = teacher;
        Ok(())
    }

    /// Deletes every quote of teacher `id`, then the teacher. Returns the ids of
    /// the removed quotes.
    pub fn delete_teacher(&mut self, id: TeacherId) -> Result<Vec<QuoteId>> {
        let pos = self.teacher_position(id)?;
        let doomed: Vec<QuoteId> = self.quotes.iter().filter(|q| q.teacher_id == id).map(|q| q.id).collect();
        for &quote_id in &doomed {
            self.delete_quote(quote_id)?;
        }
        self.teachers.swap_remove(pos);
        debug!(teacher_id = id, cascaded = doomed.len(), "removed cached teacher");
        Ok(doomed)
    }

    /// Records `rating` as `user_id`'s vote on `quote_id`, replacing an earlier
    /// vote by the same user, and returns the rescored quote.
    pub fn apply_vote(&mut self, user_id: UserId, quote_id: QuoteId, rating: u8) -> Result<Quote> {
        if user_id == 0 {
            return Err(Error::invalid("user id must be positive"));
        }
        if !rating_in_range(rating) {
            return Err(Error::invalid(format!("rating must be in range {RATING_MIN}-{RATING_MAX}")));
        }
        let slot = self.slot_of(quote_id)?;

        let ledger = self.ballots.entry(user_id).or_default();
        let previous = match ledger.iter_mut().find(|b| b.quote_id == quote_id) {
            Some(ballot) => Some(std::mem::replace(&mut ballot.rating, rating)),
            None => {
                ledger.push(Ballot { quote_id, rating });
                None
            }
        };

        let total_users = self.users.len();
        let quote = &mut self.quotes[slot.index()];
        quote.stats.shift(previous, rating);
        quote.stats.recompute(total_users);

        let mut snapshot = quote.clone();
        snapshot.own_vote = OwnVote::Rated(rating);
        Ok(snapshot)
    }

    pub fn quotes(&self) -> &[Quote] {
        &self.quotes
    }

    pub fn quote_count(&self) -> usize {
        self.quotes.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn word_index(&self) -> &WordIndex {
        &self.words
    }

    /// The quote a handle refers to. Falls back to the id table when the slot
    /// has been reused since the handle was taken; `None` once the quote is gone.
    pub fn resolve(&self, handle: QuoteHandle) -> Option<&Quote> {
        match self.quotes.get(handle.slot.index()) {
            Some(q) if q.id == handle.id => Some(q),
            _ => self.quote_slots.get(&handle.id).map(|slot| &self.quotes[slot.index()]),
        }
    }

    /// Up to `count` quotes in array order starting at `offset`.
    pub fn list_quotes(&self, count: usize, offset: usize) -> Vec<Quote> {
        if offset >= self.quotes.len() {
            return Vec::new();
        }
        let end = offset.saturating_add(count).min(self.quotes.len());
        self.quotes[offset..end].to_vec()
    }

    pub fn list_all_quotes(&self) -> Vec<Quote> {
        self.quotes.clone()
    }

    pub fn find_quote(&self, id: QuoteId) -> Option<Quote> {
        self.quote_slots.get(&id).map(|slot| self.quotes[slot.index()].clone())
    }

    pub fn list_teachers(&self) -> Vec<Teacher> {
        self.teachers.clone()
    }

    pub fn find_teacher(&self, id: TeacherId) -> Option<Teacher> {
        self.teachers.iter().find(|t| t.id == id).cloned()
    }

    pub fn user(&self, id: UserId) -> Option<User> {
        self.users.iter().find(|u| u.id == id).cloned()
    }

    /// Name matches case-insensitively, the password verbatim.
    pub fn find_user(&self, name: &str, password: &str) -> Option<User> {
        let name = name.to_lowercase();
        self.users
            .iter()
            .find(|u| u.name.to_lowercase() == name && u.password == password)
            .cloned()
    }

    /// Every quote, with `relevance` set to the sum over the distinct words of
    /// `text` of (occurrences in the quote / occurrences in all quotes).
    pub fn search(&self, text: &str) -> Vec<Quote> {
        let query = word_counts(text);
        let scores = self.words.relevance(&query, self.quotes.len());
        self.quotes
            .iter()
            .zip(scores)
            .map(|(q, relevance)| {
                let mut q = q.clone();
                q.relevance = relevance;
                q
            })
            .collect()
    }

    /// Fills `quote.own_vote` from `user_id`'s ledger.
    pub fn resolve_voter_view(&self, quote: &mut Quote, user_id: UserId) -> Result<()> {
        if user_id == 0 {
            return Err(Error::invalid("user id must be positive"));
        }
        quote.own_vote = self
            .ballots
            .get(&user_id)
            .and_then(|ledger| ledger.iter().find(|b| b.quote_id == quote.id))
            .map_or(OwnVote::None, |b| OwnVote::Rated(b.rating));
        Ok(())
    }

    /// Verifies the id table, the word index and the vote histograms against
    /// the dense arrays.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.quote_slots.len() != self.quotes.len() {
            return Err(format!(
                "id table has {} entries for {} quotes",
                self.quote_slots.len(),
                self.quotes.len()
            ));
        }
        for (i, quote) in self.quotes.iter().enumerate() {
            let slot = Slot(i as u32);
            match self.quote_slots.get(&quote.id) {
                Some(&s) if s == slot => {}
                other => return Err(format!("quote {} sits at {slot} but id table says {other:?}", quote.id)),
            }
            if self.words.counts_at(slot) != word_counts(&quote.text) {
                return Err(format!("word index disagrees with the text of quote {} at {slot}", quote.id));
            }
        }
        self.words.check(self.quotes.len())?;

        let mut histograms: HashMap<QuoteId, [u32; crate::model::RATING_BUCKETS]> = HashMap::new();
        for ledger in self.ballots.values() {
            for ballot in ledger {
                let h = histograms.entry(ballot.quote_id).or_default();
                h[(ballot.rating - RATING_MIN) as usize] += 1;
            }
        }
        for quote in &self.quotes {
            let expected = histograms.remove(&quote.id).unwrap_or_default();
            if quote.stats.histogram != expected {
                return Err(format!("histogram of quote {} does not match the ledgers", quote.id));
            }
        }
        if let Some(id) = histograms.keys().next() {
            return Err(format!("ledgers hold votes for missing quote {id}"));
        }

        let mut teacher_ids: Vec<TeacherId> = self.teachers.iter().map(|t| t.id).collect();
        teacher_ids.sort_unstable();
        teacher_ids.dedup();
        if teacher_ids.len() != self.teachers.len() {
            return Err("duplicate teacher ids".to_string());
        }
        Ok(())
    }
}

/// [`CacheState`] behind the major/minor lock.
#[derive(Default)]
pub struct QuoteCache {
    state: MajorMinorLock<CacheState>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for composite reads.
    pub fn read(&self) -> MinorGuard<'_, CacheState> {
        self.state.minor()
    }

    /// Exclusive access for composite writes.
    pub fn write(&self) -> MajorGuard<'_, CacheState> {
        self.state.major()
    }

    pub fn lock(&self) -> &MajorMinorLock<CacheState> {
        &self.state
    }

    pub fn load(&self, snapshot: Snapshot) -> Result<()> {
        let (quotes, teachers, users, votes) =
            (snapshot.quotes.len(), snapshot.teachers.len(), snapshot.users.len(), snapshot.votes.len());
        let mut state = self.write();
        match state.load(snapshot) {
            Ok(()) => {
                info!(quotes, teachers, users, votes, words = state.words.len(), "filled cache");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "cache load failed; cache left empty");
                Err(err)
            }
        }
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn insert_quote(&self, quote: Quote) -> Result<QuoteHandle> {
        self.write().insert_quote(quote)
    }

    pub fn update_quote(&self, id: QuoteId, draft: &QuoteDraft) -> Result<Quote> {
        self.write().update_quote(id, draft)
    }

    pub fn delete_quote(&self, id: QuoteId) -> Result<Quote> {
        self.write().delete_quote(id)
    }

    pub fn insert_teacher(&self, teacher: Teacher) -> Result<()> {
        self.write().insert_teacher(teacher)
    }

    pub fn update_teacher(&self, teacher: Teacher) -> Result<()> {
        self.write().update_teacher(teacher)
    }

    pub fn delete_teacher(&self, id: TeacherId) -> Result<Vec<QuoteId>> {
        self.write().delete_teacher(id)
    }

    pub fn apply_vote(&self, user_id: UserId, quote_id: QuoteId, rating: u8) -> Result<Quote> {
        self.write().apply_vote(user_id, quote_id, rating)
    }

    pub fn list_quotes(&self, count: usize, offset: usize) -> Vec<Quote> {
        self.read().list_quotes(count, offset)
    }

    pub fn list_all_quotes(&self) -> Vec<Quote> {
        self.read().list_all_quotes()
    }

    pub fn find_quote(&self, id: QuoteId) -> Option<Quote> {
        self.read().find_quote(id)
    }

    pub fn quote_count(&self) -> usize {
        self.read().quote_count()
    }

    pub fn list_teachers(&self) -> Vec<Teacher> {
        self.read().list_teachers()
    }

    pub fn find_teacher(&self, id: TeacherId) -> Option<Teacher> {
        self.read().find_teacher(id)
    }

    pub fn user(&self, id: UserId) -> Option<User> {
        self.read().user(id)
    }

    pub fn find_user(&self, name: &str, password: &str) -> Option<User> {
        self.read().find_user(name, password)
    }

    pub fn search(&self, text: &str) -> Vec<Quote> {
        self.read().search(text)
    }

    pub fn resolve_voter_view(&self, quote: &mut Quote, user_id: UserId) -> Result<()> {
        self.read().resolve_voter_view(quote, user_id)
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        self.read().check_invariants()
    }
}
