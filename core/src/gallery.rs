//! Write-through facade over the backing store, the cache and the generator.
//!
//! Every write is validated against the cache, persisted, applied to the cache
//! under the exclusive lock and finally flags the sort orders as stale. Writes
//! are serialized among themselves so validation and application see the same
//! state; the backing store is never called while the cache lock is held.

use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{error, info};

use crate::backend::Backend;
use crate::config::GalleryConfig;
use crate::error::{Entity, Error, Result};
use crate::generator::{IndexGenerator, QuoteOrder};
use crate::model::{
    rating_in_range, Quote, QuoteDraft, QuoteId, Submission, SubmissionDraft, SubmissionId, Teacher, TeacherDraft,
    TeacherId, TeacherRef, User, UserId, Vote, RATING_MAX, RATING_MIN,
};
use crate::store::{CacheState, QuoteCache};

pub struct Gallery {
    backend: Arc<dyn Backend>,
    cache: Arc<QuoteCache>,
    generator: Arc<IndexGenerator>,
    config: GalleryConfig,
    writes: Mutex<()>,
}

impl Gallery {
    /// Fills the cache from `backend`, builds the sort orders and, if
    /// configured, starts the periodic regeneration task.
    pub fn open(backend: Arc<dyn Backend>, config: GalleryConfig) -> Result<Self> {
        let gallery = Self {
            backend,
            cache: Arc::new(QuoteCache::new()),
            generator: Arc::new(IndexGenerator::new(config.regenerate_interval)),
            config,
            writes: Mutex::new(()),
        };
        gallery.reload()?;
        if gallery.config.auto_regenerate {
            gallery.generator.start(Arc::clone(&gallery.cache));
        }
        Ok(gallery)
    }

    pub fn config(&self) -> &GalleryConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<QuoteCache> {
        &self.cache
    }

    pub fn generator(&self) -> &Arc<IndexGenerator> {
        &self.generator
    }

    /// Discards the cache and refills it from the backing store.
    pub fn reload(&self) -> Result<()> {
        let _writes = self.writes.lock();
        self.resync()
    }

    fn resync(&self) -> Result<()> {
        let snapshot = match self.backend.load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.cache.clear();
                self.generator.force_regenerate(&self.cache);
                return Err(Error::Backend(err.context("loading the backing store")));
            }
        };
        let loaded = self.cache.load(snapshot);
        self.generator.force_regenerate(&self.cache);
        if loaded.is_ok() {
            info!(quotes = self.cache.quote_count(), "cache reloaded from backing store");
        }
        loaded
    }

    pub fn force_regenerate(&self) {
        self.generator.force_regenerate(&self.cache);
    }

    /// Stops the periodic task. The gallery stays usable; orders then only
    /// change on [`Gallery::force_regenerate`] and reloads.
    pub fn shutdown(&self) {
        self.generator.stop();
    }

    pub fn authenticate(&self, name: &str, password: &str) -> Option<User> {
        self.cache.find_user(name, password)
    }

    /// Applies a cache mutation for a write the backing store already
    /// accepted. A failure here means the two disagree.
    fn apply<T>(&self, op: &'static str, f: impl FnOnce(&mut CacheState) -> Result<T>) -> Result<T> {
        let outcome = {
            let mut state = self.cache.write();
            f(&mut state)
        };
        match outcome {
            Ok(value) => {
                self.generator.request_regenerate();
                Ok(value)
            }
            Err(source) => {
                error!(op, error = %source, "backing store accepted a write the cache could not apply");
                if self.config.resync_on_desync {
                    if let Err(err) = self.resync() {
                        error!(op, error = %err, "resynchronizing the cache failed");
                    }
                }
                Err(Error::Desync { op, source: Box::new(source) })
            }
        }
    }

    fn require_quote(&self, id: QuoteId) -> Result<()> {
        if id == 0 {
            return Err(Error::invalid("quote id must be positive"));
        }
        match self.cache.find_quote(id) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(Entity::Quote, id)),
        }
    }

    fn require_teacher(&self, id: TeacherId) -> Result<()> {
        if id == 0 {
            return Err(Error::invalid("teacher id must be positive"));
        }
        match self.cache.find_teacher(id) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(Entity::Teacher, id)),
        }
    }

    fn require_user(&self, id: UserId) -> Result<()> {
        if id == 0 {
            return Err(Error::invalid("user id must be positive"));
        }
        match self.cache.user(id) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(Entity::User, id)),
        }
    }

    fn check_draft(&self, draft: &QuoteDraft) -> Result<()> {
        if draft.text.trim().is_empty() {
            return Err(Error::invalid("quote text must not be empty"));
        }
        self.require_teacher(draft.teacher_id)
    }

    pub fn add_quote(&self, draft: &QuoteDraft) -> Result<Quote> {
        let _writes = self.writes.lock();
        self.insert_quote(draft, now_unix())
    }

    /// Caller holds the write lock.
    fn insert_quote(&self, draft: &QuoteDraft, created_at: i64) -> Result<Quote> {
        self.check_draft(draft)?;
        let record = self.backend.insert_quote(draft, created_at).map_err(Error::Backend)?;
        let quote = Quote::from_record(&record);
        self.apply("insert_quote", |state| {
            let handle = state.insert_quote(quote)?;
            state.resolve(handle).cloned().ok_or(Error::not_found(Entity::Quote, handle.id))
        })
    }

    pub fn edit_quote(&self, id: QuoteId, draft: &QuoteDraft) -> Result<Quote> {
        let _writes = self.writes.lock();
        self.require_quote(id)?;
        self.check_draft(draft)?;
        self.backend.update_quote(id, draft).map_err(Error::Backend)?;
        self.apply("update_quote", |state| state.update_quote(id, draft))
    }

    pub fn remove_quote(&self, id: QuoteId) -> Result<Quote> {
        let _writes = self.writes.lock();
        self.require_quote(id)?;
        self.backend.delete_quote(id).map_err(Error::Backend)?;
        self.apply("delete_quote", |state| state.delete_quote(id))
    }

    pub fn add_teacher(&self, draft: &TeacherDraft) -> Result<Teacher> {
        let _writes = self.writes.lock();
        if draft.name.trim().is_empty() {
            return Err(Error::invalid("teacher name must not be empty"));
        }
        let teacher = self.backend.insert_teacher(draft).map_err(Error::Backend)?;
        self.apply("insert_teacher", |state| state.insert_teacher(teacher.clone()))?;
        Ok(teacher)
    }

    pub fn edit_teacher(&self, id: TeacherId, draft: &TeacherDraft) -> Result<Teacher> {
        let _writes = self.writes.lock();
        self.require_teacher(id)?;
        if draft.name.trim().is_empty() {
            return Err(Error::invalid("teacher name must not be empty"));
        }
        let teacher = draft.clone().with_id(id);
        self.backend.update_teacher(&teacher).map_err(Error::Backend)?;
        self.apply("update_teacher", |state| state.update_teacher(teacher.clone()))?;
        Ok(teacher)
    }

    /// Removes the teacher and all of its quotes. Returns the removed quote ids.
    pub fn remove_teacher(&self, id: TeacherId) -> Result<Vec<QuoteId>> {
        let _writes = self.writes.lock();
        self.require_teacher(id)?;
        self.backend.delete_teacher(id).map_err(Error::Backend)?;
        self.apply("delete_teacher", |state| state.delete_teacher(id))
    }

    /// Records `user_id`'s rating of quote `quote_id`, replacing an earlier one.
    pub fn vote(&self, user_id: UserId, quote_id: QuoteId, rating: u8) -> Result<Quote> {
        let _writes = self.writes.lock();
        if !rating_in_range(rating) {
            return Err(Error::invalid(format!("rating must be in range {RATING_MIN}-{RATING_MAX}")));
        }
        self.require_user(user_id)?;
        self.require_quote(quote_id)?;
        self.backend
            .upsert_vote(&Vote { user_id, quote_id, rating })
            .map_err(Error::Backend)?;
        self.apply("upsert_vote", |state| state.apply_vote(user_id, quote_id, rating))
    }

    fn check_submission(&self, draft: &SubmissionDraft) -> Result<()> {
        if draft.text.trim().is_empty() {
            return Err(Error::invalid("quote text must not be empty"));
        }
        match &draft.teacher {
            TeacherRef::Id(id) => self.require_teacher(*id),
            TeacherRef::Name(name) if name.trim().is_empty() => Err(Error::invalid("teacher name must not be empty")),
            TeacherRef::Name(_) => Ok(()),
        }
    }

    fn require_submission(&self, id: SubmissionId) -> Result<Submission> {
        if id == 0 {
            return Err(Error::invalid("submission id must be positive"));
        }
        self.backend
            .submissions()
            .map_err(Error::Backend)?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or(Error::not_found(Entity::Submission, id))
    }

    /// Files a quote by `user_id` for moderation. Nothing reaches the cache
    /// until an admin confirms it.
    pub fn submit_quote(&self, user_id: UserId, draft: &SubmissionDraft) -> Result<Submission> {
        let _writes = self.writes.lock();
        self.require_user(user_id)?;
        self.check_submission(draft)?;
        let submission = self.backend.insert_submission(draft, user_id, now_unix()).map_err(Error::Backend)?;
        info!(submission = submission.id, user_id, "quote submitted for moderation");
        Ok(submission)
    }

    pub fn submissions(&self) -> Result<Vec<Submission>> {
        self.backend.submissions().map_err(Error::Backend)
    }

    pub fn edit_submission(&self, id: SubmissionId, draft: &SubmissionDraft) -> Result<Submission> {
        let _writes = self.writes.lock();
        self.require_submission(id)?;
        self.check_submission(draft)?;
        self.backend.update_submission(id, draft).map_err(Error::Backend)
    }

    pub fn assign_submission_teacher(&self, id: SubmissionId, teacher_id: TeacherId) -> Result<Submission> {
        let _writes = self.writes.lock();
        self.require_submission(id)?;
        self.require_teacher(teacher_id)?;
        self.backend.assign_submission_teacher(id, teacher_id).map_err(Error::Backend)
    }

    pub fn remove_submission(&self, id: SubmissionId) -> Result<Submission> {
        let _writes = self.writes.lock();
        self.require_submission(id)?;
        self.backend.delete_submission(id).map_err(Error::Backend)
    }

    /// Publishes a submission as a quote, keeping its submission time, and
    /// drops it from the moderation queue.
    pub fn confirm_submission(&self, id: SubmissionId) -> Result<Quote> {
        let _writes = self.writes.lock();
        let submission = self.require_submission(id)?;
        let draft = submission
            .quote_draft()
            .ok_or_else(|| Error::invalid(format!("submission {id} has no teacher assigned")))?;
        let quote = self.insert_quote(&draft, submission.created_at)?;
        if let Err(err) = self.backend.delete_submission(id) {
            error!(submission = id, quote_id = quote.id, error = %err, "confirmed submission could not be dropped");
            return Err(Error::Backend(
                err.context(format!("quote {} was published but submission {id} is still queued", quote.id)),
            ));
        }
        info!(submission = id, quote_id = quote.id, "submission confirmed");
        Ok(quote)
    }

    /// Quotes in cache order, `count` of them starting at `offset`.
    pub fn quotes_page(&self, count: usize, offset: usize, viewer: Option<UserId>) -> Result<Vec<Quote>> {
        let state = self.cache.read();
        let mut quotes = state.list_quotes(count, offset);
        view_as(&state, &mut quotes, viewer)?;
        Ok(quotes)
    }

    /// One page of `order` as of the last regeneration. Quotes deleted since
    /// then are skipped, so a page can come back short.
    pub fn sorted_quotes(
        &self,
        order: QuoteOrder,
        count: usize,
        offset: usize,
        viewer: Option<UserId>,
    ) -> Result<Vec<Quote>> {
        let state = self.cache.read();
        let handles = self.generator.page(order, count, offset);
        let mut quotes: Vec<Quote> = handles.into_iter().filter_map(|h| state.resolve(h).cloned()).collect();
        view_as(&state, &mut quotes, viewer)?;
        Ok(quotes)
    }

    /// Quotes sharing at least one word with `text`, most relevant first.
    pub fn search(&self, text: &str, viewer: Option<UserId>) -> Result<Vec<Quote>> {
        let state = self.cache.read();
        let mut hits: Vec<Quote> = state.search(text).into_iter().filter(|q| q.relevance > 0.0).collect();
        hits.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        view_as(&state, &mut hits, viewer)?;
        Ok(hits)
    }

    pub fn quote(&self, id: QuoteId, viewer: Option<UserId>) -> Result<Quote> {
        let state = self.cache.read();
        let mut quote = state.find_quote(id).ok_or(Error::not_found(Entity::Quote, id))?;
        if let Some(user_id) = viewer {
            state.resolve_voter_view(&mut quote, user_id)?;
        }
        Ok(quote)
    }

    pub fn teachers(&self) -> Vec<Teacher> {
        self.cache.list_teachers()
    }

    pub fn teacher(&self, id: TeacherId) -> Result<Teacher> {
        self.cache.find_teacher(id).ok_or(Error::not_found(Entity::Teacher, id))
    }
}

impl Drop for Gallery {
    fn drop(&mut self) {
        self.generator.stop();
    }
}

fn view_as(state: &CacheState, quotes: &mut [Quote], viewer: Option<UserId>) -> Result<()> {
    if let Some(user_id) = viewer {
        for quote in quotes.iter_mut() {
            state.resolve_voter_view(quote, user_id)?;
        }
    }
    Ok(())
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
