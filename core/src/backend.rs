//! The backing store contract and an in-memory implementation.
//!
//! A [`Backend`] is the durable source of truth. The gallery calls it before
//! every cache mutation and only touches the cache once it succeeded.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::model::{
    QuoteDraft, QuoteId, QuoteRecord, Snapshot, Submission, SubmissionDraft, SubmissionId, Teacher, TeacherDraft, TeacherId,
    TeacherRef, User, UserId, Vote,
};

pub trait Backend: Send + Sync {
    /// Every row, for the initial load and for resynchronization.
    fn load(&self) -> Result<Snapshot>;
    /// Stores a new quote and returns the row with its assigned id.
    fn insert_quote(&self, draft: &QuoteDraft, created_at: i64) -> Result<QuoteRecord>;
    fn update_quote(&self, id: QuoteId, draft: &QuoteDraft) -> Result<()>;
    /// Deletes the quote and the votes on it.
    fn delete_quote(&self, id: QuoteId) -> Result<()>;
    fn insert_teacher(&self, draft: &TeacherDraft) -> Result<Teacher>;
    fn update_teacher(&self, teacher: &Teacher) -> Result<()>;
    /// Deletes the teacher together with its quotes and their votes.
    fn delete_teacher(&self, id: TeacherId) -> Result<()>;
    /// Inserts the vote or overwrites the rating of an existing (user, quote) vote.
    fn upsert_vote(&self, vote: &Vote) -> Result<()>;

    /// Quotes waiting for moderation, oldest first.
    fn submissions(&self) -> Result<Vec<Submission>>;
    fn insert_submission(&self, draft: &SubmissionDraft, submitted_by: UserId, created_at: i64) -> Result<Submission>;
    /// Replaces teacher, context and text; keeps submitter and creation time.
    fn update_submission(&self, id: SubmissionId, draft: &SubmissionDraft) -> Result<Submission>;
    fn assign_submission_teacher(&self, id: SubmissionId, teacher_id: TeacherId) -> Result<Submission>;
    fn delete_submission(&self, id: SubmissionId) -> Result<Submission>;
}

/// Row tables plus id counters, shared by the in-memory and file stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tables {
    pub rows: Snapshot,
    pub next_quote_id: QuoteId,
    pub next_teacher_id: TeacherId,
    pub next_user_id: u32,
    pub submissions: Vec<Submission>,
    pub next_submission_id: SubmissionId,
}

impl Default for Tables {
    fn default() -> Self {
        Self::from_rows(Snapshot::default())
    }
}

impl Tables {
    pub fn from_rows(rows: Snapshot) -> Self {
        let next_quote_id = rows.quotes.iter().map(|q| q.id).max().unwrap_or(0) + 1;
        let next_teacher_id = rows.teachers.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let next_user_id = rows.users.iter().map(|u| u.id).max().unwrap_or(0) + 1;
        Self { rows, next_quote_id, next_teacher_id, next_user_id, submissions: Vec::new(), next_submission_id: 1 }
    }

    pub fn with_submissions(mut self, submissions: Vec<Submission>) -> Self {
        self.next_submission_id = submissions.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        self.submissions = submissions;
        self
    }

    fn quote_mut(&mut self, id: QuoteId) -> Result<&mut QuoteRecord> {
        match self.rows.quotes.iter_mut().find(|q| q.id == id) {
            Some(q) => Ok(q),
            None => bail!("no quote row with id {id}"),
        }
    }

    fn require_teacher(&self, id: TeacherId) -> Result<()> {
        if !self.rows.teachers.iter().any(|t| t.id == id) {
            bail!("foreign key violation: no teacher row with id {id}");
        }
        Ok(())
    }

    pub fn insert_quote(&mut self, draft: &QuoteDraft, created_at: i64) -> Result<QuoteRecord> {
        self.require_teacher(draft.teacher_id)?;
        let record = QuoteRecord {
            id: self.next_quote_id,
            teacher_id: draft.teacher_id,
            context: draft.context.clone(),
            text: draft.text.clone(),
            created_at,
        };
        self.next_quote_id += 1;
        self.rows.quotes.push(record.clone());
        Ok(record)
    }

    pub fn update_quote(&mut self, id: QuoteId, draft: &QuoteDraft) -> Result<()> {
        self.require_teacher(draft.teacher_id)?;
        let row = self.quote_mut(id)?;
        row.teacher_id = draft.teacher_id;
        row.context = draft.context.clone();
        row.text = draft.text.clone();
        Ok(())
    }

    pub fn delete_quote(&mut self, id: QuoteId) -> Result<()> {
        let before = self.rows.quotes.len();
        self.rows.quotes.retain(|q| q.id != id);
        if self.rows.quotes.len() == before {
            bail!("no quote row with id {id}");
        }
        self.rows.votes.retain(|v| v.quote_id != id);
        Ok(())
    }

    pub fn insert_teacher(&mut self, draft: &TeacherDraft) -> Result<Teacher> {
        let teacher = draft.clone().with_id(self.next_teacher_id);
        self.next_teacher_id += 1;
        self.rows.teachers.push(teacher.clone());
        Ok(teacher)
    }

    pub fn update_teacher(&mut self, teacher: &Teacher) -> Result<()> {
        match self.rows.teachers.iter_mut().find(|t| t.id == teacher.id) {
            Some(row) => {
                *row = teacher.clone();
                Ok(())
            }
            None => bail!("no teacher row with id {}", teacher.id),
        }
    }

    pub fn delete_teacher(&mut self, id: TeacherId) -> Result<()> {
        self.require_teacher(id)?;
        let doomed: Vec<QuoteId> = self.rows.quotes.iter().filter(|q| q.teacher_id == id).map(|q| q.id).collect();
        self.rows.quotes.retain(|q| q.teacher_id != id);
        self.rows.votes.retain(|v| !doomed.contains(&v.quote_id));
        self.rows.teachers.retain(|t| t.id != id);
        // pending submissions go back to unassigned
        for submission in self.submissions.iter_mut().filter(|s| s.teacher_id == id) {
            submission.teacher_id = 0;
        }
        Ok(())
    }

    pub fn insert_user(&mut self, name: &str, password: &str, admin: bool) -> Result<User> {
        if self.rows.users.iter().any(|u| u.name.to_lowercase() == name.to_lowercase()) {
            bail!("user name {name:?} is taken");
        }
        let user = User { id: self.next_user_id, name: name.to_string(), password: password.to_string(), admin };
        self.next_user_id += 1;
        self.rows.users.push(user.clone());
        Ok(user)
    }

    pub fn upsert_vote(&mut self, vote: &Vote) -> Result<()> {
        if !self.rows.users.iter().any(|u| u.id == vote.user_id) {
            bail!("foreign key violation: no user row with id {}", vote.user_id);
        }
        self.quote_mut(vote.quote_id)?;
        match self
            .rows
            .votes
            .iter_mut()
            .find(|v| v.user_id == vote.user_id && v.quote_id == vote.quote_id)
        {
            Some(row) => row.rating = vote.rating,
            None => self.rows.votes.push(*vote),
        }
        Ok(())
    }

    fn submission_mut(&mut self, id: SubmissionId) -> Result<&mut Submission> {
        match self.submissions.iter_mut().find(|s| s.id == id) {
            Some(s) => Ok(s),
            None => bail!("no submission row with id {id}"),
        }
    }

    fn submitted_teacher(&self, teacher: &TeacherRef) -> Result<(TeacherId, String)> {
        match teacher {
            TeacherRef::Id(id) => {
                self.require_teacher(*id)?;
                Ok((*id, String::new()))
            }
            TeacherRef::Name(name) => Ok((0, name.clone())),
        }
    }

    pub fn insert_submission(
        &mut self,
        draft: &SubmissionDraft,
        submitted_by: UserId,
        created_at: i64,
    ) -> Result<Submission> {
        if !self.rows.users.iter().any(|u| u.id == submitted_by) {
            bail!("foreign key violation: no user row with id {submitted_by}");
        }
        let (teacher_id, teacher_name) = self.submitted_teacher(&draft.teacher)?;
        let submission = Submission {
            id: self.next_submission_id,
            teacher_id,
            teacher_name,
            context: draft.context.clone(),
            text: draft.text.clone(),
            created_at,
            submitted_by,
        };
        self.next_submission_id += 1;
        self.submissions.push(submission.clone());
        Ok(submission)
    }

    pub fn update_submission(&mut self, id: SubmissionId, draft: &SubmissionDraft) -> Result<Submission> {
        let (teacher_id, teacher_name) = self.submitted_teacher(&draft.teacher)?;
        let row = self.submission_mut(id)?;
        row.teacher_id = teacher_id;
        row.teacher_name = teacher_name;
        row.context = draft.context.clone();
        row.text = draft.text.clone();
        Ok(row.clone())
    }

    pub fn assign_submission_teacher(&mut self, id: SubmissionId, teacher_id: TeacherId) -> Result<Submission> {
        self.require_teacher(teacher_id)?;
        let row = self.submission_mut(id)?;
        row.teacher_id = teacher_id;
        Ok(row.clone())
    }

    pub fn delete_submission(&mut self, id: SubmissionId) -> Result<Submission> {
        match self.submissions.iter().position(|s| s.id == id) {
            Some(pos) => Ok(self.submissions.remove(pos)),
            None => bail!("no submission row with id {id}"),
        }
    }
}

/// Volatile backing store, mainly for tests. Can be switched into a failing
/// mode to exercise the write-through error paths.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Snapshot) -> Self {
        Self { tables: Mutex::new(Tables::from_rows(rows)), unavailable: AtomicBool::new(false) }
    }

    /// Make every following call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Direct access to the rows, bypassing the gallery.
    pub fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock()
    }

    pub fn insert_user(&self, name: &str, password: &str, admin: bool) -> Result<User> {
        self.write(|t| t.insert_user(name, password, admin))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("backing store unavailable");
        }
        f(&mut self.tables.lock())
    }
}

impl Backend for MemoryBackend {
    fn load(&self) -> Result<Snapshot> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("backing store unavailable");
        }
        Ok(self.tables.lock().rows.clone())
    }

    fn insert_quote(&self, draft: &QuoteDraft, created_at: i64) -> Result<QuoteRecord> {
        self.write(|t| t.insert_quote(draft, created_at))
    }

    fn update_quote(&self, id: QuoteId, draft: &QuoteDraft) -> Result<()> {
        self.write(|t| t.update_quote(id, draft))
    }

    fn delete_quote(&self, id: QuoteId) -> Result<()> {
        self.write(|t| t.delete_quote(id))
    }

    fn insert_teacher(&self, draft: &TeacherDraft) -> Result<Teacher> {
        self.write(|t| t.insert_teacher(draft))
    }

    fn update_teacher(&self, teacher: &Teacher) -> Result<()> {
        self.write(|t| t.update_teacher(teacher))
    }

    fn delete_teacher(&self, id: TeacherId) -> Result<()> {
        self.write(|t| t.delete_teacher(id))
    }

    fn upsert_vote(&self, vote: &Vote) -> Result<()> {
        self.write(|t| t.upsert_vote(vote))
    }

    fn submissions(&self) -> Result<Vec<Submission>> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("backing store unavailable");
        }
        Ok(self.tables.lock().submissions.clone())
    }

    fn insert_submission(&self, draft: &SubmissionDraft, submitted_by: UserId, created_at: i64) -> Result<Submission> {
        self.write(|t| t.insert_submission(draft, submitted_by, created_at))
    }

    fn update_submission(&self, id: SubmissionId, draft: &SubmissionDraft) -> Result<Submission> {
        self.write(|t| t.update_submission(id, draft))
    }

    fn assign_submission_teacher(&self, id: SubmissionId, teacher_id: TeacherId) -> Result<Submission> {
        self.write(|t| t.assign_submission_teacher(id, teacher_id))
    }

    fn delete_submission(&self, id: SubmissionId) -> Result<Submission> {
        self.write(|t| t.delete_submission(id))
    }
}
