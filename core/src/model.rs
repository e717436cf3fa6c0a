use serde::{Deserialize, Serialize};

use crate::stats::QuoteStats;

pub type QuoteId = u32;
pub type TeacherId = u32;
pub type UserId = u32;
pub type SubmissionId = u32;

/// Lowest allowed rating.
pub const RATING_MIN: u8 = 1;
/// Highest allowed rating.
pub const RATING_MAX: u8 = 5;
/// The neutral rating scores are centred on.
pub const RATING_DEFAULT: u8 = 3;
/// Number of histogram buckets, one per allowed rating.
pub const RATING_BUCKETS: usize = (RATING_MAX - RATING_MIN + 1) as usize;

pub fn rating_in_range(rating: u8) -> bool {
    (RATING_MIN..=RATING_MAX).contains(&rating)
}

/// The requesting user's own vote on a quote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnVote {
    /// Not looked up for this response.
    #[default]
    Unresolved,
    /// Looked up: the user has not voted.
    None,
    Rated(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: QuoteId,
    pub teacher_id: TeacherId,
    pub context: String,
    pub text: String,
    /// Creation time, unix seconds.
    pub created_at: i64,
    #[serde(default)]
    pub stats: QuoteStats,
    #[serde(default)]
    pub own_vote: OwnVote,
    #[serde(default)]
    pub relevance: f32,
}

impl Quote {
    pub fn new(id: QuoteId, teacher_id: TeacherId, context: impl Into<String>, text: impl Into<String>, created_at: i64) -> Self {
        Self {
            id,
            teacher_id,
            context: context.into(),
            text: text.into(),
            created_at,
            stats: QuoteStats::default(),
            own_vote: OwnVote::Unresolved,
            relevance: 0.0,
        }
    }

    /// Builds the cache entry for a persisted row; histogram and scores start empty
    /// and are rebuilt from the vote rows.
    pub fn from_record(record: &QuoteRecord) -> Self {
        Self::new(record.id, record.teacher_id, record.context.clone(), record.text.clone(), record.created_at)
    }
}

/// A quote row as the backing store holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub id: QuoteId,
    pub teacher_id: TeacherId,
    pub context: String,
    pub text: String,
    pub created_at: i64,
}

/// Fields a caller supplies when creating or editing a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteDraft {
    pub teacher_id: TeacherId,
    #[serde(default)]
    pub context: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teacher {
    pub id: TeacherId,
    pub name: String,
    pub title: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeacherDraft {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub note: String,
}

impl TeacherDraft {
    pub fn with_id(self, id: TeacherId) -> Teacher {
        Teacher { id, name: self.name, title: self.title, note: self.note }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub user_id: UserId,
    pub quote_id: QuoteId,
    pub rating: u8,
}

/// How a submission names its teacher: an existing teacher's id, or free text
/// a moderator resolves later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TeacherRef {
    Id(TeacherId),
    Name(String),
}

/// Fields a user supplies when submitting a quote for moderation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionDraft {
    pub teacher: TeacherRef,
    #[serde(default)]
    pub context: String,
    pub text: String,
}

/// A quote waiting for an admin to confirm it. Submissions live in the backing
/// store only; the cache sees them once confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    /// 0 until a teacher is assigned.
    pub teacher_id: TeacherId,
    /// Free-text teacher as submitted, kept for the moderator.
    pub teacher_name: String,
    pub context: String,
    pub text: String,
    pub created_at: i64,
    pub submitted_by: UserId,
}

impl Submission {
    /// The quote this submission becomes, once it has a teacher.
    pub fn quote_draft(&self) -> Option<QuoteDraft> {
        (self.teacher_id != 0).then(|| QuoteDraft {
            teacher_id: self.teacher_id,
            context: self.context.clone(),
            text: self.text.clone(),
        })
    }
}

/// Everything the backing store holds, as loaded at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub quotes: Vec<QuoteRecord>,
    pub teachers: Vec<Teacher>,
    pub users: Vec<User>,
    pub votes: Vec<Vote>,
}
