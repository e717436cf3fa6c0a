//! In-memory write-through cache for a quote gallery.
//!
//! The [`store`] holds dense quote and teacher arrays with an inverted word
//! index, guarded by the spin lock in [`lock`]. The [`generator`] keeps
//! sorted views of the quotes and [`gallery`] ties both to a [`backend`].

pub mod backend;
pub mod config;
pub mod error;
pub mod gallery;
pub mod generator;
pub mod index;
pub mod lock;
pub mod model;
pub mod persist;
pub mod stats;
pub mod store;
pub mod tokenizer;

pub use backend::{Backend, MemoryBackend};
pub use config::GalleryConfig;
pub use error::{Entity, Error, Result};
pub use gallery::Gallery;
pub use generator::{IndexGenerator, QuoteOrder};
pub use model::{
    OwnVote, Quote, QuoteDraft, QuoteId, Snapshot, Submission, SubmissionDraft, SubmissionId, Teacher, TeacherDraft,
    TeacherId, TeacherRef, User, UserId, Vote,
};
pub use persist::FileBackend;
pub use store::{QuoteCache, QuoteHandle};
