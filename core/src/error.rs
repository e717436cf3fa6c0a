use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Quote,
    Teacher,
    User,
    Submission,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Quote => "quote",
            Entity::Teacher => "teacher",
            Entity::User => "user",
            Entity::Submission => "submission",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The backing store refused or failed the operation; the cache was not touched.
    #[error(transparent)]
    Backend(anyhow::Error),

    /// The backing store accepted a write the cache could not apply. A full
    /// reload resynchronizes the cache.
    #[error("cache out of sync after {op}: {source}")]
    Desync {
        op: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("quote array cannot address slot {0}")]
    SlotOverflow(usize),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(entity: Entity, id: u32) -> Self {
        Error::NotFound { entity, id }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}
