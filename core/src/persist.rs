//! A directory-backed [`Backend`]: one bincode file per table plus a JSON
//! meta file carrying the id counters.
//!
//! Table files carry a generation number (`quotes-3.bin`). A save writes the
//! whole next generation through temporary files, then swaps in a `meta.json`
//! naming it. Until that swap readers keep seeing the previous generation, so
//! a save that fails halfway leaves nothing behind.

use std::fs::{self, create_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Tables};
use crate::model::{
    QuoteDraft, QuoteId, QuoteRecord, Snapshot, Submission, SubmissionDraft, SubmissionId, Teacher, TeacherDraft,
    TeacherId, User, UserId, Vote,
};

pub const FORMAT_VERSION: u32 = 1;

const TABLES: [&str; 5] = ["quotes", "teachers", "users", "votes", "submissions"];

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u32,
    /// Generation of the table files this meta file commits.
    pub generation: u64,
    pub next_quote_id: u32,
    pub next_teacher_id: u32,
    pub next_user_id: u32,
    pub next_submission_id: u32,
}

pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn table(&self, name: &str, generation: u64) -> PathBuf {
        self.root.join(format!("{name}-{generation}.bin"))
    }

    fn meta(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    pub fn exists(&self) -> bool {
        self.meta().is_file()
    }
}

/// Writes `bytes` to a temporary file next to `path` and renames it into place.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).with_context(|| format!("staging {}", path.display()))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

fn save_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let bytes = bincode::serialize(rows)?;
    replace_file(path, &bytes)
}

fn load_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    let rows = bincode::deserialize(&buf).with_context(|| format!("decoding {}", path.display()))?;
    Ok(rows)
}

pub fn save_meta(paths: &DataPaths, meta: &MetaFile) -> Result<()> {
    let json = serde_json::to_string_pretty(meta)?;
    replace_file(&paths.meta(), json.as_bytes())
}

pub fn load_meta(paths: &DataPaths) -> Result<MetaFile> {
    let mut f = File::open(paths.meta()).with_context(|| format!("opening {}", paths.meta().display()))?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let meta: MetaFile = serde_json::from_str(&buf)?;
    if meta.version != FORMAT_VERSION {
        anyhow::bail!("unsupported data format version {} (expected {FORMAT_VERSION})", meta.version);
    }
    Ok(meta)
}

/// Generation committed by the current meta file, 0 for a new directory.
fn committed_generation(paths: &DataPaths) -> Result<u64> {
    if !paths.exists() {
        return Ok(0);
    }
    Ok(load_meta(paths)?.generation)
}

pub fn save_tables(paths: &DataPaths, tables: &Tables) -> Result<()> {
    create_dir_all(&paths.root)?;
    let previous = committed_generation(paths)?;
    let generation = previous + 1;
    save_table(&paths.table("quotes", generation), &tables.rows.quotes)?;
    save_table(&paths.table("teachers", generation), &tables.rows.teachers)?;
    save_table(&paths.table("users", generation), &tables.rows.users)?;
    save_table(&paths.table("votes", generation), &tables.rows.votes)?;
    save_table(&paths.table("submissions", generation), &tables.submissions)?;
    save_meta(
        paths,
        &MetaFile {
            version: FORMAT_VERSION,
            generation,
            next_quote_id: tables.next_quote_id,
            next_teacher_id: tables.next_teacher_id,
            next_user_id: tables.next_user_id,
            next_submission_id: tables.next_submission_id,
        },
    )?;

    if previous > 0 {
        for name in TABLES {
            let stale = paths.table(name, previous);
            if let Err(err) = fs::remove_file(&stale) {
                warn!(path = %stale.display(), error = %err, "could not remove superseded table file");
            }
        }
    }
    Ok(())
}

pub fn load_tables(paths: &DataPaths) -> Result<Tables> {
    let meta = load_meta(paths)?;
    let generation = meta.generation;
    let rows = Snapshot {
        quotes: load_table(&paths.table("quotes", generation))?,
        teachers: load_table(&paths.table("teachers", generation))?,
        users: load_table(&paths.table("users", generation))?,
        votes: load_table(&paths.table("votes", generation))?,
    };
    let submissions = load_table(&paths.table("submissions", generation))?;
    let mut tables = Tables::from_rows(rows).with_submissions(submissions);
    // never hand out an id twice, even one whose row was deleted
    tables.next_quote_id = tables.next_quote_id.max(meta.next_quote_id);
    tables.next_teacher_id = tables.next_teacher_id.max(meta.next_teacher_id);
    tables.next_user_id = tables.next_user_id.max(meta.next_user_id);
    tables.next_submission_id = tables.next_submission_id.max(meta.next_submission_id);
    Ok(tables)
}

/// Keeps the tables in memory and rewrites the directory after every
/// successful mutation. A mutation whose save fails is rolled back.
pub struct FileBackend {
    paths: DataPaths,
    tables: Mutex<Tables>,
}

impl FileBackend {
    /// Opens the data directory at `root`, creating an empty one if none exists.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let paths = DataPaths::new(root);
        let tables = if paths.exists() {
            load_tables(&paths)?
        } else {
            let tables = Tables::default();
            save_tables(&paths, &tables)?;
            info!(root = %paths.root.display(), "initialized empty data directory");
            tables
        };
        Ok(Self { paths, tables: Mutex::new(tables) })
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn insert_user(&self, name: &str, password: &str, admin: bool) -> Result<User> {
        self.mutate(|t| t.insert_user(name, password, admin))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.lock();
        let mut next = tables.clone();
        let out = f(&mut next)?;
        save_tables(&self.paths, &next)?;
        *tables = next;
        debug!(root = %self.paths.root.display(), "saved tables");
        Ok(out)
    }
}

impl Backend for FileBackend {
    fn load(&self) -> Result<Snapshot> {
        // re-read from disk so external edits (the importer) are picked up
        let tables = load_tables(&self.paths)?;
        let rows = tables.rows.clone();
        *self.tables.lock() = tables;
        Ok(rows)
    }

    fn insert_quote(&self, draft: &QuoteDraft, created_at: i64) -> Result<QuoteRecord> {
        self.mutate(|t| t.insert_quote(draft, created_at))
    }

    fn update_quote(&self, id: QuoteId, draft: &QuoteDraft) -> Result<()> {
        self.mutate(|t| t.update_quote(id, draft))
    }

    fn delete_quote(&self, id: QuoteId) -> Result<()> {
        self.mutate(|t| t.delete_quote(id))
    }

    fn insert_teacher(&self, draft: &TeacherDraft) -> Result<Teacher> {
        self.mutate(|t| t.insert_teacher(draft))
    }

    fn update_teacher(&self, teacher: &Teacher) -> Result<()> {
        self.mutate(|t| t.update_teacher(teacher))
    }

    fn delete_teacher(&self, id: TeacherId) -> Result<()> {
        self.mutate(|t| t.delete_teacher(id))
    }

    fn upsert_vote(&self, vote: &Vote) -> Result<()> {
        self.mutate(|t| t.upsert_vote(vote))
    }

    fn submissions(&self) -> Result<Vec<Submission>> {
        Ok(self.tables.lock().submissions.clone())
    }

    fn insert_submission(&self, draft: &SubmissionDraft, submitted_by: UserId, created_at: i64) -> Result<Submission> {
        self.mutate(|t| t.insert_submission(draft, submitted_by, created_at))
    }

    fn update_submission(&self, id: SubmissionId, draft: &SubmissionDraft) -> Result<Submission> {
        self.mutate(|t| t.update_submission(id, draft))
    }

    fn assign_submission_teacher(&self, id: SubmissionId, teacher_id: TeacherId) -> Result<Submission> {
        self.mutate(|t| t.assign_submission_teacher(id, teacher_id))
    }

    fn delete_submission(&self, id: SubmissionId) -> Result<Submission> {
        self.mutate(|t| t.delete_submission(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TeacherRef;

    fn teacher(name: &str) -> TeacherDraft {
        TeacherDraft { name: name.into(), title: "Frau".into(), note: String::new() }
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        let user = backend.insert_user("ada", "pw", true).unwrap();
        let teacher = backend.insert_teacher(&teacher("Müller")).unwrap();
        let q = backend
            .insert_quote(&QuoteDraft { teacher_id: teacher.id, context: "Mathe".into(), text: "Hallo Welt".into() }, 7)
            .unwrap();
        backend.upsert_vote(&Vote { user_id: user.id, quote_id: q.id, rating: 5 }).unwrap();
        backend.delete_quote(q.id).unwrap();
        backend
            .insert_submission(
                &SubmissionDraft { teacher: TeacherRef::Name("Herr X".into()), context: String::new(), text: "Na?".into() },
                user.id,
                9,
            )
            .unwrap();
        drop(backend);

        let reopened = FileBackend::open(dir.path()).unwrap();
        let rows = reopened.load().unwrap();
        assert_eq!(rows.users.len(), 1);
        assert_eq!(rows.teachers[0].name, "Müller");
        assert!(rows.quotes.is_empty());
        assert!(rows.votes.is_empty());
        assert_eq!(reopened.submissions().unwrap()[0].teacher_name, "Herr X");

        // the deleted quote's id is not reused
        let next = reopened
            .insert_quote(&QuoteDraft { teacher_id: teacher.id, context: String::new(), text: "x".into() }, 8)
            .unwrap();
        assert_eq!(next.id, q.id + 1);
    }

    #[test]
    fn rejected_mutation_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        assert!(backend
            .insert_quote(&QuoteDraft { teacher_id: 3, context: String::new(), text: "x".into() }, 1)
            .is_err());
        assert!(backend.load().unwrap().quotes.is_empty());
    }

    #[test]
    fn failed_save_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.insert_teacher(&teacher("Kept")).unwrap();
        let paths = DataPaths::new(dir.path());
        let next = load_meta(&paths).unwrap().generation + 1;

        // the last table file of the next generation cannot be written
        let blocker = paths.table("submissions", next);
        fs::create_dir(&blocker).unwrap();
        assert!(backend.insert_teacher(&teacher("Ghost")).is_err());
        fs::remove_dir(&blocker).unwrap();

        let names = |rows: Snapshot| rows.teachers.into_iter().map(|t| t.name).collect::<Vec<_>>();
        assert_eq!(names(backend.load().unwrap()), vec!["Kept"]);
        let reopened = FileBackend::open(dir.path()).unwrap();
        assert_eq!(names(reopened.load().unwrap()), vec!["Kept"]);

        // the next save goes through and reuses the abandoned generation
        reopened.insert_teacher(&teacher("Later")).unwrap();
        assert_eq!(names(reopened.load().unwrap()), vec!["Kept", "Later"]);
    }

    #[test]
    fn superseded_generations_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.insert_teacher(&teacher("A")).unwrap();
        backend.insert_teacher(&teacher("B")).unwrap();
        let paths = DataPaths::new(dir.path());
        let generation = load_meta(&paths).unwrap().generation;
        assert_eq!(generation, 3);
        assert!(paths.table("quotes", generation).is_file());
        assert!(!paths.table("quotes", generation - 1).exists());
    }

    #[test]
    fn unknown_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        FileBackend::open(dir.path()).unwrap();
        let paths = DataPaths::new(dir.path());
        let meta = MetaFile {
            version: 99,
            generation: 1,
            next_quote_id: 1,
            next_teacher_id: 1,
            next_user_id: 1,
            next_submission_id: 1,
        };
        save_meta(&paths, &meta).unwrap();
        assert!(FileBackend::open(dir.path()).is_err());
    }
}
