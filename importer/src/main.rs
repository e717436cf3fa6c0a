use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gallery_core::backend::Tables;
use gallery_core::config::DEFAULT_REGENERATE_INTERVAL;
use gallery_core::generator::{IndexGenerator, SortKey};
use gallery_core::model::{rating_in_range, QuoteDraft, Snapshot, TeacherDraft, Vote};
use gallery_core::persist::{load_tables, save_tables, DataPaths};
use gallery_core::store::QuoteCache;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::{fmt, EnvFilter};
use walkdir::WalkDir;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// One input record. Quotes name their teacher by key or name, votes name
/// their user by name and their quote by key.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum InputRecord {
    Teacher {
        #[serde(default)]
        key: Option<String>,
        name: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        note: String,
    },
    Quote {
        #[serde(default)]
        key: Option<String>,
        teacher: String,
        #[serde(default)]
        context: String,
        text: String,
        /// RFC 3339; defaults to the import time
        #[serde(default)]
        timestamp: Option<String>,
    },
    User {
        name: String,
        password: String,
        #[serde(default)]
        admin: bool,
    },
    Vote {
        user: String,
        quote: String,
        rating: u8,
    },
}

#[derive(Debug, Default, Serialize)]
struct SeedReport {
    users: usize,
    teachers: usize,
    quotes: usize,
    votes: usize,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    quotes: usize,
    teachers: usize,
    users: usize,
    votes: usize,
    words: usize,
    ordered: usize,
    most_popular: Option<u32>,
    minor_holders: u32,
    major_registered: bool,
    problem: Option<String>,
}

#[derive(Parser)]
#[command(name = "importer")]
#[command(about = "Seed and check a quote gallery data directory", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add records from JSON/JSONL files or a directory to a data directory
    Seed {
        /// Input path (file or directory)
        #[arg(long)]
        input: PathBuf,
        /// Data directory, created if missing
        #[arg(long)]
        data: PathBuf,
    },
    /// Load a data directory into a cache and verify its invariants
    Check {
        #[arg(long)]
        data: PathBuf,
    },
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Seed { input, data } => {
            let report = seed(&input, &data)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Check { data } => {
            let report = check(&data)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            match report.problem {
                Some(problem) => bail!("invariant check failed: {problem}"),
                None => Ok(()),
            }
        }
    }
}

fn input_files(input: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() {
                if let Some(ext) = p.extension().and_then(|s| s.to_str()) {
                    if matches!(ext, "json" | "jsonl") {
                        files.push(p.to_path_buf());
                    }
                }
            }
        }
    } else if input.is_file() {
        files.push(input.to_path_buf());
    } else {
        bail!("input {} does not exist", input.display());
    }
    Ok(files)
}

fn read_records(input: &Path) -> Result<Vec<InputRecord>> {
    let mut records = Vec::new();
    for file in input_files(input)? {
        if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
            read_jsonl(&file, &mut records)?;
        } else {
            read_json(&file, &mut records)?;
        }
    }
    Ok(records)
}

fn read_jsonl(file: &Path, records: &mut Vec<InputRecord>) -> Result<()> {
    let f = File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let reader = BufReader::new(f);
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() { continue; }
        let record = serde_json::from_str(&line).with_context(|| format!("{}:{}", file.display(), n + 1))?;
        records.push(record);
    }
    Ok(())
}

fn read_json(file: &Path, records: &mut Vec<InputRecord>) -> Result<()> {
    let f = File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let reader = BufReader::new(f);
    let json: serde_json::Value =
        serde_json::from_reader(reader).with_context(|| format!("parsing {}", file.display()))?;
    match json {
        serde_json::Value::Array(arr) => {
            for v in arr {
                records.push(serde_json::from_value(v).with_context(|| format!("record in {}", file.display()))?);
            }
        }
        serde_json::Value::Object(_) => {
            records.push(serde_json::from_value(json).with_context(|| format!("record in {}", file.display()))?);
        }
        _ => tracing::warn!(file = %file.display(), "ignoring non-object JSON"),
    }
    Ok(())
}

fn parse_timestamp(ts: Option<&str>) -> Result<i64> {
    match ts {
        Some(ts) => Ok(OffsetDateTime::parse(ts, &Rfc3339)
            .with_context(|| format!("bad timestamp {ts:?}"))?
            .unix_timestamp()),
        None => Ok(OffsetDateTime::now_utc().unix_timestamp()),
    }
}

/// Adds the records under `input` to the data directory at `data`. Users
/// and teachers go in before quotes, and quotes before votes, so references
/// resolve regardless of file order.
fn seed(input: &Path, data: &Path) -> Result<SeedReport> {
    let paths = DataPaths::new(data);
    let mut tables = if paths.exists() {
        load_tables(&paths).with_context(|| format!("loading {}", data.display()))?
    } else {
        Tables::from_rows(Snapshot::default())
    };

    let mut users = Vec::new();
    let mut teachers = Vec::new();
    let mut quotes = Vec::new();
    let mut votes = Vec::new();
    for record in read_records(input)? {
        match record {
            InputRecord::User { .. } => users.push(record),
            InputRecord::Teacher { .. } => teachers.push(record),
            InputRecord::Quote { .. } => quotes.push(record),
            InputRecord::Vote { .. } => votes.push(record),
        }
    }

    let mut user_ids: HashMap<String, u32> =
        tables.rows.users.iter().map(|u| (u.name.to_lowercase(), u.id)).collect();
    let mut teacher_ids: HashMap<String, u32> =
        tables.rows.teachers.iter().map(|t| (t.name.clone(), t.id)).collect();
    let mut quote_ids: HashMap<String, u32> = HashMap::new();
    let mut report = SeedReport::default();

    for record in users {
        if let InputRecord::User { name, password, admin } = record {
            let user = tables.insert_user(&name, &password, admin)?;
            user_ids.insert(name.to_lowercase(), user.id);
            report.users += 1;
        }
    }
    for record in teachers {
        if let InputRecord::Teacher { key, name, title, note } = record {
            let teacher = tables.insert_teacher(&TeacherDraft { name: name.clone(), title, note })?;
            teacher_ids.insert(name, teacher.id);
            if let Some(key) = key {
                teacher_ids.insert(key, teacher.id);
            }
            report.teachers += 1;
        }
    }
    for record in quotes {
        if let InputRecord::Quote { key, teacher, context, text, timestamp } = record {
            let Some(&teacher_id) = teacher_ids.get(&teacher) else {
                bail!("quote {text:?} names unknown teacher {teacher:?}");
            };
            if text.trim().is_empty() {
                bail!("quote of teacher {teacher:?} has no text");
            }
            let created_at = parse_timestamp(timestamp.as_deref())?;
            let quote = tables.insert_quote(&QuoteDraft { teacher_id, context, text }, created_at)?;
            if let Some(key) = key {
                quote_ids.insert(key, quote.id);
            }
            report.quotes += 1;
        }
    }
    for record in votes {
        if let InputRecord::Vote { user, quote, rating } = record {
            let Some(&user_id) = user_ids.get(&user.to_lowercase()) else {
                bail!("vote names unknown user {user:?}");
            };
            let Some(&quote_id) = quote_ids.get(&quote) else {
                bail!("vote names unknown quote key {quote:?}");
            };
            if !rating_in_range(rating) {
                bail!("vote of {user:?} on {quote:?} has out-of-range rating {rating}");
            }
            tables.upsert_vote(&Vote { user_id, quote_id, rating })?;
            report.votes += 1;
        }
    }

    save_tables(&paths, &tables).with_context(|| format!("saving {}", data.display()))?;
    tracing::info!(data = %data.display(), ?report, "seed complete");
    Ok(report)
}

fn check(data: &Path) -> Result<CheckReport> {
    let paths = DataPaths::new(data);
    if !paths.exists() {
        bail!("no data directory at {}", data.display());
    }
    let tables = load_tables(&paths).with_context(|| format!("loading {}", data.display()))?;
    let rows = tables.rows;
    let (teachers, users, votes) = (rows.teachers.len(), rows.users.len(), rows.votes.len());

    let cache = QuoteCache::new();
    cache.load(rows).context("filling the cache")?;
    let generator = IndexGenerator::new(DEFAULT_REGENERATE_INTERVAL);
    generator.force_regenerate(&cache);
    let orders = generator.orders();

    let words = cache.read().word_index().len();
    let problem = cache.check_invariants().err();
    let report = CheckReport {
        quotes: cache.quote_count(),
        teachers,
        users,
        votes,
        words,
        ordered: orders.len(),
        most_popular: orders.sequence(SortKey::Popularity).first().map(|h| h.id),
        minor_holders: cache.lock().minor_holders(),
        major_registered: cache.lock().major_registered(),
        problem,
    };
    tracing::info!(data = %data.display(), ok = report.problem.is_none(), "check complete");
    Ok(report)
}
