use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use gallery_core::{
    Backend, Error, Gallery, GalleryConfig, MemoryBackend, QuoteDraft, QuoteOrder, TeacherDraft,
};

const VOCABULARY: &[&str] = &["alpha", "beta", "gamma", "delta", "Alpha", "epsilon", "zeta", "eta"];

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    fn below(&mut self, n: u32) -> u32 {
        self.next() % n
    }

    fn sentence(&mut self) -> String {
        let len = 1 + self.below(5);
        (0..len).map(|_| VOCABULARY[self.below(VOCABULARY.len() as u32) as usize]).collect::<Vec<_>>().join(" ")
    }
}

fn gallery_with_users(users: u32) -> (Arc<MemoryBackend>, Gallery) {
    let backend = Arc::new(MemoryBackend::new());
    for i in 0..users {
        backend.insert_user(&format!("user{i}"), "pw", i == 0).unwrap();
    }
    let store: Arc<dyn Backend> = backend.clone();
    let gallery = Gallery::open(store, GalleryConfig { auto_regenerate: false, ..GalleryConfig::default() }).unwrap();
    (backend, gallery)
}

/// The cache must hold exactly the backing store's quotes with matching vote counts.
fn assert_mirrors(backend: &MemoryBackend, gallery: &Gallery) {
    gallery.cache().check_invariants().unwrap();
    let tables = backend.tables();
    let mut votes: HashMap<u32, u32> = HashMap::new();
    for v in &tables.rows.votes {
        *votes.entry(v.quote_id).or_default() += 1;
    }
    let cached = gallery.cache().list_all_quotes();
    assert_eq!(cached.len(), tables.rows.quotes.len());
    for row in &tables.rows.quotes {
        let q = cached.iter().find(|q| q.id == row.id).unwrap();
        assert_eq!(q.text, row.text);
        assert_eq!(q.teacher_id, row.teacher_id);
        assert_eq!(q.stats.votes, votes.get(&row.id).copied().unwrap_or(0));
    }
    assert_eq!(gallery.teachers().len(), tables.rows.teachers.len());
}

#[test]
fn random_mutations_keep_cache_and_store_in_step() {
    let (backend, gallery) = gallery_with_users(4);
    let mut rng = Lcg(0x5eed);
    let mut teachers: Vec<u32> = Vec::new();
    let mut quotes: Vec<u32> = Vec::new();

    for step in 0..600 {
        let coin = rng.below(4);
        let outcome = match rng.below(10) {
            0 => gallery
                .add_teacher(&TeacherDraft { name: format!("T{step}"), title: String::new(), note: String::new() })
                .map(|t| teachers.push(t.id)),
            1..=3 if !teachers.is_empty() => {
                let teacher_id = teachers[rng.below(teachers.len() as u32) as usize];
                let draft = QuoteDraft { teacher_id, context: String::new(), text: rng.sentence() };
                gallery.add_quote(&draft).map(|q| quotes.push(q.id))
            }
            4 if !quotes.is_empty() && !teachers.is_empty() => {
                let id = quotes[rng.below(quotes.len() as u32) as usize];
                let teacher_id = teachers[rng.below(teachers.len() as u32) as usize];
                let draft = QuoteDraft { teacher_id, context: "edited".into(), text: rng.sentence() };
                gallery.edit_quote(id, &draft).map(|_| ())
            }
            5 if !quotes.is_empty() => {
                let id = quotes.swap_remove(rng.below(quotes.len() as u32) as usize);
                gallery.remove_quote(id).map(|_| ())
            }
            6 if teachers.len() > 1 && coin == 0 => {
                let id = teachers.swap_remove(rng.below(teachers.len() as u32) as usize);
                gallery.remove_teacher(id).map(|removed| quotes.retain(|q| !removed.contains(q)))
            }
            _ if !quotes.is_empty() => {
                let id = quotes[rng.below(quotes.len() as u32) as usize];
                let user = 1 + rng.below(4);
                let rating = 1 + rng.below(5) as u8;
                gallery.vote(user, id, rating).map(|_| ())
            }
            _ => Ok(()),
        };
        match outcome {
            Ok(()) => {}
            Err(err) => panic!("step {step}: unexpected {err}"),
        }
        if step % 25 == 0 {
            assert_mirrors(&backend, &gallery);
        }
    }
    assert_mirrors(&backend, &gallery);

    gallery.force_regenerate();
    let sorted = gallery.sorted_quotes(QuoteOrder::PopularityDesc, usize::MAX, 0, None).unwrap();
    assert_eq!(sorted.len(), quotes.len());
    assert!(sorted.windows(2).all(|w| w[0].stats.popularity >= w[1].stats.popularity));

    // a reload from the store rebuilds an identical cache
    let before = gallery.cache().list_all_quotes();
    gallery.reload().unwrap();
    let mut after = gallery.cache().list_all_quotes();
    assert_eq!(after.len(), before.len());
    for q in &before {
        let pos = after.iter().position(|a| a.id == q.id).unwrap();
        let a = after.swap_remove(pos);
        assert_eq!(a.stats.histogram, q.stats.histogram);
        assert!((a.stats.popularity - q.stats.popularity).abs() < 1e-4);
    }
}

#[test]
fn readers_run_alongside_a_writer() {
    let (backend, gallery) = gallery_with_users(3);
    let teacher = gallery
        .add_teacher(&TeacherDraft { name: "Parallel".into(), title: String::new(), note: String::new() })
        .unwrap();

    thread::scope(|s| {
        for reader in 0..4 {
            let gallery = &gallery;
            s.spawn(move || {
                for i in 0..300 {
                    let hits = gallery.search(VOCABULARY[(reader + i) % VOCABULARY.len()], Some(1)).unwrap();
                    assert!(hits.windows(2).all(|w| w[0].relevance >= w[1].relevance));
                    let page = gallery.sorted_quotes(QuoteOrder::TimeDesc, 5, 0, Some(2)).unwrap();
                    assert!(page.len() <= 5);
                    gallery.cache().check_invariants().unwrap();
                }
            });
        }
        s.spawn(|| {
            let mut rng = Lcg(7);
            for _ in 0..200 {
                let draft = QuoteDraft { teacher_id: teacher.id, context: String::new(), text: rng.sentence() };
                let quote = gallery.add_quote(&draft).unwrap();
                gallery.vote(1 + rng.below(3), quote.id, 1 + rng.below(5) as u8).unwrap();
                if rng.below(3) == 0 {
                    gallery.remove_quote(quote.id).unwrap();
                }
                gallery.force_regenerate();
            }
        });
    });

    assert_mirrors(&backend, &gallery);
    assert!(matches!(gallery.vote(1, 9999, 3), Err(Error::NotFound { .. })));
}
