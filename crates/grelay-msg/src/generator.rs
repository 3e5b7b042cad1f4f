//! ---
//! grelay_section: "02-messaging-event-model"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Greeting content generation."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "ut", "labore", "et", "dolore", "magna", "aliqua", "enim",
    "ad", "minim", "veniam", "quis", "nostrud", "exercitation", "ullamco", "laboris", "nisi",
    "aliquip", "ex", "ea", "commodo", "consequat", "duis", "aute", "irure", "in", "voluptate",
    "velit", "esse", "cillum", "fugiat", "nulla", "pariatur",
];

const MIN_WORDS: usize = 5;
const MAX_WORDS: usize = 12;

/// Source of greeting text. The content is opaque to the relay.
pub trait GreetingGenerator: Send + Sync {
    /// Produce one non-empty sentence.
    fn sentence(&self) -> String;
}

/// Lorem-ipsum sentence generator.
#[derive(Debug)]
pub struct LoremGenerator {
    rng: Mutex<StdRng>,
}

impl LoremGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic generator for tests and replays.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for LoremGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl GreetingGenerator for LoremGenerator {
    fn sentence(&self) -> String {
        let mut rng = self.rng.lock();
        let count = rng.gen_range(MIN_WORDS..=MAX_WORDS);
        let words: Vec<&str> = (0..count)
            .filter_map(|_| WORDS.choose(&mut *rng).copied())
            .collect();
        let mut sentence = words.join(" ");
        if let Some(first) = sentence.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        sentence.push('.');
        sentence
    }
}

/// Generator that always returns the same text.
#[derive(Debug, Clone)]
pub struct FixedGenerator(pub String);

impl GreetingGenerator for FixedGenerator {
    fn sentence(&self) -> String {
        self.0.clone()
    }
}
