use std::collections::HashSet;

use tomehub_core::text::deaccent;

/// Typo-rescue collaborator: returns a corrected query or `None`.
pub trait SpellChecker: Send + Sync {
    fn correct(&self, query: &str) -> Option<String>;
}

/// No correction available (spell checking disabled or lexicon missing).
pub struct NoopSpellChecker;

impl SpellChecker for NoopSpellChecker {
    fn correct(&self, _query: &str) -> Option<String> {
        None
    }
}

/// Lexicon-backed corrector: per-token edit-distance-1 lookup over the
/// de-accented vocabulary of the corpus.
pub struct LexiconSpellChecker {
    words: HashSet<String>,
}

impl LexiconSpellChecker {
    pub fn new(vocabulary: impl IntoIterator<Item = String>) -> Self {
        let words = vocabulary
            .into_iter()
            .map(|w| deaccent(w.trim()))
            .filter(|w| w.len() >= 3)
            .collect();
        Self { words }
    }

    fn correct_token(&self, token: &str) -> Option<String> {
        let folded = deaccent(token);
        if folded.len() < 3 || self.words.contains(&folded) {
            return None;
        }
        self.words
            .iter()
            .filter(|candidate| edit_distance_at_most_one(&folded, candidate))
            .min_by_key(|candidate| candidate.len())
            .cloned()
    }
}

impl SpellChecker for LexiconSpellChecker {
    fn correct(&self, query: &str) -> Option<String> {
        let mut changed = false;
        let corrected: Vec<String> = query
            .split_whitespace()
            .map(|token| match self.correct_token(token) {
                Some(fixed) => {
                    changed = true;
                    fixed
                }
                None => token.to_string(),
            })
            .collect();
        changed.then(|| corrected.join(" "))
    }
}

fn edit_distance_at_most_one(a: &str, b: &str) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    match long.len() - short.len() {
        0 => {
            let diffs = short.iter().zip(long.iter()).filter(|(x, y)| x != y).count();
            diffs == 1
        }
        1 => {
            // One insertion: everything before and after the gap must align.
            let mut i = 0;
            while i < short.len() && short[i] == long[i] {
                i += 1;
            }
            short[i..] == long[i + 1..]
        }
        _ => false,
    }
}
