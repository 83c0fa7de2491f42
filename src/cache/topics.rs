//! Lightweight topic labels for semantic cache entries.
//!
//! Topics are informational: they are stored with each semantic entry and
//! shown by `parley cache stats`, but never take part in matching.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "is", "am", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do",
        "does", "did", "will", "would", "shall", "should", "may", "might", "must", "can",
        "could", "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them",
        "my", "your", "his", "its", "our", "their", "this", "that", "these", "those", "what",
        "how", "why", "when", "where", "who", "which", "about", "please", "tell", "explain",
        "some", "any", "there", "here", "from", "into", "than", "then", "just", "also", "not",
    ]
    .into_iter()
    .collect()
});

/// Words after which the next significant words name the subject.
const LEAD_INS: &[&str] = &["about", "regarding", "explain", "what", "how", "why"];

#[derive(Debug, Clone)]
pub struct TopicExtractor {
    max_topics: usize,
    min_word_len: usize,
}

impl Default for TopicExtractor {
    fn default() -> Self {
        Self::new(3)
    }
}

impl TopicExtractor {
    pub fn new(max_topics: usize) -> Self {
        Self {
            max_topics,
            min_word_len: 3,
        }
    }

    fn words(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect()
    }

    fn is_significant(&self, word: &str) -> bool {
        word.chars().count() >= self.min_word_len
            && !STOP_WORDS.contains(word)
            && !word.chars().all(|c| c.is_ascii_digit())
    }

    /// Up to `max_topics` labels, most prominent first.
    ///
    /// A phrase following a lead-in ("about rust lifetimes") wins first
    /// place; the remaining slots go to the most frequent significant words,
    /// ties broken by first appearance.
    pub fn extract(&self, text: &str) -> Vec<String> {
        if self.max_topics == 0 {
            return Vec::new();
        }
        let words = Self::words(text);
        let mut topics: Vec<String> = Vec::new();

        if let Some(pos) = words.iter().position(|w| LEAD_INS.contains(&w.as_str())) {
            let phrase: Vec<&str> = words[pos + 1..]
                .iter()
                .filter(|w| self.is_significant(w))
                .take(2)
                .map(String::as_str)
                .collect();
            if !phrase.is_empty() {
                topics.push(phrase.join(" "));
            }
        }

        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for (idx, word) in words.iter().enumerate() {
            if self.is_significant(word) {
                counts.entry(word.as_str()).or_insert((0, idx)).0 += 1;
            }
        }
        let mut ranked: Vec<(&str, usize, usize)> =
            counts.into_iter().map(|(w, (n, first))| (w, n, first)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        for (word, _, _) in ranked {
            if topics.len() >= self.max_topics {
                break;
            }
            if !topics.iter().any(|t| t.split(' ').any(|p| p == word)) {
                topics.push(word.to_string());
            }
        }
        topics.truncate(self.max_topics);
        topics
    }
}
