use std::collections::HashMap;
use std::net::SocketAddr;

use crossbeam_channel::Receiver;
use log::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::message::{self, WordRecord};

/// Index of the worker that must reduce `word`. A pure function of the
/// word and the roster length: every node computes the same value for the
/// same roster, which is what keeps a word's occurrences on one reducer.
/// xxh3 is stable across processes and architectures, unlike the std
/// hasher with its per-process random keys.
pub fn designated_index(word: &str, roster_len: usize) -> usize {
    assert!(roster_len > 0, "empty roster");
    (xxh3_64(word.as_bytes()) % roster_len as u64) as usize
}

/// The worker responsible for reducing `word`.
pub fn designated_worker<'a>(word: &str, roster: &'a [String]) -> Option<&'a String> {
    if roster.is_empty() {
        return None;
    }
    roster.get(designated_index(word, roster.len()))
}

/// Sends every locally mapped word to its designated reducer, one
/// `WordRecord` with count 1 per connection. Words owned by this worker
/// itself still travel through its own shuffle port.
pub struct ShuffleRouter {
    roster: Vec<String>,
    peers: HashMap<String, SocketAddr>,
}

impl ShuffleRouter {
    pub fn new(roster: Vec<String>, peers: HashMap<String, SocketAddr>) -> Self {
        ShuffleRouter { roster, peers }
    }

    /// Drain the mapped-word queue until the mapping side closes it.
    /// Channel disconnect means the queue is empty and mapping has
    /// finished, so returning here is the shuffle-done condition.
    pub fn drain(&self, words: Receiver<String>) {
        for word in words.iter() {
            self.route(&word);
        }
    }

    /// A failed send loses that occurrence and skews the final count;
    /// it is reported loudly but not retried.
    fn route(&self, word: &str) {
        let Some(owner) = designated_worker(word, &self.roster) else {
            warn!("empty roster, occurrence of {word:?} lost");
            return;
        };
        match self.peers.get(owner) {
            Some(addr) => {
                if let Err(e) = message::send_message(addr, &WordRecord::single(word)) {
                    warn!("shuffle send of {word:?} to {owner} failed, occurrence lost: {e}");
                }
            }
            None => warn!("no resolved address for {owner}, occurrence of {word:?} lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Listener;
    use crossbeam_channel::unbounded;

    fn roster(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("worker-{i}")).collect()
    }

    #[test]
    fn index_is_independent_of_the_caller() {
        // Two "nodes" computing independently must agree for any word.
        for word in ["the", "cat", "dog", "", "école", "a-very-long-word"] {
            let a = designated_index(word, 5);
            let b = designated_index(word, 5);
            assert_eq!(a, b, "routing for {word:?} diverged");
            assert!(a < 5);
        }
    }

    #[test]
    fn index_depends_only_on_word_and_roster() {
        let small = roster(3);
        let large = roster(7);
        for word in ["alpha", "beta", "gamma", "delta"] {
            let w = designated_worker(word, &small).unwrap();
            assert!(small.contains(w));
            let w = designated_worker(word, &large).unwrap();
            assert!(large.contains(w));
        }
    }

    #[test]
    fn known_words_spread_over_the_roster() {
        // Not a uniformity proof, just a guard against a constant index.
        let indices: Vec<usize> = ["the", "cat", "dog", "fish", "bird", "tree", "sun", "moon"]
            .iter()
            .map(|w| designated_index(w, 4))
            .collect();
        assert!(indices.iter().any(|&i| i != indices[0]));
    }

    #[test]
    fn empty_roster_routes_nowhere() {
        assert_eq!(designated_worker("word", &[]), None);
    }

    #[test]
    fn drain_sends_each_word_to_its_owner() {
        let listener: Listener<WordRecord> = Listener::start("127.0.0.1:0", "shuffle").unwrap();
        let me = "only".to_string();
        let mut peers = HashMap::new();
        peers.insert(me.clone(), listener.local_addr());
        let router = ShuffleRouter::new(vec![me], peers);

        let (tx, rx) = unbounded();
        for w in ["the", "cat", "the"] {
            tx.send(w.to_string()).unwrap();
        }
        drop(tx);
        router.drain(rx);

        let inbox = listener.receiver();
        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(inbox.recv().unwrap());
        }
        assert!(got.iter().all(|r| r.count == 1));
        assert_eq!(got.iter().filter(|r| r.word == "the").count(), 2);
        assert_eq!(got.iter().filter(|r| r.word == "cat").count(), 1);
    }
}
