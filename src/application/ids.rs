//! External identifier generation.

use std::sync::Mutex;

use ulid::Generator;

use crate::cache::lock::mutex_lock;

const SOURCE: &str = "application::ids";

/// Process-wide generator of external keys.
///
/// Identifiers are monotonic ULIDs: strictly increasing within the process,
/// so two calls never return the same value.
pub struct IdGenerator {
    inner: Mutex<Generator>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    pub fn next_id(&self) -> String {
        let mut generator = mutex_lock(&self.inner, SOURCE, "next_id");
        loop {
            match generator.generate() {
                Ok(id) => return id.to_string(),
                // Random component exhausted within this millisecond.
                Err(_) => std::thread::yield_now(),
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let ids = IdGenerator::new();
        let mut previous = ids.next_id();
        for _ in 0..1_000 {
            let next = ids.next_id();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let ids = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..500).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("worker thread") {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 2_000);
    }
}
