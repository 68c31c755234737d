//! Session id generation.

use rand::Rng;

/// Characters used in generated ids: URL and cookie safe, never a separator.
const ID_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Produces new base ids.
pub trait IdGenerator: Send + Sync {
    /// A fresh, unpredictable id of the configured length.
    fn next_id(&self) -> String;
}

/// Generator drawing from the thread-local CSPRNG (reseeded from the OS).
#[derive(Debug, Clone)]
pub struct RandomIdGenerator {
    length: usize,
}

impl RandomIdGenerator {
    pub fn new(length: usize) -> Self {
        Self { length }
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> String {
        let mut rng = rand::rng();
        (0..self.length)
            .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::codec::is_safe;

    #[test]
    fn test_generated_length_and_alphabet() {
        let generator = RandomIdGenerator::new(23);
        let id = generator.next_id();
        assert_eq!(id.len(), 23);
        assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)));
        assert!(is_safe(&id));
        assert!(!id.contains(':'));
    }

    #[test]
    fn test_ids_do_not_repeat() {
        let generator = RandomIdGenerator::new(23);
        let ids: HashSet<String> = (0..1000).map(|_| generator.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
