use rand::{seq::SliceRandom, Rng};
use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};
use serde::{Deserialize, Serialize};

/// How a stream of items is shuffled before it is consumed.
///
/// The window is a count of items held in memory at once:
/// `1` disables shuffling, `0` loads everything and shuffles it in one go.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Shuffle {
    #[default]
    DontShuffle,
    Seeded { window: usize, seed: u64 },
}

impl Shuffle {
    pub fn new(window: usize, seed: u64) -> Self {
        if window == 1 {
            Shuffle::DontShuffle
        } else {
            Shuffle::Seeded { window, seed }
        }
    }

    pub fn apply<I: Iterator>(self, iter: I) -> WindowedShuffle<I> {
        match self {
            Shuffle::DontShuffle => WindowedShuffle::passthrough(iter),
            Shuffle::Seeded { window, seed } => WindowedShuffle::new(iter, window, seed),
        }
    }
}

/// Builds the rng every seeded component uses, so equal seeds give equal streams
/// on every process regardless of platform.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    let mut bytes = [0u8; 32];
    bytes[24..32].copy_from_slice(&seed.to_be_bytes());
    ChaCha8Rng::from_seed(bytes)
}

pub fn deterministic_shuffle<T>(items: &mut [T], seed: u64) {
    items.shuffle(&mut seeded_rng(seed));
}

/// Sliding-window shuffle over an iterator.
///
/// Holds at most `window` items; each emitted item is drawn uniformly from
/// the buffer and its slot refilled from the source.
pub struct WindowedShuffle<I: Iterator> {
    inner: I,
    buffer: Vec<I::Item>,
    window: usize,
    rng: Option<ChaCha8Rng>,
    filled: bool,
}

impl<I: Iterator> WindowedShuffle<I> {
    fn passthrough(inner: I) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            window: 1,
            rng: None,
            filled: true,
        }
    }

    fn new(inner: I, window: usize, seed: u64) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            window,
            rng: Some(seeded_rng(seed)),
            filled: false,
        }
    }

    fn fill(&mut self) {
        if self.filled {
            return;
        }
        self.filled = true;
        if self.window == 0 {
            self.buffer.extend(&mut self.inner);
            if let Some(rng) = self.rng.as_mut() {
                self.buffer.shuffle(rng);
            }
        } else {
            while self.buffer.len() < self.window {
                match self.inner.next() {
                    Some(item) => self.buffer.push(item),
                    None => break,
                }
            }
        }
    }
}

impl<I: Iterator> Iterator for WindowedShuffle<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rng.is_none() {
            return self.inner.next();
        }
        self.fill();
        if self.window == 0 {
            return self.buffer.pop();
        }
        if self.buffer.is_empty() {
            return None;
        }
        let len = self.buffer.len();
        let index = self.rng.as_mut()?.random_range(0..len);
        match self.inner.next() {
            Some(replacement) => Some(std::mem::replace(&mut self.buffer[index], replacement)),
            None => Some(self.buffer.swap_remove(index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_of_one_keeps_order() {
        let out: Vec<_> = Shuffle::new(1, 7).apply(0..10).collect();
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn seeded_shuffle_is_a_permutation_and_repeatable() {
        for window in [0, 2, 5, 100] {
            let a: Vec<_> = Shuffle::new(window, 42).apply(0..50).collect();
            let b: Vec<_> = Shuffle::new(window, 42).apply(0..50).collect();
            assert_eq!(a, b, "window {window} not deterministic");

            let mut sorted = a.clone();
            sorted.sort();
            assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn different_seeds_differ() {
        let a: Vec<_> = Shuffle::new(0, 1).apply(0..64).collect();
        let b: Vec<_> = Shuffle::new(0, 2).apply(0..64).collect();
        assert_ne!(a, b);
    }
}
