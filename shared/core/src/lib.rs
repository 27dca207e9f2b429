mod data_shuffle;
mod stopwatch;

pub use data_shuffle::{deterministic_shuffle, seeded_rng, Shuffle, WindowedShuffle};
pub use stopwatch::Stopwatch;
