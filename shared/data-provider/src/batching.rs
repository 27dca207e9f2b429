use serde::{Deserialize, Serialize};

/// How examples are grouped into batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Batching {
    /// Fixed number of examples per batch.
    Static { batch_size: usize },
    /// As many examples as fit in `max_num_tokens` once padded to the longest one.
    Length { max_num_tokens: usize },
}

/// Anything a length-based batcher can measure.
pub trait SequenceLength {
    fn sequence_length(&self) -> usize;
}

impl<T: SequenceLength, E> SequenceLength for Result<T, E> {
    // errors travel through the batcher so they surface in order
    fn sequence_length(&self) -> usize {
        self.as_ref().map_or(0, SequenceLength::sequence_length)
    }
}

/// Groups consecutive items into windows of `batch_size`.
pub struct StaticBatcher<I> {
    inner: I,
    batch_size: usize,
    drop_remainder: bool,
}

impl<I: Iterator> StaticBatcher<I> {
    pub fn new(inner: I, batch_size: usize, drop_remainder: bool) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
            drop_remainder,
        }
    }
}

impl<I: Iterator> Iterator for StaticBatcher<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<_> = self.inner.by_ref().take(self.batch_size).collect();
        if batch.is_empty() || (self.drop_remainder && batch.len() < self.batch_size) {
            return None;
        }
        Some(batch)
    }
}

/// Greedily packs items while `batch_size * longest_item <= max_num_tokens`.
///
/// An item that is longer than the budget on its own becomes a batch of one;
/// items are never dropped or split.
pub struct LengthBatcher<I: Iterator> {
    inner: I,
    max_num_tokens: usize,
    pending: Option<I::Item>,
}

impl<I: Iterator> LengthBatcher<I> {
    pub fn new(inner: I, max_num_tokens: usize) -> Self {
        Self {
            inner,
            max_num_tokens,
            pending: None,
        }
    }
}

impl<I> Iterator for LengthBatcher<I>
where
    I: Iterator,
    I::Item: SequenceLength,
{
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::new();
        let mut longest = 0;

        while let Some(item) = self.pending.take().or_else(|| self.inner.next()) {
            let candidate_longest = longest.max(item.sequence_length());
            if !batch.is_empty() && (batch.len() + 1) * candidate_longest > self.max_num_tokens {
                self.pending = Some(item);
                break;
            }
            longest = candidate_longest;
            batch.push(item);
        }

        (!batch.is_empty()).then_some(batch)
    }
}
