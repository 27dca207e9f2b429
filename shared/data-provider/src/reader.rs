use crate::{
    Batching, DataError, Direction, LengthBatcher, Seq2SeqBatch, Seq2SeqExample, StaticBatcher,
    TextTokenizer,
};

use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};
use tandem_core::Shuffle;
use tandem_gang::{Gang, ReduceOp};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// What the gang does once shards run out at different steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Stop every member as soon as one member runs out.
    #[default]
    UntilFirst,
    /// Keep going until every member runs out; exhausted members step with
    /// empty batch lists.
    UntilLast,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadOptions {
    pub batching: Batching,
    pub direction: Direction,
    pub sync_mode: SyncMode,
    /// Batches materialized ahead of the consumer.
    pub num_prefetch: usize,
    pub seed: u64,
    /// 1 keeps file order, 0 shuffles the whole split.
    pub example_shuffle_window: usize,
    pub batch_shuffle_window: usize,
    /// Drops a trailing short batch. Only meaningful for static batching.
    pub drop_remainder: bool,
    /// Whether gang members agree on when to stop.
    pub sync_batches: bool,
    pub max_num_batches: Option<usize>,
    /// Batches handed out per step.
    pub num_accumulate: usize,
}

impl ReadOptions {
    pub fn new(batching: Batching, direction: Direction) -> Self {
        Self {
            batching,
            direction,
            sync_mode: SyncMode::UntilFirst,
            num_prefetch: 1,
            seed: 2,
            example_shuffle_window: 1,
            batch_shuffle_window: 1,
            drop_remainder: false,
            sync_batches: true,
            max_num_batches: None,
            num_accumulate: 1,
        }
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    pub fn with_num_prefetch(mut self, num_prefetch: usize) -> Self {
        self.num_prefetch = num_prefetch;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_shuffle_windows(mut self, example: usize, batch: usize) -> Self {
        self.example_shuffle_window = example;
        self.batch_shuffle_window = batch;
        self
    }

    pub fn with_max_num_batches(mut self, max_num_batches: usize) -> Self {
        self.max_num_batches = Some(max_num_batches);
        self
    }

    pub fn with_num_accumulate(mut self, num_accumulate: usize) -> Self {
        self.num_accumulate = num_accumulate;
        self
    }
}

/// Everything the prefetch worker needs to rebuild the batch stream from scratch.
struct ReaderSource {
    name: String,
    pairs: Vec<(String, String)>,
    tokenizer: Arc<dyn TextTokenizer>,
    min_seq_len: usize,
    max_seq_len: usize,
    options: ReadOptions,
    rank: usize,
    world_size: usize,
}

impl ReaderSource {
    fn batches(&self) -> impl Iterator<Item = Result<Seq2SeqBatch, DataError>> + '_ {
        let options = &self.options;

        let examples = Shuffle::new(options.example_shuffle_window, options.seed)
            .apply(0..self.pairs.len())
            .enumerate()
            .filter(move |(position, _)| position % self.world_size == self.rank)
            .map(move |(_, index)| self.encode(index))
            .filter(move |example| example.as_ref().map_or(true, |e| self.keeps(e)));

        let batches: Box<dyn Iterator<Item = Vec<Result<Seq2SeqExample, DataError>>> + '_> =
            match options.batching {
                Batching::Static { batch_size } => Box::new(StaticBatcher::new(
                    examples,
                    batch_size,
                    options.drop_remainder,
                )),
                Batching::Length { max_num_tokens } => {
                    Box::new(LengthBatcher::new(examples, max_num_tokens))
                }
            };

        // each rank shuffles its own batches differently
        let batch_seed = options
            .seed
            .wrapping_add(1)
            .wrapping_add(self.rank as u64);

        Shuffle::new(options.batch_shuffle_window, batch_seed)
            .apply(batches)
            .take(options.max_num_batches.unwrap_or(usize::MAX))
            .map(|examples| {
                examples
                    .into_iter()
                    .collect::<Result<Vec<_>, _>>()
                    .map(Seq2SeqBatch::collate)
            })
    }

    fn encode(&self, index: usize) -> Result<Seq2SeqExample, DataError> {
        let (source_text, target_text) = &self.pairs[index];
        Ok(Seq2SeqExample {
            source: self
                .tokenizer
                .encode(source_text)
                .map_err(DataError::Encode)?,
            target: self
                .tokenizer
                .encode(target_text)
                .map_err(DataError::Encode)?,
            source_text: source_text.clone(),
            target_text: target_text.clone(),
        })
    }

    fn keeps(&self, example: &Seq2SeqExample) -> bool {
        let bounds = self.min_seq_len..=self.max_seq_len;
        bounds.contains(&example.source.len()) && bounds.contains(&example.target.len())
    }
}

/// Background producer feeding a bounded channel of batches.
struct Prefetcher {
    rx: mpsc::Receiver<Result<Seq2SeqBatch, DataError>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Prefetcher {
    fn spawn(source: Arc<ReaderSource>) -> Result<Self, DataError> {
        let (tx, rx) = mpsc::channel(source.options.num_prefetch.max(1));
        let cancel = CancellationToken::new();
        let name = source.name.clone();

        let handle = thread::Builder::new()
            .name(format!("prefetch {name}"))
            .spawn({
                let cancel = cancel.clone();
                move || {
                    let mut sent = 0usize;
                    for batch in source.batches() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let failed = batch.is_err();
                        if tx.blocking_send(batch).is_err() || failed {
                            break;
                        }
                        sent += 1;
                    }
                    trace!(reader = %source.name, sent, "prefetch worker finished");
                }
            })
            .map_err(|source| DataError::Spawn {
                reader: name.clone(),
                source,
            })?;

        Ok(Self {
            rx,
            cancel,
            handle: Some(handle),
            name,
        })
    }

    fn recv(&mut self) -> Result<Option<Seq2SeqBatch>, DataError> {
        match self.rx.blocking_recv() {
            Some(batch) => batch.map(Some),
            None => {
                if let Some(handle) = self.handle.take() {
                    handle
                        .join()
                        .map_err(|_| DataError::PrefetchPanicked(self.name.clone()))?;
                }
                Ok(None)
            }
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.cancel.cancel();
        // wakes a producer blocked on a full channel
        self.rx.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(reader = %self.name, "prefetch worker panicked");
            }
        }
    }
}

/// A restartable reader over one data-parallel shard of a split.
///
/// Batches are produced on a background thread, at most `num_prefetch`
/// ahead of the consumer, and delivered in a fixed order for a given seed.
/// When `sync_batches` is set, every call to [`DataReader::next_batches`]
/// is a collective over the reader's gang.
pub struct DataReader {
    source: Arc<ReaderSource>,
    gang: Arc<dyn Gang>,
    prefetcher: Option<Prefetcher>,
    local_exhausted: bool,
    finished: bool,
}

impl DataReader {
    pub fn new(
        name: impl Into<String>,
        pairs: Vec<(String, String)>,
        tokenizer: Arc<dyn TextTokenizer>,
        gang: Arc<dyn Gang>,
        min_seq_len: usize,
        max_seq_len: usize,
        options: ReadOptions,
    ) -> Self {
        let source = ReaderSource {
            name: name.into(),
            pairs,
            tokenizer,
            min_seq_len,
            max_seq_len,
            options,
            rank: gang.rank(),
            world_size: gang.size(),
        };
        Self {
            source: Arc::new(source),
            gang,
            prefetcher: None,
            local_exhausted: false,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn options(&self) -> &ReadOptions {
        &self.source.options
    }

    pub fn gang(&self) -> &Arc<dyn Gang> {
        &self.gang
    }

    /// Returns the next step's batches.
    ///
    /// `None` means the gang has finished. Under [`SyncMode::UntilLast`], a
    /// member whose shard is exhausted gets `Some(vec![])` while others still
    /// have data.
    pub fn next_batches(&mut self) -> Result<Option<Vec<Seq2SeqBatch>>, DataError> {
        if self.finished {
            return Ok(None);
        }

        let num_accumulate = self.source.options.num_accumulate.max(1);
        let mut batches = Vec::with_capacity(num_accumulate);
        while batches.len() < num_accumulate && !self.local_exhausted {
            match self.prefetcher()?.recv()? {
                Some(batch) => batches.push(batch),
                None => {
                    debug!(reader = %self.name(), rank = self.gang.rank(), "shard exhausted");
                    self.local_exhausted = true;
                }
            }
        }

        if !self.source.options.sync_batches || self.gang.size() == 1 {
            if batches.is_empty() {
                self.finished = true;
                return Ok(None);
            }
            return Ok(Some(batches));
        }

        let mut num_with_data = [if batches.is_empty() { 0.0 } else { 1.0 }];
        self.gang.all_reduce(&mut num_with_data, ReduceOp::Sum)?;
        let num_with_data = num_with_data[0] as usize;

        match self.source.options.sync_mode {
            SyncMode::UntilFirst if num_with_data < self.gang.size() => {
                if !batches.is_empty() {
                    debug!(
                        reader = %self.name(),
                        rank = self.gang.rank(),
                        dropped = batches.len(),
                        "another rank ran out of data, dropping read-ahead batches"
                    );
                }
                self.finished = true;
                Ok(None)
            }
            SyncMode::UntilLast if num_with_data == 0 => {
                self.finished = true;
                Ok(None)
            }
            _ => Ok(Some(batches)),
        }
    }

    /// Restarts from the first batch. The replayed sequence is identical.
    pub fn reset(&mut self) {
        self.prefetcher = None;
        self.local_exhausted = false;
        self.finished = false;
    }

    fn prefetcher(&mut self) -> Result<&mut Prefetcher, DataError> {
        let prefetcher = match self.prefetcher.take() {
            Some(prefetcher) => prefetcher,
            None => {
                debug!(
                    reader = %self.name(),
                    rank = self.gang.rank(),
                    num_prefetch = self.source.options.num_prefetch,
                    "starting prefetch worker"
                );
                Prefetcher::spawn(self.source.clone())?
            }
        };
        Ok(self.prefetcher.insert(prefetcher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ByteTokenizer;
    use tandem_gang::FakeGang;

    fn pairs(n: usize) -> Vec<(String, String)> {
        (0..n)
            .map(|i| (format!("src {i}"), format!("tgt {i}")))
            .collect()
    }

    fn reader(n: usize, options: ReadOptions) -> DataReader {
        DataReader::new(
            "test",
            pairs(n),
            Arc::new(ByteTokenizer),
            Arc::new(FakeGang::default()),
            1,
            512,
            options,
        )
    }

    fn source_texts(reader: &mut DataReader) -> Vec<String> {
        let mut texts = Vec::new();
        while let Some(batches) = reader.next_batches().unwrap() {
            for batch in batches {
                let example = batch.example.unwrap();
                for text in example["source_text"].as_array().unwrap() {
                    texts.push(text.as_str().unwrap().to_string());
                }
            }
        }
        texts
    }

    #[test]
    fn unshuffled_reader_keeps_file_order() {
        let options = ReadOptions::new(
            Batching::Static { batch_size: 3 },
            Direction::new("a", "b"),
        );
        let mut reader = reader(7, options);
        let expected: Vec<_> = pairs(7).into_iter().map(|(s, _)| s).collect();
        assert_eq!(source_texts(&mut reader), expected);
        // finished readers stay finished until reset
        assert!(reader.next_batches().unwrap().is_none());
    }

    #[test]
    fn accumulates_batches_per_step() {
        let options = ReadOptions::new(
            Batching::Static { batch_size: 1 },
            Direction::new("a", "b"),
        )
        .with_num_accumulate(2);
        let mut reader = reader(5, options);

        let mut steps = Vec::new();
        while let Some(batches) = reader.next_batches().unwrap() {
            steps.push(batches.len());
        }
        assert_eq!(steps, vec![2, 2, 1]);
    }

    #[test]
    fn max_num_batches_caps_the_stream() {
        let options = ReadOptions::new(
            Batching::Static { batch_size: 2 },
            Direction::new("a", "b"),
        )
        .with_max_num_batches(2);
        let mut reader = reader(10, options);
        assert_eq!(source_texts(&mut reader).len(), 4);
    }

    #[test]
    fn length_filter_drops_out_of_range_examples() {
        let options = ReadOptions::new(
            Batching::Static { batch_size: 4 },
            Direction::new("a", "b"),
        );
        let mut reader = DataReader::new(
            "test",
            vec![
                ("ok".to_string(), "fine".to_string()),
                ("much too long".to_string(), "x".to_string()),
                ("x".to_string(), "".to_string()),
                ("yes".to_string(), "si".to_string()),
            ],
            Arc::new(ByteTokenizer),
            Arc::new(FakeGang::default()),
            1,
            5,
            options,
        );
        assert_eq!(source_texts(&mut reader), vec!["ok", "yes"]);
    }

    #[test]
    fn dropping_a_reader_mid_stream_stops_the_worker() {
        let options = ReadOptions::new(
            Batching::Static { batch_size: 1 },
            Direction::new("a", "b"),
        )
        .with_num_prefetch(1);
        let mut reader = reader(1000, options);
        assert!(reader.next_batches().unwrap().is_some());
        drop(reader);
    }
}
