use std::{sync::Arc, thread};

use pretty_assertions::assert_eq;
use tandem_data_provider::{
    Batching, ByteTokenizer, DataReader, Direction, InMemoryParallelTextDataset,
    ParallelTextDataset, ReadOptions, Seq2SeqBatch, SyncMode,
};
use tandem_gang::{FakeGang, Gang, ThreadGang, WaitPolicy};

fn direction() -> Direction {
    Direction::new("eng_Latn", "fra_Latn")
}

fn pairs(n: usize) -> Vec<(String, String)> {
    (0..n)
        .map(|i| (format!("source {i}"), format!("target {i}")))
        .collect()
}

fn dataset(pairs: Vec<(String, String)>) -> InMemoryParallelTextDataset {
    InMemoryParallelTextDataset::new("mem").with_pairs("test", direction(), pairs)
}

fn source_texts(batch: &Seq2SeqBatch) -> Vec<String> {
    batch.example.as_ref().unwrap()["source_text"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap().to_string())
        .collect()
}

fn read_all(reader: &mut DataReader) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    while let Some(batches) = reader.next_batches().unwrap() {
        out.extend(batches.iter().map(source_texts));
    }
    out
}

/// Ten examples, sharded over two ranks. The two over-long examples land on
/// rank 0, leaving it with 3 batches against rank 1's 5.
fn uneven_pairs() -> Vec<(String, String)> {
    (0..10)
        .map(|i| {
            let source = if i == 2 || i == 6 {
                "far too long to pass the filter".to_string()
            } else {
                format!("s{i}")
            };
            (source, format!("t{i}"))
        })
        .collect()
}

/// Runs one reader per rank on its own thread and reports, per step, how
/// many batches each rank received.
fn steps_per_rank(sync_mode: SyncMode) -> Vec<Vec<usize>> {
    let dataset = Arc::new(dataset(uneven_pairs()));
    let handles: Vec<_> = ThreadGang::cluster(2, WaitPolicy::default())
        .into_iter()
        .map(|gang| {
            let dataset = dataset.clone();
            thread::spawn(move || {
                let options = ReadOptions::new(Batching::Static { batch_size: 1 }, direction())
                    .with_sync_mode(sync_mode)
                    .with_num_prefetch(2);
                let mut reader = dataset
                    .create_reader("test", Arc::new(ByteTokenizer), Arc::new(gang), 1, 8, options)
                    .unwrap();
                let mut steps = Vec::new();
                while let Some(batches) = reader.next_batches().unwrap() {
                    steps.push(batches.len());
                }
                steps
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn until_first_stops_everyone_with_the_shortest_shard() {
    let steps = steps_per_rank(SyncMode::UntilFirst);
    assert_eq!(steps, vec![vec![1, 1, 1], vec![1, 1, 1]]);
}

#[test]
fn until_last_pads_the_shorter_shard() {
    let steps = steps_per_rank(SyncMode::UntilLast);
    assert_eq!(steps, vec![vec![1, 1, 1, 0, 0], vec![1, 1, 1, 1, 1]]);
}

#[test]
fn same_seed_gives_same_batches_across_readers_and_resets() {
    let dataset = dataset(pairs(40));
    let options = ReadOptions::new(Batching::Length { max_num_tokens: 40 }, direction())
        .with_seed(7)
        .with_shuffle_windows(0, 0);
    let create = || {
        dataset
            .create_reader(
                "test",
                Arc::new(ByteTokenizer),
                Arc::new(FakeGang::default()),
                1,
                512,
                options.clone(),
            )
            .unwrap()
    };

    let mut first = create();
    let mut second = create();
    let expected = read_all(&mut first);
    assert_eq!(read_all(&mut second), expected);

    first.reset();
    assert_eq!(read_all(&mut first), expected);

    // a shuffled pass still yields every example exactly once
    let mut seen: Vec<String> = expected.into_iter().flatten().collect();
    seen.sort();
    let mut all: Vec<String> = pairs(40).into_iter().map(|(s, _)| s).collect();
    all.sort();
    assert_eq!(seen, all);
}

#[test]
fn shards_are_disjoint_and_exhaustive() {
    let dataset = dataset(pairs(23));
    let mut seen = Vec::new();
    for gang in ThreadGang::cluster(3, WaitPolicy::default()) {
        let rank = gang.rank();
        let mut options =
            ReadOptions::new(Batching::Static { batch_size: 4 }, direction()).with_seed(3);
        options.example_shuffle_window = 5;
        // no collectives, so the ranks can be read one after another
        options.sync_batches = false;
        let mut reader = dataset
            .create_reader("test", Arc::new(ByteTokenizer), Arc::new(gang), 1, 512, options)
            .unwrap();
        let shard: Vec<String> = read_all(&mut reader).into_iter().flatten().collect();
        assert!(
            shard.len() == 7 || shard.len() == 8,
            "rank {rank} got {}",
            shard.len()
        );
        seen.extend(shard);
    }

    seen.sort();
    let mut all: Vec<String> = pairs(23).into_iter().map(|(s, _)| s).collect();
    all.sort();
    assert_eq!(seen, all);
}

#[test]
fn prefetch_depth_does_not_change_order() {
    let dataset = dataset(pairs(30));
    let read_with = |num_prefetch| {
        let options = ReadOptions::new(Batching::Static { batch_size: 3 }, direction())
            .with_shuffle_windows(4, 2)
            .with_num_prefetch(num_prefetch);
        let mut reader = dataset
            .create_reader(
                "test",
                Arc::new(ByteTokenizer),
                Arc::new(FakeGang::default()),
                1,
                512,
                options,
            )
            .unwrap();
        read_all(&mut reader)
    };

    let expected = read_with(1);
    assert_eq!(read_with(0), expected);
    assert_eq!(read_with(16), expected);
}

#[test]
fn length_batches_fit_the_token_budget() {
    let pairs: Vec<_> = (0..50)
        .map(|i| ("x".repeat(1 + i % 13), "y".repeat(1 + (i * 7) % 11)))
        .collect();
    let options = ReadOptions::new(Batching::Length { max_num_tokens: 32 }, direction());
    let mut reader = dataset(pairs)
        .create_reader(
            "test",
            Arc::new(ByteTokenizer),
            Arc::new(FakeGang::default()),
            1,
            512,
            options,
        )
        .unwrap();

    let mut total = 0;
    while let Some(batches) = reader.next_batches().unwrap() {
        for batch in batches {
            assert!(
                batch.batch_size() == 1 || batch.padded_num_elements() <= 32,
                "batch of {} pads to {}",
                batch.batch_size(),
                batch.padded_num_elements()
            );
            total += batch.batch_size();
        }
    }
    assert_eq!(total, 50);
}
