use std::{fs, path::Path, sync::Arc};

use pretty_assertions::assert_eq;
use tandem_data_provider::{
    Batching, ByteTokenizer, DataError, Direction, GenericParallelTextDataset,
    ParallelTextDataset, ReadOptions,
};
use tandem_gang::FakeGang;

fn write(path: &Path, lines: &[&str]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, lines.join("\n")).unwrap();
}

fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let test = dir.path().join("test");
    write(&test.join("eng_Latn-fra_Latn.source.txt"), &["hello", "world"]);
    write(&test.join("eng_Latn-fra_Latn.target.txt"), &["bonjour", "monde"]);
    write(&test.join("deu_Latn-eng_Latn.source.txt"), &["hallo"]);
    write(&test.join("deu_Latn-eng_Latn.target.txt"), &["hello"]);
    write(&test.join("flores/eng_Latn-deu_Latn.source.txt"), &["yes"]);
    write(&test.join("flores/eng_Latn-deu_Latn.target.txt"), &["ja"]);
    write(&test.join("broken-pair.source.txt"), &["a", "b"]);
    write(&test.join("broken-pair.target.txt"), &["a"]);
    write(&test.join("README.md"), &["not a direction"]);
    fs::create_dir_all(dir.path().join("dev")).unwrap();
    dir
}

fn options(direction: &str) -> ReadOptions {
    ReadOptions::new(
        Batching::Static { batch_size: 8 },
        direction.parse().unwrap(),
    )
}

#[test]
fn lists_splits_and_sorted_directions() {
    let dir = fixture();
    let dataset = GenericParallelTextDataset::from_path(dir.path(), Some("fixture".into())).unwrap();

    assert_eq!(dataset.name(), "fixture");
    assert_eq!(dataset.splits().unwrap(), vec!["dev", "test"]);

    let directions: Vec<String> = dataset
        .directions("test")
        .unwrap()
        .iter()
        .map(Direction::to_string)
        .collect();
    assert_eq!(
        directions,
        vec![
            "broken-pair",
            "deu_Latn-eng_Latn",
            "flores/eng_Latn-deu_Latn",
            "eng_Latn-fra_Latn",
        ]
    );
    assert!(dataset.directions("dev").unwrap().is_empty());
    assert!(matches!(
        dataset.directions("train"),
        Err(DataError::UnknownSplit { .. })
    ));
}

#[test]
fn reads_line_aligned_pairs() {
    let dir = fixture();
    let dataset = GenericParallelTextDataset::from_path(dir.path(), None).unwrap();
    let create = |direction: &str| {
        dataset.create_reader(
            "test",
            Arc::new(ByteTokenizer),
            Arc::new(FakeGang::default()),
            1,
            128,
            options(direction),
        )
    };

    let mut reader = create("eng_Latn-fra_Latn").unwrap();
    let batches = reader.next_batches().unwrap().unwrap();
    assert_eq!(batches.len(), 1);
    let example = batches[0].example.as_ref().unwrap();
    assert_eq!(example["source_text"], serde_json::json!(["hello", "world"]));
    assert_eq!(example["target_text"], serde_json::json!(["bonjour", "monde"]));
    assert!(reader.next_batches().unwrap().is_none());

    let mut reader = create("flores/eng_Latn-deu_Latn").unwrap();
    assert_eq!(reader.next_batches().unwrap().unwrap()[0].batch_size(), 1);

    assert!(matches!(
        create("broken-pair"),
        Err(DataError::Misaligned {
            source_lines: 2,
            target_lines: 1,
            ..
        })
    ));
    assert!(matches!(
        create("eng_Latn-jpn_Jpan"),
        Err(DataError::UnknownDirection { .. })
    ));
}
