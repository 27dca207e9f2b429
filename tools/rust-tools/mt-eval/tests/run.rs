use std::{fs, path::Path, process::Command};

use pretty_assertions::assert_eq;

fn write_direction(root: &Path, split: &str, direction: &str, pairs: &[(&str, &str)]) {
    let dir = root.join(split);
    fs::create_dir_all(&dir).unwrap();
    let (sources, targets): (Vec<&str>, Vec<&str>) = pairs.iter().copied().unzip();
    fs::write(
        dir.join(format!("{direction}.source.txt")),
        sources.join("\n") + "\n",
    )
    .unwrap();
    fs::write(
        dir.join(format!("{direction}.target.txt")),
        targets.join("\n") + "\n",
    )
    .unwrap();
}

fn mt_eval(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_mt-eval"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn evaluates_a_dataset_on_two_ranks() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_direction(
        data.path(),
        "test",
        "eng-fra",
        &[("a b", "a b"), ("c", "d"), ("e f g", "e f g"), ("h", "i")],
    );

    let output = mt_eval(&[
        "run",
        "--dataset-path",
        data.path().to_str().unwrap(),
        "--output-dir",
        out.path().to_str().unwrap(),
        "--dp",
        "2",
        "--logs",
        "none",
    ]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let translations = out.path().join("translations/eng-fra");
    for rank in 0..2 {
        let hyp = fs::read_to_string(translations.join(format!("rank_{rank}.hyp.txt"))).unwrap();
        assert_eq!(hyp.lines().count(), 2);
    }

    // one record per unit, written by root rank 0 at the end of the pass
    let metrics = fs::read_to_string(out.path().join("metrics.jsonl")).unwrap();
    let records: Vec<serde_json::Value> = metrics
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let runs: Vec<_> = records.iter().map(|r| r["run"].as_str().unwrap()).collect();
    assert_eq!(runs, vec!["loss/eng-fra", "score/eng-fra"]);
    assert_eq!(records[1]["metrics"]["exact_match"], 50.0);
    assert_eq!(records[1]["metrics"]["num_examples"], 4.0);
}

fn two_rank_run(data: &Path, out: &Path) -> std::process::Output {
    mt_eval(&[
        "run",
        "--dataset-path",
        data.to_str().unwrap(),
        "--output-dir",
        out.to_str().unwrap(),
        "--dp",
        "2",
        "--logs",
        "none",
    ])
}

#[test]
fn unwritable_metrics_file_fails_before_any_rank_starts() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_direction(data.path(), "test", "eng-fra", &[("a", "a"), ("b", "c")]);
    fs::create_dir(out.path().join("metrics.jsonl")).unwrap();

    let output = two_rank_run(data.path(), out.path());
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("metrics.jsonl"), "{stderr}");
    assert!(!out.path().join("translations").exists());
}

#[test]
fn setup_failure_on_one_rank_stops_the_others() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_direction(
        data.path(),
        "test",
        "eng-fra",
        &[("a", "a"), ("b", "c"), ("d", "d"), ("e", "f")],
    );
    // only rank 1 trips over this; rank 0 sets up fine and waits on its peer
    let blocked = out.path().join("translations/eng-fra/rank_1.src.txt");
    fs::create_dir_all(&blocked).unwrap();

    let output = two_rank_run(data.path(), out.path());
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("rank 1 failed"), "{stderr}");
    assert!(stderr.contains("rank_1.src.txt"), "{stderr}");
}

#[test]
fn show_config_prints_the_resolved_toml() {
    let output = mt_eval(&["show-config", "--seed", "9", "--tp", "2"]);
    assert!(output.status.success());
    let text = String::from_utf8(output.stdout).unwrap();
    assert!(text.contains("seed = 9"), "{text}");
    assert!(text.contains("tp = 2"), "{text}");
    assert!(text.contains("max_num_tokens = 4096"), "{text}");
}

#[test]
fn missing_dataset_path_fails_cleanly() {
    let out = tempfile::tempdir().unwrap();
    let output = mt_eval(&[
        "run",
        "--output-dir",
        out.path().to_str().unwrap(),
        "--logs",
        "none",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no dataset path"));
}
