use std::{sync::Arc, thread};

use pretty_assertions::assert_eq;
use tandem_gang::{Gang, ThreadGang, WaitPolicy};
use tandem_metrics::{ExactMatchScorer, Max, Mean, MetricBag, MetricValues, ScoreMetric, Sum};

/// Each rank counts `rank + 1` examples, sees a peak of `rank` and scores
/// one hypothesis, correct on even ranks only.
fn reduce_on(size: usize) -> Vec<(MetricValues, MetricValues)> {
    let handles: Vec<_> = ThreadGang::cluster(size, WaitPolicy::default())
        .into_iter()
        .map(|gang| {
            thread::spawn(move || {
                let rank = gang.rank();
                let mut bag = MetricBag::new();
                bag.register_metric("num_examples", Sum::default(), false)
                    .unwrap();
                bag.register_metric("peak", Max::default(), false).unwrap();
                bag.register_metric("avg", Mean::default(), false).unwrap();
                bag.register_metric("exact_match", ScoreMetric::new(Arc::new(ExactMatchScorer)), true)
                    .unwrap();

                bag.get_mut::<Sum>("num_examples")
                    .unwrap()
                    .update((rank + 1) as f64);
                bag.get_mut::<Max>("peak").unwrap().update(rank as f64);
                bag.get_mut::<Mean>("avg").unwrap().update(rank as f64, 1.0);
                let hypothesis = if rank % 2 == 0 { "ok" } else { "wrong" };
                bag.get_mut::<ScoreMetric>("exact_match")
                    .unwrap()
                    .update(&["ok".to_string()], &[hypothesis.to_string()]);

                let first = bag.reduce(&gang).unwrap();
                let second = bag.reduce(&gang).unwrap();
                (first, second)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn counters_sum_across_any_gang_size() {
    for size in [1usize, 2, 4] {
        let expected_count: usize = (1..=size).sum();
        for (first, second) in reduce_on(size) {
            assert_eq!(first.get("num_examples"), Some(expected_count as f64));
            assert_eq!(first.get("peak"), Some((size - 1) as f64));
            // reducing twice without updates gives the same answer
            assert_eq!(first, second);
        }
    }
}

#[test]
fn scores_are_computed_from_summed_statistics() {
    let results = reduce_on(4);
    for (values, _) in &results {
        assert_eq!(values.get("exact_match"), Some(50.0));
        assert_eq!(values.get("avg"), Some(1.5));
    }
}
