use crate::SetupError;

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use tandem_gang::{ParallelismConfig, WaitPolicy};

/// Names accepted by [`preset`].
pub const PRESETS: &[&str] = &["nllb_dense_600m"];

/// Configuration of a machine translation evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtEvalConfig {
    pub model: String,
    pub seed: u64,
    pub dataset: MtEvalDatasetSection,
    pub evaluator: MtEvaluatorSection,
    pub seq2seq_generator: Seq2SeqGeneratorSection,
    pub gang: GangSection,
}

impl Default for MtEvalConfig {
    fn default() -> Self {
        Self {
            model: "nllb-200_dense_distill_600m".to_string(),
            seed: 2,
            dataset: MtEvalDatasetSection::default(),
            evaluator: MtEvaluatorSection::default(),
            seq2seq_generator: Seq2SeqGeneratorSection::default(),
            gang: GangSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtEvalDatasetSection {
    pub name: String,
    /// Root of a `<split>/[<origin>/]<source>-<target>.{source,target}.txt` tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub split: String,
    pub min_seq_len: usize,
    pub max_seq_len: usize,
    /// Token budget of one length-bucketed loss batch.
    pub max_num_tokens: usize,
    pub num_prefetch: usize,
}

impl Default for MtEvalDatasetSection {
    fn default() -> Self {
        Self {
            name: "flores".to_string(),
            path: None,
            split: "test".to_string(),
            min_seq_len: 1,
            max_seq_len: 512,
            max_num_tokens: 4096,
            num_prefetch: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtEvaluatorSection {
    pub label_smoothing: f64,
    pub num_passes: usize,
    /// Report running values every `n` steps in addition to the end of
    /// each pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_every_n_steps: Option<u64>,
    pub scorers: Vec<String>,
    pub show_progress: bool,
}

impl Default for MtEvaluatorSection {
    fn default() -> Self {
        Self {
            label_smoothing: 0.1,
            num_passes: 1,
            report_every_n_steps: None,
            scorers: vec!["exact_match".to_string()],
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Seq2SeqGeneratorSection {
    pub batch_size: usize,
    /// `(a, b)`: a hypothesis is at most `a * source_len + b` tokens long.
    pub max_gen_len: (usize, usize),
}

impl Default for Seq2SeqGeneratorSection {
    fn default() -> Self {
        Self {
            batch_size: 8,
            max_gen_len: (1, 256),
        }
    }
}

impl Seq2SeqGeneratorSection {
    pub fn max_gen_len_for(&self, source_len: usize) -> usize {
        let (a, b) = self.max_gen_len;
        a * source_len + b
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GangSection {
    pub dp: usize,
    pub tp: usize,
    /// Seconds a rank waits for its peers in one collective. `0` waits forever.
    pub timeout_secs: u64,
}

impl Default for GangSection {
    fn default() -> Self {
        Self {
            dp: 1,
            tp: 1,
            timeout_secs: WaitPolicy::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl GangSection {
    pub fn parallelism(&self) -> ParallelismConfig {
        ParallelismConfig {
            dp: self.dp,
            tp: self.tp,
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        match self.timeout_secs {
            0 => WaitPolicy::unbounded(),
            secs => WaitPolicy::bounded(Duration::from_secs(secs)),
        }
    }
}

/// Resolves a named preset.
pub fn preset(name: &str) -> Result<MtEvalConfig, SetupError> {
    match name {
        "nllb_dense_600m" => Ok(MtEvalConfig::default()),
        _ => Err(SetupError::UnknownPreset {
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: MtEvalConfig = toml::from_str(
            r#"
            seed = 7

            [dataset]
            path = "/data/flores"
            max_num_tokens = 1024

            [gang]
            dp = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.model, "nllb-200_dense_distill_600m");
        assert_eq!(config.dataset.path, Some(PathBuf::from("/data/flores")));
        assert_eq!(config.dataset.max_num_tokens, 1024);
        assert_eq!(config.dataset.split, "test");
        assert_eq!(config.seq2seq_generator.max_gen_len, (1, 256));
        assert_eq!(config.gang.parallelism(), ParallelismConfig { dp: 2, tp: 1 });
        assert_eq!(config.evaluator.scorers, vec!["exact_match"]);
    }

    #[test]
    fn serialized_config_reads_back() {
        let mut config = preset("nllb_dense_600m").unwrap();
        config.evaluator.report_every_n_steps = Some(10);
        let text = toml::to_string(&config).unwrap();
        let back: MtEvalConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let gang = GangSection {
            timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(gang.wait_policy(), WaitPolicy::unbounded());
        assert_eq!(
            GangSection::default().wait_policy(),
            WaitPolicy::bounded(WaitPolicy::DEFAULT_TIMEOUT)
        );
    }

    #[test]
    fn unknown_preset_lists_the_known_ones() {
        let err = preset("nllb_dense_3b").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown preset `nllb_dense_3b`, available: nllb_dense_600m"
        );
    }

    #[test]
    fn generation_length_scales_with_source() {
        let section = Seq2SeqGeneratorSection {
            max_gen_len: (2, 3),
            ..Default::default()
        };
        assert_eq!(section.max_gen_len_for(5), 13);
    }
}
