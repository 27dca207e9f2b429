use anyhow::{bail, Context, Result};
use clap::Args;
use std::{fs, path::PathBuf};
use tandem_eval::{preset, MtEvalConfig};
use tandem_logging::LogOutput;
use toml::{Table, Value};

/// Where the configuration comes from and what to override in it.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Named configuration to start from.
    #[clap(long, default_value = "nllb_dense_600m")]
    pub preset: String,

    /// TOML file merged on top of the preset.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Data-parallel degree.
    #[clap(long)]
    pub dp: Option<usize>,

    /// Tensor-parallel degree.
    #[clap(long)]
    pub tp: Option<usize>,

    #[clap(long)]
    pub seed: Option<u64>,

    /// Token budget of one loss batch.
    #[clap(long)]
    pub max_num_tokens: Option<usize>,

    #[clap(long)]
    pub split: Option<String>,

    /// Root directory of a parallel text dataset.
    #[clap(long, env)]
    pub dataset_path: Option<PathBuf>,
}

impl ConfigArgs {
    /// Preset, then config file, then command line flags.
    pub fn resolve(&self) -> Result<MtEvalConfig> {
        let mut config = preset(&self.preset)?;

        if let Some(path) = &self.config {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let overlay: Table = toml::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?;
            let Value::Table(mut base) = Value::try_from(&config)? else {
                bail!("configuration does not serialize to a table");
            };
            merge(&mut base, overlay);
            config = Value::Table(base)
                .try_into()
                .with_context(|| format!("invalid config {}", path.display()))?;
        }

        if let Some(dp) = self.dp {
            config.gang.dp = dp;
        }
        if let Some(tp) = self.tp {
            config.gang.tp = tp;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(max_num_tokens) = self.max_num_tokens {
            config.dataset.max_num_tokens = max_num_tokens;
        }
        if let Some(split) = &self.split {
            config.dataset.split = split.clone();
        }
        if let Some(path) = &self.dataset_path {
            config.dataset.path = Some(path.clone());
        }
        Ok(config)
    }
}

fn merge(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(base)), Value::Table(overlay)) => merge(base, overlay),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[clap(flatten)]
    pub config: ConfigArgs,

    /// Directory receiving translations and `metrics.jsonl`.
    #[clap(long, env)]
    pub output_dir: PathBuf,

    /// A `tokenizer.json`. Without one, text is tokenized byte by byte.
    #[clap(long, env)]
    pub tokenizer: Option<PathBuf>,

    /// Sets the logs interface
    /// console: standard logs
    /// json: standard logs with json format
    #[clap(
        long,
        env,
        default_value_t = LogOutput::Console,
        value_enum,
        ignore_case = true
    )]
    pub logs: LogOutput,

    #[clap(long, env)]
    pub write_log: Option<PathBuf>,
}
