use crate::{
    cli::{ConfigArgs, RunArgs},
    demo::{CopyGenerator, UniformModel},
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tandem_data_provider::{
    load_tokenizer, ByteTokenizer, GenericParallelTextDataset, ParallelTextDataset, TextTokenizer,
};
use tandem_eval::{
    create_scorers, load_mt_evaluator, EvalError, EvalSummary, MtEvalConfig, RuntimeContext,
    Seq2SeqGenerator, Seq2SeqModel,
};
use tandem_gang::Gangs;
use tandem_metrics::{CompositeMetricRecorder, JsonlMetricRecorder, LogMetricRecorder};
use time::OffsetDateTime;
use tokio::runtime::Builder;
use tracing::{error, info, info_span};

mod cli;
mod demo;

#[derive(Parser, Debug)]
#[command(version, about = "Distributed machine translation evaluation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluates every direction of a dataset split on an in-process dp x tp cluster.
    Run {
        #[clap(flatten)]
        args: RunArgs,
    },
    /// Prints the resolved configuration as TOML.
    ShowConfig {
        #[clap(flatten)]
        config: ConfigArgs,
    },
}

/// Everything a rank needs that is shared read-only across ranks.
struct Shared {
    config: MtEvalConfig,
    context: RuntimeContext,
    dataset: Arc<dyn ParallelTextDataset>,
    tokenizer: Arc<dyn TextTokenizer>,
    model: Arc<dyn Seq2SeqModel>,
    generator: Arc<dyn Seq2SeqGenerator>,
}

/// Aborts a rank's gangs when dropped armed, so a rank that errors out or
/// panics releases peers blocked in a collective.
struct AbortOnFailure {
    gangs: Gangs,
    armed: bool,
}

impl AbortOnFailure {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnFailure {
    fn drop(&mut self) {
        if self.armed {
            self.gangs.abort();
        }
    }
}

fn run_rank(
    shared: &Shared,
    gangs: Gangs,
    metrics_file: Option<JsonlMetricRecorder>,
) -> Result<EvalSummary> {
    let rank = gangs.root.rank();
    let _span = info_span!("rank", rank).entered();

    let guard = AbortOnFailure {
        gangs: gangs.clone(),
        armed: true,
    };
    let result = evaluate_rank(shared, gangs, metrics_file);
    match &result {
        Ok(_) => guard.disarm(),
        Err(err) => error!(rank, "{err:#}"),
    }
    result
}

fn evaluate_rank(
    shared: &Shared,
    gangs: Gangs,
    metrics_file: Option<JsonlMetricRecorder>,
) -> Result<EvalSummary> {
    let scorers = create_scorers(&shared.config.evaluator.scorers)?;
    let mut evaluator = load_mt_evaluator(
        &shared.context,
        &shared.config,
        gangs,
        shared.model.clone(),
        shared.generator.clone(),
        shared.tokenizer.clone(),
        shared.dataset.as_ref(),
        &scorers,
    )?;
    if let Some(metrics_file) = metrics_file {
        let mut recorder = CompositeMetricRecorder::new(Vec::new());
        recorder.push(LogMetricRecorder);
        recorder.push(metrics_file);
        evaluator = evaluator.with_recorder(Box::new(recorder));
    }
    Ok(evaluator.run()?)
}

/// A rank that failed only because another rank aborted the cluster.
fn is_gang_abort(err: &anyhow::Error) -> bool {
    err.downcast_ref::<EvalError>()
        .is_some_and(EvalError::is_gang_abort)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.config.resolve()?;

    tandem_logging::logging()
        .with_output(args.logs)
        .with_log_file(args.write_log.clone())
        .init()?;

    info!(
        "============ Evaluation startup at {} ============",
        OffsetDateTime::now_utc()
    );

    let dataset_path = config
        .dataset
        .path
        .clone()
        .context("no dataset path: set `dataset.path` in the config or pass --dataset-path")?;
    let dataset =
        GenericParallelTextDataset::from_path(&dataset_path, Some(config.dataset.name.clone()))?;

    let (tokenizer, vocab_size) = match &args.tokenizer {
        Some(path) => {
            let tokenizer = load_tokenizer(path)?;
            let vocab_size = tokenizer.get_vocab_size(true);
            let tokenizer: Arc<dyn TextTokenizer> = Arc::new(tokenizer);
            (tokenizer, vocab_size)
        }
        None => {
            let tokenizer: Arc<dyn TextTokenizer> = Arc::new(ByteTokenizer);
            (tokenizer, 256)
        }
    };

    info!(
        model = %config.model,
        dataset = %dataset_path.display(),
        split = %config.dataset.split,
        dp = config.gang.dp,
        tp = config.gang.tp,
        seed = config.seed,
        "starting evaluation"
    );

    // opened before any rank starts; only root rank 0 records
    let metrics_path = args.output_dir.join("metrics.jsonl");
    let mut metrics_file = Some(JsonlMetricRecorder::new(&metrics_path)?);

    let cluster = Gangs::thread_cluster(config.gang.parallelism(), config.gang.wait_policy())?;
    let shared = Arc::new(Shared {
        model: Arc::new(UniformModel::new(vocab_size)?),
        generator: Arc::new(CopyGenerator::new(config.seq2seq_generator.clone())),
        context: RuntimeContext::new(&args.output_dir),
        dataset: Arc::new(dataset),
        tokenizer,
        config,
    });

    let handles = cluster.into_iter().map(|gangs| {
        let shared = shared.clone();
        let metrics_file = if gangs.root.rank() == 0 {
            metrics_file.take()
        } else {
            None
        };
        tokio::task::spawn_blocking(move || run_rank(&shared, gangs, metrics_file))
    });
    let results = futures::future::join_all(handles).await;

    let mut summaries = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (rank, result) in results.into_iter().enumerate() {
        match result.map_err(|err| anyhow!("rank {rank} panicked: {err}"))? {
            Ok(summary) => summaries.push(summary),
            Err(err) => failures.push((rank, err)),
        }
    }
    // report the rank that caused the abort, not the peers it took down
    if !failures.is_empty() {
        let index = failures
            .iter()
            .position(|(_, err)| !is_gang_abort(err))
            .unwrap_or(0);
        let (rank, err) = failures.swap_remove(index);
        return Err(err.context(format!("rank {rank} failed")));
    }

    if let Some(summary) = summaries.first() {
        info!(
            steps = summary.num_steps,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            output_dir = %args.output_dir.display(),
            "evaluation finished"
        );
    }
    Ok(())
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { args } => run(args).await,
        Commands::ShowConfig { config } => {
            let config = config.resolve()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    let runtime = Builder::new_multi_thread().enable_time().build()?;
    runtime.block_on(async_main())
}
