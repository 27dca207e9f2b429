use crate::{
    EvalError, EvalUnit, Evaluator, EvaluatorOptions, MtCriterion, MtEvalConfig, MtLossEvalUnit,
    MtScoreEvalUnit, ReportCadence, RuntimeContext, Seq2SeqGenerator, Seq2SeqModel, SetupError,
    TranslationStreams,
};

use std::sync::Arc;
use tandem_data_provider::{
    Batching, DataReader, ParallelTextDataset, ReadOptions, SyncMode, TextTokenizer,
};
use tandem_gang::Gangs;
use tandem_metrics::{ExactMatchScorer, TextScorer};
use tracing::{debug, info};

/// Resolves scorer names to the built-in scorers.
pub fn create_scorers(names: &[String]) -> Result<Vec<Arc<dyn TextScorer>>, SetupError> {
    names
        .iter()
        .map(|name| match name.as_str() {
            "exact_match" => Ok(Arc::new(ExactMatchScorer) as Arc<dyn TextScorer>),
            other => Err(SetupError::UnknownScorer(other.to_string())),
        })
        .collect()
}

/// Builds the machine translation evaluator of one rank.
///
/// Every direction of the configured split gets a loss unit reading
/// length-bucketed batches and a score unit reading batches of the
/// generator's batch size. Both read until the last data-parallel rank is
/// out of data. Translations are written only by tensor-parallel rank 0 of
/// each data-parallel group.
#[allow(clippy::too_many_arguments)]
pub fn load_mt_evaluator(
    context: &RuntimeContext,
    config: &MtEvalConfig,
    gangs: Gangs,
    model: Arc<dyn Seq2SeqModel>,
    generator: Arc<dyn Seq2SeqGenerator>,
    tokenizer: Arc<dyn TextTokenizer>,
    dataset: &dyn ParallelTextDataset,
    scorers: &[Arc<dyn TextScorer>],
) -> Result<Evaluator, EvalError> {
    let section = &config.dataset;
    let directions = dataset.directions(&section.split)?;
    if directions.is_empty() {
        return Err(SetupError::NoDirections {
            dataset: dataset.name().to_string(),
            split: section.split.clone(),
        }
        .into());
    }

    // `seed` itself is reserved for the model; each reader takes the next one
    let mut seed = config.seed + 1;

    let criterion = Arc::new(MtCriterion::new(model, config.evaluator.label_smoothing));
    let write_output = gangs.tp.rank() == 0;

    let mut units_and_readers: Vec<(Box<dyn EvalUnit>, DataReader)> =
        Vec::with_capacity(directions.len() * 2);
    for direction in directions {
        let create_reader = |batching: Batching, seed: u64| {
            let options = ReadOptions::new(batching, direction.clone())
                .with_sync_mode(SyncMode::UntilLast)
                .with_num_prefetch(section.num_prefetch)
                .with_seed(seed);
            dataset.create_reader(
                &section.split,
                tokenizer.clone(),
                gangs.dp.clone(),
                section.min_seq_len,
                section.max_seq_len,
                options,
            )
        };

        let loss_unit = MtLossEvalUnit::new(criterion.clone(), &direction)?;
        let loss_reader = create_reader(
            Batching::Length {
                max_num_tokens: section.max_num_tokens,
            },
            seed,
        )?;
        seed += 1;
        units_and_readers.push((Box::new(loss_unit), loss_reader));

        let streams = if write_output {
            let streams = TranslationStreams::create(
                context.file_system(),
                context.output_dir(),
                &direction,
                gangs.dp.rank(),
            )?;
            debug!(%direction, paths = ?streams.paths(), "writing translations");
            Some(streams)
        } else {
            None
        };
        let score_unit = MtScoreEvalUnit::new(
            &direction,
            generator.clone(),
            tokenizer.clone(),
            scorers,
            streams,
        )?;
        let score_reader = create_reader(
            Batching::Static {
                batch_size: config.seq2seq_generator.batch_size,
            },
            seed,
        )?;
        seed += 1;
        units_and_readers.push((Box::new(score_unit), score_reader));
    }

    info!(
        rank = gangs.root.rank(),
        dp_rank = gangs.dp.rank(),
        tp_rank = gangs.tp.rank(),
        split = %section.split,
        num_units = units_and_readers.len(),
        "prepared translation evaluation"
    );

    let options = EvaluatorOptions {
        num_passes: config.evaluator.num_passes,
        cadence: config
            .evaluator
            .report_every_n_steps
            .map_or(ReportCadence::EndOfPass, ReportCadence::EveryNSteps),
        show_progress: config.evaluator.show_progress,
    };
    Ok(Evaluator::new(units_and_readers, gangs, options))
}
