/* ------------------------------------------------------------------ */
/* learn-ensemble: classifier over flat and embedding features        */
/* ------------------------------------------------------------------ */

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use semantic_embeddings::cli::{DataArgs, OutputArgs, ScheduleArgs, TrainArgs};
use semantic_embeddings::dataset::{self, DataGenerator, Split};
use semantic_embeddings::embedding::ClassEmbedding;
use semantic_embeddings::logging;
use semantic_embeddings::loss::{EmbeddingLoss, LossConfig};
use semantic_embeddings::model::ModelDescriptor;
use semantic_embeddings::output;
use semantic_embeddings::train::Trainer;

/// Learns a classifier on top of a concatenation of flat and embedding features.
#[derive(Debug, Parser)]
#[command(name = "learn-ensemble", version)]
struct Cli {
    #[command(flatten)]
    data: DataArgs,

    /// Class embedding file; repeat for every embedding network.
    #[arg(long = "embedding", required = true, help_heading = "Data parameters")]
    embeddings: Vec<PathBuf>,

    #[command(flatten)]
    train: TrainArgs,

    /// Embedding loss: mse or inv_corr.
    #[arg(long, default_value = "mse", help_heading = "Training parameters")]
    loss: String,

    /// Weight of the fused classification loss.
    #[arg(long, default_value_t = 0.1, help_heading = "Training parameters")]
    cls_weight: f64,

    #[command(flatten)]
    schedule: ScheduleArgs,

    #[command(flatten)]
    output: OutputArgs,
}

fn load_tables(paths: &[PathBuf]) -> Result<Vec<ClassEmbedding>> {
    let tables = paths
        .iter()
        .map(|p| {
            ClassEmbedding::load(p)
                .with_context(|| format!("loading class embeddings from {}", p.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    // The first file decides the class order; the others must agree.
    if let Some((first, rest)) = tables.split_first() {
        for (i, t) in rest.iter().enumerate() {
            if t.labels() != first.labels() {
                bail!(
                    "{} lists different classes than {}",
                    paths[i + 1].display(),
                    paths[0].display()
                );
            }
        }
    }
    Ok(tables)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.output.no_progress);

    let kind = cli.data.kind()?;
    let architecture = cli.train.architecture()?;
    let schedule = cli.schedule.to_schedule()?;
    let loss: EmbeddingLoss = cli.loss.parse()?;
    let config = cli.train.to_config(&cli.output);
    config.validate()?;

    let tables = load_tables(&cli.embeddings)?;
    let data = dataset::open(kind, &cli.data.data_root, tables[0].labels())
        .with_context(|| format!("loading {kind} from {}", cli.data.data_root.display()))?;

    let descriptor = ModelDescriptor::Ensemble {
        architecture,
        num_classes: data.num_classes(),
        embedding_dims: tables.iter().map(ClassEmbedding::dim).collect(),
        l2_normalize: loss.normalizes_output(),
    };
    let loss_config = LossConfig { embedding_loss: loss, cls_weight: cli.cls_weight };

    let data: Arc<dyn DataGenerator> = Arc::new(data);
    let mut trainer = Trainer::new(descriptor, data, tables, &loss_config, schedule, config)
        .context("setting up training")?;
    if !cli.output.no_progress {
        println!("{}", trainer.summary());
    }

    trainer.fit().context("training")?;

    let metrics = trainer.evaluate(Split::Test).context("evaluating on the test split")?;
    println!("{metrics}");

    if let Some(path) = &cli.output.weight_dump {
        output::save_or_warn("model weights", trainer.save_weights(path));
    }
    if let Some(path) = &cli.output.model_dump {
        output::save_or_warn("model", trainer.save_model(path));
    }
    if let Some(path) = &cli.output.feature_dump {
        let features = trainer.predict_features(Split::Test).context("predicting test features")?;
        output::write_feature_dump(path, &features)
            .with_context(|| format!("writing features to {}", path.display()))?;
    }
    Ok(())
}
