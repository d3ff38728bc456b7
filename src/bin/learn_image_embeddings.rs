/* ------------------------------------------------------------------ */
/* learn-image-embeddings: map images onto class embeddings           */
/* ------------------------------------------------------------------ */

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use semantic_embeddings::cli::{DataArgs, OutputArgs, ScheduleArgs, TrainArgs};
use semantic_embeddings::dataset::{self, DataGenerator, Split};
use semantic_embeddings::embedding::ClassEmbedding;
use semantic_embeddings::logging;
use semantic_embeddings::loss::{EmbeddingLoss, LossConfig};
use semantic_embeddings::model::{ClassifierHead, ModelDescriptor};
use semantic_embeddings::network::FeatureTap;
use semantic_embeddings::output;
use semantic_embeddings::train::Trainer;

/// Learns to map images onto class embeddings.
#[derive(Debug, Parser)]
#[command(name = "learn-image-embeddings", version)]
struct Cli {
    #[command(flatten)]
    data: DataArgs,

    /// Class embedding file (JSON with `ind2label` and `embedding`).
    #[arg(long, help_heading = "Data parameters")]
    embedding: PathBuf,

    #[command(flatten)]
    train: TrainArgs,

    /// Embedding loss: mse or inv_corr.
    #[arg(long, default_value = "mse", help_heading = "Training parameters")]
    loss: String,

    /// Weight of an additional softmax head; 0 disables the head.
    #[arg(long, default_value_t = 0.0, help_heading = "Training parameters")]
    cls_weight: f64,

    /// Layer the softmax head reads from: embedding (default) or features.
    #[arg(long, help_heading = "Training parameters")]
    cls_base: Option<String>,

    #[command(flatten)]
    schedule: ScheduleArgs,

    #[command(flatten)]
    output: OutputArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.output.no_progress);

    let kind = cli.data.kind()?;
    let architecture = cli.train.architecture()?;
    let schedule = cli.schedule.to_schedule()?;
    let loss: EmbeddingLoss = cli.loss.parse()?;
    let cls_base: FeatureTap =
        cli.cls_base.as_deref().map(str::parse::<FeatureTap>).transpose()?.unwrap_or_default();
    let config = cli.train.to_config(&cli.output);
    config.validate()?;

    let table = ClassEmbedding::load(&cli.embedding)
        .with_context(|| format!("loading class embeddings from {}", cli.embedding.display()))?;
    let data = dataset::open(kind, &cli.data.data_root, table.labels())
        .with_context(|| format!("loading {kind} from {}", cli.data.data_root.display()))?;

    let descriptor = ModelDescriptor::Embedding {
        architecture,
        embedding_dim: table.dim(),
        l2_normalize: loss.normalizes_output(),
        classifier: (cli.cls_weight > 0.0)
            .then(|| ClassifierHead { num_classes: data.num_classes(), base: cls_base }),
    };
    let loss_config = LossConfig { embedding_loss: loss, cls_weight: cli.cls_weight };

    let data: Arc<dyn DataGenerator> = Arc::new(data);
    let mut trainer = Trainer::new(descriptor, data, vec![table], &loss_config, schedule, config)
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
