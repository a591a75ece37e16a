//! 2段階の転移学習ループ
//!
//! フェーズ1ではバックボーンを推論モードで固定し、分類ヘッドだけを RMSprop で学習します。
//! フェーズ2では全層を SGD (momentum) で学習します。

use anyhow::{bail, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::AutodiffModule,
    optim::{momentum::MomentumConfig, GradientsParams, Optimizer, RmsPropConfig, SgdConfig},
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::data::{DatasetError, ImageBatch, ImageBatcher, ImageDataset, LabeledImage};
use crate::ml::checkpoint::ModelCheckpoint;
use crate::ml::ml_model::{categorical_crossentropy, TransferClassifier};

/// 学習対象の層
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainableLayers {
    /// 分類ヘッドのみ（バックボーン固定）
    Head,
    /// 全層
    All,
}

/// オプティマイザの種類
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerKind {
    RmsProp { learning_rate: f64 },
    Sgd { learning_rate: f64, momentum: f64 },
}

impl OptimizerKind {
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::RmsProp { learning_rate } | Self::Sgd { learning_rate, .. } => *learning_rate,
        }
    }
}

/// 1フェーズ分の学習設定
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub trainable: TrainableLayers,
    pub optimizer: OptimizerKind,
    pub seed: u64,
}

impl PhaseConfig {
    /// フェーズ1: ヘッドのみ、RMSprop (lr 0.001)
    pub fn head_only(epochs: usize, batch_size: usize, seed: u64) -> Self {
        Self {
            epochs,
            batch_size,
            trainable: TrainableLayers::Head,
            optimizer: OptimizerKind::RmsProp { learning_rate: 1e-3 },
            seed,
        }
    }

    /// フェーズ2: 全層、SGD (lr 0.0001, momentum 0.9)
    pub fn fine_tune(epochs: usize, batch_size: usize, seed: u64) -> Self {
        Self {
            epochs,
            batch_size,
            trainable: TrainableLayers::All,
            optimizer: OptimizerKind::Sgd {
                learning_rate: 1e-4,
                momentum: 0.9,
            },
            seed,
        }
    }
}

/// 1エポック分の結果
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
    pub val_loss: Option<f64>,
}

/// 学習データの供給元
pub enum TrainingData<'a> {
    /// 展開済みデータセット。末尾 `validation_split` の割合を検証に使う
    InMemory {
        dataset: &'a ImageDataset,
        validation_split: f64,
    },
    /// 無限バッチ列から1エポックあたり `steps_per_epoch` バッチを取り出す
    Stream {
        batches: &'a mut dyn Iterator<Item = Result<ImageDataset, DatasetError>>,
        steps_per_epoch: usize,
    },
}

/// 1フェーズ分の学習を実行
///
/// # 戻り値
/// - (学習後のモデル, エポックごとの結果)
pub fn run_phase<B: AutodiffBackend>(
    model: TransferClassifier<B>,
    data: TrainingData<'_>,
    phase: &PhaseConfig,
    checkpoint: &mut ModelCheckpoint,
    device: &B::Device,
) -> Result<(TransferClassifier<B>, Vec<EpochStats>)> {
    info!(
        "Training {:?} layers for {} epochs with {:?} (lr {})",
        phase.trainable,
        phase.epochs,
        phase.optimizer,
        phase.optimizer.learning_rate()
    );

    match phase.optimizer {
        OptimizerKind::RmsProp { learning_rate } => {
            let optim = RmsPropConfig::new()
                .with_alpha(0.9)
                .with_epsilon(1e-7)
                .init::<B, TransferClassifier<B>>();
            fit(model, optim, learning_rate, data, phase, checkpoint, device)
        }
        OptimizerKind::Sgd { learning_rate, momentum } => {
            let optim = SgdConfig::new()
                .with_momentum(Some(MomentumConfig {
                    momentum,
                    dampening: 0.,
                    nesterov: false,
                }))
                .init::<B, TransferClassifier<B>>();
            fit(model, optim, learning_rate, data, phase, checkpoint, device)
        }
    }
}

fn fit<B, O>(
    mut model: TransferClassifier<B>,
    mut optim: O,
    learning_rate: f64,
    mut data: TrainingData<'_>,
    phase: &PhaseConfig,
    checkpoint: &mut ModelCheckpoint,
    device: &B::Device,
) -> Result<(TransferClassifier<B>, Vec<EpochStats>)>
where
    B: AutodiffBackend,
    O: Optimizer<TransferClassifier<B>, B>,
{
    if phase.batch_size == 0 {
        bail!("batch_size must be greater than 0");
    }

    let mut rng = StdRng::seed_from_u64(phase.seed);
    let batcher = ImageBatcher;
    let mut history = Vec::with_capacity(phase.epochs);

    for epoch in 1..=phase.epochs {
        let mut tracker = LossTracker::default();

        let val_loss = match &mut data {
            TrainingData::InMemory {
                dataset,
                validation_split,
            } => {
                let (mut train_indices, val_indices) =
                    split_indices(dataset.len(), *validation_split);
                if train_indices.is_empty() {
                    bail!(
                        "No training samples (dataset: {}, validation_split: {})",
                        dataset.len(),
                        validation_split
                    );
                }
                train_indices.shuffle(&mut rng);

                for chunk in train_indices.chunks(phase.batch_size) {
                    let batch: ImageBatch<B> =
                        batcher.batch(collect_items(dataset, chunk), device);
                    let size = chunk.len();
                    let (next, loss) =
                        train_step(model, &mut optim, learning_rate, batch, phase.trainable);
                    model = next;
                    tracker.update(loss, size);
                }

                if val_indices.is_empty() {
                    None
                } else {
                    Some(evaluate(&model, dataset, &val_indices, phase.batch_size, device))
                }
            }
            TrainingData::Stream {
                batches,
                steps_per_epoch,
            } => {
                if *steps_per_epoch == 0 {
                    bail!("steps_per_epoch must be greater than 0");
                }
                for step in 0..*steps_per_epoch {
                    let Some(batch_data) = batches.next().transpose()? else {
                        bail!("Batch source ended at epoch {} step {}", epoch, step);
                    };
                    let size = batch_data.len();
                    let batch: ImageBatch<B> = batcher.batch(batch_data.into_items(), device);
                    let (next, loss) =
                        train_step(model, &mut optim, learning_rate, batch, phase.trainable);
                    model = next;
                    tracker.update(loss, size);
                }
                None
            }
        };

        let loss = tracker.mean();
        match val_loss {
            Some(val_loss) => info!(
                "Epoch {}/{} - loss: {:.4} - val_loss: {:.4}",
                epoch, phase.epochs, loss, val_loss
            ),
            None => info!("Epoch {}/{} - loss: {:.4}", epoch, phase.epochs, loss),
        }

        checkpoint.on_epoch_end::<B, _>(epoch, loss, &model)?;
        history.push(EpochStats { epoch, loss, val_loss });
    }

    Ok((model, history))
}

/// 1バッチ分の勾配計算と更新
fn train_step<B, O>(
    model: TransferClassifier<B>,
    optim: &mut O,
    learning_rate: f64,
    batch: ImageBatch<B>,
    trainable: TrainableLayers,
) -> (TransferClassifier<B>, f64)
where
    B: AutodiffBackend,
    O: Optimizer<TransferClassifier<B>, B>,
{
    let logits = forward_trainable(&model, batch.images, trainable);
    let loss = categorical_crossentropy(logits, batch.targets);
    let loss_value = loss.clone().into_scalar().elem::<f64>();

    let mut grads = loss.backward();
    let grads = match trainable {
        TrainableLayers::Head => GradientsParams::from_module(&mut grads, &model.head),
        TrainableLayers::All => GradientsParams::from_grads(grads, &model),
    };
    debug!("batch loss: {:.5}", loss_value);

    (optim.step(learning_rate, model, grads), loss_value)
}

/// 固定された層は推論モードで実行し、計算グラフから外す
fn forward_trainable<B: AutodiffBackend>(
    model: &TransferClassifier<B>,
    images: Tensor<B, 4>,
    trainable: TrainableLayers,
) -> Tensor<B, 2> {
    match trainable {
        TrainableLayers::All => model.forward(images),
        TrainableLayers::Head => {
            let features = model.backbone.valid().forward(images.inner());
            model.head.forward(Tensor::from_inner(features))
        }
    }
}

/// 検証データの平均損失
fn evaluate<B: AutodiffBackend>(
    model: &TransferClassifier<B>,
    dataset: &ImageDataset,
    indices: &[usize],
    batch_size: usize,
    device: &B::Device,
) -> f64 {
    let valid_model = model.valid();
    let batcher = ImageBatcher;
    let mut tracker = LossTracker::default();

    for chunk in indices.chunks(batch_size) {
        let batch: ImageBatch<B> = batcher.batch(collect_items(dataset, chunk), device);
        let logits = valid_model.forward(batch.images.inner());
        let loss = categorical_crossentropy(logits, batch.targets.inner());
        tracker.update(loss.into_scalar().elem::<f64>(), chunk.len());
    }

    tracker.mean()
}

/// 先頭を学習用、末尾 `validation_split` の割合を検証用に分ける（分割前にシャッフルしない）
pub fn split_indices(len: usize, validation_split: f64) -> (Vec<usize>, Vec<usize>) {
    let split_at = if validation_split > 0.0 && validation_split < 1.0 {
        (len as f64 * (1.0 - validation_split)) as usize
    } else {
        len
    };
    ((0..split_at).collect(), (split_at..len).collect())
}

fn collect_items(dataset: &ImageDataset, indices: &[usize]) -> Vec<LabeledImage> {
    indices.iter().filter_map(|&i| dataset.get(i)).collect()
}

/// サンプル数で重み付けした損失の平均
#[derive(Debug, Default)]
struct LossTracker {
    sum: f64,
    count: usize,
}

impl LossTracker {
    fn update(&mut self, loss: f64, samples: usize) {
        self.sum += loss * samples as f64;
        self.count += samples;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PreparedImage;
    use crate::ml::ModelConfig;
    use burn::nn::Linear;

    type TestBackend = burn_autodiff::Autodiff<burn_ndarray::NdArray<f32>>;

    const SIZE: usize = 32;

    fn tiny_dataset(len: usize) -> ImageDataset {
        let mut images = Vec::with_capacity(len);
        let mut labels = Vec::with_capacity(len);
        for i in 0..len {
            let class = i % 2;
            let value = if class == 0 { -0.5 } else { 0.5 };
            let pixels = (0..3 * SIZE * SIZE)
                .map(|p| value + (p % 7) as f32 * 0.01 + i as f32 * 0.001)
                .collect();
            images.push(PreparedImage {
                pixels,
                height: SIZE,
                width: SIZE,
            });
            labels.push(if class == 0 { vec![1.0, 0.0] } else { vec![0.0, 1.0] });
        }
        ImageDataset { images, labels }
    }

    fn tiny_model(
        device: &<TestBackend as burn::tensor::backend::Backend>::Device,
    ) -> TransferClassifier<TestBackend> {
        ModelConfig::new(2)
            .with_hidden_units(8)
            .with_width_multiplier(0.35)
            .init::<TestBackend>(device)
    }

    fn stem_weights(model: &TransferClassifier<TestBackend>) -> Vec<f32> {
        model.backbone.stem.conv.weight.val().into_data().to_vec::<f32>().unwrap()
    }

    fn linear_weights(linear: &Linear<TestBackend>) -> Vec<f32> {
        linear.weight.val().into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_split_indices_takes_tail_for_validation() {
        let (train, val) = split_indices(10, 0.2);
        assert_eq!(train, (0..8).collect::<Vec<_>>());
        assert_eq!(val, vec![8, 9]);

        let (train, val) = split_indices(5, 0.0);
        assert_eq!(train.len(), 5);
        assert!(val.is_empty());
    }

    #[test]
    fn test_head_phase_keeps_backbone_frozen() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model = tiny_model(&device);
        let dataset = tiny_dataset(4);

        let stem_before = stem_weights(&model);
        let head_before = linear_weights(&model.head.fc2);

        let phase = PhaseConfig::head_only(2, 2, 7);
        let mut checkpoint = ModelCheckpoint::new(dir.path().join("weights"), 1);
        let data = TrainingData::InMemory {
            dataset: &dataset,
            validation_split: 0.0,
        };
        let (model, history) = run_phase(model, data, &phase, &mut checkpoint, &device).unwrap();

        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.loss.is_finite() && h.val_loss.is_none()));
        assert_eq!(stem_weights(&model), stem_before);
        assert_ne!(linear_weights(&model.head.fc2), head_before);
        assert!(dir.path().join("weights.mpk").exists());
    }

    #[test]
    fn test_fine_tune_updates_backbone() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model = tiny_model(&device);
        let dataset = tiny_dataset(4);
        let stem_before = stem_weights(&model);

        let mut phase = PhaseConfig::fine_tune(1, 2, 7);
        phase.optimizer = OptimizerKind::Sgd {
            learning_rate: 0.1,
            momentum: 0.9,
        };
        let mut checkpoint = ModelCheckpoint::new(dir.path().join("weights"), 1);
        let data = TrainingData::InMemory {
            dataset: &dataset,
            validation_split: 0.0,
        };
        let (model, _) = run_phase(model, data, &phase, &mut checkpoint, &device).unwrap();

        assert_ne!(stem_weights(&model), stem_before);
    }

    #[test]
    fn test_validation_loss_reported() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let dataset = tiny_dataset(6);

        let phase = PhaseConfig::head_only(1, 2, 1);
        let mut checkpoint = ModelCheckpoint::new(dir.path().join("weights"), 1);
        let data = TrainingData::InMemory {
            dataset: &dataset,
            validation_split: 0.34,
        };
        let (_, history) =
            run_phase(tiny_model(&device), data, &phase, &mut checkpoint, &device).unwrap();

        let val_loss = history[0].val_loss.unwrap();
        assert!(val_loss.is_finite() && val_loss > 0.0);
    }

    #[test]
    fn test_stream_pulls_steps_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut pulled = 0usize;
        let mut batches = std::iter::from_fn(|| {
            pulled += 1;
            Some(Ok::<_, DatasetError>(tiny_dataset(2)))
        });

        let phase = PhaseConfig::head_only(2, 2, 1);
        let mut checkpoint = ModelCheckpoint::new(dir.path().join("weights"), 1);
        let data = TrainingData::Stream {
            batches: &mut batches,
            steps_per_epoch: 3,
        };
        let (_, history) =
            run_phase(tiny_model(&device), data, &phase, &mut checkpoint, &device).unwrap();
        drop(batches);

        assert_eq!(history.len(), 2);
        assert_eq!(pulled, 6);
    }

    #[test]
    fn test_stream_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let missing = DatasetError::MissingLabel("x.png".into());
        let mut batches = std::iter::once(Err::<ImageDataset, _>(missing));

        let phase = PhaseConfig::head_only(1, 2, 1);
        let mut checkpoint = ModelCheckpoint::new(dir.path().join("weights"), 1);
        let data = TrainingData::Stream {
            batches: &mut batches,
            steps_per_epoch: 1,
        };
        assert!(run_phase(tiny_model(&device), data, &phase, &mut checkpoint, &device).is_err());
    }
}
