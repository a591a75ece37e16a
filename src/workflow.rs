//! 学習全体の流れ
//!
//! 設定読み込み後の処理をまとめて実行します。
//!
//! 1. 出力ディレクトリ作成
//! 2. モデル構築（ImageNet / ランダム / 保存済み）
//! 3. データセット展開
//! 4. フェーズ1: バックボーン固定でヘッドを学習 → save_model_stage1
//! 5. フェーズ2 (`epochs_after_unfreeze > 0`): 全層を学習 → save_model_stage2

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use tracing::info;

use crate::backend::{cpu_device, gpu_device, CpuBackend, GpuBackend};
use crate::data::{
    create_folders, generate_batches, generate_batches_with_augmentation, generate_dataset,
    list_image_files, ImageDataset,
};
use crate::ml::{
    build_model, run_phase, save_trained_model, EpochStats, ModelCheckpoint, ModelConfig,
    PhaseConfig, TransferClassifier, TrainingData, WeightsSource,
};
use crate::model::{DeviceType, TrainConfig};

/// 学習結果の概要
#[derive(Debug, Clone)]
pub struct WorkflowSummary {
    /// 学習に使った画像ファイル数
    pub num_samples: usize,
    pub stage1_model: PathBuf,
    pub stage2_model: Option<PathBuf>,
    pub stage1_history: Vec<EpochStats>,
    pub stage2_history: Vec<EpochStats>,
    /// モデル構築後から保存完了までの時間
    pub duration: Duration,
}

/// 設定の計算デバイスで学習を実行
pub fn run(config: &TrainConfig) -> Result<WorkflowSummary> {
    info!("Using backend: {}", config.device_type);
    match config.device_type {
        DeviceType::Wgpu => run_on::<GpuBackend>(config, &gpu_device()),
        DeviceType::Cpu => run_on::<CpuBackend>(config, &cpu_device()),
    }
}

/// 指定バックエンドで学習を実行
pub fn run_on<B: AutodiffBackend>(
    config: &TrainConfig,
    device: &B::Device,
) -> Result<WorkflowSummary> {
    run_with_model_config::<B>(config, &ModelConfig::new(config.classes), device)
}

pub(crate) fn run_with_model_config<B: AutodiffBackend>(
    config: &TrainConfig,
    model_config: &ModelConfig,
    device: &B::Device,
) -> Result<WorkflowSummary> {
    create_folders(&config.model_path, &config.augmented_data, &config.logs_path)
        .context("Failed to create output directories")?;

    let source = WeightsSource::parse(&config.weights);
    let (model, model_config) =
        build_model::<B>(&source, model_config, &config.imagenet_weights, device)
            .context("Failed to build model")?;
    info!("[INFO] successfully loaded base model and model...");

    let start = Instant::now();

    info!("Freezing the base layers. Unfreeze the top 2 layers...");
    info!("Start training...");
    let files = list_image_files(&config.train_path)
        .with_context(|| format!("Failed to list images in {}", config.train_path.display()))?;

    let dataset = if config.stream_batches && !config.data_augmentation {
        info!("Streaming {} files in batches of {}", files.len(), config.batch_size);
        None
    } else {
        let dataset =
            generate_dataset(&files, config.classes).context("Failed to prepare dataset")?;
        info!("dataset # of x:{}, #of y:{}", dataset.images.len(), dataset.labels.len());
        Some(dataset)
    };

    let phase1 = PhaseConfig::head_only(config.epochs, config.batch_size, config.seed);
    let (model, stage1_history) = train_stage(
        model,
        config,
        dataset.as_ref(),
        &files,
        &phase1,
        config.checkpoint_period,
        device,
    )?;

    info!("Saving...");
    let stage1_model = save_trained_model(
        &model,
        &model_config,
        &config.stage1_model_path(),
        1,
        config.epochs,
        &config.weights,
    )?;

    let mut stage2_model = None;
    let mut stage2_history = Vec::new();
    if config.epochs_after_unfreeze > 0 {
        info!("Unfreezing all layers...");
        info!("Start training - phase 2...");
        let phase2 = PhaseConfig::fine_tune(
            config.epochs_after_unfreeze,
            config.batch_size,
            config.seed.wrapping_add(1),
        );
        let (model, history) = train_stage(
            model,
            config,
            dataset.as_ref(),
            &files,
            &phase2,
            config.checkpoint_period_after_unfreeze,
            device,
        )?;

        info!("Saving...");
        stage2_model = Some(save_trained_model(
            &model,
            &model_config,
            &config.stage2_model_path(),
            2,
            config.epochs_after_unfreeze,
            &config.weights,
        )?);
        stage2_history = history;
    }

    let duration = start.elapsed();
    info!("[STATUS] end time - {}", chrono::Local::now().format("%Y-%m-%d %H:%M"));
    info!("[STATUS] total duration: {}", duration.as_secs_f64());

    Ok(WorkflowSummary {
        num_samples: files.len(),
        stage1_model,
        stage2_model,
        stage1_history,
        stage2_history,
        duration,
    })
}

/// 1フェーズ分のデータ供給元を選んで学習する
///
/// 拡張ありの場合はフェーズごとに新しいジェネレータを作ります。
fn train_stage<B: AutodiffBackend>(
    model: TransferClassifier<B>,
    config: &TrainConfig,
    dataset: Option<&ImageDataset>,
    files: &[PathBuf],
    phase: &PhaseConfig,
    checkpoint_period: usize,
    device: &B::Device,
) -> Result<(TransferClassifier<B>, Vec<EpochStats>)> {
    let mut checkpoint = ModelCheckpoint::new(config.checkpoint_path(), checkpoint_period);

    if config.data_augmentation {
        let mut batches = generate_batches_with_augmentation(
            &config.train_path,
            config.batch_size,
            config.validation_split,
            &config.augmented_data,
            config.classes,
        )
        .context("Failed to configure augmentation")?;
        let steps_per_epoch = batches.steps_per_epoch();
        let data = TrainingData::Stream {
            batches: &mut batches,
            steps_per_epoch,
        };
        return run_phase(model, data, phase, &mut checkpoint, device);
    }

    match dataset {
        Some(dataset) => {
            let data = TrainingData::InMemory {
                dataset,
                validation_split: config.validation_split,
            };
            run_phase(model, data, phase, &mut checkpoint, device)
        }
        None => {
            let mut batches = generate_batches(files.to_vec(), config.classes, config.batch_size);
            let steps_per_epoch = batches.steps_per_epoch();
            let data = TrainingData::Stream {
                batches: &mut batches,
                steps_per_epoch,
            };
            run_phase(model, data, phase, &mut checkpoint, device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::data::dataset::tests::two_class_tree;
    use crate::model::load_metadata;

    fn test_config(
        root: &Path,
        weights: &str,
        epochs_after_unfreeze: usize,
        augmentation: bool,
    ) -> TrainConfig {
        let json = serde_json::json!({
            "weights": weights,
            "train_path": root.join("train"),
            "test_path": root.join("test"),
            "model_path": root.join("model"),
            "batch_size": 2,
            "epochs": 1,
            "classes": 2,
            "augmented_data": root.join("augmented"),
            "validation_split": 0.25,
            "data_augmentation": augmentation,
            "epochs_after_unfreeze": epochs_after_unfreeze,
            "checkpoint_period": 1,
            "checkpoint_period_after_unfreeze": 1,
            "logs_path": root.join("logs"),
            "device_type": "Cpu"
        });
        TrainConfig::from_json_str(&json.to_string()).unwrap()
    }

    fn small_model() -> ModelConfig {
        ModelConfig::new(2).with_hidden_units(8).with_width_multiplier(0.35)
    }

    fn run_small(config: &TrainConfig) -> Result<WorkflowSummary> {
        run_with_model_config::<CpuBackend>(config, &small_model(), &Default::default())
    }

    #[test]
    fn test_two_phase_run_saves_both_stages() {
        let dir = tempfile::tempdir().unwrap();
        two_class_tree(&dir.path().join("train"));
        let config = test_config(dir.path(), "", 1, false);

        let summary = run_small(&config).unwrap();

        assert_eq!(summary.num_samples, 4);
        assert_eq!(summary.stage1_history.len(), 1);
        assert_eq!(summary.stage2_history.len(), 1);
        assert!(summary.stage1_history[0].val_loss.is_some());
        assert!(summary.stage1_model.exists());
        assert_eq!(load_metadata(&summary.stage1_model).unwrap().stage, 1);

        let stage2 = summary.stage2_model.unwrap();
        assert_eq!(load_metadata(&stage2).unwrap().stage, 2);
        assert!(dir.path().join("logs/weights.mpk").exists());
        assert!(dir.path().join("augmented").is_dir());
    }

    #[test]
    fn test_resume_from_saved_model_skips_phase2() {
        let dir = tempfile::tempdir().unwrap();
        two_class_tree(&dir.path().join("train"));

        let first = run_small(&test_config(dir.path(), "", 0, false)).unwrap();
        assert!(first.stage2_model.is_none());

        let saved = first.stage1_model.to_string_lossy().to_string();
        let summary = run_small(&test_config(dir.path(), &saved, 0, false)).unwrap();
        assert!(summary.stage2_model.is_none());
        assert!(summary.stage2_history.is_empty());
    }

    #[test]
    fn test_resume_with_other_class_count_aborts() {
        let dir = tempfile::tempdir().unwrap();
        two_class_tree(&dir.path().join("train"));

        let first = run_small(&test_config(dir.path(), "", 0, false)).unwrap();

        // 2クラスで保存したアーカイブを3クラスの設定で読み込む
        let saved = first.stage1_model.to_string_lossy().to_string();
        let mut config = test_config(dir.path(), &saved, 0, false);
        config.classes = 3;
        let result = run_with_model_config::<CpuBackend>(
            &config,
            &ModelConfig::new(3).with_hidden_units(8).with_width_multiplier(0.35),
            &Default::default(),
        );

        let message = format!("{:#}", result.err().unwrap());
        assert!(message.contains("Failed to build model"));
    }

    #[test]
    fn test_streamed_run_without_validation() {
        let dir = tempfile::tempdir().unwrap();
        two_class_tree(&dir.path().join("train"));
        let mut config = test_config(dir.path(), "", 1, false);
        config.stream_batches = true;
        config.batch_size = 8;

        // バッチサイズより画像が少なくても1エポック1ステップは学習する
        let summary = run_small(&config).unwrap();

        assert_eq!(summary.num_samples, 4);
        assert_eq!(summary.stage1_history.len(), 1);
        assert_eq!(summary.stage2_history.len(), 1);
        assert!(summary.stage1_history[0].val_loss.is_none());
        assert!(summary.stage2_history[0].val_loss.is_none());
        assert!(summary.stage2_model.unwrap().exists());
    }

    #[test]
    fn test_augmented_run_writes_images() {
        let dir = tempfile::tempdir().unwrap();
        two_class_tree(&dir.path().join("train"));
        let config = test_config(dir.path(), "", 0, true);

        let summary = run_small(&config).unwrap();

        assert_eq!(summary.stage1_history.len(), 1);
        assert!(summary.stage1_history[0].val_loss.is_none());
        let written = std::fs::read_dir(dir.path().join("augmented")).unwrap().count();
        assert_eq!(written, 4);
    }

    #[test]
    fn test_missing_imagenet_weights_aborts() {
        let dir = tempfile::tempdir().unwrap();
        two_class_tree(&dir.path().join("train"));
        let mut config = test_config(dir.path(), "imagenet", 0, false);
        config.imagenet_weights = dir.path().join("no_such_weights");

        assert!(run_small(&config).is_err());
    }
}
