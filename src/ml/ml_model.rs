//! 転移学習用の分類モデル
//!
//! MobileNetV2 バックボーンの上に GAP → Dense(1024, ReLU) → Dense(classes) の
//! 分類ヘッドを載せたモデルと、その構築・保存処理を提供します。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    record::{BinBytesRecorder, DefaultFileRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation, backend::Backend, Tensor},
};
use tracing::info;

use crate::data::dataset::IMAGE_SIZE;
use crate::ml::mobilenet::{MobileNetV2, MobileNetV2Config};
use crate::model::model_storage::archive_path;
use crate::model::{load_model_with_metadata, save_model_with_metadata, ModelMetadata};

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 中間全結合層のユニット数
    #[config(default = 1024)]
    pub hidden_units: usize,
    /// バックボーンの幅係数
    #[config(default = 1.0)]
    pub width_multiplier: f64,
}

impl ModelConfig {
    /// 保存済みモデルのメタデータから設定を復元
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self::new(metadata.num_classes)
            .with_hidden_units(metadata.hidden_units)
            .with_width_multiplier(metadata.width_multiplier)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> TransferClassifier<B> {
        let backbone_config =
            MobileNetV2Config::new().with_width_multiplier(self.width_multiplier);
        let features = backbone_config.out_channels();

        TransferClassifier {
            backbone: backbone_config.init(device),
            head: ClassifierHead {
                pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
                fc1: LinearConfig::new(features, self.hidden_units).init(device),
                fc2: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
                activation: Relu::new(),
            },
        }
    }
}

/// 分類ヘッド（学習フェーズ1で唯一学習される部分）
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    /// 特徴マップ [batch, channels, h, w] からロジット [batch, num_classes] を計算
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();

        let x = self.pool.forward(features).reshape([batch_size, channels]);
        let x = self.activation.forward(self.fc1.forward(x));
        self.fc2.forward(x)
    }
}

/// 転移学習モデル
///
/// # アーキテクチャ
/// - MobileNetV2 特徴抽出器
/// - GlobalAveragePooling
/// - FC: features -> 1024 + ReLU
/// - FC: 1024 -> num_classes
/// - Softmax (予測時)
#[derive(Module, Debug)]
pub struct TransferClassifier<B: Backend> {
    pub backbone: MobileNetV2<B>,
    pub head: ClassifierHead<B>,
}

impl<B: Backend> TransferClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        activation::softmax(self.forward(images), 1)
    }
}

/// one-hot ターゲットに対する交差エントロピー（バッチ平均）
pub fn categorical_crossentropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_probs = activation::log_softmax(logits, 1);
    (log_probs * targets).sum_dim(1).mean().neg()
}

/// モデル重みの取得元
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsSource {
    /// ImageNet 事前学習済みバックボーン
    ImageNet,
    /// ランダム初期化
    Random,
    /// 保存済みモデルアーカイブ
    Saved(PathBuf),
}

impl WeightsSource {
    /// 設定の `weights` 文字列を解釈
    pub fn parse(weights: &str) -> Self {
        match weights {
            "imagenet" => Self::ImageNet,
            "" => Self::Random,
            path => Self::Saved(PathBuf::from(path)),
        }
    }
}

/// 重みの取得元に応じてモデルを構築
///
/// 保存済みモデルの場合はネットワーク構造をメタデータから復元するため、
/// 返される設定が `config` と異なることがあります。
/// ただしクラス数が `config` と一致しないアーカイブはエラーになります。
pub fn build_model<B: Backend>(
    source: &WeightsSource,
    config: &ModelConfig,
    imagenet_weights: &Path,
    device: &B::Device,
) -> Result<(TransferClassifier<B>, ModelConfig)> {
    match source {
        WeightsSource::Random => Ok((config.init(device), config.clone())),
        WeightsSource::ImageNet => {
            let mut model = config.init::<B>(device);
            let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
            model.backbone = model
                .backbone
                .load_file(imagenet_weights.to_path_buf(), &recorder, device)
                .map_err(|e| {
                    anyhow::anyhow!(
                        "ImageNet重みの読み込みエラー ({}): {:?}",
                        imagenet_weights.display(),
                        e
                    )
                })?;
            info!("Loaded ImageNet backbone weights from {}", imagenet_weights.display());
            Ok((model, config.clone()))
        }
        WeightsSource::Saved(path) => {
            let path = archive_path(path);
            let (metadata, model_binary) = load_model_with_metadata(&path)
                .with_context(|| format!("Failed to load saved model: {}", path.display()))?;

            if metadata.num_classes != config.num_classes {
                anyhow::bail!(
                    "保存済みモデルのクラス数 ({}) が設定のクラス数 ({}) と異なります: {}",
                    metadata.num_classes,
                    config.num_classes,
                    path.display()
                );
            }
            if metadata.image_size != IMAGE_SIZE {
                anyhow::bail!(
                    "保存済みモデルの入力サイズ ({}) は {} ではありません: {}",
                    metadata.image_size,
                    IMAGE_SIZE,
                    path.display()
                );
            }

            let loaded_config = ModelConfig::from_metadata(&metadata);
            let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
            let record = recorder
                .load(model_binary, device)
                .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
            let model = loaded_config.init::<B>(device).load_record(record);
            info!("Loaded saved model from {} (stage {})", path.display(), metadata.stage);

            Ok((model, loaded_config))
        }
    }
}

/// モデルの重みをフル精度のバイト列に変換
pub fn model_to_bytes<B: Backend>(model: &TransferClassifier<B>) -> Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの変換エラー: {:?}", e))
}

/// 学習済みモデルをメタデータ付きで保存
///
/// 戻り値は書き込んだアーカイブのパス
pub fn save_trained_model<B: Backend>(
    model: &TransferClassifier<B>,
    config: &ModelConfig,
    output_path: &Path,
    stage: u32,
    num_epochs: usize,
    weights_source: &str,
) -> Result<PathBuf> {
    let metadata = ModelMetadata::new(
        config.num_classes,
        config.hidden_units,
        IMAGE_SIZE,
        config.width_multiplier,
        stage,
        num_epochs as u32,
        weights_source.to_string(),
    );
    let model_binary = model_to_bytes(model)?;
    let saved = save_model_with_metadata(output_path, &metadata, &model_binary)?;

    info!(
        "Saved model ({} params, {:.2} MB) to {}",
        model.num_params(),
        model_binary.len() as f64 / 1024.0 / 1024.0,
        saved.display()
    );

    Ok(saved)
}
