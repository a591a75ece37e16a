//! 学習設定管理モジュール
//!
//! `conf.json` の学習設定を読み込みます。基本の13キーは必須で、
//! 欠けていれば起動時にエラーになります。追加のキーは省略可能です。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 学習設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// 重みの取得元: "imagenet" / "" (ランダム初期化) / 保存済みモデルのパス
    pub weights: String,
    /// 学習画像のルート（サブフォルダ名がクラス番号）
    pub train_path: PathBuf,
    /// テスト画像のルート（学習では使用しない）
    pub test_path: PathBuf,
    /// 学習済みモデルの出力先
    pub model_path: PathBuf,
    /// バッチサイズ
    pub batch_size: usize,
    /// フェーズ1のエポック数
    pub epochs: usize,
    /// 分類クラス数
    pub classes: usize,
    /// 拡張画像の保存先
    pub augmented_data: PathBuf,
    /// 検証データの割合
    pub validation_split: f64,
    /// データ拡張を使うかどうか
    pub data_augmentation: bool,
    /// フェーズ2（全層解凍後）のエポック数。0ならフェーズ2を行わない
    pub epochs_after_unfreeze: usize,
    /// フェーズ1のチェックポイント間隔（エポック）
    pub checkpoint_period: usize,
    /// フェーズ2のチェックポイント間隔（エポック）
    pub checkpoint_period_after_unfreeze: usize,

    /// ImageNet事前学習済みバックボーンの重みファイル（拡張子なし）
    #[serde(default = "default_imagenet_weights")]
    pub imagenet_weights: PathBuf,
    /// チェックポイントの出力先
    #[serde(default = "default_logs_path")]
    pub logs_path: PathBuf,
    /// 計算デバイス
    #[serde(default)]
    pub device_type: DeviceType,
    /// シャッフル用シード
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// 拡張なしの場合にデータセットを事前展開せずバッチ単位で読み込む
    #[serde(default)]
    pub stream_batches: bool,
    /// ログレベル (trace/debug/info/warn/error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_imagenet_weights() -> PathBuf {
    PathBuf::from("weights/mobilenet_v2_imagenet")
}

fn default_logs_path() -> PathBuf {
    PathBuf::from("logs")
}

fn default_seed() -> u64 {
    42
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TrainConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("conf.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// JSON文字列から設定を生成
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: TrainConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// フェーズ1で保存するモデルのパス
    pub fn stage1_model_path(&self) -> PathBuf {
        self.model_path.join("save_model_stage1")
    }

    /// フェーズ2で保存するモデルのパス
    pub fn stage2_model_path(&self) -> PathBuf {
        self.model_path.join("save_model_stage2")
    }

    /// チェックポイントのパス（拡張子はレコーダーが付与する）
    pub fn checkpoint_path(&self) -> PathBuf {
        self.logs_path.join("weights")
    }

    /// 設定情報を表示
    pub fn display(&self) {
        tracing::info!("=== 学習設定 ===");
        let weights = if self.weights.is_empty() { "(ランダム初期化)" } else { self.weights.as_str() };
        tracing::info!("重み: {}", weights);
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("学習データ: {}", self.train_path.display());
        tracing::info!("モデル出力先: {}", self.model_path.display());
        tracing::info!("クラス数: {}", self.classes);
        tracing::info!("バッチサイズ: {}", self.batch_size);
        tracing::info!(
            "エポック数: {} (解凍後: {})",
            self.epochs,
            self.epochs_after_unfreeze
        );
        tracing::info!(
            "チェックポイント間隔: {} (解凍後: {})",
            self.checkpoint_period,
            self.checkpoint_period_after_unfreeze
        );
        tracing::info!("検証データ割合: {}", self.validation_split);
        tracing::info!("データ拡張: {}", self.data_augmentation);
    }
}
