//! モデルメタデータの定義
//!
//! tar.gz形式でモデルの重みと一緒に保存され、保存済みモデルから
//! 学習を再開する際にネットワーク構造を復元するために使います。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// 分類クラス数（出力層の次元）
    pub num_classes: usize,

    /// 分類ヘッドの中間全結合層のユニット数
    #[serde(default = "default_hidden_units")]
    pub hidden_units: usize,

    /// モデル入力サイズ（正方形、通常224）
    pub image_size: usize,

    /// MobileNetV2 の幅係数
    #[serde(default = "default_width_multiplier")]
    pub width_multiplier: f64,

    /// 保存時の学習フェーズ（1: ヘッドのみ, 2: 全層）
    pub stage: u32,

    /// このフェーズで学習したエポック数
    pub num_epochs: u32,

    /// 学習開始時の重みの取得元（"imagenet" / "" / パス）
    #[serde(default)]
    pub weights_source: String,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

fn default_hidden_units() -> usize {
    1024
}

fn default_width_multiplier() -> f64 {
    1.0
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        num_classes: usize,
        hidden_units: usize,
        image_size: usize,
        width_multiplier: f64,
        stage: u32,
        num_epochs: u32,
        weights_source: String,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            num_classes,
            hidden_units,
            image_size,
            width_multiplier,
            stage,
            num_epochs,
            weights_source,
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
