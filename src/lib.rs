//! MobileNetV2 の2段階転移学習
//!
//! - `data`: 画像の列挙・前処理・バッチ生成・データ拡張
//! - `ml`: ネットワーク定義と学習ループ
//! - `model`: 学習設定とモデルアーカイブの保存・読み込み
//! - `workflow`: 全体の実行順序

#![recursion_limit = "256"]
pub mod backend;
pub mod data;
pub mod ml;
pub mod model;
pub mod utils;
pub mod workflow;
