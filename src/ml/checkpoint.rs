//! 学習損失が最良のときだけ重みを書き出すチェックポイント

use std::path::PathBuf;

use anyhow::Result;
use burn::{
    module::Module,
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::backend::Backend,
};
use tracing::{debug, info};

/// 保存判定
///
/// `period` エポックごとに損失を比較し、それまでの最良値を下回った場合のみ保存します。
/// 期間の途中のエポックは比較対象になりません。
#[derive(Debug, Clone)]
pub struct CheckpointMonitor {
    period: usize,
    best: f64,
    epochs_since_last_save: usize,
}

impl CheckpointMonitor {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            best: f64::INFINITY,
            epochs_since_last_save: 0,
        }
    }

    /// これまでの最良の損失
    pub fn best(&self) -> f64 {
        self.best
    }

    /// エポック終了時に呼び、保存すべきなら true を返す
    pub fn should_save(&mut self, loss: f64) -> bool {
        self.epochs_since_last_save += 1;
        if self.epochs_since_last_save < self.period {
            return false;
        }
        self.epochs_since_last_save = 0;

        if loss < self.best {
            self.best = loss;
            true
        } else {
            false
        }
    }
}

/// チェックポイントの書き出し
///
/// 保存先は上書きされ、拡張子 `.mpk` はレコーダーが付与します。
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    path: PathBuf,
    monitor: CheckpointMonitor,
}

impl ModelCheckpoint {
    pub fn new(path: impl Into<PathBuf>, period: usize) -> Self {
        Self {
            path: path.into(),
            monitor: CheckpointMonitor::new(period),
        }
    }

    /// エポック終了時の処理。保存した場合は true
    pub fn on_epoch_end<B: Backend, M: Module<B>>(
        &mut self,
        epoch: usize,
        loss: f64,
        model: &M,
    ) -> Result<bool> {
        let previous = self.monitor.best();
        if !self.monitor.should_save(loss) {
            debug!("Epoch {:05}: checkpoint skipped (loss {:.5})", epoch, loss);
            return Ok(false);
        }

        model
            .clone()
            .save_file(self.path.clone(), &DefaultFileRecorder::<FullPrecisionSettings>::new())
            .map_err(|e| {
                anyhow::anyhow!("チェックポイント保存エラー ({}): {:?}", self.path.display(), e)
            })?;

        info!(
            "Epoch {:05}: loss improved from {:.5} to {:.5}, saving model to {}",
            epoch,
            previous,
            loss,
            self.path.display()
        );
        Ok(true)
    }
}
