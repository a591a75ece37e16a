//! ファイル一覧を繰り返し巡回するバッチジェネレータ

use std::path::PathBuf;

use crate::data::dataset::{generate_dataset, DatasetError, ImageDataset};

/// 固定のファイル一覧からバッチを無限に生成する
///
/// 一巡ごとの最後のバッチは `batch_size` より小さくなることがあります。
#[derive(Debug, Clone)]
pub struct BatchStream {
    files: Vec<PathBuf>,
    classes: usize,
    batch_size: usize,
    cursor: usize,
}

impl BatchStream {
    /// 1エポックあたりのステップ数
    ///
    /// 端数は切り捨てますが、ファイルが1つでもあれば最低1ステップです。
    pub fn steps_per_epoch(&self) -> usize {
        if self.batch_size == 0 || self.files.is_empty() {
            return 0;
        }
        (self.files.len() / self.batch_size).max(1)
    }
}

impl Iterator for BatchStream {
    type Item = Result<ImageDataset, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.files.is_empty() || self.batch_size == 0 {
            return None;
        }

        let end = (self.cursor + self.batch_size).min(self.files.len());
        let batch = generate_dataset(&self.files[self.cursor..end], self.classes);
        self.cursor = if end >= self.files.len() { 0 } else { end };

        Some(batch)
    }
}

/// `files` を `batch_size` 枚ずつ読み込むジェネレータを作る
pub fn generate_batches(files: Vec<PathBuf>, classes: usize, batch_size: usize) -> BatchStream {
    BatchStream {
        files,
        classes,
        batch_size,
        cursor: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::tests::two_class_tree;

    #[test]
    fn test_batches_cycle_forever() {
        let dir = tempfile::tempdir().unwrap();
        let files = two_class_tree(dir.path());

        let stream = generate_batches(files, 2, 3);
        assert_eq!(stream.steps_per_epoch(), 1);

        let sizes: Vec<usize> = stream.take(5).map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![3, 1, 3, 1, 3]);
    }

    #[test]
    fn test_batch_labels_follow_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = two_class_tree(dir.path());

        let mut stream = generate_batches(files, 2, 2);
        let first = stream.next().unwrap().unwrap();
        let second = stream.next().unwrap().unwrap();
        assert_eq!(first.labels, vec![vec![1.0, 0.0], vec![1.0, 0.0]]);
        assert_eq!(second.labels, vec![vec![0.0, 1.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_batch_larger_than_file_list() {
        let dir = tempfile::tempdir().unwrap();
        let files = two_class_tree(dir.path());

        let mut stream = generate_batches(files, 2, 8);
        assert_eq!(stream.steps_per_epoch(), 1);
        assert_eq!(stream.next().unwrap().unwrap().len(), 4);
    }

    #[test]
    fn test_empty_file_list_ends() {
        let mut stream = generate_batches(Vec::new(), 2, 4);
        assert_eq!(stream.steps_per_epoch(), 0);
        assert!(stream.next().is_none());
    }
}
