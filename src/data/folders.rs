//! 出力ディレクトリの作成

use std::io;
use std::path::Path;

/// モデル出力先・拡張画像の保存先・チェックポイント出力先を作成する
///
/// 既に存在する場合は何もしません。
pub fn create_folders(
    model_path: &Path,
    augmented_data: &Path,
    logs_path: &Path,
) -> io::Result<()> {
    for dir in [model_path, augmented_data, logs_path] {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            tracing::debug!("Created directory {}", dir.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_folders_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model");
        let augmented = dir.path().join("augmented");
        let logs = dir.path().join("logs");

        create_folders(&model, &augmented, &logs).unwrap();
        create_folders(&model, &augmented, &logs).unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["augmented", "logs", "model"]);
        assert!(model.is_dir() && augmented.is_dir() && logs.is_dir());
    }
}
