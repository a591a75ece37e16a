//! 学習データセットの構築
//!
//! `train_path/<クラス番号>/画像` の構成から画像を読み込み、224x224にリサイズ、
//! MobileNetV2 の前処理で正規化して one-hot ラベルと組にします。

use std::path::{Path, PathBuf};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::{backend::Backend, Tensor};
use image::imageops::FilterType;
use image::RgbImage;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// モデル入力の画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// チャネル数 (RGB)
pub const CHANNELS: usize = 3;

/// 対象とする画像拡張子
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// データ準備時のエラー
#[derive(Error, Debug)]
pub enum DatasetError {
    /// 画像のデコードに失敗
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// 拡張画像の保存に失敗
    #[error("Failed to save image to '{0}': {1}")]
    ImageSave(PathBuf, String),

    /// ラベルとなる親ディレクトリがない
    #[error("No label directory for '{0}'")]
    MissingLabel(PathBuf),

    /// 親ディレクトリ名が数値でない
    #[error("Label directory '{label}' of '{path}' is not a number")]
    InvalidLabel { path: PathBuf, label: String },

    /// ラベルがクラス数の範囲外
    #[error("Label {label} of '{path}' is out of range for {classes} classes")]
    LabelOutOfRange {
        path: PathBuf,
        label: usize,
        classes: usize,
    },

    /// IOエラー
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 前処理済みの画像 (C, H, W) の順で平坦化
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    pub pixels: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

impl PreparedImage {
    /// [チャネル, 高さ, 幅]
    pub fn dims(&self) -> [usize; 3] {
        [CHANNELS, self.height, self.width]
    }
}

/// MobileNetV2 の前処理: 画素値を [-1, 1] に変換
pub fn preprocess_input(img: &RgbImage) -> PreparedImage {
    let (width, height) = img.dimensions();
    let mut pixels = Vec::with_capacity(CHANNELS * width as usize * height as usize);

    for channel in 0..CHANNELS {
        for y in 0..height {
            for x in 0..width {
                let value = img.get_pixel(x, y)[channel] as f32;
                pixels.push(value / 127.5 - 1.0);
            }
        }
    }

    PreparedImage {
        pixels,
        height: height as usize,
        width: width as usize,
    }
}

/// 画像を読み込み、指定サイズにリサイズする
pub fn load_resized(path: &Path, size: usize) -> Result<RgbImage, DatasetError> {
    let img = image::open(path)
        .map_err(|e| DatasetError::ImageLoad(path.to_path_buf(), e.to_string()))?;
    Ok(img
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8())
}

/// 画像を読み込み、224x224にリサイズして前処理する
pub fn load_prepared_image(path: &Path) -> Result<PreparedImage, DatasetError> {
    Ok(preprocess_input(&load_resized(path, IMAGE_SIZE)?))
}

/// 親ディレクトリ名からクラス番号を取得
pub fn label_from_path(path: &Path) -> Result<usize, DatasetError> {
    let label = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .ok_or_else(|| DatasetError::MissingLabel(path.to_path_buf()))?;

    label.trim().parse::<usize>().map_err(|_| DatasetError::InvalidLabel {
        path: path.to_path_buf(),
        label: label.to_string(),
    })
}

/// クラス番号を one-hot ベクトルに変換
pub fn one_hot(label: usize, classes: usize) -> Option<Vec<f32>> {
    if label >= classes {
        return None;
    }
    let mut vector = vec![0.0; classes];
    vector[label] = 1.0;
    Some(vector)
}

/// `train_path/*/*.{png,jpg,jpeg}` に一致するファイルを列挙（パス順）
pub fn list_image_files(train_path: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut files = Vec::new();

    for entry in WalkDir::new(train_path).min_depth(2).max_depth(2) {
        let entry = entry.map_err(|e| {
            DatasetError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        let path = entry.path();

        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(ext) = path.extension() {
            let ext = ext.to_string_lossy().to_lowercase();
            if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                files.push(path.to_path_buf());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// 画像と one-hot ラベルの組
#[derive(Debug, Clone)]
pub struct LabeledImage {
    pub image: PreparedImage,
    pub label: Vec<f32>,
}

/// メモリ上のデータセット（画像とラベルの並列配列）
#[derive(Debug, Clone, Default)]
pub struct ImageDataset {
    pub images: Vec<PreparedImage>,
    pub labels: Vec<Vec<f32>>,
}

impl ImageDataset {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// 画像とラベルを組にして取り出す
    pub fn into_items(self) -> Vec<LabeledImage> {
        self.images
            .into_iter()
            .zip(self.labels)
            .map(|(image, label)| LabeledImage { image, label })
            .collect()
    }
}

impl Dataset<LabeledImage> for ImageDataset {
    fn get(&self, index: usize) -> Option<LabeledImage> {
        Some(LabeledImage {
            image: self.images.get(index)?.clone(),
            label: self.labels.get(index)?.clone(),
        })
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

/// ファイル一覧から画像配列と one-hot ラベル配列を生成
pub fn generate_dataset(files: &[PathBuf], classes: usize) -> Result<ImageDataset, DatasetError> {
    let mut dataset = ImageDataset {
        images: Vec::with_capacity(files.len()),
        labels: Vec::with_capacity(files.len()),
    };

    for path in files {
        let label = label_from_path(path)?;
        let vector = one_hot(label, classes).ok_or_else(|| DatasetError::LabelOutOfRange {
            path: path.clone(),
            label,
            classes,
        })?;

        dataset.images.push(load_prepared_image(path)?);
        dataset.labels.push(vector);
    }

    debug!("Prepared {} images for {} classes", dataset.len(), classes);
    Ok(dataset)
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// one-hot [batch_size, classes]
    pub targets: Tensor<B, 2>,
}

/// バッチャー
#[derive(Clone, Debug, Default)]
pub struct ImageBatcher;

impl<B: Backend> Batcher<B, LabeledImage, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<LabeledImage>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let [channels, height, width] = items
            .first()
            .map(|item| item.image.dims())
            .unwrap_or([CHANNELS, IMAGE_SIZE, IMAGE_SIZE]);
        let classes = items.first().map(|item| item.label.len()).unwrap_or(0);

        let mut all_pixels = Vec::with_capacity(batch_size * channels * height * width);
        let mut all_targets = Vec::with_capacity(batch_size * classes);

        for item in items {
            all_pixels.extend_from_slice(&item.image.pixels);
            all_targets.extend_from_slice(&item.label);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device)
            .reshape([batch_size, channels, height, width]);
        let targets = Tensor::<B, 1>::from_floats(all_targets.as_slice(), device)
            .reshape([batch_size, classes]);

        ImageBatch { images, targets }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;

    pub(crate) fn write_image(path: &Path, width: u32, height: u32, color: [u8; 3]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(width, height, Rgb(color)).save(path).unwrap();
    }

    /// 0/ と 1/ に2枚ずつ、サイズの異なる画像を置く
    pub(crate) fn two_class_tree(root: &Path) -> Vec<PathBuf> {
        write_image(&root.join("0/a.png"), 300, 200, [255, 0, 0]);
        write_image(&root.join("0/b.jpg"), 64, 64, [250, 10, 10]);
        write_image(&root.join("1/c.png"), 224, 224, [0, 0, 255]);
        write_image(&root.join("1/d.jpeg"), 50, 120, [0, 10, 250]);
        list_image_files(root).unwrap()
    }

    #[test]
    fn test_list_image_files_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        two_class_tree(dir.path());
        std::fs::write(dir.path().join("0/notes.txt"), "skip").unwrap();
        write_image(&dir.path().join("top_level.png"), 8, 8, [0, 0, 0]);

        let files = list_image_files(dir.path()).unwrap();
        assert_eq!(files.len(), 4);
        assert!(files.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_generate_dataset_two_classes() {
        let dir = tempfile::tempdir().unwrap();
        let files = two_class_tree(dir.path());

        let dataset = generate_dataset(&files, 2).unwrap();
        assert_eq!(dataset.images.len(), 4);
        assert_eq!(dataset.labels.len(), 4);

        for (path, label) in files.iter().zip(&dataset.labels) {
            let expected = label_from_path(path).unwrap();
            let hot: Vec<usize> = label
                .iter()
                .enumerate()
                .filter(|(_, v)| **v == 1.0)
                .map(|(i, _)| i)
                .collect();
            assert_eq!(hot, vec![expected]);
            assert_eq!(label.iter().sum::<f32>(), 1.0);
        }
        assert_eq!(dataset.labels[0], vec![1.0, 0.0]);
        assert_eq!(dataset.labels[3], vec![0.0, 1.0]);
    }

    #[test]
    fn test_every_image_is_resized() {
        let dir = tempfile::tempdir().unwrap();
        let files = two_class_tree(dir.path());

        let dataset = generate_dataset(&files, 2).unwrap();
        for image in &dataset.images {
            assert_eq!(image.dims(), [3, IMAGE_SIZE, IMAGE_SIZE]);
            assert_eq!(image.pixels.len(), 3 * IMAGE_SIZE * IMAGE_SIZE);
        }
    }

    #[test]
    fn test_preprocess_range() {
        let img = RgbImage::from_pixel(2, 2, Rgb([0, 255, 127]));
        let prepared = preprocess_input(&img);
        // R チャネル
        assert_eq!(prepared.pixels[0], -1.0);
        // G チャネル
        assert_eq!(prepared.pixels[4], 1.0);
        assert!(prepared.pixels[8].abs() < 0.01);
    }

    #[test]
    fn test_label_errors() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("cats/x.png");
        write_image(&bad, 4, 4, [1, 2, 3]);
        assert!(matches!(
            generate_dataset(&[bad], 2),
            Err(DatasetError::InvalidLabel { .. })
        ));

        let out_of_range = dir.path().join("5/y.png");
        write_image(&out_of_range, 4, 4, [1, 2, 3]);
        assert!(matches!(
            generate_dataset(&[out_of_range], 2),
            Err(DatasetError::LabelOutOfRange { label: 5, classes: 2, .. })
        ));
    }

    #[test]
    fn test_unreadable_image_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("0/broken.png");
        std::fs::create_dir_all(broken.parent().unwrap()).unwrap();
        std::fs::write(&broken, b"not an image").unwrap();

        assert!(matches!(
            generate_dataset(&[broken], 2),
            Err(DatasetError::ImageLoad(..))
        ));
    }

    #[test]
    fn test_batcher_shapes() {
        type B = burn_ndarray::NdArray<f32>;
        let img = preprocess_input(&RgbImage::from_pixel(8, 8, Rgb([10, 20, 30])));
        let items = vec![
            LabeledImage { image: img.clone(), label: vec![1.0, 0.0, 0.0] },
            LabeledImage { image: img, label: vec![0.0, 0.0, 1.0] },
        ];

        let batch: ImageBatch<B> = <ImageBatcher as Batcher<B, LabeledImage, ImageBatch<B>>>::batch(
            &ImageBatcher,
            items,
            &Default::default(),
        );
        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        assert_eq!(batch.targets.dims(), [2, 3]);
    }
}
