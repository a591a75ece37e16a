//! データ拡張付きバッチジェネレータ
//!
//! 回転・シアー・ズームのランダムなアフィン変換を画像中心まわりに適用し、
//! ディレクトリ構成から無限にバッチを生成します。変換後の画素は
//! 双線形補間で求め、画像外の参照は端の画素で埋めます。

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::data::dataset::{
    label_from_path, list_image_files, load_resized, one_hot, preprocess_input, DatasetError,
    ImageDataset, IMAGE_SIZE,
};

type Matrix3 = [[f32; 3]; 3];

/// 拡張設定（角度は度単位）
#[derive(Debug, Clone)]
pub struct AugmentationConfig {
    /// シアー角の最大値
    pub shear_range: f32,
    /// 回転角の最大値
    pub rotation_range: f32,
    /// ズーム倍率の幅: [1 - zoom_range, 1 + zoom_range]
    pub zoom_range: f32,
    /// 検証用に確保する割合（`Subset` 指定時のみ有効）
    pub validation_split: f64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            shear_range: 0.2,
            rotation_range: 0.3,
            zoom_range: 0.1,
            validation_split: 0.0,
        }
    }
}

/// 1枚分の変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    pub theta: f32,
    pub shear: f32,
    pub zx: f32,
    pub zy: f32,
}

impl TransformParams {
    pub fn identity() -> Self {
        Self {
            theta: 0.0,
            shear: 0.0,
            zx: 1.0,
            zy: 1.0,
        }
    }
}

fn matmul(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            *value = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// 出力座標 (行, 列) から入力座標への変換行列
pub fn transform_matrix(params: &TransformParams, height: u32, width: u32) -> Matrix3 {
    let theta = params.theta.to_radians();
    let shear = params.shear.to_radians();

    let rotation = [
        [theta.cos(), -theta.sin(), 0.0],
        [theta.sin(), theta.cos(), 0.0],
        [0.0, 0.0, 1.0],
    ];
    let shearing = [
        [1.0, -shear.sin(), 0.0],
        [0.0, shear.cos(), 0.0],
        [0.0, 0.0, 1.0],
    ];
    let zoom = [
        [params.zx, 0.0, 0.0],
        [0.0, params.zy, 0.0],
        [0.0, 0.0, 1.0],
    ];
    let transform = matmul(&matmul(&rotation, &shearing), &zoom);

    // 画像中心を原点にしてから戻す
    let o_r = height as f32 / 2.0 - 0.5;
    let o_c = width as f32 / 2.0 - 0.5;
    let offset = [[1.0, 0.0, o_r], [0.0, 1.0, o_c], [0.0, 0.0, 1.0]];
    let reset = [[1.0, 0.0, -o_r], [0.0, 1.0, -o_c], [0.0, 0.0, 1.0]];

    matmul(&matmul(&offset, &transform), &reset)
}

fn sample_bilinear(img: &RgbImage, row: f32, col: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let row = row.clamp(0.0, (height - 1) as f32);
    let col = col.clamp(0.0, (width - 1) as f32);

    let r0 = row.floor() as u32;
    let c0 = col.floor() as u32;
    let r1 = (r0 + 1).min(height - 1);
    let c1 = (c0 + 1).min(width - 1);
    let dr = row - r0 as f32;
    let dc = col - c0 as f32;

    let mut out = [0u8; 3];
    for (channel, value) in out.iter_mut().enumerate() {
        let p = |r: u32, c: u32| img.get_pixel(c, r)[channel] as f32;
        let top = p(r0, c0) * (1.0 - dc) + p(r0, c1) * dc;
        let bottom = p(r1, c0) * (1.0 - dc) + p(r1, c1) * dc;
        *value = (top * (1.0 - dr) + bottom * dr).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// アフィン変換を適用した新しい画像を返す
pub fn apply_affine_transform(img: &RgbImage, params: &TransformParams) -> RgbImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }
    let m = transform_matrix(params, height, width);

    RgbImage::from_fn(width, height, |col, row| {
        let (r, c) = (row as f32, col as f32);
        let src_r = m[0][0] * r + m[0][1] * c + m[0][2];
        let src_c = m[1][0] * r + m[1][1] * c + m[1][2];
        sample_bilinear(img, src_r, src_c)
    })
}

/// 検証用分割のどちら側を使うか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    Training,
    Validation,
}

/// `flow_from_directory` のオプション
#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub target_size: usize,
    pub batch_size: usize,
    pub classes: usize,
    pub save_to_dir: Option<PathBuf>,
    pub subset: Option<Subset>,
    pub shuffle: bool,
}

impl FlowOptions {
    pub fn new(batch_size: usize, classes: usize) -> Self {
        Self {
            target_size: IMAGE_SIZE,
            batch_size,
            classes,
            save_to_dir: None,
            subset: None,
            shuffle: true,
        }
    }
}

/// ランダム変換を行う拡張ジェネレータ
pub struct AugmentingGenerator {
    config: AugmentationConfig,
    rng: StdRng,
}

impl AugmentingGenerator {
    pub fn new(config: AugmentationConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(config: AugmentationConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// 設定範囲から変換パラメータを1組引く
    pub fn random_params(&mut self) -> TransformParams {
        let mut uniform = |range: f32| {
            if range > 0.0 {
                self.rng.gen_range(-range..=range)
            } else {
                0.0
            }
        };
        let theta = uniform(self.config.rotation_range);
        let shear = uniform(self.config.shear_range);

        let (zx, zy) = if self.config.zoom_range > 0.0 {
            let low = 1.0 - self.config.zoom_range;
            let high = 1.0 + self.config.zoom_range;
            (self.rng.gen_range(low..=high), self.rng.gen_range(low..=high))
        } else {
            (1.0, 1.0)
        };

        TransformParams { theta, shear, zx, zy }
    }

    pub fn random_transform(&mut self, img: &RgbImage) -> RgbImage {
        let params = self.random_params();
        apply_affine_transform(img, &params)
    }

    /// ディレクトリ構成から拡張付きバッチを生成するイテレータを作る
    pub fn flow_from_directory(
        self,
        directory: &Path,
        options: FlowOptions,
    ) -> Result<DirectoryIterator, DatasetError> {
        let files = list_image_files(directory)?;
        let split = self.config.validation_split.clamp(0.0, 1.0);

        // クラスフォルダごとに先頭を検証用、残りを学習用に割り当てる
        let mut samples = Vec::with_capacity(files.len());
        let mut start = 0;
        while start < files.len() {
            let parent = files[start].parent().map(Path::to_path_buf);
            let end = files[start..]
                .iter()
                .position(|f| f.parent().map(Path::to_path_buf) != parent)
                .map_or(files.len(), |offset| start + offset);

            let class_files = &files[start..end];
            let n_valid = (split * class_files.len() as f64) as usize;
            let selected = match options.subset {
                None => class_files,
                Some(Subset::Validation) => &class_files[..n_valid],
                Some(Subset::Training) => &class_files[n_valid..],
            };

            for path in selected {
                let label = label_from_path(path)?;
                if label >= options.classes {
                    return Err(DatasetError::LabelOutOfRange {
                        path: path.clone(),
                        label,
                        classes: options.classes,
                    });
                }
                samples.push((path.clone(), label));
            }
            start = end;
        }

        info!(
            "Found {} images belonging to {} classes.",
            samples.len(),
            options.classes
        );

        let order = (0..samples.len()).collect();
        Ok(DirectoryIterator {
            samples,
            generator: self,
            options,
            order,
            cursor: 0,
            saved: 0,
        })
    }
}

/// 拡張済みバッチを無限に返すイテレータ
pub struct DirectoryIterator {
    samples: Vec<(PathBuf, usize)>,
    generator: AugmentingGenerator,
    options: FlowOptions,
    order: Vec<usize>,
    cursor: usize,
    saved: usize,
}

impl DirectoryIterator {
    /// 1エポックあたりのステップ数（端数切り上げ）
    pub fn steps_per_epoch(&self) -> usize {
        if self.options.batch_size == 0 {
            return 0;
        }
        self.samples.len().div_ceil(self.options.batch_size)
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    fn save_augmented(&mut self, img: &RgbImage, index: usize) -> Result<(), DatasetError> {
        if let Some(dir) = &self.options.save_to_dir {
            let hash: u32 = self.generator.rng.gen_range(0..10_000_000);
            let path = dir.join(format!("_{}_{}.png", index, hash));
            img.save(&path)
                .map_err(|e| DatasetError::ImageSave(path.clone(), e.to_string()))?;
            self.saved += 1;
        }
        Ok(())
    }

    fn next_batch(&mut self) -> Result<ImageDataset, DatasetError> {
        if self.cursor == 0 && self.options.shuffle {
            self.order.shuffle(&mut self.generator.rng);
        }

        let end = (self.cursor + self.options.batch_size).min(self.samples.len());
        let indices: Vec<usize> = self.order[self.cursor..end].to_vec();
        self.cursor = if end >= self.samples.len() { 0 } else { end };

        let mut batch = ImageDataset::default();
        for index in indices {
            let (path, label) = self.samples[index].clone();
            let img = load_resized(&path, self.options.target_size)?;
            let augmented = self.generator.random_transform(&img);
            self.save_augmented(&augmented, index)?;

            batch.images.push(preprocess_input(&augmented));
            batch.labels.push(one_hot(label, self.options.classes).ok_or(
                DatasetError::LabelOutOfRange {
                    path,
                    label,
                    classes: self.options.classes,
                },
            )?);
        }

        debug!("Augmented batch of {} images ({} saved so far)", batch.len(), self.saved);
        Ok(batch)
    }
}

impl Iterator for DirectoryIterator {
    type Item = Result<ImageDataset, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.samples.is_empty() || self.options.batch_size == 0 {
            return None;
        }
        Some(self.next_batch())
    }
}

/// 学習用の拡張ジェネレータを構成して返す
///
/// 拡張後の画像は `augmented_data` にも書き出されます。
pub fn generate_batches_with_augmentation(
    train_path: &Path,
    batch_size: usize,
    validation_split: f64,
    augmented_data: &Path,
    classes: usize,
) -> Result<DirectoryIterator, DatasetError> {
    let generator = AugmentingGenerator::new(AugmentationConfig {
        validation_split,
        ..AugmentationConfig::default()
    });

    let mut options = FlowOptions::new(batch_size, classes);
    options.save_to_dir = Some(augmented_data.to_path_buf());

    generator.flow_from_directory(train_path, options)
}
