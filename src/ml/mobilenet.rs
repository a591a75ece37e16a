//! MobileNetV2 バックボーン
//!
//! 分類層を含まない特徴抽出部分のみを提供します。
//! 224x224 入力で [batch, 1280, 7, 7] の特徴マップを返します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};

/// 逆残差ブロックの構成 (拡張率 t, 出力チャネル c, 繰り返し n, ストライド s)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// チャネル数を divisor の倍数に丸める（元の値の90%を下回らない）
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let divisor_f = divisor as f64;
    let mut rounded = (((value + divisor_f / 2.0) / divisor_f) as usize * divisor).max(divisor);
    if (rounded as f64) < 0.9 * value {
        rounded += divisor;
    }
    rounded
}

fn relu6<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.clamp(0.0, 6.0)
}

/// MobileNetV2 設定
#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    /// 幅係数 (alpha)
    #[config(default = 1.0)]
    pub width_multiplier: f64,
}

impl MobileNetV2Config {
    /// 最終特徴マップのチャネル数
    pub fn out_channels(&self) -> usize {
        if self.width_multiplier > 1.0 {
            make_divisible(1280.0 * self.width_multiplier, 8)
        } else {
            1280
        }
    }

    /// バックボーンを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let alpha = self.width_multiplier;
        let first = make_divisible(32.0 * alpha, 8);
        let stem = ConvBn::new(3, first, 3, 2, 1, device);

        let mut blocks = Vec::new();
        let mut in_channels = first;
        for (expansion, channels, repeats, stride) in INVERTED_RESIDUAL_SETTINGS {
            let out_channels = make_divisible(channels as f64 * alpha, 8);
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(InvertedResidual::new(
                    in_channels,
                    out_channels,
                    stride,
                    expansion,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let last = ConvBn::new(in_channels, self.out_channels(), 1, 1, 1, device);

        MobileNetV2 { stem, blocks, last }
    }
}

/// 畳み込み + バッチ正規化（バイアスなし）
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel_size / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let bn = BatchNormConfig::new(out_channels)
            .with_epsilon(1e-3)
            .with_momentum(1e-3)
            .init(device);

        Self { conv, bn }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// 逆残差ブロック: 1x1 拡張 → 3x3 depthwise → 1x1 射影
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    pub expand: Option<ConvBn<B>>,
    pub depthwise: ConvBn<B>,
    pub project: ConvBn<B>,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expansion: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expansion;
        let expand = (expansion != 1).then(|| ConvBn::new(in_channels, hidden, 1, 1, 1, device));

        Self {
            expand,
            depthwise: ConvBn::new(hidden, hidden, 3, stride, hidden, device),
            project: ConvBn::new(hidden, out_channels, 1, 1, 1, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => relu6(expand.forward(input.clone())),
            None => input.clone(),
        };
        let x = relu6(self.depthwise.forward(x));
        let x = self.project.forward(x);

        // ストライド1かつ入出力チャネルが同じときだけ残差接続
        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

/// MobileNetV2 特徴抽出器
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    pub stem: ConvBn<B>,
    pub blocks: Vec<InvertedResidual<B>>,
    pub last: ConvBn<B>,
}

impl<B: Backend> MobileNetV2<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - 特徴マップ [batch_size, 1280, size/32, size/32]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = relu6(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        relu6(self.last.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn_ndarray::NdArray<f32>;

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(32.0, 8), 32);
        assert_eq!(make_divisible(32.0 * 0.35, 8), 16);
        assert_eq!(make_divisible(16.0 * 0.35, 8), 8);
        assert_eq!(make_divisible(24.0 * 0.5, 8), 16);
        assert_eq!(make_divisible(1280.0 * 1.4, 8), 1792);
    }

    #[test]
    fn test_block_layout() {
        let device = Default::default();
        let model = MobileNetV2Config::new().init::<TestBackend>(&device);
        assert_eq!(model.blocks.len(), 17);
        assert!(model.blocks[0].expand.is_none());
        assert!(model.blocks[1].expand.is_some());
    }

    #[test]
    fn test_output_shape_small_input() {
        let device = Default::default();
        let model = MobileNetV2Config::new()
            .with_width_multiplier(0.35)
            .init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);

        let features = model.forward(images);
        assert_eq!(features.dims(), [2, 1280, 2, 2]);
    }
}
