//! 計算バックエンドの定義
//!
//! 学習は WGPU (GPU) を既定とし、設定で NdArray (CPU) に切り替えられます。

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};

/// GPU 学習用バックエンド
pub type GpuBackend = Autodiff<Wgpu>;

/// CPU 学習用バックエンド
pub type CpuBackend = Autodiff<NdArray<f32>>;

/// GPU デバイス（既定のアダプタ）
pub fn gpu_device() -> WgpuDevice {
    WgpuDevice::default()
}

/// CPU デバイス
pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}
