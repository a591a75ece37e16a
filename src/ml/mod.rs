pub mod mobilenet;
pub mod ml_model;
pub mod checkpoint;
pub mod training;

pub use mobilenet::{make_divisible, MobileNetV2, MobileNetV2Config};
pub use ml_model::{
    build_model, categorical_crossentropy, save_trained_model, ModelConfig, TransferClassifier,
    WeightsSource,
};
pub use checkpoint::{CheckpointMonitor, ModelCheckpoint};
pub use training::{
    run_phase, EpochStats, OptimizerKind, PhaseConfig, TrainableLayers, TrainingData,
};
