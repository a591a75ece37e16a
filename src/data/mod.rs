pub mod dataset;
pub mod batches;
pub mod augmentation;
pub mod folders;

pub use dataset::{
    generate_dataset, list_image_files, DatasetError, ImageBatch, ImageBatcher, ImageDataset,
    LabeledImage, PreparedImage, IMAGE_SIZE,
};
pub use batches::{generate_batches, BatchStream};
pub use augmentation::{
    generate_batches_with_augmentation, AugmentationConfig, AugmentingGenerator, DirectoryIterator,
};
pub use folders::create_folders;
