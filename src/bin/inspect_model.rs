//! 保存済みモデルアーカイブのメタデータを表示する

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use mobilenet_finetune_lib::model::model_storage::archive_path;
use mobilenet_finetune_lib::model::{load_model_binary, load_metadata, print_metadata_info};

#[derive(Parser, Debug)]
#[command(name = "inspect_model")]
#[command(about = "save_model_stage*.tar.gz の内容を表示する", long_about = None)]
struct Cli {
    /// モデルアーカイブ（.tar.gz は省略可）
    model: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = archive_path(&cli.model);

    let metadata = load_metadata(&path)?;
    print_metadata_info(&metadata);

    let model_binary = load_model_binary(&path)?;
    println!(
        "重みサイズ: {} bytes ({:.2} MB)",
        model_binary.len(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    Ok(())
}
