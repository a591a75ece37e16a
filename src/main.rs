//! 2段階転移学習の実行エントリポイント

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use mobilenet_finetune_lib::model::TrainConfig;
use mobilenet_finetune_lib::utils::{init_logging, LogConfig, LogLevel};
use mobilenet_finetune_lib::workflow;

#[derive(Parser, Debug)]
#[command(name = "mobilenet_finetune")]
#[command(about = "MobileNetV2 を2段階で転移学習する", long_about = None)]
struct Cli {
    /// 設定ファイル (JSON)
    #[arg(short, long, default_value_os_t = TrainConfig::default_path())]
    config: PathBuf,

    /// デバッグログを出力する
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TrainConfig::load(&cli.config)?;

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        let level = config.log_level.parse::<LogLevel>().map_err(anyhow::Error::msg)?;
        LogConfig::with_level(level)
    };
    init_logging(&log_config)?;

    config.display();
    let summary = workflow::run(&config)?;

    tracing::debug!("Finished: {:?}", summary);
    Ok(())
}
