// USI cluster proxy

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use rshogi_cluster::driver;
use rshogi_cluster::logging;
use rshogi_cluster::output::StdoutSink;
use rshogi_cluster::ClusterSettings;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 設定ファイル (省略時は rshogi-cluster.toml / rshogi-cluster.json / proxy-setting.json を探す)
    #[arg(long)]
    config: Option<PathBuf>,

    /// ログの出力先ディレクトリ (設定ファイルの log_directory より優先)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args) {
        if log::log_enabled!(log::Level::Error) {
            log::error!("Fatal error: {e:#}");
        } else {
            // ロガーの初期化自体に失敗した
            eprintln!("rshogi-cluster: {e:#}");
        }
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let loaded = ClusterSettings::load(args.config.as_deref());
    let log_directory = match &loaded {
        Ok((settings, _)) => args.log_dir.clone().or_else(|| settings.log_directory.clone()),
        Err(_) => args.log_dir.clone(),
    };
    // IMPORTANT: stdout は USI 専用。ログは stderr かファイルへ
    if let Some(path) = logging::init(args.debug, log_directory.as_deref())? {
        log::info!("logging to {}", path.display());
    }

    let (settings, path) = loaded.context("failed to load configuration")?;
    log::info!(
        "loaded {} ({} engines)",
        path.display(),
        settings.engines.len()
    );
    for (index, engine) in settings.engines.iter().enumerate() {
        log::info!(
            "engine[{index}] {}: {} {:?} mate_specialist={} echo_commands={}",
            engine.name,
            engine.path.display(),
            engine.args,
            engine.mate_specialist,
            engine.echo_commands
        );
    }

    driver::run(&settings, Arc::new(StdoutSink))
}
