use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use up_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use up_lib::{SftpStore, UpConfig, UpError, UploadEngine, UploadEvent, CONFIG_FILE_NAME};

/// 把本地文件或目录上传到 SFTP 服务器
#[derive(Debug, Parser)]
#[command(name = "up", version, about)]
struct Cli {
    /// initialize a new configuration file
    #[arg(short, long)]
    init: bool,

    /// skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,

    /// configuration file path
    #[arg(short, long, value_name = "FILE", default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// output the current version
    #[arg(short = 'v', hide = true)]
    show_version: bool,
}

/// 初始化日志系统
fn init_logging(config: &LogConfig) {
    // 创建日志级别过滤器
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let file_layer = if config.enabled {
        match SizeRotatingWriter::new(&get_log_dir(), config.max_size_mb) {
            Ok(file_writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(false),
            ),
            Err(e) => {
                eprintln!("无法创建日志文件: {}", e);
                None
            }
        }
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn init_config(path: &Path) -> Result<(), UpError> {
    UpConfig::write_template(path)?;
    info!("已创建配置文件: {}", path.display());
    info!("请修改配置文件中的连接信息和路径，然后重新运行 up");
    Ok(())
}

fn confirm() -> Result<bool, UpError> {
    dialoguer::Confirm::new()
        .with_prompt("Confirm the configuration and continue?")
        .default(true)
        .interact()
        .map_err(|e| UpError::Io(std::io::Error::other(e)))
}

async fn upload(path: &Path, skip_confirm: bool) -> Result<(), UpError> {
    let config = UpConfig::load(path)?;
    info!("\n{}", config.display());
    info!("以上是本次上传使用的最终配置");

    if !skip_confirm && !confirm()? {
        info!("已取消上传");
        return Ok(());
    }

    let engine = UploadEngine::new(config);

    // 第一次 Ctrl-C 在下一步之前停止，第二次直接退出
    let cancel_flag = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在停止上传...");
            cancel_flag.store(true, Ordering::SeqCst);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(1);
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::channel(64);
    let progress = tokio::spawn(async move {
        let mut uploaded = 0u32;
        while let Some(event) = progress_rx.recv().await {
            match event {
                UploadEvent::Phase(phase) => debug!("阶段: {:?}", phase),
                UploadEvent::DirCreated(dir) => debug!("已创建目录: {}", dir),
                UploadEvent::FileUploaded { remote, bytes, .. } => {
                    uploaded += 1;
                    debug!("[{}] {} ({} 字节)", uploaded, remote, bytes);
                }
            }
        }
    });

    let store = SftpStore::new();
    let result = engine.run(&store, Some(progress_tx)).await;
    let _ = progress.await;

    result?;
    info!("上传成功!");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.show_version {
        println!("up {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    init_logging(&LogConfig::load(&cli.config));

    let result = if cli.init {
        init_config(&cli.config)
    } else {
        upload(&cli.config, cli.yes).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            if matches!(e, UpError::RemoteOperationFailed { .. } | UpError::Cancelled) {
                warn!("远程目录可能已被部分更新，已上传的内容不会回滚");
            }
            ExitCode::from(e.exit_code())
        }
    }
}
