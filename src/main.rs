use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use llama_herder::{
    config::DEFAULT_CONFIG_PATH, logging, AppConfig, DaemonClient, ModelId, Notifier,
    SessionNotification, SessionRegistry, VerificationOutcome,
};
use std::path::Path;
use std::process;
use std::time::Duration;
use tracing::{error, info, warn};

/// 本地模型守护进程安装管理工具
#[derive(Debug, Parser)]
#[command(name = "llama-herder", version, about = "Install and manage local daemon models")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 覆盖配置中的守护进程地址
    #[arg(long, global = true)]
    daemon_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 安装模型（流式拉取，守护进程不可达时回退到命令行安装器）
    Pull {
        /// 模型标识，例如 llama3.2:3b
        model: String,
    },
    /// 列出已安装模型
    List,
    /// 删除模型
    Rm {
        /// 模型标识
        model: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(2);
        }
    };

    let _log_guard = logging::init_logging(&config.log);

    if let Err(e) = run(args.command, config).await {
        error!("命令执行失败: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// 加载配置；文件不存在时使用默认配置
async fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if Path::new(&args.config).exists() {
        AppConfig::load_from_file(&args.config)
            .await
            .with_context(|| format!("加载配置失败: {}", args.config))?
    } else {
        AppConfig::default()
    };

    if let Some(url) = &args.daemon_url {
        config.daemon.base_url = url.clone();
        config.validate()?;
    }
    Ok(config)
}

async fn run(command: Commands, config: AppConfig) -> Result<()> {
    match command {
        Commands::Pull { model } => pull(config, ModelId::new(model)).await,
        Commands::List => list(config).await,
        Commands::Rm { model } => remove(config, ModelId::new(model)).await,
    }
}

async fn pull(config: AppConfig, model: ModelId) -> Result<()> {
    let (notifier, mut rx) = Notifier::channel();
    let registry = SessionRegistry::from_config(&config, notifier)?;
    registry.start(model.clone())?;

    // 终态之前持续消费通知，Ctrl-C 触发取消
    let outcome: Result<()> = loop {
        let notification = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，取消安装: {}", model);
                registry.cancel(&model);
                continue;
            }
            notification = rx.recv() => notification,
        };

        let Some(notification) = notification else {
            break Err(anyhow::anyhow!("notification channel closed"));
        };
        print_notification(&notification);

        match notification {
            SessionNotification::Completed { .. } => break Ok(()),
            SessionNotification::Failed { error, .. } => {
                break Err(anyhow::anyhow!("failed to install {}: {}", model, error))
            }
            SessionNotification::Cancelled { .. } => {
                break Err(anyhow::anyhow!("installation of {} was cancelled", model))
            }
            SessionNotification::Stalled { message, .. } => {
                break Err(anyhow::anyhow!("installation of {} stalled: {}", model, message))
            }
            _ => {}
        }
    };

    if outcome.is_ok() {
        // 校验结果只作提示，不影响退出码
        let wait = async {
            while let Some(notification) = rx.recv().await {
                if let SessionNotification::Verification { .. } = notification {
                    print_notification(&notification);
                    return;
                }
            }
        };
        let limit = config.daemon.list_timeout() + Duration::from_secs(1);
        if tokio::time::timeout(limit, wait).await.is_err() {
            warn!("等待安装校验结果超时: {}", model);
        }
    }

    registry.shutdown().await;
    outcome
}

fn print_notification(notification: &SessionNotification) {
    match notification {
        SessionNotification::Preparing { model, .. } => {
            println!("Preparing to install {}...", model)
        }
        SessionNotification::Status { message, .. } => println!("{}", message),
        SessionNotification::Progress {
            message,
            percentage,
            ..
        } => match percentage {
            Some(pct) => println!("[{:>5.1}%] {}", pct, message),
            None => println!("{}", message),
        },
        SessionNotification::FallbackActivated { reason, .. } => {
            println!("Daemon unreachable, {}...", reason)
        }
        SessionNotification::Completed { model, .. } => {
            println!("Successfully installed {}", model)
        }
        SessionNotification::Failed { error, .. } => println!("Installation failed: {}", error),
        SessionNotification::Cancelled { model } => println!("Installation of {} cancelled", model),
        SessionNotification::Stalled { message, .. } => println!("Installation stalled: {}", message),
        SessionNotification::Verification { model, outcome } => match outcome {
            VerificationOutcome::Verified => println!("Verified {} is installed", model),
            VerificationOutcome::Mismatch => {
                println!("Warning: {} not found in the installed model list", model)
            }
            VerificationOutcome::Error { reason } => {
                println!("Warning: could not verify {}: {}", model, reason)
            }
        },
        SessionNotification::StatusChanged {
            model,
            old_status,
            new_status,
        } => info!("{}: {} -> {}", model, old_status, new_status),
    }
}

async fn list(config: AppConfig) -> Result<()> {
    let client = DaemonClient::new(&config.daemon, &config.pull)?;
    let models = client.list_installed().await?;

    if models.is_empty() {
        println!("No models installed");
        return Ok(());
    }

    println!(
        "{:<32} {:>10} {:>8} {:<10} {:<18} {}",
        "NAME", "SIZE", "PARAMS", "QUANT", "DIGEST", "MODIFIED"
    );
    for model in &models {
        let size = if model.size_mb() >= 1024.0 {
            format!("{:.1} GB", model.size_mb() / 1024.0)
        } else {
            format!("{:.1} MB", model.size_mb())
        };
        println!(
            "{:<32} {:>10} {:>8} {:<10} {:<18} {}",
            model.name,
            size,
            model.param_size,
            model.quantization,
            model.short_digest(),
            model.modified_at
        );
    }
    Ok(())
}

async fn remove(config: AppConfig, model: ModelId) -> Result<()> {
    let client = DaemonClient::new(&config.daemon, &config.pull)?;
    client.delete_model(&model).await?;
    println!("Deleted {}", model);
    Ok(())
}
