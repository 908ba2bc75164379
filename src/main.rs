use clap::{Parser, Subcommand};
use dropship_lib::commands::{check_config, run_transfers, test_connection};
use dropship_lib::db::{AuditMessage, AuditMirror};
use dropship_lib::logging::{AuditLayer, LogConfig, SizeRotatingWriter};
use dropship_lib::{AppContext, ExitStatus, Settings};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dropship")]
#[command(version, about = "Upload drop folders to an SFTP server")]
struct Cli {
    /// 配置文件路径，默认为程序同目录下的 <程序名>.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 同时输出日志到控制台
    #[arg(long, global = true)]
    console: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// 执行所有传输段（默认）
    Run,
    /// 校验配置文件
    Check,
    /// 测试远程连接
    TestConnection,
}

fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .map(|exe| exe.with_extension("toml"))
        .unwrap_or_else(|_| PathBuf::from("dropship.toml"))
}

/// 初始化日志系统
fn init_logging(
    config: &LogConfig,
    base_dir: &Path,
    console: bool,
    audit_tx: UnboundedSender<AuditMessage>,
) -> std::io::Result<WorkerGuard> {
    let log_dir = config.log_dir(base_dir);
    let writer = SizeRotatingWriter::new(&log_dir, &config.file, config.max_bytes, config.backups)?;
    let (file_writer, guard) = tracing_appender::non_blocking(writer);

    // RUST_LOG 优先，否则使用配置的级别
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(config.tracing_level()).into())
        .from_env_lossy();
    if let Ok(directive) = "sqlx=warn".parse() {
        env_filter = env_filter.add_directive(directive);
    }

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .with(AuditLayer::new(audit_tx));
    let _ = tracing::subscriber::set_global_default(subscriber);

    Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);
    let config_path = cli.config.unwrap_or_else(default_config_path);

    let settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return ExitStatus::Config.into();
        }
    };

    let log_config = match settings.log_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitStatus::Config.into();
        }
    };

    let (audit_tx, audit_rx) = mpsc::unbounded_channel();
    let _guard = match init_logging(&log_config, settings.base_dir(), cli.console, audit_tx.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!(
                "无法创建日志文件 {}: {}",
                log_config.log_dir(settings.base_dir()).display(),
                e
            );
            return ExitStatus::LogDirectory.into();
        }
    };

    match command {
        Commands::Check => check(&settings).into(),
        Commands::TestConnection => test_remote(&settings).await.into(),
        Commands::Run => run(settings, audit_tx, audit_rx).await.into(),
    }
}

fn check(settings: &Settings) -> ExitStatus {
    info!(audit = false, "检查配置文件 {}", settings.path().display());
    let report = check_config(settings);

    for problem in &report.problems {
        error!(audit = false, "{}", problem);
        println!("ERROR   {}", problem);
    }
    for warning in &report.warnings {
        warn!(audit = false, "{}", warning);
        println!("WARNING {}", warning);
    }
    println!("{} 个有效传输段: {}", report.sections.len(), report.sections.join(", "));

    if report.is_ok() {
        ExitStatus::Success
    } else {
        ExitStatus::CheckFailed
    }
}

async fn test_remote(settings: &Settings) -> ExitStatus {
    let remote = match settings.remote_config() {
        Ok(remote) => remote,
        Err(e) => {
            error!(audit = false, "{}", e);
            eprintln!("{}", e);
            return ExitStatus::Config;
        }
    };

    let result = test_connection(&remote, settings.base_dir()).await;
    info!(audit = false, success = result.success, "{}", result.message);
    println!("{}", result.message);
    if let Some(details) = &result.details {
        println!("{}", details);
    }

    if result.success {
        ExitStatus::Success
    } else {
        ExitStatus::CheckFailed
    }
}

async fn run(
    settings: Settings,
    audit_tx: UnboundedSender<AuditMessage>,
    audit_rx: mpsc::UnboundedReceiver<AuditMessage>,
) -> ExitStatus {
    let audit_config = match settings.audit_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitStatus::Config;
        }
    };
    let setup = match settings.setup() {
        Ok(setup) => setup,
        Err(e) => {
            error!("{}", e);
            return ExitStatus::Config;
        }
    };

    let audit = match &audit_config {
        Some(config) => AppContext::connect_audit(config, &setup.sid).await,
        None => None,
    };
    // 审计库可用时才启动镜像，之前排队的日志会一并写入
    let mirror = audit
        .clone()
        .map(|store| AuditMirror::spawn(store, audit_tx, audit_rx));

    info!(sid = %setup.sid, "Start -->");

    let ctx = match AppContext::new(settings, audit) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("{}", e);
            return ExitStatus::Config;
        }
    };

    let status = match run_transfers(&ctx).await {
        Ok(report) => {
            if report.has_failures() {
                warn!("本次运行有失败的文件或配置段，详见日志");
            }
            ExitStatus::Success
        }
        Err(e) => {
            error!(critical = true, "运行失败: {:#}", e);
            ExitStatus::Internal
        }
    };

    info!("<---- End");

    if let Some(mirror) = mirror {
        mirror.shutdown().await;
    }
    ctx.cleanup().await;

    status
}
