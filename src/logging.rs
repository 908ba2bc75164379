//! 日志模块 - 提供文件日志、大小轮转和审计库镜像

use crate::db::{AuditLevel, AuditMessage};
use serde::Deserialize;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// 审计镜像只转发本程序自身的日志
const MIRRORED_TARGET_PREFIX: &str = "dropship";

/// 日志配置（`[log]` 段）
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// 日志目录，未配置时使用配置文件所在目录
    #[serde(default)]
    pub path: Option<String>,
    /// 日志文件名
    #[serde(default = "default_file")]
    pub file: String,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 单个日志文件最大字节数，0 表示不轮转
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// 保留的轮转文件数
    #[serde(default = "default_backups")]
    pub backups: u32,
}

fn default_file() -> String {
    "log.log".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

fn default_max_bytes() -> u64 {
    512_000
}

fn default_backups() -> u32 {
    10
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: None,
            file: default_file(),
            level: default_level(),
            max_bytes: default_max_bytes(),
            backups: default_backups(),
        }
    }
}

impl LogConfig {
    /// 日志目录，相对路径按配置文件所在目录解析
    pub fn log_dir(&self, base_dir: &Path) -> PathBuf {
        match &self.path {
            Some(p) if !p.is_empty() => base_dir.join(p),
            _ => base_dir.to_path_buf(),
        }
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" | "warning" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 带大小限制和编号备份的日志写入器
///
/// 超过 `max_size` 时 `app.log` -> `app.log.1` -> `app.log.2` ...，最多保留 `backups` 个。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    backups: u32,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, file_name: &str, max_size: u64, backups: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(file_name);
        let (writer, written) = Self::open_file(&file_path)?;

        Ok(Self {
            file_path,
            max_size,
            backups,
            written,
            writer: Some(writer),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path) -> io::Result<(BufWriter<File>, u64)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok((BufWriter::new(file), len))
    }

    /// 第 `index` 个备份文件路径
    fn backup_path(file_path: &Path, index: u32) -> PathBuf {
        let mut name = OsString::from(file_path.as_os_str());
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path, backups: u32) -> io::Result<()> {
        if backups == 0 {
            return fs::remove_file(file_path);
        }

        let oldest = Self::backup_path(file_path, backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for index in (1..backups).rev() {
            let from = Self::backup_path(file_path, index);
            if from.exists() {
                fs::rename(&from, Self::backup_path(file_path, index + 1))?;
            }
        }

        fs::rename(file_path, Self::backup_path(file_path, 1))
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }

        Self::rotate_log(&self.file_path, self.backups)?;

        let (writer, written) = Self::open_file(&self.file_path)?;
        self.writer = Some(writer);
        self.written = written;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_size > 0
            && self.written > 0
            && self.written + buf.len() as u64 > self.max_size
        {
            self.rotate()?;
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Writer not available"))?;
        writer.write_all(buf)?;
        writer.flush()?;
        self.written += buf.len() as u64;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// 把日志事件转发到审计库的 tracing 层
///
/// 事件只进入通道，由后台任务写库，因此不会阻塞调用方。
pub struct AuditLayer {
    tx: UnboundedSender<AuditMessage>,
}

impl AuditLayer {
    pub fn new(tx: UnboundedSender<AuditMessage>) -> Self {
        Self { tx }
    }
}

impl<S: Subscriber> Layer<S> for AuditLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !meta.target().starts_with(MIRRORED_TARGET_PREFIX) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if !visitor.audit {
            return;
        }

        let level = AuditLevel::from_tracing(meta.level(), visitor.critical);
        let _ = self.tx.send(AuditMessage::Log {
            level,
            message: visitor.finish(),
        });
    }
}

/// 收集 message 和其余字段，格式与文件日志一致
struct MessageVisitor {
    message: String,
    fields: String,
    critical: bool,
    audit: bool,
}

impl Default for MessageVisitor {
    fn default() -> Self {
        Self {
            message: String::new(),
            fields: String::new(),
            critical: false,
            audit: true,
        }
    }
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            "critical" => self.critical = value,
            "audit" => self.audit = value,
            name => self.fields.push_str(&format!(" {}={}", name, value)),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_log_config_defaults() {
        let config: LogConfig = toml::from_str("").unwrap();
        assert_eq!(config.file, "log.log");
        assert_eq!(config.max_bytes, 512_000);
        assert_eq!(config.backups, 10);
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
        assert_eq!(config.log_dir(Path::new("/opt/app")), PathBuf::from("/opt/app"));
    }

    #[test]
    fn test_log_dir_relative_to_config() {
        let mut config = LogConfig {
            path: Some("logs".to_string()),
            ..Default::default()
        };
        assert_eq!(config.log_dir(Path::new("/opt/app")), PathBuf::from("/opt/app/logs"));

        config.path = Some("/var/log/dropship".to_string());
        assert_eq!(
            config.log_dir(Path::new("/opt/app")),
            PathBuf::from("/var/log/dropship")
        );
    }

    #[test]
    fn test_tracing_level() {
        let config = LogConfig {
            level: "DEBUG".to_string(),
            ..Default::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_rotation_keeps_numbered_backups() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), "t.log", 10, 2).unwrap();

        for line in ["aaaaaaaa\n", "bbbbbbbb\n", "cccccccc\n", "dddddddd\n"] {
            writer.write_all(line.as_bytes()).unwrap();
        }
        writer.flush().unwrap();

        let current = fs::read_to_string(dir.path().join("t.log")).unwrap();
        let first = fs::read_to_string(dir.path().join("t.log.1")).unwrap();
        let second = fs::read_to_string(dir.path().join("t.log.2")).unwrap();
        assert_eq!(current, "dddddddd\n");
        assert_eq!(first, "cccccccc\n");
        assert_eq!(second, "bbbbbbbb\n");
        assert!(!dir.path().join("t.log.3").exists());
    }

    #[test]
    fn test_no_rotation_when_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), "t.log", 0, 2).unwrap();
        for _ in 0..10 {
            writer.write_all(b"0123456789").unwrap();
        }
        assert_eq!(writer.file_path(), dir.path().join("t.log"));
        assert!(!dir.path().join("t.log.1").exists());
    }

    #[test]
    fn test_audit_layer_mirrors_crate_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(AuditLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "dropship_lib::core", file = "a.txt", "上传文件");
            tracing::error!(target: "dropship", critical = true, "致命错误");
            tracing::info!(target: "dropship", audit = false, "只写文件");
            tracing::warn!(target: "sqlx::query", "外部日志");
        });

        match rx.try_recv().unwrap() {
            AuditMessage::Log { level, message } => {
                assert_eq!(level, AuditLevel::Info);
                assert_eq!(message, "上传文件 file=a.txt");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        match rx.try_recv().unwrap() {
            AuditMessage::Log { level, .. } => assert_eq!(level, AuditLevel::Critical),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
