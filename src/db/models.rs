use serde::Deserialize;

/// 审计库连接配置（`[mysql]` 段）
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, alias = "password")]
    pub pswd: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_port() -> u16 {
    3306
}

fn default_database() -> String {
    "transfers".to_string()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            pswd: String::new(),
            port: default_port(),
            database: default_database(),
        }
    }
}

impl AuditConfig {
    /// 未配置主机时不启用审计库
    pub fn is_enabled(&self) -> bool {
        !self.host.is_empty()
    }
}

/// 审计日志级别，对应存储过程 `log` 的级别代码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Error,
    Warning,
    Info,
    Debug,
    Critical,
}

impl AuditLevel {
    pub fn code(&self) -> &'static str {
        match self {
            AuditLevel::Error => "E",
            AuditLevel::Warning => "W",
            AuditLevel::Info => "I",
            AuditLevel::Debug => "D",
            AuditLevel::Critical => "C",
        }
    }

    /// tracing 没有 critical 级别，用 `critical = true` 字段标记
    pub fn from_tracing(level: &tracing::Level, critical: bool) -> Self {
        match *level {
            tracing::Level::ERROR if critical => AuditLevel::Critical,
            tracing::Level::ERROR => AuditLevel::Error,
            tracing::Level::WARN => AuditLevel::Warning,
            tracing::Level::INFO => AuditLevel::Info,
            _ => AuditLevel::Debug,
        }
    }
}

/// 审计镜像通道中的消息
#[derive(Debug, Clone)]
pub enum AuditMessage {
    Log { level: AuditLevel, message: String },
    Shutdown,
}

/// 审计库分配的传输记录 ID
pub type TransferId = i64;
