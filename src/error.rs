//! 错误类型

use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置文件不存在: {0}")]
    Missing(PathBuf),

    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("配置文件格式错误 {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("配置段 [{section}] 无效: {message}")]
    InvalidSection { section: String, message: String },

    #[error("配置段 [{section}] 的传输类型未知: {kind}")]
    UnknownType { section: String, kind: String },
}

/// 单个文件传输过程中的错误，携带操作名、目标路径和底层原因
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("连接 {target} 失败: {source}")]
    Connection {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("远程目录操作 {op} 失败: {path}: {source}")]
    RemoteDirectory {
        op: &'static str,
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("上传 {local} -> {remote} 失败: {source}")]
    Upload {
        local: PathBuf,
        remote: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("上传校验失败 {remote}: {reason}")]
    Verification { remote: String, reason: String },

    #[error("本地文件操作 {op} 失败: {path}: {source}")]
    LocalIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    /// 错误类别（用于日志字段）
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Connection { .. } => "ConnectionError",
            TransferError::RemoteDirectory { .. } => "RemoteDirectoryError",
            TransferError::Upload { .. } => "UploadError",
            TransferError::Verification { .. } => "UploadVerificationError",
            TransferError::LocalIo { .. } => "LocalIOError",
        }
    }
}

/// 进程退出状态
///
/// | 状态 | 含义 |
/// | --- | --- |
/// | 0 | 运行结束（单个文件失败只记录日志） |
/// | 1 | 意外的内部错误 |
/// | 2 | 配置文件缺失或无法解析 |
/// | 3 | 无法创建日志目录 |
/// | 4 | `check` / `test-connection` 发现问题 |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success = 0,
    Internal = 1,
    Config = 2,
    LogDirectory = 3,
    CheckFailed = 4,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_codes_are_distinct() {
        let codes = [
            ExitStatus::Success as u8,
            ExitStatus::Internal as u8,
            ExitStatus::Config as u8,
            ExitStatus::LogDirectory as u8,
            ExitStatus::CheckFailed as u8,
        ];
        let mut sorted = codes.to_vec();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }

    #[test]
    fn test_transfer_error_kind() {
        let err = TransferError::Verification {
            remote: "/up/a.txt".to_string(),
            reason: "size".to_string(),
        };
        assert_eq!(err.kind(), "UploadVerificationError");
        assert!(err.to_string().contains("/up/a.txt"));
    }
}
