use crate::storage::{create_connector, ConnType, RemoteConfig};
use std::path::Path;

#[derive(Debug)]
pub struct TestConnectionResult {
    pub success: bool,
    pub message: String,
    pub details: Option<String>,
}

/// 测试远程连接：登录、读取登录目录，然后断开
pub async fn test_connection(config: &RemoteConfig, base_dir: &Path) -> TestConnectionResult {
    if config.conntype == ConnType::Sftp && config.host.is_empty() {
        return TestConnectionResult {
            success: false,
            message: "未配置远程主机".to_string(),
            details: Some("在 [sftp] 段中设置 host".to_string()),
        };
    }

    if let Some(key) = config.key_path(base_dir) {
        if !key.is_file() {
            return TestConnectionResult {
                success: false,
                message: "私钥文件不存在".to_string(),
                details: Some(key.display().to_string()),
            };
        }
    }

    let connector = create_connector(config, base_dir);
    let target = connector.describe();

    let conn = match connector.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            return TestConnectionResult {
                success: false,
                message: format!("连接 {} 失败", target),
                details: Some(format!("{:#}", e)),
            }
        }
    };

    let result = match conn.working_dir().await {
        Ok(home) => TestConnectionResult {
            success: true,
            message: format!("连接 {} 成功", target),
            details: Some(format!("登录目录: {}", home)),
        },
        Err(e) => TestConnectionResult {
            success: false,
            message: format!("连接 {} 成功，但无法读取工作目录", target),
            details: Some(format!("{:#}", e)),
        },
    };

    if let Err(e) = conn.close().await {
        tracing::warn!("关闭测试连接时出错: {:#}", e);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_connection() {
        let dir = tempfile::tempdir().unwrap();
        let config = RemoteConfig {
            conntype: ConnType::Local,
            host: "remote".to_string(),
            ..Default::default()
        };

        let result = test_connection(&config, dir.path()).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.details.as_deref(), Some("登录目录: /"));
        assert!(dir.path().join("remote").is_dir());
    }

    #[tokio::test]
    async fn test_missing_host() {
        let result = test_connection(&RemoteConfig::default(), Path::new(".")).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_missing_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = RemoteConfig {
            host: "sftp.example.com".to_string(),
            key: "keys/id_rsa".to_string(),
            ..Default::default()
        };

        let result = test_connection(&config, dir.path()).await;
        assert!(!result.success);
        assert_eq!(result.message, "私钥文件不存在");
    }
}
