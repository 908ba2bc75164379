pub mod local;
pub mod sftp;

use crate::core::transfer::TransferJournal;
use crate::error::TransferError;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub use local::{LocalConnector, LocalStorage};
pub use sftp::{SftpConnector, SftpStorage};

/// 远程文件元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMeta {
    pub size: u64,
    pub is_dir: bool,
}

/// 远程存储接口（一条已建立的连接）
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// 当前工作目录（绝对路径）
    async fn working_dir(&self) -> Result<String>;

    /// 切换工作目录
    async fn change_dir(&self, path: &str) -> Result<()>;

    /// 获取文件元数据，不存在时返回 None
    async fn stat(&self, path: &str) -> Result<Option<RemoteMeta>>;

    /// 检查文件是否存在
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// 递归创建目录
    async fn create_dir_all(&self, path: &str) -> Result<()>;

    /// 上传本地文件，返回写入的字节数
    async fn put(&self, local: &Path, remote: &str) -> Result<u64>;

    /// 关闭连接
    async fn close(&self) -> Result<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 建立远程连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RemoteStorage>>;

    /// 审计记录中的远程描述，形如 `user@host`
    fn describe(&self) -> String;
}

/// 连接类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    #[default]
    Sftp,
    Local,
}

/// 主机密钥校验策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKeyPolicy {
    /// 接受任何主机密钥
    #[default]
    Accept,
    /// 必须与 known_hosts 中的记录一致
    Strict,
}

/// 远程连接配置（`[sftp]` 段）
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub conntype: ConnType,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// 私钥路径，相对路径基于配置文件目录
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub passphrase: String,
    #[serde(default)]
    pub hostkey: HostKeyPolicy,
    #[serde(default)]
    pub known_hosts: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_port() -> u16 {
    22
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            conntype: ConnType::default(),
            host: String::new(),
            port: default_port(),
            user: String::new(),
            password: String::new(),
            key: String::new(),
            passphrase: String::new(),
            hostkey: HostKeyPolicy::default(),
            known_hosts: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RemoteConfig {
    /// 私钥的实际路径
    pub fn key_path(&self, base_dir: &Path) -> Option<PathBuf> {
        if self.key.is_empty() {
            return None;
        }
        let key = PathBuf::from(&self.key);
        Some(if key.is_absolute() {
            key
        } else {
            base_dir.join(key)
        })
    }
}

/// 根据配置创建连接器
pub fn create_connector(config: &RemoteConfig, base_dir: &Path) -> Box<dyn Connector> {
    match config.conntype {
        ConnType::Sftp => Box::new(SftpConnector::new(config.clone(), base_dir)),
        ConnType::Local => {
            let root = if Path::new(&config.host).is_absolute() {
                PathBuf::from(&config.host)
            } else {
                base_dir.join(&config.host)
            };
            Box::new(LocalConnector::new(root))
        }
    }
}

/// 远程会话
///
/// 第一次上传时才建立连接；连接失败时保持断开，下次上传再试。
/// 整个运行期间共用一个会话，结束时调用一次 `disconnect`。
pub struct RemoteSession {
    connector: Box<dyn Connector>,
    conn: Option<Box<dyn RemoteStorage>>,
    home: String,
    journal: TransferJournal,
}

impl RemoteSession {
    pub fn new(connector: Box<dyn Connector>, journal: TransferJournal) -> Self {
        Self {
            connector,
            conn: None,
            home: "/".to_string(),
            journal,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// 建立连接（已连接时直接返回）
    pub async fn connect(&mut self) -> Result<(), TransferError> {
        if self.conn.is_some() {
            return Ok(());
        }

        let target = self.connector.describe();
        info!("连接远程服务器 {}", target);

        let conn = self
            .connector
            .connect()
            .await
            .map_err(|source| TransferError::Connection {
                target: target.clone(),
                source,
            })?;

        // 记录登录后的初始目录，相对路径基于它解析
        self.home = conn
            .working_dir()
            .await
            .map_err(|source| TransferError::Connection {
                target: target.clone(),
                source,
            })?;
        self.conn = Some(conn);

        Ok(())
    }

    /// 断开连接，可重复调用
    pub async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                warn!("关闭远程连接时出错: {:#}", e);
            }
            info!("远程连接已断开");
        }
    }

    fn storage(&self) -> Result<&dyn RemoteStorage, TransferError> {
        self.conn
            .as_deref()
            .ok_or_else(|| TransferError::Connection {
                target: self.connector.describe(),
                source: anyhow::anyhow!("未连接"),
            })
    }

    /// 确保远程目录存在并切换到该目录
    ///
    /// 切换后工作目录必须等于目标路径，否则视为失败。返回目录的绝对路径。
    pub async fn ensure_directory(&self, path: &str) -> Result<String, TransferError> {
        let target = resolve_remote(&self.home, path);
        let storage = self.storage()?;

        let dir_err = |op: &'static str| {
            let path = path.to_string();
            move |source: anyhow::Error| TransferError::RemoteDirectory { op, path, source }
        };

        let cwd = storage.working_dir().await.map_err(dir_err("pwd"))?;
        if normalize_remote(&cwd) == target {
            return Ok(target);
        }

        if !storage.exists(&target).await.map_err(dir_err("exists"))? {
            info!("创建远程目录: {}", target);
            storage
                .create_dir_all(&target)
                .await
                .map_err(dir_err("mkdir"))?;
        }

        storage.change_dir(&target).await.map_err(dir_err("cwd"))?;

        let cwd = storage.working_dir().await.map_err(dir_err("pwd"))?;
        if normalize_remote(&cwd) != target {
            return Err(TransferError::RemoteDirectory {
                op: "cwd",
                path: path.to_string(),
                source: anyhow::anyhow!("切换后的工作目录为 {}", cwd),
            });
        }

        Ok(target)
    }

    /// 上传文件并按大小校验，失败只记录日志并返回 false
    pub async fn upload(&mut self, local: &Path, remote_dir: &str, remote_name: &str) -> bool {
        match self.try_upload(local, remote_dir, remote_name).await {
            Ok(_) => true,
            Err(e) => {
                let kind = e.kind();
                error!(kind, local = %local.display(), "{}", e);
                self.journal.fail().await;
                false
            }
        }
    }

    async fn try_upload(
        &mut self,
        local: &Path,
        remote_dir: &str,
        remote_name: &str,
    ) -> Result<u64, TransferError> {
        self.connect().await?;

        let remote_dir = trim_trailing_slash(remote_dir);
        let target_dir = self.ensure_directory(remote_dir).await?;

        let local_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if local_name != remote_name {
            info!("上传 {} 到 {}，重命名为 {}", local_name, remote_dir, remote_name);
        } else {
            info!("上传 {} 到 {}", local_name, remote_dir);
        }

        let remote = join_remote(&target_dir, remote_name);
        let descriptor = format!("[{}] {}", self.connector.describe(), remote);
        self.journal
            .begin(&local.to_string_lossy(), &descriptor)
            .await;

        let storage = self.storage()?;
        let written = storage
            .put(local, &remote)
            .await
            .map_err(|source| TransferError::Upload {
                local: local.to_path_buf(),
                remote: remote.clone(),
                source,
            })?;

        self.journal.check().await;

        let storage = self.storage()?;
        let local_size = tokio::fs::metadata(local)
            .await
            .map_err(|source| TransferError::LocalIo {
                op: "stat",
                path: local.to_path_buf(),
                source,
            })?
            .len();

        match storage.stat(&remote).await {
            Ok(Some(meta)) if meta.size == local_size => {}
            Ok(Some(meta)) => {
                return Err(TransferError::Verification {
                    remote,
                    reason: format!("远程大小 {} 与本地大小 {} 不一致", meta.size, local_size),
                })
            }
            Ok(None) => {
                return Err(TransferError::Verification {
                    remote,
                    reason: "上传后远程文件不存在".to_string(),
                })
            }
            Err(e) => {
                return Err(TransferError::Verification {
                    remote,
                    reason: format!("{:#}", e),
                })
            }
        }

        self.journal.pass().await;
        Ok(written)
    }
}

fn trim_trailing_slash(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// 拼接远程路径
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// 规范化远程绝对路径：合并重复的 `/`，处理 `.` 和 `..`，去掉结尾的 `/`
pub fn normalize_remote(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// 相对路径基于登录目录解析
pub fn resolve_remote(home: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize_remote(path)
    } else {
        normalize_remote(&join_remote(home, path))
    }
}
