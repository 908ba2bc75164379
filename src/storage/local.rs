use super::{normalize_remote, resolve_remote, Connector, RemoteMeta, RemoteStorage};
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

/// 本地目录作为远程根目录
pub struct LocalStorage {
    base_path: PathBuf,
    cwd: Mutex<String>,
    name: String,
}

impl LocalStorage {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = path.into();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self {
            base_path,
            cwd: Mutex::new("/".to_string()),
            name,
        })
    }

    fn cwd(&self) -> String {
        self.cwd
            .lock()
            .map(|cwd| cwd.clone())
            .unwrap_or_else(|_| "/".to_string())
    }

    /// 远程路径（相对当前目录）映射到本地路径
    fn resolve_path(&self, path: &str) -> PathBuf {
        let remote = resolve_remote(&self.cwd(), path);
        let relative = remote.trim_start_matches('/');
        if relative.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(relative)
        }
    }
}

#[async_trait]
impl RemoteStorage for LocalStorage {
    async fn working_dir(&self) -> Result<String> {
        Ok(self.cwd())
    }

    async fn change_dir(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        if !fs::metadata(&full_path).await?.is_dir() {
            anyhow::bail!("不是目录: {}", path);
        }

        let target = resolve_remote(&self.cwd(), path);
        let mut cwd = self
            .cwd
            .lock()
            .map_err(|_| anyhow::anyhow!("工作目录锁已损坏"))?;
        *cwd = normalize_remote(&target);
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteMeta>> {
        match fs::metadata(self.resolve_path(path)).await {
            Ok(metadata) => Ok(Some(RemoteMeta {
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                is_dir: metadata.is_dir(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_dir_all(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve_path(path)).await?;
        Ok(())
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<u64> {
        let full_path = self.resolve_path(remote);

        // 先写临时文件，再原子重命名
        let mut temp_name = full_path.as_os_str().to_os_string();
        temp_name.push(".part");
        let temp_path = PathBuf::from(temp_name);

        let written = fs::copy(local, &temp_path).await?;
        fs::rename(&temp_path, &full_path).await?;

        Ok(written)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 本地目录连接器
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<Box<dyn RemoteStorage>> {
        let storage = LocalStorage::new(&self.root)?;
        tracing::info!("初始化本地存储: {}", storage.name());
        Ok(Box::new(storage))
    }

    fn describe(&self) -> String {
        format!("local@{}", self.root.display())
    }
}
