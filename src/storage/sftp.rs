use super::{resolve_remote, Connector, HostKeyPolicy, RemoteConfig, RemoteMeta, RemoteStorage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ssh2::{CheckResult, ErrorCode, HashType, KnownHostFileKind, Session, Sftp};
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// SFTP 状态码：文件不存在
const SFTP_NO_SUCH_FILE: i32 = 2;

struct SftpInner {
    session: Session,
    sftp: Sftp,
}

/// SFTP 远程存储
///
/// ssh2 是阻塞接口，所有调用都放到 `spawn_blocking` 中执行。
/// SFTP 协议没有工作目录，这里自己记录当前目录。
pub struct SftpStorage {
    inner: Arc<Mutex<SftpInner>>,
    cwd: Mutex<String>,
    name: String,
}

impl SftpStorage {
    fn cwd(&self) -> String {
        self.cwd
            .lock()
            .map(|cwd| cwd.clone())
            .unwrap_or_else(|_| "/".to_string())
    }

    fn resolve(&self, path: &str) -> String {
        resolve_remote(&self.cwd(), path)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SftpInner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = inner
                .lock()
                .map_err(|_| anyhow::anyhow!("SFTP 会话锁已损坏"))?;
            f(&guard)
        })
        .await?
    }
}

fn is_not_found(e: &ssh2::Error) -> bool {
    e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE)
}

#[async_trait]
impl RemoteStorage for SftpStorage {
    async fn working_dir(&self) -> Result<String> {
        Ok(self.cwd())
    }

    async fn change_dir(&self, path: &str) -> Result<()> {
        let target = self.resolve(path);
        let resolved = self
            .blocking(move |inner| {
                let stat = inner
                    .sftp
                    .stat(Path::new(&target))
                    .with_context(|| format!("目录不存在: {}", target))?;
                if !stat.is_dir() {
                    anyhow::bail!("不是目录: {}", target);
                }
                let real = inner.sftp.realpath(Path::new(&target))?;
                Ok(real.to_string_lossy().into_owned())
            })
            .await?;

        let mut cwd = self
            .cwd
            .lock()
            .map_err(|_| anyhow::anyhow!("工作目录锁已损坏"))?;
        *cwd = resolved;
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteMeta>> {
        let target = self.resolve(path);
        self.blocking(move |inner| match inner.sftp.stat(Path::new(&target)) {
            Ok(stat) => Ok(Some(RemoteMeta {
                size: stat.size.unwrap_or(0),
                is_dir: stat.is_dir(),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn create_dir_all(&self, path: &str) -> Result<()> {
        let target = self.resolve(path);
        self.blocking(move |inner| {
            let mut current = String::new();
            for part in target.split('/').filter(|p| !p.is_empty()) {
                current.push('/');
                current.push_str(part);
                match inner.sftp.stat(Path::new(&current)) {
                    Ok(stat) if stat.is_dir() => continue,
                    Ok(_) => anyhow::bail!("路径已存在且不是目录: {}", current),
                    Err(e) if is_not_found(&e) => {
                        debug!("创建远程目录 {}", current);
                        inner
                            .sftp
                            .mkdir(Path::new(&current), 0o755)
                            .with_context(|| format!("创建目录失败: {}", current))?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
        .await
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<u64> {
        let target = self.resolve(remote);
        let local = local.to_path_buf();
        self.blocking(move |inner| {
            let mut source = std::fs::File::open(&local)
                .with_context(|| format!("打开本地文件失败: {}", local.display()))?;
            let mut dest = inner
                .sftp
                .create(Path::new(&target))
                .with_context(|| format!("创建远程文件失败: {}", target))?;
            let written = std::io::copy(&mut source, &mut dest)?;
            dest.flush()?;
            Ok(written)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.blocking(|inner| {
            inner.session.disconnect(None, "bye", None)?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// SFTP 连接器
pub struct SftpConnector {
    config: RemoteConfig,
    base_dir: PathBuf,
}

impl SftpConnector {
    pub fn new(config: RemoteConfig, base_dir: &Path) -> Self {
        Self {
            config,
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn known_hosts_path(&self) -> Option<PathBuf> {
        let home = || std::env::var_os("HOME").map(PathBuf::from);
        match &self.config.known_hosts {
            Some(path) if path.starts_with("~/") => home().map(|h| h.join(&path[2..])),
            Some(path) if Path::new(path).is_absolute() => Some(PathBuf::from(path)),
            Some(path) => Some(self.base_dir.join(path)),
            None => home().map(|h| h.join(".ssh").join("known_hosts")),
        }
    }
}

#[async_trait]
impl Connector for SftpConnector {
    async fn connect(&self) -> Result<Box<dyn RemoteStorage>> {
        let config = self.config.clone();
        let key = config.key_path(&self.base_dir);
        let known_hosts = self.known_hosts_path();
        let name = self.describe();

        let (inner, home) = tokio::task::spawn_blocking(move || {
            open_session(&config, key.as_deref(), known_hosts.as_deref())
        })
        .await??;

        info!("已连接 {}，登录目录 {}", name, home);
        Ok(Box::new(SftpStorage {
            inner: Arc::new(Mutex::new(inner)),
            cwd: Mutex::new(home),
            name,
        }))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host)
    }
}

fn open_session(
    config: &RemoteConfig,
    key: Option<&Path>,
    known_hosts: Option<&Path>,
) -> Result<(SftpInner, String)> {
    if config.host.is_empty() {
        anyhow::bail!("未配置远程主机");
    }

    let timeout = Duration::from_secs(config.timeout_secs);
    let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .with_context(|| format!("解析地址失败: {}:{}", config.host, config.port))?
        .collect();
    let (tcp, addr) = connect_any(&addrs, timeout)
        .with_context(|| format!("TCP 连接到 {}:{} 失败", config.host, config.port))?;

    let mut session = Session::new().context("创建 SSH 会话失败")?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    session
        .handshake()
        .with_context(|| format!("SSH 握手失败: {}", addr))?;

    verify_host_key(&session, config, known_hosts)?;

    if let Some(key) = key {
        let passphrase = (!config.passphrase.is_empty()).then_some(config.passphrase.as_str());
        session
            .userauth_pubkey_file(&config.user, None, key, passphrase)
            .with_context(|| format!("密钥认证失败: {}", key.display()))?;
    } else {
        session
            .userauth_password(&config.user, &config.password)
            .context("密码认证失败")?;
    }
    if !session.authenticated() {
        anyhow::bail!("SSH 认证失败: {}", config.user);
    }

    let sftp = session.sftp().context("打开 SFTP 通道失败")?;
    let home = sftp
        .realpath(Path::new("."))
        .context("获取登录目录失败")?
        .to_string_lossy()
        .into_owned();

    Ok((SftpInner { session, sftp }, home))
}

/// 依次尝试解析出的每个地址，返回第一个连上的；全部失败时返回最后一个错误
fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        let attempt = if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(addr, timeout)
        };
        match attempt {
            Ok(tcp) => return Ok((tcp, *addr)),
            Err(e) => {
                debug!("连接 {} 失败: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(e.into()),
        None => anyhow::bail!("没有可用的地址"),
    }
}

fn verify_host_key(
    session: &Session,
    config: &RemoteConfig,
    known_hosts: Option<&Path>,
) -> Result<()> {
    let fingerprint = session
        .host_key_hash(HashType::Sha256)
        .map(|hash| hash.iter().map(|b| format!("{:02x}", b)).collect::<String>())
        .unwrap_or_default();

    match config.hostkey {
        HostKeyPolicy::Accept => {
            warn!(host = %config.host, fingerprint, "未校验主机密钥");
            Ok(())
        }
        HostKeyPolicy::Strict => {
            let (key, _) = session
                .host_key()
                .ok_or_else(|| anyhow::anyhow!("服务器未提供主机密钥"))?;
            let path = known_hosts.ok_or_else(|| anyhow::anyhow!("未找到 known_hosts 文件"))?;

            let mut hosts = session.known_hosts()?;
            hosts
                .read_file(path, KnownHostFileKind::OpenSSH)
                .with_context(|| format!("读取 known_hosts 失败: {}", path.display()))?;

            match hosts.check_port(&config.host, config.port, key) {
                CheckResult::Match => Ok(()),
                CheckResult::NotFound => {
                    anyhow::bail!("known_hosts 中没有 {} 的记录", config.host)
                }
                CheckResult::Mismatch => {
                    anyhow::bail!("{} 的主机密钥不匹配 ({})", config.host, fingerprint)
                }
                CheckResult::Failure => anyhow::bail!("主机密钥校验失败: {}", config.host),
            }
        }
    }
}
