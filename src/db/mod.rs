//! 审计库 - 通过存储过程记录运行日志和文件传输状态

pub mod models;
pub use models::*;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// 审计存储接口
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// 写入一条运行日志
    async fn log(&self, level: AuditLevel, message: &str) -> Result<()>;

    /// 登记一次上传，返回记录 ID
    async fn file_create(&self, local: &str, remote: &str) -> Result<Option<TransferId>>;

    /// 标记记录进入校验阶段
    async fn file_check(&self, id: TransferId) -> Result<()>;

    /// 标记记录成功
    async fn file_pass(&self, id: TransferId) -> Result<()>;

    /// 标记记录失败
    async fn file_fail(&self, id: TransferId) -> Result<()>;

    /// 关闭连接
    async fn close(&self);
}

/// MySQL 审计库
///
/// 存储过程使用会话变量传出 ID，所以全程只用一条连接。
pub struct MySqlAuditStore {
    sid: String,
    conn: Mutex<Option<MySqlConnection>>,
}

impl MySqlAuditStore {
    pub async fn connect(config: &AuditConfig, sid: &str) -> Result<Self> {
        let conn = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.pswd)
            .database(&config.database)
            .charset("utf8mb4")
            .connect()
            .await
            .with_context(|| format!("连接审计库 {}:{} 失败", config.host, config.port))?;

        Ok(Self {
            sid: sid.to_string(),
            conn: Mutex::new(Some(conn)),
        })
    }

    async fn call_with_id(&self, procedure: &str, id: TransferId) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("审计库连接已关闭"))?;

        sqlx::query(&format!("CALL {}(?)", procedure))
            .bind(id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("调用存储过程 {} 失败", procedure))?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MySqlAuditStore {
    async fn log(&self, level: AuditLevel, message: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("审计库连接已关闭"))?;

        sqlx::query("CALL log(?, ?, ?)")
            .bind(level.code())
            .bind(&self.sid)
            .bind(message)
            .execute(&mut *conn)
            .await
            .context("调用存储过程 log 失败")?;
        Ok(())
    }

    async fn file_create(&self, local: &str, remote: &str) -> Result<Option<TransferId>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("审计库连接已关闭"))?;

        sqlx::query("CALL logfileU(?, ?, ?, @transfer_id)")
            .bind(&self.sid)
            .bind(local)
            .bind(remote)
            .execute(&mut *conn)
            .await
            .context("调用存储过程 logfileU 失败")?;

        let id: Option<i64> = sqlx::query_scalar("SELECT CAST(@transfer_id AS SIGNED)")
            .fetch_one(&mut *conn)
            .await
            .context("读取传输记录 ID 失败")?;

        Ok(id.filter(|id| *id > 0))
    }

    async fn file_check(&self, id: TransferId) -> Result<()> {
        self.call_with_id("logfileC", id).await
    }

    async fn file_pass(&self, id: TransferId) -> Result<()> {
        self.call_with_id("logfileS", id).await
    }

    async fn file_fail(&self, id: TransferId) -> Result<()> {
        self.call_with_id("logfileF", id).await
    }

    async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            let _ = conn.close().await;
        }
    }
}

/// 审计日志镜像：后台任务从通道读取日志并写入审计库
pub struct AuditMirror {
    tx: UnboundedSender<AuditMessage>,
    handle: JoinHandle<()>,
}

impl AuditMirror {
    pub fn spawn(
        store: Arc<dyn AuditStore>,
        tx: UnboundedSender<AuditMessage>,
        mut rx: UnboundedReceiver<AuditMessage>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    AuditMessage::Log { level, message } => {
                        if let Err(e) = store.log(level, &message).await {
                            // target 不以 dropship 开头，不会再次进入镜像
                            tracing::warn!(target: "audit_mirror", "写入审计日志失败: {:#}", e);
                        }
                    }
                    AuditMessage::Shutdown => break,
                }
            }
        });

        Self { tx, handle }
    }

    /// 写完已排队的日志后停止
    pub async fn shutdown(self) {
        let _ = self.tx.send(AuditMessage::Shutdown);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// 内存审计库，记录所有调用
    #[derive(Default)]
    pub struct RecordingAuditStore {
        calls: std::sync::Mutex<Vec<String>>,
        next_id: std::sync::Mutex<TransferId>,
    }

    impl RecordingAuditStore {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl AuditStore for RecordingAuditStore {
        async fn log(&self, level: AuditLevel, message: &str) -> Result<()> {
            self.push(format!("log {} {}", level.code(), message));
            Ok(())
        }

        async fn file_create(&self, local: &str, remote: &str) -> Result<Option<TransferId>> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            self.push(format!("create {} {} -> {}", *next, local, remote));
            Ok(Some(*next))
        }

        async fn file_check(&self, id: TransferId) -> Result<()> {
            self.push(format!("check {}", id));
            Ok(())
        }

        async fn file_pass(&self, id: TransferId) -> Result<()> {
            self.push(format!("pass {}", id));
            Ok(())
        }

        async fn file_fail(&self, id: TransferId) -> Result<()> {
            self.push(format!("fail {}", id));
            Ok(())
        }

        async fn close(&self) {}
    }
}
