use std::sync::Arc;

pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::config::{Settings, TransferMode, TransferRule};
pub use crate::core::{RunReport, SectionReport, TransferEngine};
pub use crate::error::{ConfigError, ExitStatus, TransferError};

use crate::config::SetupConfig;
use crate::core::{FileStateManager, PathMacros, TransferJournal};
use crate::db::{AuditConfig, AuditStore, MySqlAuditStore};
use crate::storage::{create_connector, RemoteSession};

/// 一次运行共享的状态
pub struct AppContext {
    pub settings: Settings,
    pub setup: SetupConfig,
    /// 运行开始时计算的路径宏
    pub macros: PathMacros,
    pub audit: Option<Arc<dyn AuditStore>>,
}

impl AppContext {
    pub fn new(settings: Settings, audit: Option<Arc<dyn AuditStore>>) -> Result<Self, ConfigError> {
        let setup = settings.setup()?;
        Ok(Self {
            settings,
            setup,
            macros: PathMacros::now(),
            audit,
        })
    }

    /// 连接审计库；失败只记录日志，本次运行不写审计库
    pub async fn connect_audit(config: &AuditConfig, sid: &str) -> Option<Arc<dyn AuditStore>> {
        match MySqlAuditStore::connect(config, sid).await {
            Ok(store) => {
                tracing::debug!("已连接审计库 {}:{}/{}", config.host, config.port, config.database);
                Some(Arc::new(store))
            }
            Err(e) => {
                tracing::error!(audit = false, "审计库不可用，本次运行不写审计记录: {:#}", e);
                None
            }
        }
    }

    /// 远程会话，尚未连接
    pub fn session(&self) -> Result<RemoteSession, ConfigError> {
        let remote = self.settings.remote_config()?;
        let connector = create_connector(&remote, self.settings.base_dir());
        Ok(RemoteSession::new(
            connector,
            TransferJournal::new(self.audit.clone()),
        ))
    }

    /// 文件状态库 `<statedir>/<sid>.db`
    pub fn tracker(&self) -> FileStateManager {
        FileStateManager::for_sid(&self.setup.state_dir(self.settings.base_dir()), &self.setup.sid)
    }

    /// 清理资源（运行结束时调用）
    pub async fn cleanup(&self) {
        if let Some(store) = &self.audit {
            tracing::debug!("关闭审计库连接");
            store.close().await;
        }
    }
}
