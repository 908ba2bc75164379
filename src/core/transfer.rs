//! 传输记录 - 单个文件的 create → check → pass | fail 审计生命周期

use crate::db::{AuditStore, TransferId};
use std::sync::Arc;
use tracing::warn;

/// 传输记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// 没有进行中的记录
    Idle,
    /// 已登记，等待结果
    InProgress(TransferId),
}

/// 传输记录管理器
///
/// 同一时间只跟踪一条记录；pass / fail 之后 ID 清零，
/// 之后的 pass / fail 调用什么也不做（先写者生效）。
/// 审计库不可用时所有调用都是空操作，错误只写日志。
pub struct TransferJournal {
    store: Option<Arc<dyn AuditStore>>,
    current: Option<TransferId>,
}

impl TransferJournal {
    pub fn new(store: Option<Arc<dyn AuditStore>>) -> Self {
        Self {
            store,
            current: None,
        }
    }

    /// 不写审计库
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn status(&self) -> TransferStatus {
        match self.current {
            Some(id) => TransferStatus::InProgress(id),
            None => TransferStatus::Idle,
        }
    }

    /// 登记一次上传
    pub async fn begin(&mut self, local: &str, remote: &str) {
        let Some(store) = &self.store else {
            return;
        };

        self.current = match store.file_create(local, remote).await {
            Ok(id) => id,
            Err(e) => {
                warn!("登记传输记录失败: {:#}", e);
                None
            }
        };
    }

    /// 标记进入校验阶段
    pub async fn check(&mut self) {
        if let (Some(store), Some(id)) = (&self.store, self.current) {
            if let Err(e) = store.file_check(id).await {
                warn!(id, "更新传输记录失败: {:#}", e);
            }
        }
    }

    /// 标记成功
    pub async fn pass(&mut self) {
        if let (Some(store), Some(id)) = (&self.store, self.current.take()) {
            if let Err(e) = store.file_pass(id).await {
                warn!(id, "更新传输记录失败: {:#}", e);
            }
        }
    }

    /// 标记失败
    pub async fn fail(&mut self) {
        if let (Some(store), Some(id)) = (&self.store, self.current.take()) {
            if let Err(e) = store.file_fail(id).await {
                warn!(id, "更新传输记录失败: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::RecordingAuditStore;

    #[tokio::test]
    async fn test_first_writer_wins() {
        let store = Arc::new(RecordingAuditStore::default());
        let mut journal = TransferJournal::new(Some(store.clone()));

        journal.begin("/in/a.txt", "[u@h] /up/a.txt").await;
        assert_eq!(journal.status(), TransferStatus::InProgress(1));
        journal.check().await;
        journal.pass().await;
        journal.fail().await;
        journal.check().await;
        assert_eq!(journal.status(), TransferStatus::Idle);

        assert_eq!(
            store.calls(),
            vec!["create 1 /in/a.txt -> [u@h] /up/a.txt", "check 1", "pass 1"]
        );
    }

    #[tokio::test]
    async fn test_fail_without_record_is_noop() {
        let store = Arc::new(RecordingAuditStore::default());
        let mut journal = TransferJournal::new(Some(store.clone()));
        journal.fail().await;
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_journal() {
        let mut journal = TransferJournal::disabled();
        journal.begin("a", "b").await;
        journal.pass().await;
        assert_eq!(journal.status(), TransferStatus::Idle);
    }
}
