use crate::config::{TransferMode, TransferRule};
use crate::core::file_state::FileStateManager;
use crate::core::filter::{ExtensionFilter, FilterDecision};
use crate::core::scanner::{FileScanner, LocalFile};
use crate::error::{ConfigError, TransferError};
use crate::storage::RemoteSession;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// 单个配置段的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionReport {
    pub name: String,
    /// 源目录中的文件数
    pub listed: u32,
    /// 被过滤规则跳过
    pub excluded: u32,
    /// 未变化（类型 2）
    pub unchanged: u32,
    pub uploaded: u32,
    pub failed: u32,
    pub relocated: u32,
    pub relocate_failed: u32,
    /// 配置段因源目录或转移目录问题中止
    pub aborted: bool,
}

impl SectionReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// 整次运行的统计
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub sections: Vec<SectionReport>,
    /// 配置错误而跳过的段
    pub skipped: Vec<String>,
    pub duration_ms: u64,
}

impl RunReport {
    /// 各段统计之和
    pub fn totals(&self) -> SectionReport {
        self.sections
            .iter()
            .fold(SectionReport::new("total"), |mut total, s| {
                total.listed += s.listed;
                total.excluded += s.excluded;
                total.unchanged += s.unchanged;
                total.uploaded += s.uploaded;
                total.failed += s.failed;
                total.relocated += s.relocated;
                total.relocate_failed += s.relocate_failed;
                total.aborted |= s.aborted;
                total
            })
    }

    pub fn has_failures(&self) -> bool {
        let totals = self.totals();
        totals.failed > 0 || totals.relocate_failed > 0 || totals.aborted || !self.skipped.is_empty()
    }
}

/// 传输引擎
///
/// 按段名顺序逐段处理，每段内逐个文件处理；单个文件或单个段的失败不影响其他文件和段。
pub struct TransferEngine {
    session: RemoteSession,
    tracker: FileStateManager,
}

impl TransferEngine {
    pub fn new(session: RemoteSession, tracker: FileStateManager) -> Self {
        Self { session, tracker }
    }

    /// 处理所有传输段，结束时断开远程连接
    pub async fn run(&mut self, rules: Vec<Result<TransferRule, ConfigError>>) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::default();

        for rule in rules {
            match rule {
                Ok(rule) => {
                    let section = self.run_rule(&rule).await;
                    report.sections.push(section);
                }
                Err(e) => {
                    error!("{}，跳过该段", e);
                    if let ConfigError::InvalidSection { section, .. }
                    | ConfigError::UnknownType { section, .. } = e
                    {
                        report.skipped.push(section);
                    }
                }
            }
        }

        self.session.disconnect().await;
        report.duration_ms = started.elapsed().as_millis() as u64;

        let totals = report.totals();
        info!(
            "全部配置段处理完成: 上传 {}, 失败 {}, 转移 {}, 转移失败 {}, 耗时 {}ms",
            totals.uploaded,
            totals.failed,
            totals.relocated,
            totals.relocate_failed,
            report.duration_ms
        );
        if totals.relocate_failed > 0 {
            warn!("{} 个文件已上传但未能转移，下次运行会再次上传", totals.relocate_failed);
        }

        report
    }

    /// 处理单个传输段
    pub async fn run_rule(&mut self, rule: &TransferRule) -> SectionReport {
        info!(
            "处理配置段 [{}]: 类型 {}, {} -> {}",
            rule.name,
            rule.type_code(),
            rule.source().display(),
            rule.destination()
        );

        let report = match &rule.mode {
            TransferMode::SingleDirectoryWithRelocate {
                source,
                destination,
                relocate_to,
                filter,
            } => {
                self.run_relocate(&rule.name, source, destination, relocate_to.as_deref(), filter)
                    .await
            }
            TransferMode::SingleDirectoryWithChangeTracking {
                source,
                destination,
                filter,
            } => {
                self.run_tracked(&rule.name, source, destination, filter)
                    .await
            }
        };

        info!(
            "配置段 [{}] 完成: 文件 {}, 跳过 {}, 未变化 {}, 上传 {}, 失败 {}, 转移 {}",
            report.name,
            report.listed,
            report.excluded,
            report.unchanged,
            report.uploaded,
            report.failed,
            report.relocated
        );
        report
    }

    fn scan(source: &Path, report: &mut SectionReport) -> Option<Vec<LocalFile>> {
        match FileScanner::new(source).scan() {
            Ok(files) => {
                report.listed = files.len() as u32;
                Some(files)
            }
            Err(e) => {
                let kind = e.kind();
                error!(kind, section = %report.name, "源目录不可用，中止该段: {}", e);
                report.aborted = true;
                None
            }
        }
    }

    /// 类型 1：上传成功后转移本地文件
    async fn run_relocate(
        &mut self,
        name: &str,
        source: &Path,
        destination: &str,
        relocate_to: Option<&Path>,
        filter: &ExtensionFilter,
    ) -> SectionReport {
        let mut report = SectionReport::new(name);

        let Some(files) = Self::scan(source, &mut report) else {
            return report;
        };

        if let Some(dir) = relocate_to {
            if !dir.is_dir() {
                info!("创建转移目录: {}", dir.display());
                if let Err(e) = tokio::fs::create_dir_all(dir).await {
                    error!(section = name, "无法创建转移目录 {}，中止该段: {}", dir.display(), e);
                    report.aborted = true;
                    return report;
                }
            }
        }

        for file in files {
            let remote_name = match filter.evaluate(&file.name) {
                FilterDecision::Excluded => {
                    info!("文件 {} 命中排除规则，跳过", file.name);
                    report.excluded += 1;
                    continue;
                }
                FilterDecision::NotIncluded => {
                    info!("文件 {} 不在包含规则中，跳过", file.name);
                    report.excluded += 1;
                    continue;
                }
                FilterDecision::Accepted { remote_name } => remote_name,
            };

            if !self.session.upload(&file.path, destination, &remote_name).await {
                report.failed += 1;
                continue;
            }
            report.uploaded += 1;

            let Some(dir) = relocate_to else {
                continue;
            };

            let target = dir.join(&file.name);
            info!("转移文件 {} 到 {}", file.name, dir.display());
            match move_file(&file.path, &target).await {
                Ok(()) => report.relocated += 1,
                Err(e) => {
                    let kind = e.kind();
                    error!(kind, "{}", e);
                    report.relocate_failed += 1;
                }
            }
        }

        report
    }

    /// 类型 2：只上传修改时间变化的文件
    async fn run_tracked(
        &mut self,
        name: &str,
        source: &Path,
        destination: &str,
        filter: &ExtensionFilter,
    ) -> SectionReport {
        let mut report = SectionReport::new(name);

        let Some(files) = Self::scan(source, &mut report) else {
            return report;
        };

        for file in files {
            let remote_name = match filter.evaluate(&file.name) {
                FilterDecision::Excluded | FilterDecision::NotIncluded => {
                    debug!("文件 {} 被过滤规则跳过", file.name);
                    report.excluded += 1;
                    continue;
                }
                FilterDecision::Accepted { remote_name } => remote_name,
            };

            match self.tracker.should_upload(name, &file.path).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("文件 {} 未变化", file.name);
                    report.unchanged += 1;
                    continue;
                }
                Err(e) => {
                    error!(section = name, file = %file.path.display(), "读取文件状态失败: {:#}", e);
                    report.failed += 1;
                    continue;
                }
            }

            if self.session.upload(&file.path, destination, &remote_name).await {
                report.uploaded += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }
}

/// 移动文件；跨设备时改为复制后删除
async fn move_file(from: &Path, to: &Path) -> Result<(), TransferError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    let io_err = |op: &'static str, path: PathBuf| {
        move |source: std::io::Error| TransferError::LocalIo { op, path, source }
    };

    tokio::fs::copy(from, to)
        .await
        .map_err(io_err("move", to.to_path_buf()))?;
    tokio::fs::remove_file(from)
        .await
        .map_err(io_err("remove", from.to_path_buf()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transfer::TransferJournal;
    use crate::db::testing::RecordingAuditStore;
    use crate::storage::testing::{MemoryConnector, MemoryRemote};
    use crate::storage::LocalConnector;
    use std::sync::Arc;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join("in")).unwrap();
            Self { dir }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        fn write(&self, rel: &str, content: &[u8]) {
            std::fs::write(self.path(rel), content).unwrap();
        }

        fn memory_engine(&self, remote: &MemoryRemote) -> TransferEngine {
            let session = RemoteSession::new(
                Box::new(MemoryConnector {
                    remote: remote.clone(),
                }),
                TransferJournal::disabled(),
            );
            TransferEngine::new(session, FileStateManager::for_sid(&self.path("state"), "SID"))
        }

        fn relocate_rule(&self, inc: &str, exc: &str, relocate: Option<&str>) -> TransferRule {
            TransferRule {
                name: "set-a".to_string(),
                mode: TransferMode::SingleDirectoryWithRelocate {
                    source: self.path("in"),
                    destination: "/up/".to_string(),
                    relocate_to: relocate.map(|r| self.path(r)),
                    filter: ExtensionFilter::parse(inc, exc),
                },
            }
        }

        fn tracked_rule(&self, inc: &str) -> TransferRule {
            TransferRule {
                name: "set-b".to_string(),
                mode: TransferMode::SingleDirectoryWithChangeTracking {
                    source: self.path("in"),
                    destination: "/up".to_string(),
                    filter: ExtensionFilter::parse(inc, ""),
                },
            }
        }
    }

    #[tokio::test]
    async fn test_relocate_end_to_end_with_local_backend() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");
        fx.write("in/b.tmp", b"beta");

        let store = Arc::new(RecordingAuditStore::default());
        let session = RemoteSession::new(
            Box::new(LocalConnector::new(fx.path("remote"))),
            TransferJournal::new(Some(store.clone())),
        );
        let mut engine = TransferEngine::new(session, FileStateManager::for_sid(&fx.path("state"), "SID"));

        let report = engine
            .run(vec![Ok(fx.relocate_rule("txt", "", Some("sent")))])
            .await;

        let section = &report.sections[0];
        assert_eq!(section.listed, 2);
        assert_eq!(section.excluded, 1);
        assert_eq!(section.uploaded, 1);
        assert_eq!(section.relocated, 1);
        assert!(!report.has_failures());

        assert_eq!(std::fs::read(fx.path("remote/up/a.txt")).unwrap(), b"alpha");
        assert!(fx.path("sent/a.txt").exists());
        assert!(!fx.path("in/a.txt").exists());
        assert!(fx.path("in/b.tmp").exists());
        assert!(!fx.path("remote/up/b.tmp").exists());

        let calls = store.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].contains("-> [local@"));
        assert!(calls[0].ends_with("/up/a.txt"));
        assert_eq!(calls[2], "pass 1");
    }

    #[tokio::test]
    async fn test_verification_failure_keeps_file() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");

        let remote = MemoryRemote::new();
        remote.state.lock().unwrap().size_skew = 1;
        let mut engine = fx.memory_engine(&remote);

        let report = engine
            .run(vec![Ok(fx.relocate_rule("", "", Some("sent")))])
            .await;

        let section = &report.sections[0];
        assert_eq!(section.uploaded, 0);
        assert_eq!(section.failed, 1);
        assert_eq!(section.relocated, 0);
        assert!(fx.path("in/a.txt").exists());
        assert!(!fx.path("sent/a.txt").exists());
        assert!(report.has_failures());
    }

    #[tokio::test]
    async fn test_failed_relocation_does_not_stop_the_section() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");
        fx.write("in/b.txt", b"beta");
        fx.write("in/c.txt", b"gamma");
        // 同名非空目录挡住 a.txt 的转移
        std::fs::create_dir_all(fx.path("sent/a.txt")).unwrap();
        fx.write("sent/a.txt/keep", b"x");

        let remote = MemoryRemote::new();
        let mut engine = fx.memory_engine(&remote);

        let report = engine
            .run(vec![Ok(fx.relocate_rule("", "", Some("sent")))])
            .await;

        let section = &report.sections[0];
        assert_eq!(section.uploaded, 3);
        assert_eq!(section.relocated, 2);
        assert_eq!(section.relocate_failed, 1);
        assert_eq!(remote.puts(), vec!["/up/a.txt", "/up/b.txt", "/up/c.txt"]);
        assert!(fx.path("in/a.txt").exists());
        assert!(fx.path("sent/b.txt").is_file());
        assert!(fx.path("sent/c.txt").is_file());
        assert!(report.has_failures());
    }

    #[tokio::test]
    async fn test_failed_upload_does_not_stop_the_section() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");
        fx.write("in/b.txt", b"beta");

        let remote = MemoryRemote::new();
        remote.state.lock().unwrap().skewed = vec!["/up/a.txt".to_string()];
        let mut engine = fx.memory_engine(&remote);

        let report = engine
            .run(vec![Ok(fx.relocate_rule("", "", Some("sent")))])
            .await;

        let section = &report.sections[0];
        assert_eq!(section.failed, 1);
        assert_eq!(section.uploaded, 1);
        assert_eq!(section.relocated, 1);
        assert_eq!(remote.puts(), vec!["/up/a.txt", "/up/b.txt"]);
        assert!(fx.path("in/a.txt").exists());
        assert!(!fx.path("in/b.txt").exists());
        assert!(fx.path("sent/b.txt").exists());
    }

    #[tokio::test]
    async fn test_rename_on_upload_keeps_local_name() {
        let fx = Fixture::new();
        fx.write("in/data.CSV", b"1,2");
        fx.write("in/notes.md", b"#");

        let remote = MemoryRemote::new();
        let mut engine = fx.memory_engine(&remote);

        let report = engine
            .run(vec![Ok(fx.relocate_rule("csv:txt", "", Some("sent")))])
            .await;

        assert_eq!(remote.puts(), vec!["/up/data.txt"]);
        assert_eq!(report.sections[0].excluded, 1);
        assert!(fx.path("sent/data.CSV").exists());
    }

    #[tokio::test]
    async fn test_exclude_wins_over_include() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");

        let remote = MemoryRemote::new();
        let mut engine = fx.memory_engine(&remote);

        let report = engine
            .run(vec![Ok(fx.relocate_rule("txt", "TXT", None))])
            .await;

        assert!(remote.puts().is_empty());
        assert_eq!(report.sections[0].excluded, 1);
    }

    #[tokio::test]
    async fn test_without_relocation_file_stays() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");

        let remote = MemoryRemote::new();
        let mut engine = fx.memory_engine(&remote);

        let report = engine.run(vec![Ok(fx.relocate_rule("", "", None))]).await;

        assert_eq!(report.sections[0].uploaded, 1);
        assert_eq!(report.sections[0].relocated, 0);
        assert!(fx.path("in/a.txt").exists());
    }

    #[tokio::test]
    async fn test_change_tracking_skips_unchanged() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");
        fx.write("in/b.log", b"beta");

        let remote = MemoryRemote::new();
        let mut engine = fx.memory_engine(&remote);
        let rule = fx.tracked_rule("txt");

        let first = engine.run(vec![Ok(rule.clone())]).await;
        assert_eq!(first.sections[0].uploaded, 1);
        assert_eq!(first.sections[0].excluded, 1);
        assert_eq!(remote.puts().len(), 1);

        let second = engine.run(vec![Ok(rule.clone())]).await;
        assert_eq!(second.sections[0].uploaded, 0);
        assert_eq!(second.sections[0].unchanged, 1);
        assert_eq!(remote.puts().len(), 1);

        filetime::set_file_mtime(
            fx.path("in/a.txt"),
            filetime::FileTime::from_unix_time(1_600_000_000, 0),
        )
        .unwrap();
        let third = engine.run(vec![Ok(rule)]).await;
        assert_eq!(third.sections[0].uploaded, 1);
        assert_eq!(remote.puts().len(), 2);
        assert!(fx.path("in/a.txt").exists());
    }

    #[tokio::test]
    async fn test_tracker_error_counts_as_failure() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");
        std::fs::create_dir(fx.path("state.db")).unwrap();

        let remote = MemoryRemote::new();
        let session = RemoteSession::new(
            Box::new(MemoryConnector {
                remote: remote.clone(),
            }),
            TransferJournal::disabled(),
        );
        // 状态库路径是目录，打开必然失败
        let mut engine = TransferEngine::new(session, FileStateManager::new(fx.path("state.db")));

        let report = engine.run(vec![Ok(fx.tracked_rule(""))]).await;

        assert_eq!(report.sections[0].failed, 1);
        assert!(remote.puts().is_empty());
    }

    #[tokio::test]
    async fn test_bad_sections_do_not_stop_the_run() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");

        let remote = MemoryRemote::new();
        let mut engine = fx.memory_engine(&remote);

        let mut missing = fx.relocate_rule("", "", None);
        missing.name = "set-0".to_string();
        if let TransferMode::SingleDirectoryWithRelocate { source, .. } = &mut missing.mode {
            *source = fx.path("missing");
        }

        let report = engine
            .run(vec![
                Ok(missing),
                Err(ConfigError::UnknownType {
                    section: "set-x".to_string(),
                    kind: "9".to_string(),
                }),
                Ok(fx.relocate_rule("", "", None)),
            ])
            .await;

        assert_eq!(report.sections.len(), 2);
        assert!(report.sections[0].aborted);
        assert_eq!(report.sections[1].uploaded, 1);
        assert_eq!(report.skipped, vec!["set-x"]);
        assert_eq!(remote.puts(), vec!["/up/a.txt"]);
    }

    #[tokio::test]
    async fn test_session_closed_once_per_run() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");
        fx.write("in/b.txt", b"beta");

        let remote = MemoryRemote::new();
        let mut engine = fx.memory_engine(&remote);
        engine.run(vec![Ok(fx.relocate_rule("", "", None))]).await;

        let state = remote.state.lock().unwrap();
        assert_eq!(state.connects, 1);
        assert_eq!(state.closes, 1);
    }

    #[tokio::test]
    async fn test_move_file() {
        let fx = Fixture::new();
        fx.write("in/a.txt", b"alpha");
        std::fs::create_dir(fx.path("out")).unwrap();

        move_file(&fx.path("in/a.txt"), &fx.path("out/a.txt"))
            .await
            .unwrap();
        assert!(!fx.path("in/a.txt").exists());
        assert_eq!(std::fs::read(fx.path("out/a.txt")).unwrap(), b"alpha");

        let err = move_file(&fx.path("in/none.txt"), &fx.path("out/none.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "LocalIOError");
    }
}
