//! 配置检查命令

use crate::config::{Settings, TransferMode};
use crate::core::PathMacros;
use crate::storage::ConnType;

/// 检查结果
#[derive(Debug, Default)]
pub struct CheckReport {
    /// 会导致段被跳过或运行失败的问题
    pub problems: Vec<String>,
    pub warnings: Vec<String>,
    /// 有效的传输段
    pub sections: Vec<String>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// 校验配置文件，不连接远程服务器
pub fn check_config(settings: &Settings) -> CheckReport {
    let mut report = CheckReport {
        warnings: settings.warnings(),
        ..Default::default()
    };

    if let Err(e) = settings.setup() {
        report.problems.push(e.to_string());
    }
    if let Err(e) = settings.log_config() {
        report.problems.push(e.to_string());
    }
    if let Err(e) = settings.audit_config() {
        report.problems.push(e.to_string());
    }

    match settings.remote_config() {
        Ok(remote) => {
            if remote.conntype == ConnType::Sftp && remote.host.is_empty() {
                report.problems.push("[sftp] 未配置 host".to_string());
            }
            if let Some(key) = remote.key_path(settings.base_dir()) {
                if !key.is_file() {
                    report
                        .problems
                        .push(format!("[sftp] 私钥文件不存在: {}", key.display()));
                }
            }
        }
        Err(e) => report.problems.push(e.to_string()),
    }

    let macros = PathMacros::now();
    for rule in settings.transfer_rules(&macros) {
        let rule = match rule {
            Ok(rule) => rule,
            Err(e) => {
                report.problems.push(e.to_string());
                continue;
            }
        };

        if !rule.source().is_dir() {
            report.warnings.push(format!(
                "[{}] 源目录不存在: {}",
                rule.name,
                rule.source().display()
            ));
        }
        if let TransferMode::SingleDirectoryWithRelocate {
            relocate_to: Some(dir),
            ..
        } = &rule.mode
        {
            if !dir.is_dir() {
                report.warnings.push(format!(
                    "[{}] 转移目录不存在，运行时会创建: {}",
                    rule.name,
                    dir.display()
                ));
            }
        }

        report.sections.push(rule.name);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn settings(content: &str, base: &Path) -> Settings {
        Settings::parse(content, &base.join("dropship.toml"), base).unwrap()
    }

    #[test]
    fn test_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("out")).unwrap();
        let content = format!(
            "[sftp]\nhost = \"h\"\nuser = \"u\"\n\n[set-a]\nfrom = \"{}\"\nto = \"/up\"\n",
            dir.path().join("out").display()
        );

        let report = check_config(&settings(&content, dir.path()));
        assert!(report.is_ok(), "{:?}", report);
        assert!(report.warnings.is_empty(), "{:?}", report);
        assert_eq!(report.sections, vec!["set-a"]);
    }

    #[test]
    fn test_problems_and_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let content = r#"
[sftp]
key = "missing_key"

[set-a]
from = "/no/such/dir"
to = "/up"
extfilterinc = "txt"
extfilterexc = "txt"

[set-b]
type = "x"
from = "/data"
to = "/up"
"#;

        let report = check_config(&settings(content, dir.path()));
        assert!(!report.is_ok());
        assert_eq!(report.problems.len(), 3, "{:?}", report.problems);
        assert!(report.warnings.iter().any(|w| w.contains("txt")));
        assert!(report.warnings.iter().any(|w| w.contains("/no/such/dir")));
        assert_eq!(report.sections, vec!["set-a"]);
    }
}
