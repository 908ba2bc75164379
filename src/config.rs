//! 应用配置模块
//!
//! 配置文件为 TOML，按段组织：`[setup]`、`[log]`、`[mysql]`、`[sftp]`，
//! 以及任意多个以 `set-` 开头的传输段。

use crate::core::filter::ExtensionFilter;
use crate::core::macros::PathMacros;
use crate::db::AuditConfig;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::storage::RemoteConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 传输段名前缀
pub const TRANSFER_SECTION_PREFIX: &str = "set-";

/// 运行配置（`[setup]` 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// 运行标识，写入审计库并作为状态库文件名
    #[serde(default = "default_sid")]
    pub sid: String,
    /// 状态库目录，未配置时使用配置文件所在目录
    #[serde(default)]
    pub statedir: Option<String>,
}

fn default_sid() -> String {
    "SID".to_string()
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            sid: default_sid(),
            statedir: None,
        }
    }
}

impl SetupConfig {
    pub fn state_dir(&self, base_dir: &Path) -> PathBuf {
        match &self.statedir {
            Some(dir) if !dir.is_empty() => {
                let dir = PathBuf::from(dir);
                if dir.is_absolute() {
                    dir
                } else {
                    base_dir.join(dir)
                }
            }
            _ => base_dir.to_path_buf(),
        }
    }
}

/// 传输类型，整数或字符串均可
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TypeField {
    Int(i64),
    Text(String),
}

impl TypeField {
    fn code(&self) -> String {
        match self {
            TypeField::Int(n) => n.to_string(),
            TypeField::Text(s) => s.trim().to_string(),
        }
    }
}

/// 传输段的原始内容
#[derive(Debug, Clone, Default, Deserialize)]
struct RawTransferSection {
    #[serde(rename = "type", default)]
    kind: Option<TypeField>,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default, alias = "transferred")]
    transfered: String,
    #[serde(default)]
    extfilterinc: String,
    #[serde(default)]
    extfilterexc: String,
}

/// 传输方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// 类型 1：上传成功后把本地文件移到 `relocate_to`
    SingleDirectoryWithRelocate {
        source: PathBuf,
        destination: String,
        relocate_to: Option<PathBuf>,
        filter: ExtensionFilter,
    },
    /// 类型 2：按修改时间判断，只上传变化过的文件
    SingleDirectoryWithChangeTracking {
        source: PathBuf,
        destination: String,
        filter: ExtensionFilter,
    },
}

/// 一个传输段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRule {
    pub name: String,
    pub mode: TransferMode,
}

impl TransferRule {
    pub fn source(&self) -> &Path {
        match &self.mode {
            TransferMode::SingleDirectoryWithRelocate { source, .. }
            | TransferMode::SingleDirectoryWithChangeTracking { source, .. } => source,
        }
    }

    pub fn destination(&self) -> &str {
        match &self.mode {
            TransferMode::SingleDirectoryWithRelocate { destination, .. }
            | TransferMode::SingleDirectoryWithChangeTracking { destination, .. } => destination,
        }
    }

    pub fn filter(&self) -> &ExtensionFilter {
        match &self.mode {
            TransferMode::SingleDirectoryWithRelocate { filter, .. }
            | TransferMode::SingleDirectoryWithChangeTracking { filter, .. } => filter,
        }
    }

    /// 配置中的类型代码
    pub fn type_code(&self) -> u8 {
        match self.mode {
            TransferMode::SingleDirectoryWithRelocate { .. } => 1,
            TransferMode::SingleDirectoryWithChangeTracking { .. } => 2,
        }
    }
}

/// 已加载的配置文件
#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    base_dir: PathBuf,
    table: toml::Table,
}

impl Settings {
    /// 从文件加载
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::parse(&content, path, &base_dir)
    }

    /// 从字符串解析，`path` 只用于错误信息
    pub fn parse(content: &str, path: &Path, base_dir: &Path) -> Result<Self, ConfigError> {
        let table = content
            .parse::<toml::Table>()
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
            table,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 配置文件所在目录，相对路径基于它解析
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// 所有配置段名，按名称排序
    pub fn sections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .iter()
            .filter(|(_, v)| v.is_table())
            .map(|(k, _)| k.clone())
            .collect();
        names.sort();
        names
    }

    pub fn section_exists(&self, name: &str) -> bool {
        self.table.get(name).is_some_and(toml::Value::is_table)
    }

    fn value(&self, section: &str, key: &str) -> Option<&toml::Value> {
        self.table.get(section)?.as_table()?.get(key)
    }

    /// 读取字符串，缺失时返回默认值；数字和布尔值按文本返回
    pub fn get_str(&self, section: &str, key: &str, default: &str) -> String {
        match self.value(section, key) {
            Some(toml::Value::String(s)) => s.clone(),
            Some(toml::Value::Integer(n)) => n.to_string(),
            Some(toml::Value::Float(f)) => f.to_string(),
            Some(toml::Value::Boolean(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    /// 读取整数，缺失或无法转换时返回默认值
    pub fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        match self.value(section, key) {
            Some(toml::Value::Integer(n)) => *n,
            Some(toml::Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// 把整个段反序列化为类型化配置，段不存在时使用默认值
    fn section<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, ConfigError> {
        match self.table.get(name) {
            None => Ok(T::default()),
            Some(value) => value
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::InvalidSection {
                    section: name.to_string(),
                    message: e.message().to_string(),
                }),
        }
    }

    pub fn setup(&self) -> Result<SetupConfig, ConfigError> {
        self.section("setup")
    }

    pub fn log_config(&self) -> Result<LogConfig, ConfigError> {
        self.section("log")
    }

    /// 审计库配置，未配置 `[mysql]` 段或主机为空时返回 None
    pub fn audit_config(&self) -> Result<Option<AuditConfig>, ConfigError> {
        if !self.section_exists("mysql") {
            return Ok(None);
        }
        let config: AuditConfig = self.section("mysql")?;
        Ok(config.is_enabled().then_some(config))
    }

    pub fn remote_config(&self) -> Result<RemoteConfig, ConfigError> {
        self.section("sftp")
    }

    /// 解析所有 `set-` 段，按段名排序；每段单独返回解析结果
    pub fn transfer_rules(&self, macros: &PathMacros) -> Vec<Result<TransferRule, ConfigError>> {
        self.sections()
            .into_iter()
            .filter(|name| name.starts_with(TRANSFER_SECTION_PREFIX))
            .map(|name| self.transfer_rule(&name, macros))
            .collect()
    }

    fn transfer_rule(&self, name: &str, macros: &PathMacros) -> Result<TransferRule, ConfigError> {
        let raw: RawTransferSection = self
            .table
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::InvalidSection {
                section: name.to_string(),
                message: "配置段不存在".to_string(),
            })?
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::InvalidSection {
                section: name.to_string(),
                message: e.message().to_string(),
            })?;

        let invalid = |message: &str| ConfigError::InvalidSection {
            section: name.to_string(),
            message: message.to_string(),
        };

        let from = macros.expand(raw.from.trim());
        let to = macros.expand(raw.to.trim());
        if from.is_empty() {
            return Err(invalid("缺少 from"));
        }
        if to.is_empty() {
            return Err(invalid("缺少 to"));
        }

        let source = PathBuf::from(from);
        let filter = ExtensionFilter::parse(&raw.extfilterinc, &raw.extfilterexc);
        let kind = raw.kind.map(|k| k.code()).unwrap_or_else(|| "1".to_string());

        let mode = match kind.as_str() {
            "1" => {
                let transfered = macros.expand(raw.transfered.trim());
                TransferMode::SingleDirectoryWithRelocate {
                    source,
                    destination: to,
                    relocate_to: (!transfered.is_empty()).then(|| PathBuf::from(transfered)),
                    filter,
                }
            }
            "2" => TransferMode::SingleDirectoryWithChangeTracking {
                source,
                destination: to,
                filter,
            },
            _ => {
                return Err(ConfigError::UnknownType {
                    section: name.to_string(),
                    kind,
                })
            }
        };

        Ok(TransferRule {
            name: name.to_string(),
            mode,
        })
    }

    /// 不影响运行、但值得提示的配置问题
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.section_exists("sftp") {
            warnings.push("缺少 [sftp] 段，使用默认连接配置".to_string());
        }

        let macros = PathMacros::now();
        let rules = self.transfer_rules(&macros);
        if rules.is_empty() {
            warnings.push(format!("没有以 {} 开头的传输段", TRANSFER_SECTION_PREFIX));
        }

        for rule in rules.iter().flatten() {
            let overlap = rule.filter().overlapping_exts();
            if !overlap.is_empty() {
                warnings.push(format!(
                    "[{}] 扩展名同时出现在包含和排除规则中，将被排除: {}",
                    rule.name,
                    overlap.join(",")
                ));
            }
        }

        warnings
    }
}
