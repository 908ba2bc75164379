//! 扩展名过滤
//!
//! 排除规则总是先于包含规则检查，命中排除即跳过，与包含规则的顺序无关。

use std::path::Path;

/// 包含规则：扩展名，以及上传时可选的新扩展名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeRule {
    pub ext: String,
    pub rename_to: Option<String>,
}

/// 过滤结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// 命中排除规则
    Excluded,
    /// 未命中任何包含规则
    NotIncluded,
    /// 通过过滤，`remote_name` 为上传后的文件名
    Accepted { remote_name: String },
}

/// 扩展名过滤器
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    include: Vec<IncludeRule>,
    exclude: Vec<String>,
}

impl ExtensionFilter {
    /// 解析配置中的过滤规则
    ///
    /// `include` 形如 `csv:txt,xml`，`exclude` 形如 `tmp,part`。
    pub fn parse(include: &str, exclude: &str) -> Self {
        let include = split_tokens(include)
            .map(|token| match token.split_once(':') {
                Some((ext, new_ext)) => IncludeRule {
                    ext: ext.trim().to_string(),
                    rename_to: Some(new_ext.trim().to_string()).filter(|e| !e.is_empty()),
                },
                None => IncludeRule {
                    ext: token.to_string(),
                    rename_to: None,
                },
            })
            .filter(|rule| !rule.ext.is_empty())
            .collect();

        let exclude = split_tokens(exclude).map(str::to_string).collect();

        Self { include, exclude }
    }

    pub fn include_rules(&self) -> &[IncludeRule] {
        &self.include
    }

    /// 文件是否通过排除规则（true 表示保留）
    pub fn passes_exclude(&self, file_name: &str) -> bool {
        !self.exclude.iter().any(|ext| has_extension(file_name, ext))
    }

    /// 检查包含规则，返回 (是否保留, 上传文件名)
    pub fn check_include(&self, file_name: &str) -> (bool, String) {
        if self.include.is_empty() {
            return (true, file_name.to_string());
        }

        for rule in &self.include {
            if has_extension(file_name, &rule.ext) {
                let remote_name = match &rule.rename_to {
                    Some(new_ext) => format!("{}.{}", file_stem(file_name), new_ext),
                    None => file_name.to_string(),
                };
                return (true, remote_name);
            }
        }

        (false, file_name.to_string())
    }

    /// 依次检查排除和包含规则
    pub fn evaluate(&self, file_name: &str) -> FilterDecision {
        if !self.passes_exclude(file_name) {
            return FilterDecision::Excluded;
        }

        match self.check_include(file_name) {
            (true, remote_name) => FilterDecision::Accepted { remote_name },
            (false, _) => FilterDecision::NotIncluded,
        }
    }

    /// 同时出现在包含和排除列表中的扩展名（排除优先，这类配置多半是误写）
    pub fn overlapping_exts(&self) -> Vec<String> {
        let mut overlaps: Vec<String> = self
            .include
            .iter()
            .filter(|rule| {
                self.exclude
                    .iter()
                    .any(|ext| ext.eq_ignore_ascii_case(&rule.ext))
            })
            .map(|rule| rule.ext.to_lowercase())
            .collect();
        overlaps.dedup();
        overlaps
    }
}

fn split_tokens(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|t| !t.is_empty())
}

/// 文件名是否以 `.ext` 结尾（不区分大小写）
fn has_extension(file_name: &str, ext: &str) -> bool {
    let suffix = format!(".{}", ext.to_lowercase());
    file_name.to_lowercase().ends_with(&suffix)
}

fn file_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}
