use chrono::{DateTime, Local};

/// 路径宏，启动时按运行时间计算一次
#[derive(Debug, Clone)]
pub struct PathMacros {
    date1: String,
}

impl PathMacros {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            date1: now.format("%Y%m%d").to_string(),
        }
    }

    pub fn now() -> Self {
        Self::new(Local::now())
    }

    /// 替换路径中的 `{date#1}`
    pub fn expand(&self, path: &str) -> String {
        path.replace("{date#1}", &self.date1)
    }
}
