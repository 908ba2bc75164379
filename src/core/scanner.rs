use crate::error::TransferError;
use std::path::PathBuf;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 扫描到的本地文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub path: PathBuf,
}

/// 源目录扫描器
///
/// 只看一层，不进入子目录；目录本身被跳过，结果按文件名排序。
pub struct FileScanner {
    root: PathBuf,
}

impl FileScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn scan(&self) -> Result<Vec<LocalFile>, TransferError> {
        let metadata = std::fs::metadata(&self.root).map_err(|source| TransferError::LocalIo {
            op: "list",
            path: self.root.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(TransferError::LocalIo {
                op: "list",
                path: self.root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "不是目录"),
            });
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("读取目录项失败: {}", e);
                    continue;
                }
            };

            // 符号链接按目标类型判断
            let is_dir = if entry.file_type().is_symlink() {
                entry.path().is_dir()
            } else {
                entry.file_type().is_dir()
            };
            if is_dir {
                continue;
            }

            files.push(LocalFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path().to_path_buf(),
            });
        }

        debug!("扫描 {} 完成: {} 个文件", self.root.display(), files.len());
        Ok(files)
    }
}
