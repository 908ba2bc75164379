//! 文件状态管理 - 记录每个配置段中文件的修改时间，未变化的文件不再上传

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 文件状态记录
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FileState {
    pub filename: String,
    pub ts: String,
}

/// 文件变化跟踪器
///
/// 每个配置段一张表，结构为 `(filename TEXT PRIMARY KEY, ts TEXT)`。
/// 每次查询单独打开和关闭数据库，不在运行期间持有连接。
pub struct FileStateManager {
    db_path: PathBuf,
}

impl FileStateManager {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// `<state_dir>/<sid>.db`
    pub fn for_sid(state_dir: &Path, sid: &str) -> Self {
        Self::new(state_dir.join(format!("{}.db", sid)))
    }

    async fn open(&self) -> Result<SqliteConnection> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        SqliteConnectOptions::new()
            .filename(&self.db_path)
            .create_if_missing(true)
            .connect()
            .await
            .with_context(|| format!("打开状态库失败: {}", self.db_path.display()))
    }

    /// 文件是否需要上传
    ///
    /// 文件不存在时返回 false。没有记录或修改时间不同时，更新记录并返回 true。
    /// 同一路径查到多条记录时，全部删除后按已变化处理。
    pub async fn should_upload(&self, section: &str, file: &Path) -> Result<bool> {
        let metadata = match tokio::fs::metadata(file).await {
            Ok(m) if m.is_file() => m,
            _ => return Ok(false),
        };
        let current = format_mtime(metadata.modified()?.into());
        let key = file_key(file)?;
        let table = quote_ident(section);

        let mut conn = self.open().await?;
        let result = Self::check_and_record(&mut conn, &table, &key, &current).await;
        let _ = conn.close().await;
        result
    }

    async fn check_and_record(
        conn: &mut SqliteConnection,
        table: &str,
        key: &str,
        current: &str,
    ) -> Result<bool> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (filename TEXT PRIMARY KEY, ts TEXT)",
            table
        ))
        .execute(&mut *conn)
        .await?;

        let rows = sqlx::query_as::<_, FileState>(&format!(
            "SELECT filename, ts FROM {} WHERE filename = ?",
            table
        ))
        .bind(key)
        .fetch_all(&mut *conn)
        .await?;

        let stored = match rows.as_slice() {
            [] => None,
            [row] => Some(row.ts.clone()),
            _ => {
                warn!(file = key, count = rows.len(), "状态库中同一文件有多条记录，删除后重新上传");
                sqlx::query(&format!("DELETE FROM {} WHERE filename = ?", table))
                    .bind(key)
                    .execute(&mut *conn)
                    .await?;
                None
            }
        };

        if stored.as_deref() == Some(current) {
            return Ok(false);
        }

        debug!(file = key, previous = ?stored, current, "文件修改时间变化");

        let mut tx = conn.begin().await?;
        sqlx::query(&format!("DELETE FROM {} WHERE filename = ?", table))
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("INSERT INTO {} (filename, ts) VALUES (?, ?)", table))
            .bind(key)
            .bind(current)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(true)
    }

    /// 获取配置段中的所有记录
    pub async fn section_states(&self, section: &str) -> Result<Vec<FileState>> {
        let table = quote_ident(section);
        let mut conn = self.open().await?;

        let exists: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(section)
                .fetch_optional(&mut conn)
                .await?;

        let rows = match exists {
            Some(_) => {
                sqlx::query_as::<_, FileState>(&format!(
                    "SELECT filename, ts FROM {} ORDER BY filename",
                    table
                ))
                .fetch_all(&mut conn)
                .await?
            }
            None => Vec::new(),
        };

        let _ = conn.close().await;
        Ok(rows)
    }
}

/// 记录使用绝对路径作为键
fn file_key(file: &Path) -> Result<String> {
    let absolute = std::path::absolute(file)
        .with_context(|| format!("无法解析绝对路径: {}", file.display()))?;
    Ok(absolute.to_string_lossy().into_owned())
}

fn format_mtime(modified: DateTime<Utc>) -> String {
    modified.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// 配置段名作为 SQL 标识符
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
