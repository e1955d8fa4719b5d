// ============================================================================
// 数据库模块：本地 SQLite 持久化层
// 保存连接设置与操作历史，使用 rusqlite 直接操作 SQLite，不引入 ORM
// ============================================================================

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::models::dtos::{ConnectionProfile, OperationRecord};
use crate::utils::error::{AppError, AppResult};

/// 本地数据库文件名
pub const DB_FILE_NAME: &str = "kgr_toolbox.db";

/// 连接设置使用的键
pub const KEY_HOST: &str = "connection.host";
pub const KEY_PORT: &str = "connection.port";
pub const KEY_USER: &str = "connection.user";

fn store_error(action: &str) -> impl Fn(rusqlite::Error) -> AppError + '_ {
    move |e| AppError::StoreError(format!("{}：{}", action, e))
}

// ============================================================================
// 数据库管理器
// ============================================================================

/// 数据库管理器，封装 rusqlite 连接
pub struct Database {
    /// SQLite 数据库连接
    conn: Connection,
}

impl Database {
    /// 初始化数据库：在指定目录创建数据库文件并建表
    ///
    /// # 参数
    /// - `data_dir`: 数据目录路径（`--data-dir` 或平台默认数据目录）
    ///
    /// # 返回
    /// - `Ok(Database)`: 初始化成功
    /// - `Err(AppError::StoreError)`: 目录或数据库文件无法创建
    pub fn init(data_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            AppError::StoreError(format!(
                "数据库初始化失败：无法创建数据目录 {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        let db_path = data_dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path).map_err(|e| {
            AppError::StoreError(format!(
                "数据库初始化失败：无法打开数据库文件 {}: {}",
                db_path.display(),
                e
            ))
        })?;

        Self::create_tables(&conn)?;

        Ok(Database { conn })
    }

    /// 创建所有数据库表（如果不存在）
    fn create_tables(conn: &Connection) -> AppResult<()> {
        conn.execute_batch(
            "
            -- 设置表（键值对）
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- 操作历史表
            CREATE TABLE IF NOT EXISTS operation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL,
                target TEXT NOT NULL DEFAULT '',
                success INTEGER NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            );
            ",
        )
        .map_err(store_error("数据库初始化失败：建表出错"))?;

        Ok(())
    }

    /// 获取数据库连接的引用
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // ========================================================================
    // 设置
    // ========================================================================

    /// 保存单个设置项（INSERT OR REPLACE 实现 upsert）
    pub fn save_setting(&self, key: &str, value: &str) -> AppResult<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(store_error("保存设置失败"))?;
        Ok(())
    }

    /// 读取单个设置项，不存在时返回 None
    pub fn get_setting(&self, key: &str) -> AppResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_error("读取设置失败"))
    }

    /// 上次成功连接的 host / port / user（不含密码）
    pub fn get_connection_profile(&self) -> AppResult<ConnectionProfile> {
        Ok(ConnectionProfile {
            host: self.get_setting(KEY_HOST)?,
            port: self.get_setting(KEY_PORT)?.and_then(|p| p.parse().ok()),
            user: self.get_setting(KEY_USER)?,
        })
    }

    /// 保存连接参数，密码永不落盘
    pub fn save_connection_profile(&self, host: &str, port: u16, user: &str) -> AppResult<()> {
        self.save_setting(KEY_HOST, host)?;
        self.save_setting(KEY_PORT, &port.to_string())?;
        self.save_setting(KEY_USER, user)?;
        Ok(())
    }

    // ========================================================================
    // 操作历史
    // ========================================================================

    /// 记录一次操作结果
    ///
    /// # 参数
    /// - `operation`: 操作名（如 `create-template`）
    /// - `target`: 操作对象（数据库名、工程名、文件路径）
    /// - `success`: 是否成功
    /// - `message`: 结果或错误信息
    pub fn record_operation(
        &self,
        operation: &str,
        target: &str,
        success: bool,
        message: &str,
    ) -> AppResult<OperationRecord> {
        self.conn
            .execute(
                "INSERT INTO operation_history (operation, target, success, message)
                 VALUES (?1, ?2, ?3, ?4)",
                params![operation, target, success, message],
            )
            .map_err(store_error("记录操作失败"))?;

        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, operation, target, success, message, created_at
                 FROM operation_history WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .map_err(store_error("记录操作失败：无法读取新记录"))
    }

    /// 最近的操作记录（新的在前）
    pub fn list_operations(&self, limit: usize) -> AppResult<Vec<OperationRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, operation, target, success, message, created_at
                 FROM operation_history ORDER BY id DESC LIMIT ?1",
            )
            .map_err(store_error("查询操作历史失败"))?;

        let records = stmt
            .query_map(params![limit as i64], row_to_record)
            .map_err(store_error("查询操作历史失败"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error("查询操作历史失败"))?;
        Ok(records)
    }

    /// 清空操作历史，返回删除条数
    pub fn clear_operations(&self) -> AppResult<usize> {
        self.conn
            .execute("DELETE FROM operation_history", [])
            .map_err(store_error("清空操作历史失败"))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperationRecord> {
    Ok(OperationRecord {
        id: row.get(0)?,
        operation: row.get(1)?,
        target: row.get(2)?,
        success: row.get(3)?,
        message: row.get(4)?,
        created_at: row.get(5)?,
    })
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    /// 测试数据库初始化：创建文件和所有表
    #[test]
    fn test_database_init_creates_file_and_tables() {
        let dir = TempDir::new().unwrap();
        let db = Database::init(dir.path()).unwrap();

        assert!(dir.path().join(DB_FILE_NAME).exists());

        let table_names: Vec<String> = db
            .conn()
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(table_names, vec!["operation_history", "settings"]);
    }

    /// 测试重复初始化不会丢数据
    #[test]
    fn test_database_init_idempotent() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::init(dir.path()).unwrap();
            db.save_setting("k", "v").unwrap();
        }
        let db = Database::init(dir.path()).unwrap();
        assert_eq!(db.get_setting("k").unwrap().as_deref(), Some("v"));
    }

    /// 测试初始化时自动创建多级目录
    #[test]
    fn test_database_init_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        Database::init(&nested).unwrap();
        assert!(nested.join(DB_FILE_NAME).exists());
    }

    /// 测试设置 upsert 与缺失键
    #[test]
    fn test_settings_upsert() {
        let dir = TempDir::new().unwrap();
        let db = Database::init(dir.path()).unwrap();

        assert_eq!(db.get_setting("missing").unwrap(), None);
        db.save_setting("k", "1").unwrap();
        db.save_setting("k", "2").unwrap();
        assert_eq!(db.get_setting("k").unwrap().as_deref(), Some("2"));
    }

    /// 测试连接参数读写，且不保存密码
    #[test]
    fn test_connection_profile() {
        let dir = TempDir::new().unwrap();
        let db = Database::init(dir.path()).unwrap();

        assert_eq!(db.get_connection_profile().unwrap(), ConnectionProfile::default());
        db.save_connection_profile("db.local", 6543, "admin").unwrap();

        let profile = db.get_connection_profile().unwrap();
        assert_eq!(profile.host.as_deref(), Some("db.local"));
        assert_eq!(profile.port, Some(6543));
        assert_eq!(profile.user.as_deref(), Some("admin"));

        let keys: Vec<String> = db
            .conn()
            .prepare("SELECT key FROM settings")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(keys.iter().all(|k| !k.contains("password")));
    }

    /// 测试操作历史：新记录在前、limit 生效、清空
    #[test]
    fn test_operation_history() {
        let dir = TempDir::new().unwrap();
        let db = Database::init(dir.path()).unwrap();

        let first = db.record_operation("create-template", "tpl_a", true, "ok").unwrap();
        assert_eq!(first.operation, "create-template");
        assert!(first.success);
        assert!(!first.created_at.is_empty());

        db.record_operation("delete-database", "old", false, "in use").unwrap();
        db.record_operation("truncate", "public", true, "3 tables").unwrap();

        let recent = db.list_operations(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].operation, "truncate");
        assert_eq!(recent[1].operation, "delete-database");
        assert!(!recent[1].success);

        assert_eq!(db.clear_operations().unwrap(), 3);
        assert!(db.list_operations(10).unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// 测试任意键值保存后都能原样读回
        #[test]
        fn prop_setting_roundtrip(key in "[a-z.]{1,20}", value in "\\PC{0,40}") {
            let dir = TempDir::new().unwrap();
            let db = Database::init(dir.path()).unwrap();
            db.save_setting(&key, &value).unwrap();
            prop_assert_eq!(db.get_setting(&key).unwrap(), Some(value));
        }
    }
}
