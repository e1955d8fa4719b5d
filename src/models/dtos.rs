// ============================================================================
// 数据传输对象（DTO）定义
// 业务层与命令层之间的数据结构，仅包含字段定义和序列化派生
// ⛔ 禁止：包含复杂的业务逻辑方法
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::error::{AppError, AppResult};

/// 当前登录用户的权限，由 `check_user_privileges` 返回
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserPrivileges {
    pub is_superuser: bool,
    pub can_create_db: bool,
}

/// 数据库详情，由 `database_info` 返回
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub owner: String,
    pub encoding: String,
    /// pg_size_pretty 格式的大小，如 "12 MB"
    pub size_pretty: String,
    pub connection_count: i64,
    pub comment: Option<String>,
    pub is_template: bool,
}

/// 数据库上的一个活动连接
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ActiveConnection {
    pub pid: i32,
    pub username: Option<String>,
    pub client_addr: Option<String>,
    pub client_hostname: Option<String>,
    pub client_port: Option<i32>,
    /// 文本形式的连接建立时间
    pub backend_start: Option<String>,
    pub state: Option<String>,
    pub query: Option<String>,
}

/// 创建模板的结果
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TemplateReport {
    pub template: String,
    /// 已清空的表（schema.table）
    pub cleared_tables: Vec<String>,
    /// 清空失败的表，失败不影响模板创建
    pub failed_tables: Vec<String>,
}

/// 清空计划：哪些表会被清空、哪些被排除
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TruncatePlan {
    pub to_truncate: Vec<String>,
    pub excluded: Vec<String>,
}

/// 清空执行结果
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TruncateReport {
    pub truncated: Vec<String>,
    /// (表名, 错误信息)
    pub failed: Vec<(String, String)>,
}

/// 数据库中保存的一个 QGIS 工程
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct QgisProjectRef {
    pub schema: String,
    pub table: String,
    pub name: String,
}

impl QgisProjectRef {
    /// 解析 `schema.table - name` 形式的显示文本
    pub fn parse(text: &str) -> AppResult<Self> {
        let invalid = || {
            AppError::ValidationError(format!(
                "工程标识格式应为 \"schema.table - name\"：{}",
                text
            ))
        };
        let (qualified, name) = text.split_once(" - ").ok_or_else(invalid)?;
        let (schema, table) = qualified.split_once('.').ok_or_else(invalid)?;
        let (schema, table, name) = (schema.trim(), table.trim(), name.trim());
        if schema.is_empty() || table.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(QgisProjectRef {
            schema: schema.to_string(),
            table: table.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for QgisProjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} - {}", self.schema, self.table, self.name)
    }
}

/// 修复数据库内工程的结果
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProjectRepairReport {
    pub project: String,
    pub layers_updated: usize,
    /// 内容未变化时不回写数据库
    pub content_changed: bool,
    pub backup_path: Option<String>,
}

/// 便携归档结果
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveReport {
    pub portable_project: String,
    /// 没有 PostgreSQL 图层时为 None
    pub geopackage: Option<String>,
    pub copied_items: Vec<String>,
    pub layers_exported: Vec<String>,
    /// (图层名, 失败原因)
    pub layers_failed: Vec<(String, String)>,
    pub credentials_removed: usize,
    pub csv_converted: usize,
    /// 需要人工复核的绝对路径（分类 → 路径）
    pub remaining_paths: BTreeMap<String, BTreeSet<String>>,
    pub report_path: String,
}

/// 本地操作历史中的一条记录
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OperationRecord {
    pub id: i64,
    pub operation: String,
    pub target: String,
    pub success: bool,
    pub message: String,
    pub created_at: String,
}

/// 已保存的连接参数（不含密码）
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
}

/// 连接测试结果
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub server_version: String,
    pub privileges: UserPrivileges,
}

/// 数据库列表中的一项
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DatabaseSummary {
    pub name: String,
    pub comment: Option<String>,
}

/// 清空命令的完整结果
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TruncateOutcome {
    pub database: String,
    pub schema: String,
    /// 按排除规则跳过的表
    pub excluded: Vec<String>,
    pub report: TruncateReport,
}

// ============================================================================
// 单元测试
// ============================================================================
