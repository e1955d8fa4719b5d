// ============================================================================
// 命令层：命令行与业务层之间的薄接口
// 负责：
// 1. 校验输入（非空字段、选择项、建库权限）
// 2. 破坏性操作的确认（--yes）
// 3. 调用 services
// 4. 把修改类操作写入本地操作历史
// 5. 返回 Result<Dto, String>
// ⛔ 禁止：包含业务逻辑
// ============================================================================

pub mod archive;
pub mod clean_qgs;
pub mod connection;
pub mod databases;
pub mod history;
pub mod qgis_projects;
pub mod templates;
pub mod truncate;

use std::sync::{Mutex, MutexGuard};

use crate::database::Database;
use crate::services::pg_admin::{PgAdmin, PgConfig};
use crate::utils::error::{AppError, AppResult};

/// 命令执行上下文
pub struct AppContext {
    pub db: Mutex<Database>,
    pub pg: PgAdmin,
    /// 已通过 --yes 确认破坏性操作
    pub assume_yes: bool,
}

impl AppContext {
    pub fn new(db: Database, config: PgConfig, assume_yes: bool) -> Self {
        AppContext {
            db: Mutex::new(db),
            pg: PgAdmin::new(config),
            assume_yes,
        }
    }

    /// 获取本地存储
    pub fn store(&self) -> AppResult<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| AppError::StoreError("数据库访问失败：无法获取锁".to_string()))
    }

    /// 记录一次修改类操作；写历史失败只记日志，不影响命令结果
    pub fn record<T>(
        &self,
        operation: &str,
        target: &str,
        result: &AppResult<T>,
        ok_message: &str,
    ) {
        let (success, message) = match result {
            Ok(_) => (true, ok_message.to_string()),
            Err(e) => (false, e.to_string()),
        };
        if !success {
            log::error!("{} {} 失败：{}", operation, target, message);
        }

        let recorded = self
            .store()
            .and_then(|db| db.record_operation(operation, target, success, &message));
        if let Err(e) = recorded {
            log::warn!("写入操作历史失败：{}", e);
        }
    }

    /// 未确认时返回 Cancelled，携带确认对话框应展示的内容
    pub fn confirm(&self, details: &str) -> AppResult<()> {
        if self.assume_yes {
            Ok(())
        } else {
            Err(AppError::Cancelled(format!("{}（加 --yes 确认执行）", details)))
        }
    }
}

/// 字段非空校验
pub fn validate_non_empty(value: &str, field: &str) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::ValidationError(format!("{}不能为空", field)));
    }
    Ok(trimmed.to_string())
}

/// 选择项校验：值必须出现在候选列表中
pub fn validate_selection(value: &str, choices: &[String], what: &str) -> AppResult<()> {
    if choices.iter().any(|c| c == value) {
        Ok(())
    } else {
        Err(AppError::ValidationError(format!("请选择有效的{}：{}", what, value)))
    }
}

// ============================================================================
// 单元测试
// ============================================================================
