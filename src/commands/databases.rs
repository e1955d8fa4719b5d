// ============================================================================
// 数据库 Commands
// 列表（含注释）、详情、活动连接、删除
// ============================================================================

use crate::commands::{validate_non_empty, AppContext};
use crate::models::dtos::{ActiveConnection, DatabaseInfo, DatabaseSummary};
use crate::utils::error::{AppError, AppResult};

/// 列出非模板数据库及其注释
pub async fn list_databases(ctx: &AppContext) -> Result<Vec<DatabaseSummary>, String> {
    let databases = ctx.pg.list_databases_with_comments().await?;
    Ok(databases
        .into_iter()
        .map(|(name, comment)| DatabaseSummary { name, comment })
        .collect())
}

/// 数据库详情
pub async fn database_info(ctx: &AppContext, name: &str) -> Result<DatabaseInfo, String> {
    let name = validate_non_empty(name, "数据库")?;
    Ok(ctx.pg.database_info(&name).await?)
}

/// 数据库上的活动连接
pub async fn active_connections(
    ctx: &AppContext,
    name: &str,
) -> Result<Vec<ActiveConnection>, String> {
    let name = validate_non_empty(name, "数据库")?;
    Ok(ctx.pg.active_connections(&name).await?)
}

/// 删除数据库，需要确认；`force` 时先断开其他连接
pub async fn delete_database(ctx: &AppContext, name: &str, force: bool) -> Result<(), String> {
    let target = name.trim().to_string();
    let result = delete_database_inner(ctx, name, force).await;
    if !matches!(result, Err(AppError::Cancelled(_))) {
        ctx.record("delete-database", &target, &result, "数据库已删除");
    }
    Ok(result?)
}

async fn delete_database_inner(ctx: &AppContext, name: &str, force: bool) -> AppResult<()> {
    let name = validate_non_empty(name, "数据库")?;
    if !ctx.pg.database_exists(&name).await? {
        return Err(AppError::ValidationError(format!("数据库 {} 不存在", name)));
    }

    let connections = ctx.pg.connection_count(&name).await?;
    let mut details = format!("将永久删除数据库 {}", name);
    if connections > 0 {
        if !force {
            return Err(AppError::ValidationError(format!(
                "数据库 {} 有 {} 个活动连接，加 --force 断开后重试",
                name, connections
            )));
        }
        details.push_str(&format!("，并断开 {} 个连接", connections));
    }
    ctx.confirm(&details)?;

    ctx.pg.delete_database(&name, force).await
}

// ============================================================================
// 单元测试
// ============================================================================
