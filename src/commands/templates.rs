// ============================================================================
// 模板 Commands
// 列出模板、从数据库创建模板、从模板建库、删除模板
// ============================================================================

use crate::commands::{validate_non_empty, validate_selection, AppContext};
use crate::models::dtos::TemplateReport;
use crate::utils::error::{AppError, AppResult};

/// 列出模板数据库
pub async fn list_templates(ctx: &AppContext) -> Result<Vec<String>, String> {
    Ok(ctx.pg.list_templates().await?)
}

/// 从源数据库创建模板
///
/// 源库有活动连接时必须指定 `drop_connections`；断开连接或覆盖已有模板都需要确认。
pub async fn create_template(
    ctx: &AppContext,
    source: &str,
    template: &str,
    drop_connections: bool,
) -> Result<TemplateReport, String> {
    let target = template.trim().to_string();
    let result = create_template_inner(ctx, source, template, drop_connections).await;
    let message = match &result {
        Ok(r) => format!(
            "模板已创建，清空 {} 张表，失败 {} 张",
            r.cleared_tables.len(),
            r.failed_tables.len()
        ),
        Err(_) => String::new(),
    };
    if !matches!(result, Err(AppError::Cancelled(_))) {
        ctx.record("create-template", &target, &result, &message);
    }
    Ok(result?)
}

async fn create_template_inner(
    ctx: &AppContext,
    source: &str,
    template: &str,
    drop_connections: bool,
) -> AppResult<TemplateReport> {
    let source = validate_non_empty(source, "源数据库")?;
    let template = validate_non_empty(template, "模板名称")?;
    if source == template {
        return Err(AppError::ValidationError("模板名称不能与源数据库相同".to_string()));
    }

    ctx.pg.require_create_privilege().await?;
    let databases = ctx.pg.list_databases().await?;
    validate_selection(&source, &databases, "源数据库")?;

    let connections = ctx.pg.connection_count(&source).await?;
    if connections > 0 && !drop_connections {
        return Err(AppError::ValidationError(format!(
            "源数据库 {} 有 {} 个活动连接，加 --drop-connections 断开后重试",
            source, connections
        )));
    }

    let template_exists = ctx.pg.database_exists(&template).await?;
    let mut details = Vec::new();
    if connections > 0 {
        details.push(format!("将断开 {} 上的 {} 个连接", source, connections));
    }
    if template_exists {
        details.push(format!("已有模板 {} 将被删除重建", template));
    }
    if !details.is_empty() {
        ctx.confirm(&details.join("；"))?;
    }

    ctx.pg
        .create_template(&source, &template, drop_connections)
        .await
}

/// 从模板创建新数据库
pub async fn create_database(
    ctx: &AppContext,
    template: &str,
    new_name: &str,
    comment: Option<&str>,
) -> Result<(), String> {
    let target = new_name.trim().to_string();
    let result = create_database_inner(ctx, template, new_name, comment).await;
    ctx.record("create-database", &target, &result, "数据库已创建");
    Ok(result?)
}

async fn create_database_inner(
    ctx: &AppContext,
    template: &str,
    new_name: &str,
    comment: Option<&str>,
) -> AppResult<()> {
    let template = validate_non_empty(template, "模板")?;
    let new_name = validate_non_empty(new_name, "新数据库名称")?;

    ctx.pg.require_create_privilege().await?;
    let templates = ctx.pg.list_templates().await?;
    validate_selection(&template, &templates, "模板")?;

    let comment = comment.map(str::trim).filter(|c| !c.is_empty());
    ctx.pg
        .create_database_from_template(&template, &new_name, comment)
        .await
}

/// 删除模板数据库，需要确认
pub async fn delete_template(ctx: &AppContext, template: &str) -> Result<(), String> {
    let target = template.trim().to_string();
    let result = delete_template_inner(ctx, template).await;
    if !matches!(result, Err(AppError::Cancelled(_))) {
        ctx.record("delete-template", &target, &result, "模板已删除");
    }
    Ok(result?)
}

async fn delete_template_inner(ctx: &AppContext, template: &str) -> AppResult<()> {
    let template = validate_non_empty(template, "模板")?;
    let templates = ctx.pg.list_templates().await?;
    validate_selection(&template, &templates, "模板")?;

    ctx.confirm(&format!("将永久删除模板 {}", template))?;
    ctx.pg.delete_template(&template).await
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::offline_context;
    use tempfile::TempDir;

    /// 测试空名称在连接数据库之前就被拒绝
    #[tokio::test]
    async fn test_create_template_rejects_empty_names() {
        let dir = TempDir::new().unwrap();
        let ctx = offline_context(&dir, true);

        let err = create_template(&ctx, "gis", "  ", false).await.unwrap_err();
        assert!(err.contains("模板名称不能为空"));

        let err = create_template(&ctx, "same", "same", false).await.unwrap_err();
        assert!(err.contains("不能与源数据库相同"));
    }

    /// 测试失败的操作写入历史
    #[tokio::test]
    async fn test_create_database_failure_is_recorded() {
        let dir = TempDir::new().unwrap();
        let ctx = offline_context(&dir, true);

        assert!(create_database(&ctx, "", "new_db", None).await.is_err());
        let records = ctx.store().unwrap().list_operations(5).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, "create-database");
        assert_eq!(records[0].target, "new_db");
        assert!(!records[0].success);
    }
}
