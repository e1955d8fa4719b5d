// ============================================================================
// 清空表 Commands
// 列出模式与表，按计划清空模式下的表
// ============================================================================

use crate::commands::{validate_non_empty, validate_selection, AppContext};
use crate::models::dtos::{TruncateOutcome, TruncatePlan};
use crate::services::pg_admin::plan_truncation;
use crate::utils::error::{AppError, AppResult};

/// 列出数据库中的用户模式（public 在前）
pub async fn list_schemas(ctx: &AppContext, db: &str) -> Result<Vec<String>, String> {
    let db = validate_non_empty(db, "数据库")?;
    Ok(ctx.pg.list_schemas(&db).await?)
}

/// 列出模式下的表
pub async fn list_tables(ctx: &AppContext, db: &str, schema: &str) -> Result<Vec<String>, String> {
    let db = validate_non_empty(db, "数据库")?;
    let schema = validate_non_empty(schema, "模式")?;
    Ok(ctx.pg.list_schema_tables(&db, &schema).await?)
}

/// 预览清空计划，不做任何修改
pub async fn plan(
    ctx: &AppContext,
    db: &str,
    schema: &str,
    exclude_qgis_projects: bool,
) -> Result<TruncatePlan, String> {
    let tables = list_tables(ctx, db, schema).await?;
    Ok(plan_truncation(&tables, exclude_qgis_projects))
}

/// 清空模式下的表，需要确认
pub async fn truncate_tables(
    ctx: &AppContext,
    db: &str,
    schema: &str,
    exclude_qgis_projects: bool,
) -> Result<TruncateOutcome, String> {
    let target = format!("{}.{}", db.trim(), schema.trim());
    let result = truncate_inner(ctx, db, schema, exclude_qgis_projects).await;
    let message = match &result {
        Ok(o) => format!(
            "已清空 {} 张表，失败 {} 张",
            o.report.truncated.len(),
            o.report.failed.len()
        ),
        Err(_) => String::new(),
    };
    if !matches!(result, Err(AppError::Cancelled(_))) {
        ctx.record("truncate", &target, &result, &message);
    }
    Ok(result?)
}

async fn truncate_inner(
    ctx: &AppContext,
    db: &str,
    schema: &str,
    exclude_qgis_projects: bool,
) -> AppResult<TruncateOutcome> {
    let db = validate_non_empty(db, "数据库")?;
    let schema = validate_non_empty(schema, "模式")?;

    let schemas = ctx.pg.list_schemas(&db).await?;
    validate_selection(&schema, &schemas, "模式")?;

    let tables = ctx.pg.list_schema_tables(&db, &schema).await?;
    let plan = plan_truncation(&tables, exclude_qgis_projects);
    if plan.to_truncate.is_empty() {
        return Err(AppError::ValidationError(format!(
            "模式 {}.{} 中没有需要清空的表",
            db, schema
        )));
    }

    let mut details = format!(
        "将清空 {}.{} 中的 {} 张表：{}",
        db,
        schema,
        plan.to_truncate.len(),
        plan.to_truncate.join(", ")
    );
    if !plan.excluded.is_empty() {
        details.push_str(&format!("（跳过 {}）", plan.excluded.join(", ")));
    }
    ctx.confirm(&details)?;

    let report = ctx
        .pg
        .truncate_schema_tables(&db, &schema, &plan.to_truncate)
        .await?;
    Ok(TruncateOutcome {
        database: db,
        schema,
        excluded: plan.excluded,
        report,
    })
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::offline_context;
    use tempfile::TempDir;

    /// 测试缺少数据库或模式时的校验，以及失败记录
    #[tokio::test]
    async fn test_truncate_requires_db_and_schema() {
        let dir = TempDir::new().unwrap();
        let ctx = offline_context(&dir, true);

        let err = truncate_tables(&ctx, "gis", " ", true).await.unwrap_err();
        assert!(err.contains("模式不能为空"));
        assert!(list_tables(&ctx, "", "public").await.is_err());

        let records = ctx.store().unwrap().list_operations(5).unwrap();
        assert_eq!(records[0].operation, "truncate");
        assert_eq!(records[0].target, "gis.");
    }
}
