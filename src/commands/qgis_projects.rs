// ============================================================================
// 库内 QGIS 工程 Commands
// 查找 qgis_projects 表中的工程，修复图层连接参数
// ============================================================================

use std::path::Path;

use crate::commands::{validate_non_empty, AppContext};
use crate::models::dtos::{ProjectRepairReport, QgisProjectRef};
use crate::services::datasource::ConnectionOverrides;
use crate::utils::error::{AppError, AppResult};

/// 查找数据库中保存的全部工程
pub async fn find_projects(ctx: &AppContext, db: &str) -> Result<Vec<QgisProjectRef>, String> {
    let db = validate_non_empty(db, "数据库")?;
    Ok(ctx.pg.find_qgis_projects(&db).await?)
}

/// 修复工程的图层连接参数
///
/// `project` 为 `schema.table - name` 形式；只给出工程名时在库内唯一匹配。
pub async fn fix_project(
    ctx: &AppContext,
    db: &str,
    project: &str,
    overrides: &ConnectionOverrides,
    backup_dir: Option<&Path>,
) -> Result<ProjectRepairReport, String> {
    let target = format!("{} / {}", db.trim(), project.trim());
    let result = fix_project_inner(ctx, db, project, overrides, backup_dir).await;
    let message = match &result {
        Ok(r) if r.content_changed => format!("已更新 {} 个图层连接", r.layers_updated),
        Ok(_) => "内容未变化，未写回数据库".to_string(),
        Err(_) => String::new(),
    };
    ctx.record("fix-project", &target, &result, &message);
    Ok(result?)
}

async fn fix_project_inner(
    ctx: &AppContext,
    db: &str,
    project: &str,
    overrides: &ConnectionOverrides,
    backup_dir: Option<&Path>,
) -> AppResult<ProjectRepairReport> {
    let db = validate_non_empty(db, "数据库")?;
    let project = validate_non_empty(project, "工程")?;
    if overrides.is_empty() {
        return Err(AppError::ValidationError(
            "请至少指定一个要更新的连接参数".to_string(),
        ));
    }
    if let Some(dir) = backup_dir {
        if !dir.is_dir() {
            return Err(AppError::ValidationError(format!(
                "备份目录不存在：{}",
                dir.display()
            )));
        }
    }

    let projects = ctx.pg.find_qgis_projects(&db).await?;
    let selected = select_project(&projects, &project)?;
    ctx.pg
        .fix_qgis_project_layers(&db, &selected, overrides, backup_dir)
        .await
}

/// 按显示文本或工程名选择工程
fn select_project(projects: &[QgisProjectRef], text: &str) -> AppResult<QgisProjectRef> {
    if let Ok(parsed) = QgisProjectRef::parse(text) {
        if projects.contains(&parsed) {
            return Ok(parsed);
        }
    }

    let by_name: Vec<&QgisProjectRef> = projects.iter().filter(|p| p.name == text).collect();
    match by_name.as_slice() {
        [single] => Ok((*single).clone()),
        [] => Err(AppError::ValidationError(format!("未找到工程：{}", text))),
        _ => Err(AppError::ValidationError(format!(
            "工程名 {} 不唯一，请使用 \"schema.table - name\" 形式",
            text
        ))),
    }
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::offline_context;
    use tempfile::TempDir;

    fn project(schema: &str, name: &str) -> QgisProjectRef {
        QgisProjectRef {
            schema: schema.to_string(),
            table: "qgis_projects".to_string(),
            name: name.to_string(),
        }
    }

    /// 测试按显示文本和工程名选择
    #[test]
    fn test_select_project() {
        let projects = vec![
            project("public", "city"),
            project("public", "roads"),
            project("archive", "roads"),
        ];

        assert_eq!(select_project(&projects, "city").unwrap(), projects[0]);
        assert_eq!(
            select_project(&projects, "archive.qgis_projects - roads").unwrap(),
            projects[2]
        );
        assert!(select_project(&projects, "roads").is_err());
        assert!(select_project(&projects, "missing").is_err());
    }

    /// 测试没有任何连接参数时拒绝执行
    #[tokio::test]
    async fn test_fix_project_requires_overrides() {
        let dir = TempDir::new().unwrap();
        let ctx = offline_context(&dir, true);

        let err = fix_project(&ctx, "gis", "city", &ConnectionOverrides::default(), None)
            .await
            .unwrap_err();
        assert!(err.contains("请至少指定一个要更新的连接参数"));
    }

    /// 测试备份目录必须存在
    #[tokio::test]
    async fn test_fix_project_checks_backup_dir() {
        let dir = TempDir::new().unwrap();
        let ctx = offline_context(&dir, true);
        let overrides = ConnectionOverrides {
            host: Some("db.new".to_string()),
            ..Default::default()
        };

        let missing = dir.path().join("nope");
        let err = fix_project(&ctx, "gis", "city", &overrides, Some(&missing))
            .await
            .unwrap_err();
        assert!(err.contains("备份目录不存在"));
    }
}
