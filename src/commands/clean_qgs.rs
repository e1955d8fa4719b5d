// ============================================================================
// 工程文件凭据清理 Commands
// 预览与清理 .qgs / .qgz 中的用户名和密码
// ============================================================================

use std::path::Path;

use crate::commands::AppContext;
use crate::services::credential_cleaner::{
    clean_project_file, preview_project_file, CleanOptions, CleanOutcome, DatasourceChange,
};
use crate::utils::error::{AppError, AppResult};

fn validate_options(opts: CleanOptions) -> AppResult<()> {
    if !opts.remove_user && !opts.remove_password {
        return Err(AppError::ValidationError(
            "至少需要选择一种要清理的凭据".to_string(),
        ));
    }
    Ok(())
}

/// 预览会被清理的数据源
pub fn preview(path: &Path, opts: CleanOptions) -> Result<Vec<DatasourceChange>, String> {
    validate_options(opts)?;
    if !path.is_file() {
        return Err(AppError::ValidationError("所选文件不存在".to_string()).into());
    }
    Ok(preview_project_file(path, opts)?)
}

/// 清理并写出 `_cleaned` 副本，原文件不变
pub fn clean(ctx: &AppContext, path: &Path, opts: CleanOptions) -> Result<CleanOutcome, String> {
    let result = validate_options(opts).and_then(|_| clean_project_file(path, opts));
    let message = match &result {
        Ok(o) => match &o.output_path {
            Some(out) => format!("已清理 {} 个数据源，输出到 {}", o.changes, out),
            None => "未发现需要清理的凭据".to_string(),
        },
        Err(_) => String::new(),
    };
    ctx.record("clean-qgs", &path.display().to_string(), &result, &message);
    Ok(result?)
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::offline_context;
    use tempfile::TempDir;

    const PROJECT: &str = r#"<qgis><maplayer><datasource>dbname='gis' host=db user='admin' password='secret' table="public"."roads"</datasource></maplayer></qgis>"#;

    /// 测试预览后清理，输出副本且写入历史
    #[test]
    fn test_preview_then_clean() {
        let dir = TempDir::new().unwrap();
        let ctx = offline_context(&dir, false);
        let path = dir.path().join("city.qgs");
        std::fs::write(&path, PROJECT).unwrap();

        let changes = preview(&path, CleanOptions::default()).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].cleaned.contains("secret"));

        let outcome = clean(&ctx, &path, CleanOptions::default()).unwrap();
        assert_eq!(outcome.changes, 1);
        let output = outcome.output_path.unwrap();
        assert!(output.ends_with("city_cleaned.qgs"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), PROJECT);

        let records = ctx.store().unwrap().list_operations(5).unwrap();
        assert_eq!(records[0].operation, "clean-qgs");
        assert!(records[0].success);
    }

    /// 测试两个选项都关闭时拒绝执行
    #[test]
    fn test_requires_one_option() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.qgs");
        std::fs::write(&path, PROJECT).unwrap();

        let opts = CleanOptions {
            remove_user: false,
            remove_password: false,
        };
        assert!(preview(&path, opts).unwrap_err().contains("至少需要选择一种"));
    }

    #[test]
    fn test_preview_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = preview(&dir.path().join("missing.qgs"), CleanOptions::default()).unwrap_err();
        assert!(err.contains("所选文件不存在"));
    }
}
