// ============================================================================
// 便携归档 Command
// PostgreSQL 图层导出为 GeoPackage，工程改写为相对路径
// ============================================================================

use std::path::PathBuf;

use crate::commands::AppContext;
use crate::models::dtos::ArchiveReport;
use crate::services::archiver::{archive_project, ArchiveRequest};
use crate::services::layer_export::PostgresLayerSource;

/// 归档工程，数据源中没有凭据的图层使用当前连接参数
pub async fn archive(
    ctx: &AppContext,
    project_file: PathBuf,
    output_dir: PathBuf,
    notes: Option<String>,
) -> Result<ArchiveReport, String> {
    let target = project_file.display().to_string();
    let request = ArchiveRequest {
        project_file,
        output_dir,
        notes: notes.filter(|n| !n.trim().is_empty()),
    };
    let source = PostgresLayerSource::new(ctx.pg.config().clone());

    let result = archive_project(&request, &source).await;
    let message = match &result {
        Ok(r) => format!(
            "导出 {} 个图层，失败 {} 个，输出 {}",
            r.layers_exported.len(),
            r.layers_failed.len(),
            r.portable_project
        ),
        Err(_) => String::new(),
    };
    ctx.record("archive", &target, &result, &message);
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

    /// 测试输出目录不存在时失败并记录
    #[tokio::test]
    async fn test_archive_missing_output_dir() {
        let dir = TempDir::new().unwrap();
        let ctx = offline_context(&dir, true);
        let project = dir.path().join("city.qgs");
        std::fs::write(&project, "<qgis/>").unwrap();

        let err = archive(&ctx, project, dir.path().join("missing"), None)
            .await
            .unwrap_err();
        assert!(err.contains("输出目录不存在"));

        let records = ctx.store().unwrap().list_operations(5).unwrap();
        assert_eq!(records[0].operation, "archive");
        assert!(!records[0].success);
    }

    /// 测试没有 PostgreSQL 图层的工程不需要数据库连接
    #[tokio::test]
    async fn test_archive_without_postgres_layers() {
        let dir = TempDir::new().unwrap();
        let ctx = offline_context(&dir, true);
        let src = dir.path().join("src");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&out).unwrap();
        let project = src.join("city.qgs");
        std::fs::write(
            &project,
            r#"<qgis><projectlayers><maplayer type="vector"><id>a</id><layername>A</layername><provider>ogr</provider><datasource>./a.shp</datasource></maplayer></projectlayers></qgis>"#,
        )
        .unwrap();

        let report = archive(&ctx, project, out.clone(), Some("交付".to_string()))
            .await
            .unwrap();
        assert!(report.geopackage.is_none());
        assert!(report.layers_exported.is_empty());
        assert!(out.join("city_portable.qgs").exists());
    }
}
