// ============================================================================
// 便携归档：把引用 PostgreSQL 的 QGIS 工程导出为自包含目录
// ============================================================================
//
// 输出目录内容：
//   <工程名>_portable.qgs   数据源改指向 data.gpkg，凭据已清除
//   data.gpkg               全部 PostgreSQL 图层
//   archive_report.txt      归档报告
//   以及工程目录中的其他文件（样式、CSV、图片等）

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::dtos::ArchiveReport;
use crate::services::gpkg_writer::GpkgWriter;
use crate::services::layer_export::LayerSource;
use crate::services::packer::{copy_project_dir, same_dir};
use crate::services::path_scanner::{detect_absolute_paths, relativize_csv_sources};
use crate::services::project_layers::{scan_layers, LayerInfo};
use crate::services::qgz::{is_qgz_path, read_project_file};
use crate::services::source_rewriter::{rewrite_sources, RewriteOptions};
use crate::services::{ARCHIVE_GPKG_NAME, ARCHIVE_REPORT_NAME};
use crate::utils::error::{AppError, AppResult};
use crate::utils::timestamp::{display_stamp, local_now};

/// 归档请求
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ArchiveRequest {
    pub project_file: PathBuf,
    pub output_dir: PathBuf,
    /// 写入报告的用户备注
    pub notes: Option<String>,
}

fn validate_request(request: &ArchiveRequest) -> AppResult<()> {
    if !request.project_file.is_file() {
        return Err(AppError::ValidationError(format!(
            "工程文件不存在：{}",
            request.project_file.display()
        )));
    }
    let ext_ok = is_qgz_path(&request.project_file)
        || request
            .project_file
            .extension()
            .map(|e| e.eq_ignore_ascii_case("qgs"))
            .unwrap_or(false);
    if !ext_ok {
        return Err(AppError::ValidationError(
            "只支持 .qgs / .qgz 工程文件".to_string(),
        ));
    }
    if !request.output_dir.is_dir() {
        return Err(AppError::ValidationError(format!(
            "输出目录不存在：{}",
            request.output_dir.display()
        )));
    }
    Ok(())
}

/// GeoPackage 内唯一的表名，重名时追加 `_2`、`_3` …
fn unique_table_name(base: &str, used: &mut HashSet<String>) -> String {
    let mut name = base.to_string();
    let mut n = 2;
    while !used.insert(name.to_lowercase()) {
        name = format!("{}_{}", base, n);
        n += 1;
    }
    name
}

/// 便携工程引用 GeoPackage 图层的数据源
pub fn gpkg_source(table: &str) -> String {
    format!("./{}|layername={}", ARCHIVE_GPKG_NAME, table)
}

/// 归档报告正文
fn render_report(
    project_file: &Path,
    output_dir: &Path,
    exported: &[String],
    failed: &[(String, String)],
    notes: Option<&str>,
) -> String {
    let project_name = project_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut lines = vec![
        "QGIS PORTABLE PROJECT ARCHIVE REPORT".to_string(),
        "=".repeat(45),
        String::new(),
        format!("Archive Date: {}", display_stamp(local_now())),
        format!("Source Project: {}", project_name),
        format!("Source Path: {}", project_file.display()),
        format!("Output Folder: {}", output_dir.display()),
        String::new(),
        "PROCESSING DETAILS:".to_string(),
        "- PostgreSQL layers converted to GeoPackage format".to_string(),
        "- All project files and folders copied to output directory".to_string(),
        "- Project file updated to reference local data sources".to_string(),
        "- Database credentials removed for security".to_string(),
        String::new(),
        format!("EXPORTED LAYERS ({}):", exported.len()),
    ];
    lines.extend(exported.iter().map(|l| format!("- {}", l)));

    if !failed.is_empty() {
        lines.push(String::new());
        lines.push(format!("FAILED LAYERS ({}):", failed.len()));
        lines.extend(failed.iter().map(|(l, e)| format!("- {}: {}", l, e)));
    }

    if let Some(notes) = notes.map(str::trim).filter(|n| !n.is_empty()) {
        lines.push(String::new());
        lines.push("USER NOTES:".to_string());
        lines.push("-".repeat(12));
        lines.push(notes.to_string());
    }

    lines.join("\n")
}

/// 执行便携归档
pub async fn archive_project(
    request: &ArchiveRequest,
    source: &dyn LayerSource,
) -> AppResult<ArchiveReport> {
    validate_request(request)?;

    let project_file = &request.project_file;
    let output_dir = &request.output_dir;
    let project_dir = project_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let project_file_name = project_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = project_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());

    // 出错时删除本次生成的输出文件
    let mut outputs = scopeguard::guard(Vec::<PathBuf>::new(), |paths| {
        for path in paths {
            let _ = std::fs::remove_file(path);
        }
    });

    // 1. 复制工程目录
    let copied_items = if same_dir(&project_dir, output_dir) {
        log::info!("源目录与输出目录相同，跳过文件复制");
        Vec::new()
    } else {
        let copied = copy_project_dir(&project_dir, output_dir, &project_file_name)?;
        log::info!("已复制 {} 个工程附属条目", copied.len());
        copied
    };

    // 2. 读取工程
    let doc = read_project_file(project_file)?;
    let layers = scan_layers(&doc.xml)?;
    let pg_layers: Vec<&LayerInfo> = layers
        .iter()
        .filter(|l| l.is_vector() && l.is_postgres())
        .collect();
    log::info!(
        "工程共 {} 个图层，其中 PostgreSQL 矢量图层 {} 个",
        layers.len(),
        pg_layers.len()
    );

    // 3. 导出 PostgreSQL 图层
    let gpkg_path = output_dir.join(ARCHIVE_GPKG_NAME);
    let mut writer: Option<GpkgWriter> = None;
    let mut used_names = HashSet::new();
    let mut new_sources = HashMap::new();
    let mut layers_exported = Vec::new();
    let mut layers_failed = Vec::new();

    for layer in &pg_layers {
        log::info!("正在导出图层 {}", layer.name);
        let mut table = match source.fetch_layer(layer).await {
            Ok(table) => table,
            Err(e) => {
                log::warn!("图层 {} 导出失败，已跳过：{}", layer.name, e);
                layers_failed.push((layer.name.clone(), e.to_string()));
                continue;
            }
        };
        table.name = unique_table_name(&table.name, &mut used_names);

        if writer.is_none() {
            writer = Some(GpkgWriter::create(&gpkg_path, true)?);
            outputs.push(gpkg_path.clone());
        }
        if let Some(w) = writer.as_mut() {
            match w.write_table(&table) {
                Ok(_) => {
                    new_sources.insert(layer.id.clone(), gpkg_source(&table.name));
                    layers_exported.push(layer.name.clone());
                }
                Err(e) => {
                    log::warn!("图层 {} 写入 GeoPackage 失败，已跳过：{}", layer.name, e);
                    layers_failed.push((layer.name.clone(), e.to_string()));
                }
            }
        }
    }
    let gpkg_created = writer.is_some();
    drop(writer);

    // 4. 重写数据源并清除凭据
    let opts = RewriteOptions {
        strip_credentials: true,
        convert_all_provider_refs: !pg_layers.is_empty()
            && layers_exported.len() == layers.iter().filter(|l| l.is_postgres()).count(),
    };
    let rewrite = rewrite_sources(&doc.xml, &new_sources, &layers, opts)?;
    log::info!(
        "已重写 {} 个图层数据源，清除 {} 处凭据",
        rewrite.layers_rewritten,
        rewrite.credentials_removed
    );

    // 5. CSV 路径相对化
    let (xml, csv_converted) = relativize_csv_sources(&rewrite.xml, output_dir)?;

    // 6. 写出便携工程
    let portable = output_dir.join(format!("{}_portable.qgs", stem));
    std::fs::write(&portable, &xml)?;
    outputs.push(portable.clone());

    // 7. 残留绝对路径
    let remaining_paths = detect_absolute_paths(&xml)?;
    if !remaining_paths.is_empty() {
        let total: usize = remaining_paths.values().map(|p| p.len()).sum();
        log::warn!("便携工程中仍有 {} 个绝对路径需要人工复核", total);
    }

    // 8. 归档报告
    let report_path = output_dir.join(ARCHIVE_REPORT_NAME);
    std::fs::write(
        &report_path,
        render_report(
            project_file,
            output_dir,
            &layers_exported,
            &layers_failed,
            request.notes.as_deref(),
        ),
    )?;

    // 全部成功，保留输出
    let _ = scopeguard::ScopeGuard::into_inner(outputs);

    let geopackage = gpkg_created.then(|| gpkg_path.to_string_lossy().to_string());

    log::info!("便携工程已生成：{}", portable.display());
    Ok(ArchiveReport {
        portable_project: portable.to_string_lossy().to_string(),
        geopackage,
        copied_items,
        layers_exported,
        layers_failed,
        credentials_removed: rewrite.credentials_removed,
        csv_converted,
        remaining_paths,
        report_path: report_path.to_string_lossy().to_string(),
    })
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gpkg_writer::{Column, ColumnType, Feature, GeometryColumn, LayerTable};
    use crate::services::project_layers::tests::TWO_LAYER_PROJECT;
    use async_trait::async_trait;
    use rusqlite::types::Value;
    use tempfile::TempDir;

    /// 内存中的图层来源：只认识 roads_1
    struct FakeSource;

    #[async_trait]
    impl LayerSource for FakeSource {
        async fn fetch_layer(&self, layer: &LayerInfo) -> AppResult<LayerTable> {
            if layer.id != "roads_1" {
                return Err(AppError::ConnectionError("no such server".to_string()));
            }
            let mut wkb = vec![1u8, 1, 0, 0, 0];
            wkb.extend_from_slice(&3.0f64.to_le_bytes());
            wkb.extend_from_slice(&4.0f64.to_le_bytes());
            Ok(LayerTable {
                name: layer.export_name(),
                columns: vec![Column {
                    name: "name".to_string(),
                    column_type: ColumnType::Text,
                }],
                geometry: Some(GeometryColumn {
                    name: "geom".to_string(),
                    geometry_type: "POINT".to_string(),
                    srs_id: 4326,
                    srs_definition: None,
                }),
                features: vec![Feature {
                    values: vec![Value::Text("Main".to_string())],
                    geometry: Some(wkb),
                }],
            })
        }
    }

    fn setup() -> (TempDir, TempDir, PathBuf) {
        let project_dir = TempDir::new().unwrap();
        let output_dir = TempDir::new().unwrap();
        let project = project_dir.path().join("city.qgs");
        std::fs::write(&project, TWO_LAYER_PROJECT).unwrap();
        std::fs::write(project_dir.path().join("rivers.shp"), b"shp").unwrap();
        (project_dir, output_dir, project)
    }

    #[tokio::test]
    async fn test_archive_project_end_to_end() {
        let (_project_dir, output_dir, project) = setup();
        let request = ArchiveRequest {
            project_file: project,
            output_dir: output_dir.path().to_path_buf(),
            notes: Some("handover to client".to_string()),
        };

        let report = archive_project(&request, &FakeSource).await.unwrap();

        assert_eq!(report.copied_items, vec!["rivers.shp"]);
        assert_eq!(report.layers_exported, vec!["Main roads"]);
        assert!(report.layers_failed.is_empty());
        assert!(report.geopackage.is_some());

        let portable = std::fs::read_to_string(&report.portable_project).unwrap();
        assert!(report.portable_project.ends_with("city_portable.qgs"));
        assert!(portable.contains("<datasource>./data.gpkg|layername=Main_roads</datasource>"));
        assert!(portable.contains("<datasource>./rivers.shp</datasource>"));
        assert!(!portable.contains("password"));
        assert!(!portable.contains("admin"));

        let gpkg = rusqlite::Connection::open(output_dir.path().join("data.gpkg")).unwrap();
        let rows: i64 = gpkg
            .query_row("SELECT COUNT(*) FROM \"Main_roads\"", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);

        let text = std::fs::read_to_string(&report.report_path).unwrap();
        assert!(text.starts_with("QGIS PORTABLE PROJECT ARCHIVE REPORT"));
        assert!(text.contains("Source Project: city"));
        assert!(text.contains("- Main roads"));
        assert!(text.contains("handover to client"));
    }

    #[tokio::test]
    async fn test_failed_layer_is_skipped_and_credentials_still_removed() {
        let (project_dir, output_dir, _) = setup();
        let xml = TWO_LAYER_PROJECT.replace("roads_1", "roads_9");
        let project = project_dir.path().join("broken.qgs");
        std::fs::write(&project, xml).unwrap();

        let request = ArchiveRequest {
            project_file: project,
            output_dir: output_dir.path().to_path_buf(),
            notes: None,
        };
        let report = archive_project(&request, &FakeSource).await.unwrap();

        assert!(report.layers_exported.is_empty());
        assert_eq!(report.layers_failed.len(), 1);
        assert!(report.geopackage.is_none());
        // 图层树 source 与 datasource 各含 user / password
        assert_eq!(report.credentials_removed, 4);
        let portable = std::fs::read_to_string(&report.portable_project).unwrap();
        assert!(!portable.contains("password"));
        // 未导出的图层保留 PostgreSQL 数据源
        assert!(portable.contains("dbname='gis'"));
    }

    /// 测试 PostgreSQL 栅格图层不参与导出，保留原数据源
    #[tokio::test]
    async fn test_postgres_raster_layer_not_exported() {
        let (project_dir, output_dir, _) = setup();
        let raster = r#"    <maplayer type="raster">
      <id>dem_3</id>
      <datasource>dbname='gis' host=db table=&quot;public&quot;.&quot;dem&quot; (rast)</datasource>
      <layername>DEM</layername>
      <provider>postgres</provider>
    </maplayer>
  </projectlayers>"#;
        let xml = TWO_LAYER_PROJECT.replace("  </projectlayers>", raster);
        let project = project_dir.path().join("terrain.qgs");
        std::fs::write(&project, xml).unwrap();

        let request = ArchiveRequest {
            project_file: project,
            output_dir: output_dir.path().to_path_buf(),
            notes: None,
        };
        let report = archive_project(&request, &FakeSource).await.unwrap();

        assert_eq!(report.layers_exported, vec!["Main roads"]);
        assert!(report.layers_failed.is_empty());
        let portable = std::fs::read_to_string(&report.portable_project).unwrap();
        assert!(portable.contains("table=&quot;public&quot;.&quot;dem&quot; (rast)"));
        assert!(portable.contains("<provider>postgres</provider>"));
    }

    #[tokio::test]
    async fn test_archive_in_place_skips_copy() {
        let (project_dir, _output_dir, project) = setup();
        let request = ArchiveRequest {
            project_file: project,
            output_dir: project_dir.path().to_path_buf(),
            notes: None,
        };
        let report = archive_project(&request, &FakeSource).await.unwrap();
        assert!(report.copied_items.is_empty());
        assert!(project_dir.path().join("city_portable.qgs").exists());
    }

    #[tokio::test]
    async fn test_archive_validates_inputs() {
        let (_project_dir, output_dir, project) = setup();
        let missing_output = ArchiveRequest {
            project_file: project.clone(),
            output_dir: output_dir.path().join("nope"),
            notes: None,
        };
        assert!(matches!(
            archive_project(&missing_output, &FakeSource).await,
            Err(AppError::ValidationError(_))
        ));

        let missing_project = ArchiveRequest {
            project_file: output_dir.path().join("nope.qgs"),
            output_dir: output_dir.path().to_path_buf(),
            notes: None,
        };
        assert!(archive_project(&missing_project, &FakeSource).await.is_err());
    }

    #[test]
    fn test_unique_table_name() {
        let mut used = HashSet::new();
        assert_eq!(unique_table_name("roads", &mut used), "roads");
        assert_eq!(unique_table_name("Roads", &mut used), "Roads_2");
        assert_eq!(unique_table_name("roads", &mut used), "roads_3");
    }
}
