// ============================================================================
// 业务层：纯 Rust 核心逻辑
// ✅ 特点：不依赖命令行解析，方便写 #[test]
// ⛔ 禁止：直接打印到终端、直接返回面向用户的字符串错误
// ============================================================================

pub mod archiver;
pub mod credential_cleaner;
pub mod datasource;
pub mod gpkg_writer;
pub mod layer_export;
pub mod packer;
pub mod path_scanner;
pub mod pg_admin;
pub mod project_layers;
pub mod project_repair;
pub mod qgz;
pub mod source_rewriter;
pub mod sql;

// ============================================================================
// 常量定义
// ============================================================================

/// PostgreSQL 内置数据库，禁止删除、不参与列表展示
pub const SYSTEM_DATABASES: &[&str] = &["postgres", "template0", "template1"];

/// 系统 schema，列举用户表/用户 schema 时跳过
pub const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "pg_catalog", "pg_toast"];

/// QGIS 在数据库中保存工程所用的表名
pub const QGIS_PROJECTS_TABLE: &str = "qgis_projects";

/// 便携归档输出的 GeoPackage 文件名（与 .qgs 同级，使用相对路径引用）
pub const ARCHIVE_GPKG_NAME: &str = "data.gpkg";

/// 便携归档报告文件名
pub const ARCHIVE_REPORT_NAME: &str = "archive_report.txt";

/// 替换 PostgreSQL 数据源后使用的 QGIS provider
pub const OGR_PROVIDER: &str = "ogr";
