// ============================================================================
// GeoPackage 输出：用 rusqlite 直接写 OGC GeoPackage 1.2 文件
// 只实现要素表/属性表所需的核心表，不含瓦片与扩展
// ============================================================================

use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::services::sql::quote_ident;
use crate::utils::error::{AppError, AppResult};

/// "GPKG" 的 ASCII 编码
pub const GPKG_APPLICATION_ID: i32 = 0x4750_4B47;
/// GeoPackage 1.2.0
pub const GPKG_USER_VERSION: i32 = 10200;

/// 要素表主键列名
const FID_COLUMN: &str = "fid";

const WGS84_DEFINITION: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]]"#;

// ============================================================================
// 数据结构定义
// ============================================================================

/// 输出列类型（GeoPackage 允许的基本类型）
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }
}

/// 普通属性列
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

/// 几何列定义
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GeometryColumn {
    pub name: String,
    /// POINT / LINESTRING / MULTIPOLYGON / GEOMETRY …
    pub geometry_type: String,
    pub srs_id: i32,
    /// WKT 定义，未知时为 None
    pub srs_definition: Option<String>,
}

/// 一条记录：属性值与列一一对应，几何为 WKB
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub values: Vec<Value>,
    pub geometry: Option<Vec<u8>>,
}

/// 待写入的整张图层
#[derive(Clone, Debug, PartialEq)]
pub struct LayerTable {
    pub name: String,
    pub columns: Vec<Column>,
    pub geometry: Option<GeometryColumn>,
    pub features: Vec<Feature>,
}

fn gpkg_error(action: &str, err: rusqlite::Error) -> AppError {
    AppError::ArchiveError(format!("GeoPackage {}失败：{}", action, err))
}

/// WKB 包装为 GeoPackage 几何二进制：
/// `GP` + 版本 0 + flags 0x01（小端、无包络）+ srs_id(i32 LE) + WKB
pub fn encode_gpkg_geometry(srs_id: i32, wkb: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + wkb.len());
    out.extend_from_slice(b"GP");
    out.push(0);
    out.push(0x01);
    out.extend_from_slice(&srs_id.to_le_bytes());
    out.extend_from_slice(wkb);
    out
}

// ============================================================================
// GeoPackage 写入器
// ============================================================================

/// GeoPackage 写入器，封装 rusqlite 连接
pub struct GpkgWriter {
    conn: Connection,
    path: PathBuf,
}

impl GpkgWriter {
    /// 创建（或打开）GeoPackage 文件
    ///
    /// `overwrite` 为 true 时先删除已有文件。
    pub fn create(path: &Path, overwrite: bool) -> AppResult<Self> {
        if overwrite && path.exists() {
            std::fs::remove_file(path)?;
        }

        let conn = Connection::open(path).map_err(|e| gpkg_error("打开文件", e))?;
        conn.execute_batch(&format!(
            "PRAGMA application_id = {};
             PRAGMA user_version = {};",
            GPKG_APPLICATION_ID, GPKG_USER_VERSION
        ))
        .map_err(|e| gpkg_error("设置文件头", e))?;

        Self::create_core_tables(&conn)?;

        Ok(GpkgWriter {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 创建核心表并写入规范要求的三条 SRS
    fn create_core_tables(conn: &Connection) -> AppResult<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
                srs_name TEXT NOT NULL,
                srs_id INTEGER PRIMARY KEY,
                organization TEXT NOT NULL,
                organization_coordsys_id INTEGER NOT NULL,
                definition TEXT NOT NULL,
                description TEXT
            );

            CREATE TABLE IF NOT EXISTS gpkg_contents (
                table_name TEXT NOT NULL PRIMARY KEY,
                data_type TEXT NOT NULL,
                identifier TEXT UNIQUE,
                description TEXT DEFAULT '',
                last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                min_x DOUBLE,
                min_y DOUBLE,
                max_x DOUBLE,
                max_y DOUBLE,
                srs_id INTEGER,
                CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
            );

            CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                geometry_type_name TEXT NOT NULL,
                srs_id INTEGER NOT NULL,
                z TINYINT NOT NULL,
                m TINYINT NOT NULL,
                CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
                CONSTRAINT uk_gc_table_name UNIQUE (table_name),
                CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
                CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
            );
            ",
        )
        .map_err(|e| gpkg_error("建表", e))?;

        let seeds: [(&str, i32, &str, i32, &str, &str); 3] = [
            (
                "Undefined cartesian SRS",
                -1,
                "NONE",
                -1,
                "undefined",
                "undefined cartesian coordinate reference system",
            ),
            (
                "Undefined geographic SRS",
                0,
                "NONE",
                0,
                "undefined",
                "undefined geographic coordinate reference system",
            ),
            (
                "WGS 84 geodetic",
                4326,
                "EPSG",
                4326,
                WGS84_DEFINITION,
                "longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid",
            ),
        ];
        for (name, id, org, org_id, definition, description) in seeds {
            conn.execute(
                "INSERT OR IGNORE INTO gpkg_spatial_ref_sys
                 (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![name, id, org, org_id, definition, description],
            )
            .map_err(|e| gpkg_error("写入 SRS", e))?;
        }
        Ok(())
    }

    /// 确保 srs_id 已登记；未知定义记为 undefined
    pub fn ensure_srs(&self, srs_id: i32, definition: Option<&str>) -> AppResult<()> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT srs_id FROM gpkg_spatial_ref_sys WHERE srs_id = ?1",
                params![srs_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| gpkg_error("查询 SRS", e))?;
        if exists.is_some() {
            return Ok(());
        }

        self.conn
            .execute(
                "INSERT INTO gpkg_spatial_ref_sys
                 (srs_name, srs_id, organization, organization_coordsys_id, definition)
                 VALUES (?1, ?2, 'EPSG', ?2, ?3)",
                params![
                    format!("EPSG:{}", srs_id),
                    srs_id,
                    definition.unwrap_or("undefined")
                ],
            )
            .map_err(|e| gpkg_error("写入 SRS", e))?;
        log::debug!("GeoPackage 新增 SRS {}", srs_id);
        Ok(())
    }

    /// 是否已有同名表
    fn has_table(&self, name: &str) -> AppResult<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(|e| gpkg_error("查询表", e))?;
        Ok(count > 0)
    }

    /// 写入一张图层，已存在的同名表会被替换
    ///
    /// 返回写入的记录数。
    pub fn write_table(&mut self, layer: &LayerTable) -> AppResult<usize> {
        if layer.name.trim().is_empty() {
            return Err(AppError::ValidationError("图层表名不能为空".to_string()));
        }
        if self.has_table(&layer.name)? {
            log::info!("GeoPackage 中已有表 {}，将被替换", layer.name);
        }
        if let Some(geom) = &layer.geometry {
            self.ensure_srs(geom.srs_id, geom.srs_definition.as_deref())?;
        }

        // 源表自带的 fid 列与主键冲突，跳过
        let kept: Vec<usize> = layer
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                !c.name.eq_ignore_ascii_case(FID_COLUMN)
                    && layer
                        .geometry
                        .as_ref()
                        .map(|g| !g.name.eq_ignore_ascii_case(&c.name))
                        .unwrap_or(true)
            })
            .map(|(i, _)| i)
            .collect();

        let table = quote_ident(&layer.name);
        let mut column_defs = vec![format!(
            "{} INTEGER PRIMARY KEY AUTOINCREMENT",
            quote_ident(FID_COLUMN)
        )];
        let mut insert_columns = Vec::new();
        if let Some(geom) = &layer.geometry {
            column_defs.push(format!(
                "{} {}",
                quote_ident(&geom.name),
                geom.geometry_type.to_uppercase()
            ));
            insert_columns.push(quote_ident(&geom.name));
        }
        for &i in &kept {
            let column = &layer.columns[i];
            column_defs.push(format!(
                "{} {}",
                quote_ident(&column.name),
                column.column_type.sql_type()
            ));
            insert_columns.push(quote_ident(&column.name));
        }

        let tx = self
            .conn
            .transaction()
            .map_err(|e| gpkg_error("开启事务", e))?;

        tx.execute(
            "DELETE FROM gpkg_geometry_columns WHERE table_name = ?1",
            params![layer.name],
        )
        .map_err(|e| gpkg_error("清理元数据", e))?;
        tx.execute(
            "DELETE FROM gpkg_contents WHERE table_name = ?1",
            params![layer.name],
        )
        .map_err(|e| gpkg_error("清理元数据", e))?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} ({defs});",
            table = table,
            defs = column_defs.join(", ")
        ))
        .map_err(|e| gpkg_error("建表", e))?;

        if !insert_columns.is_empty() {
            let placeholders: Vec<String> =
                (1..=insert_columns.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                insert_columns.join(", "),
                placeholders.join(", ")
            );
            let mut stmt = tx.prepare(&sql).map_err(|e| gpkg_error("准备插入语句", e))?;

            for feature in &layer.features {
                let mut row: Vec<Value> = Vec::with_capacity(insert_columns.len());
                if let Some(geom) = &layer.geometry {
                    row.push(match &feature.geometry {
                        Some(wkb) => Value::Blob(encode_gpkg_geometry(geom.srs_id, wkb)),
                        None => Value::Null,
                    });
                }
                for &i in &kept {
                    row.push(feature.values.get(i).cloned().unwrap_or(Value::Null));
                }
                stmt.execute(params_from_iter(row))
                    .map_err(|e| gpkg_error("写入记录", e))?;
            }
        } else {
            for _ in &layer.features {
                tx.execute(&format!("INSERT INTO {} DEFAULT VALUES", table), [])
                    .map_err(|e| gpkg_error("写入记录", e))?;
            }
        }

        let (data_type, srs_id) = match &layer.geometry {
            Some(geom) => ("features", Some(geom.srs_id)),
            None => ("attributes", None),
        };
        tx.execute(
            "INSERT INTO gpkg_contents (table_name, data_type, identifier, srs_id)
             VALUES (?1, ?2, ?1, ?3)",
            params![layer.name, data_type, srs_id],
        )
        .map_err(|e| gpkg_error("登记图层", e))?;

        if let Some(geom) = &layer.geometry {
            tx.execute(
                "INSERT INTO gpkg_geometry_columns
                 (table_name, column_name, geometry_type_name, srs_id, z, m)
                 VALUES (?1, ?2, ?3, ?4, 0, 0)",
                params![layer.name, geom.name, geom.geometry_type.to_uppercase(), geom.srs_id],
            )
            .map_err(|e| gpkg_error("登记几何列", e))?;
        }

        tx.commit().map_err(|e| gpkg_error("提交事务", e))?;
        log::info!(
            "已写入 GeoPackage 图层 {}（{} 条记录）",
            layer.name,
            layer.features.len()
        );
        Ok(layer.features.len())
    }
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// POINT(1 2) 的小端 WKB
    fn point_wkb() -> Vec<u8> {
        let mut wkb = vec![1u8, 1, 0, 0, 0];
        wkb.extend_from_slice(&1.0f64.to_le_bytes());
        wkb.extend_from_slice(&2.0f64.to_le_bytes());
        wkb
    }

    fn roads(srs_id: i32) -> LayerTable {
        LayerTable {
            name: "roads".to_string(),
            columns: vec![
                Column {
                    name: "fid".to_string(),
                    column_type: ColumnType::Integer,
                },
                Column {
                    name: "name".to_string(),
                    column_type: ColumnType::Text,
                },
                Column {
                    name: "width".to_string(),
                    column_type: ColumnType::Real,
                },
            ],
            geometry: Some(GeometryColumn {
                name: "geom".to_string(),
                geometry_type: "point".to_string(),
                srs_id,
                srs_definition: Some("PROJCS[\"ETRS89 / UTM 33N\"]".to_string()),
            }),
            features: vec![
                Feature {
                    values: vec![
                        Value::Integer(7),
                        Value::Text("Main".to_string()),
                        Value::Real(6.5),
                    ],
                    geometry: Some(point_wkb()),
                },
                Feature {
                    values: vec![Value::Integer(8), Value::Null, Value::Real(3.0)],
                    geometry: None,
                },
            ],
        }
    }

    #[test]
    fn test_encode_gpkg_geometry_header() {
        let blob = encode_gpkg_geometry(25833, &[1, 2, 3]);
        assert_eq!(&blob[0..2], b"GP");
        assert_eq!(blob[2], 0);
        assert_eq!(blob[3], 0x01);
        assert_eq!(i32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]), 25833);
        assert_eq!(&blob[8..], &[1, 2, 3]);
    }

    #[test]
    fn test_create_sets_header_and_core_tables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.gpkg");
        let writer = GpkgWriter::create(&path, true).unwrap();

        let app_id: i32 = writer
            .conn
            .query_row("PRAGMA application_id", [], |r| r.get(0))
            .unwrap();
        let version: i32 = writer
            .conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(app_id, GPKG_APPLICATION_ID);
        assert_eq!(version, GPKG_USER_VERSION);

        let srs: Vec<i64> = writer
            .conn
            .prepare("SELECT srs_id FROM gpkg_spatial_ref_sys ORDER BY srs_id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(srs, vec![-1, 0, 4326]);
        assert!(writer.has_table("gpkg_contents").unwrap());
        assert!(writer.has_table("gpkg_geometry_columns").unwrap());
    }

    #[test]
    fn test_write_feature_table() {
        let dir = TempDir::new().unwrap();
        let mut writer = GpkgWriter::create(&dir.path().join("data.gpkg"), true).unwrap();

        let written = writer.write_table(&roads(25833)).unwrap();
        assert_eq!(written, 2);

        let conn = &writer.conn;
        let (data_type, srs): (String, i64) = conn
            .query_row(
                "SELECT data_type, srs_id FROM gpkg_contents WHERE table_name = 'roads'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(data_type, "features");
        assert_eq!(srs, 25833);

        let geom_type: String = conn
            .query_row(
                "SELECT geometry_type_name FROM gpkg_geometry_columns WHERE table_name = 'roads'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(geom_type, "POINT");

        let definition: String = conn
            .query_row(
                "SELECT definition FROM gpkg_spatial_ref_sys WHERE srs_id = 25833",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(definition.starts_with("PROJCS"));

        let (fid, name, geom): (i64, String, Vec<u8>) = conn
            .query_row(
                "SELECT fid, name, geom FROM roads ORDER BY fid LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(fid, 1);
        assert_eq!(name, "Main");
        assert_eq!(&geom[8..], point_wkb().as_slice());

        let null_geoms: i64 = conn
            .query_row("SELECT COUNT(*) FROM roads WHERE geom IS NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(null_geoms, 1);
    }

    #[test]
    fn test_write_table_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let mut writer = GpkgWriter::create(&dir.path().join("data.gpkg"), true).unwrap();
        writer.write_table(&roads(4326)).unwrap();

        let mut smaller = roads(4326);
        smaller.features.truncate(1);
        writer.write_table(&smaller).unwrap();

        let rows: i64 = writer
            .conn
            .query_row("SELECT COUNT(*) FROM roads", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        let contents: i64 = writer
            .conn
            .query_row("SELECT COUNT(*) FROM gpkg_contents", [], |r| r.get(0))
            .unwrap();
        assert_eq!(contents, 1);
    }

    #[test]
    fn test_write_attribute_table() {
        let dir = TempDir::new().unwrap();
        let mut writer = GpkgWriter::create(&dir.path().join("data.gpkg"), true).unwrap();
        let table = LayerTable {
            name: "lookup".to_string(),
            columns: vec![Column {
                name: "code".to_string(),
                column_type: ColumnType::Text,
            }],
            geometry: None,
            features: vec![Feature {
                values: vec![Value::Text("A".to_string())],
                geometry: None,
            }],
        };
        writer.write_table(&table).unwrap();

        let data_type: String = writer
            .conn
            .query_row(
                "SELECT data_type FROM gpkg_contents WHERE table_name = 'lookup'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(data_type, "attributes");
    }

    /// 测试重复写入同名表时替换旧表，不累积记录
    #[test]
    fn test_write_same_table_twice_replaces() {
        let dir = TempDir::new().unwrap();
        let mut writer = GpkgWriter::create(&dir.path().join("data.gpkg"), true).unwrap();
        writer.write_table(&roads(4326)).unwrap();
        assert!(writer.has_table("roads").unwrap());
        writer.write_table(&roads(4326)).unwrap();

        let rows: i64 = writer
            .conn
            .query_row("SELECT COUNT(*) FROM \"roads\"", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 2);
        let contents: i64 = writer
            .conn
            .query_row(
                "SELECT COUNT(*) FROM gpkg_contents WHERE table_name = 'roads'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(contents, 1);
    }

    #[test]
    fn test_create_overwrite_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.gpkg");
        {
            let mut writer = GpkgWriter::create(&path, true).unwrap();
            writer.write_table(&roads(4326)).unwrap();
        }
        // 不覆盖时保留已有图层
        let writer = GpkgWriter::create(&path, false).unwrap();
        assert!(writer.has_table("roads").unwrap());
        drop(writer);

        let writer = GpkgWriter::create(&path, true).unwrap();
        assert!(!writer.has_table("roads").unwrap());
    }
}
