// ============================================================================
// 图层导出：从 PostgreSQL 读出整张图层，交给 GpkgWriter 写入
// ============================================================================

use async_trait::async_trait;
use rusqlite::types::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::services::datasource::DataSource;
use crate::services::gpkg_writer::{Column, ColumnType, Feature, GeometryColumn, LayerTable};
use crate::services::pg_admin::PgConfig;
use crate::services::project_layers::LayerInfo;
use crate::services::sql::quote_ident;
use crate::utils::error::{AppError, AppResult};

/// 查询结果中几何列的别名
const GEOMETRY_ALIAS: &str = "__geom_wkb";

/// 图层数据来源，归档流程只依赖该 trait
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// 读出图层的全部记录
    async fn fetch_layer(&self, layer: &LayerInfo) -> AppResult<LayerTable>;
}

// ============================================================================
// 列类型映射
// ============================================================================

/// 按 information_schema 的 data_type / udt_name 归类
pub fn classify_column(data_type: &str, udt_name: &str) -> ColumnType {
    match data_type.to_lowercase().as_str() {
        "smallint" | "integer" | "bigint" | "boolean" => ColumnType::Integer,
        "real" | "double precision" | "numeric" => ColumnType::Real,
        "bytea" => ColumnType::Blob,
        "user-defined" if matches!(udt_name, "geometry" | "geography") => ColumnType::Blob,
        _ => ColumnType::Text,
    }
}

/// 列在 SELECT 中的表达式，保证能按 ColumnType 解码
pub fn select_expression(column: &str, data_type: &str, column_type: ColumnType) -> String {
    let ident = quote_ident(column);
    match column_type {
        ColumnType::Integer if data_type.eq_ignore_ascii_case("boolean") => {
            format!("{}::int::bigint", ident)
        }
        ColumnType::Integer => format!("{}::bigint", ident),
        ColumnType::Real => format!("{}::float8", ident),
        ColumnType::Blob if data_type.eq_ignore_ascii_case("bytea") => ident,
        ColumnType::Blob => format!("ST_AsBinary({})", ident),
        ColumnType::Text => format!("{}::text", ident),
    }
}

fn decode_value(row: &PgRow, index: usize, column_type: ColumnType) -> AppResult<Value> {
    let value = match column_type {
        ColumnType::Integer => row
            .try_get::<Option<i64>, _>(index)?
            .map(Value::Integer),
        ColumnType::Real => row.try_get::<Option<f64>, _>(index)?.map(Value::Real),
        ColumnType::Text => row.try_get::<Option<String>, _>(index)?.map(Value::Text),
        ColumnType::Blob => row.try_get::<Option<Vec<u8>>, _>(index)?.map(Value::Blob),
    };
    Ok(value.unwrap_or(Value::Null))
}

// ============================================================================
// PostgreSQL 实现
// ============================================================================

/// 从 PostgreSQL 读取图层
///
/// 数据源自带的 host / port / user / password 优先，缺失时使用命令行连接参数。
pub struct PostgresLayerSource {
    fallback: PgConfig,
}

impl PostgresLayerSource {
    pub fn new(fallback: PgConfig) -> Self {
        PostgresLayerSource { fallback }
    }

    /// 由数据源推出连接参数，返回 (连接参数, 数据库名)
    pub fn config_for(&self, ds: &DataSource) -> AppResult<(PgConfig, String)> {
        let dbname = ds
            .get("dbname")
            .filter(|d| !d.is_empty())
            .ok_or_else(|| AppError::ValidationError("数据源中没有 dbname".to_string()))?;

        let port = match ds.get("port") {
            Some(p) => p.parse::<u16>().map_err(|_| {
                AppError::ValidationError(format!("数据源端口无效：{}", p))
            })?,
            None => self.fallback.port,
        };

        let config = PgConfig {
            host: ds.get("host").unwrap_or_else(|| self.fallback.host.clone()),
            port,
            user: ds.get("user").unwrap_or_else(|| self.fallback.user.clone()),
            password: ds.get("password").or_else(|| self.fallback.password.clone()),
            maintenance_db: self.fallback.maintenance_db.clone(),
        };
        Ok((config, dbname))
    }
}

#[async_trait]
impl LayerSource for PostgresLayerSource {
    async fn fetch_layer(&self, layer: &LayerInfo) -> AppResult<LayerTable> {
        let ds = DataSource::parse(&layer.datasource);
        let (config, dbname) = self.config_for(&ds)?;
        let (schema, table, geom_column) = ds.table_ref().ok_or_else(|| {
            AppError::ValidationError(format!("图层 {} 的数据源中没有 table=", layer.name))
        })?;

        let mut conn = config.connect(&dbname).await?;

        let meta: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT column_name::text, data_type::text, udt_name::text
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
        )
        .bind(&schema)
        .bind(&table)
        .fetch_all(&mut conn)
        .await?;
        if meta.is_empty() {
            return Err(AppError::DatabaseError(format!(
                "表 {}.{} 不存在或没有列",
                schema, table
            )));
        }

        let geometry = match &geom_column {
            Some(geom) => {
                let registered: Option<(String, i32)> = sqlx::query_as(
                    "SELECT type::text, srid::int4 FROM geometry_columns
                     WHERE f_table_schema = $1 AND f_table_name = $2 AND f_geometry_column = $3",
                )
                .bind(&schema)
                .bind(&table)
                .bind(geom)
                .fetch_optional(&mut conn)
                .await?;
                let (geometry_type, srs_id) = registered.unwrap_or_else(|| {
                    let srid = ds.get("srid").and_then(|s| s.parse().ok()).unwrap_or(0);
                    ("GEOMETRY".to_string(), srid)
                });
                let srs_definition = sqlx::query_scalar::<_, Option<String>>(
                    "SELECT srtext::text FROM spatial_ref_sys WHERE srid = $1",
                )
                .bind(srs_id)
                .fetch_optional(&mut conn)
                .await?
                .flatten();
                Some(GeometryColumn {
                    name: geom.clone(),
                    geometry_type,
                    srs_id,
                    srs_definition,
                })
            }
            None => None,
        };

        let mut columns = Vec::new();
        let mut exprs = Vec::new();
        for (name, data_type, udt_name) in &meta {
            if geom_column.as_deref() == Some(name.as_str()) {
                continue;
            }
            let column_type = classify_column(data_type, udt_name);
            exprs.push(select_expression(name, data_type, column_type));
            columns.push(Column {
                name: name.clone(),
                column_type,
            });
        }
        if let Some(geom) = &geometry {
            exprs.push(format!(
                "ST_AsBinary({}) AS {}",
                quote_ident(&geom.name),
                GEOMETRY_ALIAS
            ));
        }
        if exprs.is_empty() {
            exprs.push("1".to_string());
        }

        let mut query = format!(
            "SELECT {} FROM {}.{}",
            exprs.join(", "),
            quote_ident(&schema),
            quote_ident(&table)
        );
        if let Some(filter) = ds.get("sql").filter(|s| !s.trim().is_empty()) {
            log::debug!("图层 {} 使用过滤条件：{}", layer.name, filter);
            query.push_str(&format!(" WHERE {}", filter));
        }

        let rows = sqlx::query(&query).fetch_all(&mut conn).await?;
        if let Err(e) = sqlx::Connection::close(conn).await {
            log::debug!("关闭连接时出错：{}", e);
        }

        let mut features = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = columns
                .iter()
                .enumerate()
                .map(|(i, c)| decode_value(row, i, c.column_type))
                .collect::<AppResult<Vec<_>>>()?;
            let geometry = match &geometry {
                Some(_) => row.try_get::<Option<Vec<u8>>, _>(GEOMETRY_ALIAS)?,
                None => None,
            };
            features.push(Feature { values, geometry });
        }

        log::info!(
            "已读取图层 {}（{}.{}，{} 条记录）",
            layer.name,
            schema,
            table,
            features.len()
        );
        Ok(LayerTable {
            name: layer.export_name(),
            columns,
            geometry,
            features,
        })
    }
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_column() {
        assert_eq!(classify_column("integer", "int4"), ColumnType::Integer);
        assert_eq!(classify_column("boolean", "bool"), ColumnType::Integer);
        assert_eq!(classify_column("double precision", "float8"), ColumnType::Real);
        assert_eq!(classify_column("numeric", "numeric"), ColumnType::Real);
        assert_eq!(classify_column("bytea", "bytea"), ColumnType::Blob);
        assert_eq!(classify_column("USER-DEFINED", "geometry"), ColumnType::Blob);
        assert_eq!(classify_column("USER-DEFINED", "hstore"), ColumnType::Text);
        assert_eq!(classify_column("timestamp with time zone", "timestamptz"), ColumnType::Text);
    }

    #[test]
    fn test_select_expression() {
        assert_eq!(select_expression("id", "integer", ColumnType::Integer), "\"id\"::bigint");
        assert_eq!(
            select_expression("ok", "boolean", ColumnType::Integer),
            "\"ok\"::int::bigint"
        );
        assert_eq!(select_expression("w", "numeric", ColumnType::Real), "\"w\"::float8");
        assert_eq!(select_expression("raw", "bytea", ColumnType::Blob), "\"raw\"");
        assert_eq!(
            select_expression("g2", "USER-DEFINED", ColumnType::Blob),
            "ST_AsBinary(\"g2\")"
        );
        assert_eq!(select_expression("a\"b", "text", ColumnType::Text), "\"a\"\"b\"::text");
    }

    #[test]
    fn test_config_for_prefers_datasource_values() {
        let source = PostgresLayerSource::new(PgConfig {
            password: Some("fallback".to_string()),
            ..Default::default()
        });
        let ds = DataSource::parse(
            "dbname='gis' host=db.local port=6543 user='reader' table=\"public\".\"roads\" (geom)",
        );
        let (config, dbname) = source.config_for(&ds).unwrap();
        assert_eq!(dbname, "gis");
        assert_eq!(config.host, "db.local");
        assert_eq!(config.port, 6543);
        assert_eq!(config.user, "reader");
        assert_eq!(config.password.as_deref(), Some("fallback"));
    }

    #[test]
    fn test_config_for_requires_dbname_and_valid_port() {
        let source = PostgresLayerSource::new(PgConfig::default());
        assert!(source.config_for(&DataSource::parse("host=x table=t")).is_err());
        assert!(source
            .config_for(&DataSource::parse("dbname='a' port=abc"))
            .is_err());
    }
}
