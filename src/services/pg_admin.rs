// ============================================================================
// PostgreSQL 管理：模板库、数据库、清空表、库内 QGIS 工程
// ============================================================================
//
// 每次调用都新建一条 PgConnection，用完即关闭，不持有连接池。
// 标识符一律经 `sql::quote_ident` 引用，值一律使用绑定参数；
// 只有 COMMENT ON DATABASE 这类不接受参数的 DDL 使用 `quote_literal`。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};

use crate::models::dtos::{
    ActiveConnection, DatabaseInfo, ProjectRepairReport, QgisProjectRef, TemplateReport,
    TruncatePlan, TruncateReport, UserPrivileges,
};
use crate::services::datasource::ConnectionOverrides;
use crate::services::project_repair::{content_digest, repair_project_blob};
use crate::services::sql::{
    comment_on_database_sql, create_from_template_sql, create_template_sql, drop_database_sql,
    is_system_database, qualified_name, quote_ident, truncate_table_sql, validate_database_name,
};
use crate::services::{QGIS_PROJECTS_TABLE, SYSTEM_SCHEMAS};
use crate::utils::error::{AppError, AppResult};
use crate::utils::timestamp::{file_stamp, local_now};

// ============================================================================
// 连接参数
// ============================================================================

/// PostgreSQL 连接参数
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// 执行目录查询与 CREATE/DROP DATABASE 所连接的库
    pub maintenance_db: String,
}

impl Default for PgConfig {
    fn default() -> Self {
        PgConfig {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            maintenance_db: "postgres".to_string(),
        }
    }
}

impl PgConfig {
    pub fn connect_options(&self, database: &str) -> PgConnectOptions {
        let opts = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(database);
        match self.password.as_deref() {
            Some(pw) if !pw.is_empty() => opts.password(pw),
            _ => opts,
        }
    }

    /// 连接指定数据库
    pub async fn connect(&self, database: &str) -> AppResult<PgConnection> {
        log::debug!("连接 {}@{}:{}/{}", self.user, self.host, self.port, database);
        PgConnection::connect_with(&self.connect_options(database))
            .await
            .map_err(|e| {
                AppError::ConnectionError(format!(
                    "无法连接 {}:{}/{}：{}",
                    self.host, self.port, database, e
                ))
            })
    }
}

/// 关闭连接，关闭失败只记录日志
async fn close(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        log::debug!("关闭连接时出错：{}", e);
    }
}

// ============================================================================
// 纯函数
// ============================================================================

/// 拆分清空计划：开启排除时跳过 qgis_projects 表
pub fn plan_truncation(tables: &[String], exclude_qgis_projects: bool) -> TruncatePlan {
    let mut plan = TruncatePlan::default();
    for table in tables {
        if exclude_qgis_projects && table == QGIS_PROJECTS_TABLE {
            plan.excluded.push(table.clone());
        } else {
            plan.to_truncate.push(table.clone());
        }
    }
    plan
}

/// 备份文件路径：`<dir>/<工程名>_<YYYYmmdd_HHMMSS>.qgz`
pub fn backup_file_path(backup_dir: &Path, project_name: &str, stamp: &str) -> PathBuf {
    let safe: String = project_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    backup_dir.join(format!("{}_{}.qgz", safe.trim(), stamp))
}

fn system_schemas() -> Vec<String> {
    SYSTEM_SCHEMAS.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// 管理器
// ============================================================================

/// PostgreSQL 管理器
pub struct PgAdmin {
    config: PgConfig,
}

impl PgAdmin {
    pub fn new(config: PgConfig) -> Self {
        PgAdmin { config }
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    async fn maintenance(&self) -> AppResult<PgConnection> {
        self.config.connect(&self.config.maintenance_db).await
    }

    /// 测试连接，返回服务器版本
    pub async fn test_connection(&self) -> AppResult<String> {
        let mut conn = self.maintenance().await?;
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&mut conn)
            .await?;
        close(conn).await;
        log::info!("连接成功：{}", version);
        Ok(version)
    }

    /// 非模板的用户数据库
    pub async fn list_databases(&self) -> AppResult<Vec<String>> {
        let mut conn = self.maintenance().await?;
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT datname::text FROM pg_database
             WHERE datistemplate = false
               AND datname NOT IN ('postgres', 'template0', 'template1')
             ORDER BY datname",
        )
        .fetch_all(&mut conn)
        .await?;
        close(conn).await;
        Ok(names)
    }

    /// 用户模板库（不含 template0 / template1）
    pub async fn list_templates(&self) -> AppResult<Vec<String>> {
        let mut conn = self.maintenance().await?;
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT datname::text FROM pg_database
             WHERE datistemplate = true
               AND datname NOT IN ('template0', 'template1')
             ORDER BY datname",
        )
        .fetch_all(&mut conn)
        .await?;
        close(conn).await;
        Ok(names)
    }

    /// 非模板数据库及其注释
    pub async fn list_databases_with_comments(&self) -> AppResult<Vec<(String, Option<String>)>> {
        let mut conn = self.maintenance().await?;
        let rows = sqlx::query(
            "SELECT datname::text AS name, shobj_description(oid, 'pg_database') AS comment
             FROM pg_database
             WHERE datistemplate = false
               AND datname NOT IN ('postgres', 'template0', 'template1')
             ORDER BY datname",
        )
        .fetch_all(&mut conn)
        .await?;
        close(conn).await;

        rows.iter()
            .map(|row| -> AppResult<(String, Option<String>)> {
                Ok((row.try_get("name")?, row.try_get("comment")?))
            })
            .collect()
    }

    /// 当前用户是否为超级用户 / 是否可建库
    pub async fn check_user_privileges(&self) -> AppResult<UserPrivileges> {
        let mut conn = self.maintenance().await?;
        let row = sqlx::query("SELECT usesuper, usecreatedb FROM pg_user WHERE usename = $1")
            .bind(&self.config.user)
            .fetch_optional(&mut conn)
            .await?;
        close(conn).await;

        match row {
            Some(row) => Ok(UserPrivileges {
                is_superuser: row.try_get("usesuper")?,
                can_create_db: row.try_get("usecreatedb")?,
            }),
            None => Ok(UserPrivileges::default()),
        }
    }

    /// 没有建库权限时返回验证错误
    pub async fn require_create_privilege(&self) -> AppResult<UserPrivileges> {
        let privileges = self.check_user_privileges().await?;
        if !privileges.is_superuser && !privileges.can_create_db {
            return Err(AppError::ValidationError(format!(
                "用户 {} 没有 CREATEDB 权限，也不是超级用户",
                self.config.user
            )));
        }
        Ok(privileges)
    }

    async fn exists_on(conn: &mut PgConnection, name: &str) -> AppResult<bool> {
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(found.is_some())
    }

    pub async fn database_exists(&self, name: &str) -> AppResult<bool> {
        let mut conn = self.maintenance().await?;
        let exists = Self::exists_on(&mut conn, name).await;
        close(conn).await;
        exists
    }

    /// 数据库详情
    pub async fn database_info(&self, name: &str) -> AppResult<DatabaseInfo> {
        let mut conn = self.maintenance().await?;
        let row = sqlx::query(
            "SELECT d.datname::text AS name,
                    pg_get_userbyid(d.datdba)::text AS owner,
                    pg_encoding_to_char(d.encoding)::text AS encoding,
                    pg_size_pretty(pg_database_size(d.datname)) AS size_pretty,
                    (SELECT count(*) FROM pg_stat_activity a
                      WHERE a.datname = d.datname AND a.pid <> pg_backend_pid()) AS connection_count,
                    shobj_description(d.oid, 'pg_database') AS comment,
                    d.datistemplate AS is_template
             FROM pg_database d
             WHERE d.datname = $1",
        )
        .bind(name)
        .fetch_optional(&mut conn)
        .await?;
        close(conn).await;

        let row = row.ok_or_else(|| {
            AppError::ValidationError(format!("数据库 {} 不存在", name))
        })?;
        Ok(DatabaseInfo {
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            encoding: row.try_get("encoding")?,
            size_pretty: row.try_get("size_pretty")?,
            connection_count: row.try_get("connection_count")?,
            comment: row.try_get("comment")?,
            is_template: row.try_get("is_template")?,
        })
    }

    async fn connection_count_on(conn: &mut PgConnection, name: &str) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM pg_stat_activity
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count)
    }

    /// 数据库上的其他连接数（不含本连接）
    pub async fn connection_count(&self, name: &str) -> AppResult<i64> {
        let mut conn = self.maintenance().await?;
        let count = Self::connection_count_on(&mut conn, name).await;
        close(conn).await;
        count
    }

    /// 数据库上的活动连接明细
    pub async fn active_connections(&self, name: &str) -> AppResult<Vec<ActiveConnection>> {
        let mut conn = self.maintenance().await?;
        let rows = sqlx::query(
            "SELECT pid, usename::text AS username, client_addr::text AS client_addr,
                    client_hostname, client_port, backend_start::text AS backend_start,
                    state, query
             FROM pg_stat_activity
             WHERE datname = $1 AND pid <> pg_backend_pid()
             ORDER BY backend_start",
        )
        .bind(name)
        .fetch_all(&mut conn)
        .await?;
        close(conn).await;

        rows.iter()
            .map(|row| -> AppResult<ActiveConnection> {
                Ok(ActiveConnection {
                    pid: row.try_get("pid")?,
                    username: row.try_get("username")?,
                    client_addr: row.try_get("client_addr")?,
                    client_hostname: row.try_get("client_hostname")?,
                    client_port: row.try_get("client_port")?,
                    backend_start: row.try_get("backend_start")?,
                    state: row.try_get("state")?,
                    query: row.try_get("query")?,
                })
            })
            .collect()
    }

    async fn terminate_on(conn: &mut PgConnection, name: &str) -> AppResult<usize> {
        let results: Vec<bool> = sqlx::query_scalar(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(name)
        .fetch_all(&mut *conn)
        .await?;
        let terminated = results.into_iter().filter(|ok| *ok).count();
        if terminated > 0 {
            log::info!("已断开数据库 {} 上的 {} 个连接", name, terminated);
        }
        Ok(terminated)
    }

    /// 断开数据库上的全部其他连接，返回断开个数
    pub async fn terminate_connections(&self, name: &str) -> AppResult<usize> {
        let mut conn = self.maintenance().await?;
        let terminated = Self::terminate_on(&mut conn, name).await;
        close(conn).await;
        terminated
    }

    async fn drop_template_on(conn: &mut PgConnection, name: &str) -> AppResult<()> {
        sqlx::query("UPDATE pg_database SET datistemplate = false WHERE datname = $1")
            .bind(name)
            .execute(&mut *conn)
            .await?;
        sqlx::raw_sql(&drop_database_sql(name))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// 从源库创建模板并清空模板中的全部用户表
    pub async fn create_template(
        &self,
        source_db: &str,
        template_name: &str,
        drop_connections: bool,
    ) -> AppResult<TemplateReport> {
        validate_database_name(template_name)?;
        if source_db == template_name {
            return Err(AppError::ValidationError(
                "模板名称不能与源数据库相同".to_string(),
            ));
        }

        let mut conn = self.maintenance().await?;
        if !Self::exists_on(&mut conn, source_db).await? {
            close(conn).await;
            return Err(AppError::ValidationError(format!(
                "源数据库 {} 不存在",
                source_db
            )));
        }

        if drop_connections {
            Self::terminate_on(&mut conn, source_db).await?;
        }

        if Self::exists_on(&mut conn, template_name).await? {
            log::info!("模板 {} 已存在，先删除", template_name);
            Self::drop_template_on(&mut conn, template_name).await?;
        }

        log::info!("正在从 {} 创建模板 {}", source_db, template_name);
        sqlx::raw_sql(&create_template_sql(source_db, template_name))
            .execute(&mut conn)
            .await?;
        close(conn).await;

        // 连接新模板，逐表清空
        let mut tpl_conn = self.config.connect(template_name).await?;
        let tables: Vec<(String, String)> = sqlx::query_as(
            "SELECT schemaname::text, tablename::text FROM pg_tables
             WHERE schemaname::text <> ALL($1)
             ORDER BY schemaname, tablename",
        )
        .bind(system_schemas())
        .fetch_all(&mut tpl_conn)
        .await?;

        let mut report = TemplateReport {
            template: template_name.to_string(),
            cleared_tables: Vec::new(),
            failed_tables: Vec::new(),
        };
        for (schema, table) in tables {
            let name = qualified_name(&schema, &table);
            match sqlx::raw_sql(&truncate_table_sql(&schema, &table))
                .execute(&mut tpl_conn)
                .await
            {
                Ok(_) => report.cleared_tables.push(name),
                Err(e) => {
                    log::warn!("清空模板表 {} 失败：{}", name, e);
                    report.failed_tables.push(name);
                }
            }
        }
        close(tpl_conn).await;

        log::info!(
            "模板 {} 创建完成，清空 {} 张表",
            template_name,
            report.cleared_tables.len()
        );
        Ok(report)
    }

    /// 从模板创建新数据库，目标已存在时拒绝
    pub async fn create_database_from_template(
        &self,
        template_name: &str,
        new_db_name: &str,
        comment: Option<&str>,
    ) -> AppResult<()> {
        validate_database_name(new_db_name)?;

        let mut conn = self.maintenance().await?;
        if Self::exists_on(&mut conn, new_db_name).await? {
            close(conn).await;
            return Err(AppError::ValidationError(format!(
                "数据库 {} 已存在",
                new_db_name
            )));
        }

        log::info!("正在从模板 {} 创建数据库 {}", template_name, new_db_name);
        sqlx::raw_sql(&create_from_template_sql(template_name, new_db_name))
            .execute(&mut conn)
            .await?;

        if let Some(comment) = comment.map(str::trim).filter(|c| !c.is_empty()) {
            sqlx::raw_sql(&comment_on_database_sql(new_db_name, comment))
                .execute(&mut conn)
                .await?;
        }
        close(conn).await;

        log::info!("数据库 {} 创建成功", new_db_name);
        Ok(())
    }

    /// 删除模板库：先取消模板标记再删除
    pub async fn delete_template(&self, template_name: &str) -> AppResult<()> {
        let templates = self.list_templates().await?;
        if !templates.iter().any(|t| t == template_name) {
            return Err(AppError::ValidationError(format!(
                "{} 不是可删除的模板库",
                template_name
            )));
        }

        let mut conn = self.maintenance().await?;
        Self::drop_template_on(&mut conn, template_name).await?;
        close(conn).await;
        log::info!("模板 {} 已删除", template_name);
        Ok(())
    }

    /// 删除数据库；系统库与当前连接的库禁止删除
    pub async fn delete_database(&self, name: &str, force_drop_connections: bool) -> AppResult<()> {
        if is_system_database(name) {
            return Err(AppError::ValidationError(format!(
                "系统数据库 {} 禁止删除",
                name
            )));
        }
        if name == self.config.maintenance_db {
            return Err(AppError::ValidationError(format!(
                "不能删除当前连接所在的数据库 {}",
                name
            )));
        }

        let mut conn = self.maintenance().await?;
        if !Self::exists_on(&mut conn, name).await? {
            close(conn).await;
            return Err(AppError::ValidationError(format!("数据库 {} 不存在", name)));
        }
        if force_drop_connections {
            Self::terminate_on(&mut conn, name).await?;
        }
        sqlx::raw_sql(&drop_database_sql(name))
            .execute(&mut conn)
            .await?;
        close(conn).await;
        log::info!("数据库 {} 已删除", name);
        Ok(())
    }

    /// 用户 schema，public 排在最前
    pub async fn list_schemas(&self, db: &str) -> AppResult<Vec<String>> {
        let mut conn = self.config.connect(db).await?;
        let schemas: Vec<String> = sqlx::query_scalar(
            "SELECT schema_name::text FROM information_schema.schemata
             WHERE schema_name NOT IN ('pg_catalog', 'information_schema')
               AND schema_name NOT LIKE 'pg\\_toast%'
               AND schema_name NOT LIKE 'pg\\_temp%'
             ORDER BY CASE WHEN schema_name = 'public' THEN 0 ELSE 1 END, schema_name",
        )
        .fetch_all(&mut conn)
        .await?;
        close(conn).await;
        Ok(schemas)
    }

    /// schema 下的表
    pub async fn list_schema_tables(&self, db: &str, schema: &str) -> AppResult<Vec<String>> {
        let mut conn = self.config.connect(db).await?;
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT tablename::text FROM pg_tables WHERE schemaname = $1 ORDER BY tablename",
        )
        .bind(schema)
        .fetch_all(&mut conn)
        .await?;
        close(conn).await;
        Ok(tables)
    }

    /// 逐表 TRUNCATE … CASCADE，全部失败时返回错误
    pub async fn truncate_schema_tables(
        &self,
        db: &str,
        schema: &str,
        tables: &[String],
    ) -> AppResult<TruncateReport> {
        if tables.is_empty() {
            return Err(AppError::ValidationError("没有需要清空的表".to_string()));
        }

        let mut conn = self.config.connect(db).await?;
        let mut report = TruncateReport::default();
        for table in tables {
            let name = qualified_name(schema, table);
            match sqlx::raw_sql(&truncate_table_sql(schema, table))
                .execute(&mut conn)
                .await
            {
                Ok(_) => {
                    log::info!("已清空 {}", name);
                    report.truncated.push(name);
                }
                Err(e) => {
                    log::warn!("清空 {} 失败：{}", name, e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        close(conn).await;

        if report.truncated.is_empty() {
            let details: Vec<String> = report
                .failed
                .iter()
                .map(|(t, e)| format!("{}: {}", t, e))
                .collect();
            return Err(AppError::DatabaseError(format!(
                "所有表都清空失败：{}",
                details.join("; ")
            )));
        }
        Ok(report)
    }

    /// 查找库中全部 qgis_projects 表里保存的工程
    pub async fn find_qgis_projects(&self, db: &str) -> AppResult<Vec<QgisProjectRef>> {
        let mut conn = self.config.connect(db).await?;
        let tables: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_schema::text, table_name::text FROM information_schema.tables
             WHERE table_name = $1 AND table_schema::text <> ALL($2)
             ORDER BY table_schema",
        )
        .bind(QGIS_PROJECTS_TABLE)
        .bind(system_schemas())
        .fetch_all(&mut conn)
        .await?;

        let mut projects = Vec::new();
        for (schema, table) in tables {
            let sql = format!(
                "SELECT name FROM {}.{} ORDER BY name",
                quote_ident(&schema),
                quote_ident(&table)
            );
            match sqlx::query_scalar::<_, String>(&sql).fetch_all(&mut conn).await {
                Ok(names) => projects.extend(names.into_iter().map(|name| QgisProjectRef {
                    schema: schema.clone(),
                    table: table.clone(),
                    name,
                })),
                Err(e) => log::warn!("读取 {}.{} 失败：{}", schema, table, e),
            }
        }
        close(conn).await;

        projects.sort();
        log::info!("在 {} 中找到 {} 个 QGIS 工程", db, projects.len());
        Ok(projects)
    }

    /// 修复库内工程的图层连接参数
    ///
    /// 指定备份目录时先把原始内容写到本地，再做任何修改。
    pub async fn fix_qgis_project_layers(
        &self,
        db: &str,
        project: &QgisProjectRef,
        overrides: &ConnectionOverrides,
        backup_dir: Option<&Path>,
    ) -> AppResult<ProjectRepairReport> {
        if overrides.is_empty() {
            return Err(AppError::ValidationError(
                "请至少指定一个要更新的连接参数".to_string(),
            ));
        }

        let table = format!(
            "{}.{}",
            quote_ident(&project.schema),
            quote_ident(&project.table)
        );
        let mut conn = self.config.connect(db).await?;
        let content: Option<Vec<u8>> =
            sqlx::query_scalar(&format!("SELECT content FROM {} WHERE name = $1", table))
                .bind(&project.name)
                .fetch_optional(&mut conn)
                .await?;
        let content = match content {
            Some(c) => c,
            None => {
                close(conn).await;
                return Err(AppError::ValidationError(format!(
                    "未找到工程 {}",
                    project
                )));
            }
        };

        let backup_path = match backup_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = backup_file_path(dir, &project.name, &file_stamp(local_now()));
                std::fs::write(&path, &content)?;
                log::info!("已备份工程到 {}", path.display());
                Some(path.to_string_lossy().to_string())
            }
            None => None,
        };

        let (fixed, layers_updated) = repair_project_blob(&content, overrides)?;
        let content_changed = content_digest(&fixed) != content_digest(&content);

        if content_changed {
            sqlx::query(&format!("UPDATE {} SET content = $1 WHERE name = $2", table))
                .bind(&fixed)
                .bind(&project.name)
                .execute(&mut conn)
                .await?;
            log::info!("工程 {} 已更新 {} 个图层", project, layers_updated);
        } else {
            log::info!("工程 {} 内容无变化，未回写", project);
        }
        close(conn).await;

        Ok(ProjectRepairReport {
            project: project.to_string(),
            layers_updated,
            content_changed,
            backup_path,
        })
    }
}

// ============================================================================
// 单元测试（只测试不需要服务器的部分）
// ============================================================================
