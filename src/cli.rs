// ============================================================================
// 命令行定义与分发
// ✅ 只能做：解析参数、解析连接配置、调用 commands、渲染输出
// ⛔ 禁止：包含业务逻辑
// ============================================================================

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::commands::{self, AppContext};
use crate::models::dtos::ConnectionProfile;
use crate::services::credential_cleaner::CleanOptions;
use crate::services::datasource::ConnectionOverrides;
use crate::services::path_scanner::summarize_paths;
use crate::services::pg_admin::PgConfig;
use crate::utils::error::{AppError, AppResult};

/// 数据目录下的子目录名
pub const APP_DIR_NAME: &str = "kgr-toolbox";

/// KGR Toolbox：PostgreSQL 模板管理与 QGIS 工程工具
#[derive(Parser, Debug)]
#[command(name = "kgr-toolbox")]
#[command(about = "PostgreSQL template manager and QGIS project toolbox")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// 本地设置库所在目录
    #[arg(long, value_name = "DIR", env = "KGR_TOOLBOX_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// 以 JSON 输出结果
    #[arg(long, global = true)]
    pub json: bool,

    /// 输出调试日志
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// 只输出错误日志
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// 确认执行破坏性操作
    #[arg(short = 'y', long = "yes", global = true)]
    pub assume_yes: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// PostgreSQL 连接参数；未给出时依次使用环境变量、已保存的设置和默认值
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    #[arg(long, env = "PGHOST", global = true)]
    pub host: Option<String>,

    #[arg(long, env = "PGPORT", global = true)]
    pub port: Option<u16>,

    #[arg(long, env = "PGUSER", global = true)]
    pub user: Option<String>,

    #[arg(long, env = "PGPASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    #[arg(long, value_name = "DB", default_value = "postgres", global = true)]
    pub maintenance_db: String,
}

impl ConnectionArgs {
    /// 合并命令行参数与已保存的连接设置
    pub fn resolve(&self, saved: &ConnectionProfile) -> PgConfig {
        let defaults = PgConfig::default();
        PgConfig {
            host: self
                .host
                .clone()
                .or_else(|| saved.host.clone())
                .unwrap_or(defaults.host),
            port: self.port.or(saved.port).unwrap_or(defaults.port),
            user: self
                .user
                .clone()
                .or_else(|| saved.user.clone())
                .unwrap_or(defaults.user),
            password: self.password.clone(),
            maintenance_db: self.maintenance_db.clone(),
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// 测试连接并保存连接参数（不含密码）
    Connect,
    /// 查看当前用户的建库权限
    Privileges,
    /// 模板数据库管理
    #[command(subcommand)]
    Template(TemplateCommand),
    /// 数据库管理
    #[command(subcommand)]
    Database(DatabaseCommand),
    /// 清空模式下的表
    #[command(subcommand)]
    Truncate(TruncateCommand),
    /// 库内 QGIS 工程
    #[command(subcommand)]
    Project(ProjectCommand),
    /// 清除工程文件中的用户名和密码
    #[command(subcommand)]
    CleanQgs(CleanQgsCommand),
    /// 把工程导出为便携归档（PostgreSQL 图层转 GeoPackage）
    Archive {
        /// .qgs 或 .qgz 工程文件
        project: PathBuf,
        /// 已存在的输出目录
        output: PathBuf,
        /// 写入归档报告的备注
        #[arg(long)]
        notes: Option<String>,
    },
    /// 本地操作历史
    #[command(subcommand)]
    History(HistoryCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum TemplateCommand {
    /// 列出模板
    List,
    /// 从数据库创建模板并清空其中的表
    Create {
        source: String,
        name: String,
        /// 先断开源库上的其他连接
        #[arg(long)]
        drop_connections: bool,
    },
    /// 删除模板
    Delete { name: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum DatabaseCommand {
    /// 列出数据库及其注释
    List,
    /// 数据库详情
    Info { name: String },
    /// 活动连接
    Connections { name: String },
    /// 从模板创建数据库
    Create {
        name: String,
        #[arg(long)]
        template: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// 删除数据库
    Delete {
        name: String,
        /// 先断开其他连接
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum TruncateCommand {
    /// 列出模式
    Schemas { database: String },
    /// 列出模式下的表
    Tables { database: String, schema: String },
    /// 预览清空计划
    Plan {
        database: String,
        schema: String,
        /// 不跳过 qgis_projects 表
        #[arg(long)]
        include_qgis_projects: bool,
    },
    /// 清空表
    Run {
        database: String,
        schema: String,
        /// 不跳过 qgis_projects 表
        #[arg(long)]
        include_qgis_projects: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProjectCommand {
    /// 查找 qgis_projects 表中的工程
    Find { database: String },
    /// 修复工程中 PostgreSQL 图层的连接参数
    Fix {
        database: String,
        /// 工程名或 "schema.table - name"
        project: String,
        #[command(flatten)]
        overrides: OverrideArgs,
        /// 修改前把原始工程备份到该目录
        #[arg(long, value_name = "DIR")]
        backup_dir: Option<PathBuf>,
    },
}

/// 写入图层数据源的新连接参数
#[derive(Args, Debug, Clone, Default)]
pub struct OverrideArgs {
    #[arg(long)]
    pub new_dbname: Option<String>,
    #[arg(long)]
    pub new_host: Option<String>,
    #[arg(long)]
    pub new_port: Option<u16>,
    #[arg(long)]
    pub new_user: Option<String>,
    #[arg(long)]
    pub new_password: Option<String>,
    #[arg(long)]
    pub new_schema: Option<String>,
}

impl OverrideArgs {
    pub fn to_overrides(&self) -> ConnectionOverrides {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        ConnectionOverrides {
            dbname: non_empty(&self.new_dbname),
            host: non_empty(&self.new_host),
            port: self.new_port.map(|p| p.to_string()),
            user: non_empty(&self.new_user),
            password: self.new_password.clone().filter(|p| !p.is_empty()),
            schema: non_empty(&self.new_schema),
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum CleanQgsCommand {
    /// 预览会被清理的数据源
    Preview {
        file: PathBuf,
        #[command(flatten)]
        keep: KeepArgs,
    },
    /// 写出清理后的 `_cleaned` 副本
    Run {
        file: PathBuf,
        #[command(flatten)]
        keep: KeepArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct KeepArgs {
    /// 保留用户名
    #[arg(long)]
    pub keep_user: bool,
    /// 保留密码
    #[arg(long)]
    pub keep_password: bool,
}

impl KeepArgs {
    pub fn options(&self) -> CleanOptions {
        CleanOptions {
            remove_user: !self.keep_user,
            remove_password: !self.keep_password,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommand {
    /// 最近的操作
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// 清空历史
    Clear,
}

impl Cli {
    /// 日志级别：-v 为 debug，-q 为 error
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }

    /// 本地设置库目录
    pub fn data_dir(&self) -> AppResult<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|d| d.join(APP_DIR_NAME))
                .ok_or_else(|| {
                    AppError::StoreError("无法确定数据目录，请使用 --data-dir 指定".to_string())
                }),
        }
    }
}

// ============================================================================
// 分发与输出
// ============================================================================

fn render<T: Serialize>(
    value: &T,
    json: bool,
    human: impl FnOnce(&T) -> String,
) -> Result<String, String> {
    if json {
        serde_json::to_string_pretty(value).map_err(|e| format!("输出序列化失败：{}", e))
    } else {
        Ok(human(value))
    }
}

fn done(message: String, json: bool) -> Result<String, String> {
    render(
        &serde_json::json!({ "ok": true, "message": message.as_str() }),
        json,
        |_| message.clone(),
    )
}

fn lines<T>(items: &[T], empty: &str, line: impl Fn(&T) -> String) -> String {
    if items.is_empty() {
        empty.to_string()
    } else {
        items.iter().map(line).collect::<Vec<_>>().join("\n")
    }
}

/// 执行子命令，返回要打印的文本
pub async fn dispatch(ctx: &AppContext, command: Command, json: bool) -> Result<String, String> {
    match command {
        Command::Connect => {
            let status = commands::connection::connect(ctx).await?;
            render(&status, json, |s| {
                format!(
                    "已连接 {}@{}:{}\n{}\n超级用户：{}  可建库：{}",
                    s.user,
                    s.host,
                    s.port,
                    s.server_version,
                    s.privileges.is_superuser,
                    s.privileges.can_create_db
                )
            })
        }
        Command::Privileges => {
            let p = commands::connection::check_privileges(ctx).await?;
            render(&p, json, |p| {
                format!("超级用户：{}  可建库：{}", p.is_superuser, p.can_create_db)
            })
        }
        Command::Template(cmd) => dispatch_template(ctx, cmd, json).await,
        Command::Database(cmd) => dispatch_database(ctx, cmd, json).await,
        Command::Truncate(cmd) => dispatch_truncate(ctx, cmd, json).await,
        Command::Project(cmd) => dispatch_project(ctx, cmd, json).await,
        Command::CleanQgs(cmd) => dispatch_clean(ctx, cmd, json),
        Command::Archive {
            project,
            output,
            notes,
        } => {
            let report = commands::archive::archive(ctx, project, output, notes).await?;
            render(&report, json, |r| {
                let mut text = format!(
                    "便携工程：{}\nGeoPackage：{}\n导出图层：{}\n清除凭据：{} 处，CSV 相对化：{} 个\n报告：{}",
                    r.portable_project,
                    r.geopackage.as_deref().unwrap_or("无"),
                    r.layers_exported.len(),
                    r.credentials_removed,
                    r.csv_converted,
                    r.report_path
                );
                for (name, reason) in &r.layers_failed {
                    text.push_str(&format!("\n导出失败：{}（{}）", name, reason));
                }
                if !r.remaining_paths.is_empty() {
                    text.push('\n');
                    text.push_str(&summarize_paths(&r.remaining_paths, 3));
                }
                text
            })
        }
        Command::History(HistoryCommand::List { limit }) => {
            let records = commands::history::list_history(ctx, limit)?;
            render(&records, json, |r| {
                lines(r, "暂无操作记录", |rec| {
                    format!(
                        "{}  {:<16} {:<24} {}  {}",
                        rec.created_at,
                        rec.operation,
                        rec.target,
                        if rec.success { "成功" } else { "失败" },
                        rec.message
                    )
                })
            })
        }
        Command::History(HistoryCommand::Clear) => {
            let removed = commands::history::clear_history(ctx)?;
            done(format!("已删除 {} 条操作记录", removed), json)
        }
    }
}

async fn dispatch_template(
    ctx: &AppContext,
    cmd: TemplateCommand,
    json: bool,
) -> Result<String, String> {
    match cmd {
        TemplateCommand::List => {
            let templates = commands::templates::list_templates(ctx).await?;
            render(&templates, json, |t| lines(t, "没有模板数据库", String::clone))
        }
        TemplateCommand::Create {
            source,
            name,
            drop_connections,
        } => {
            let report =
                commands::templates::create_template(ctx, &source, &name, drop_connections).await?;
            render(&report, json, |r| {
                let mut text = format!(
                    "模板 {} 已创建，清空 {} 张表",
                    r.template,
                    r.cleared_tables.len()
                );
                if !r.failed_tables.is_empty() {
                    text.push_str(&format!("\n未能清空：{}", r.failed_tables.join(", ")));
                }
                text
            })
        }
        TemplateCommand::Delete { name } => {
            commands::templates::delete_template(ctx, &name).await?;
            done(format!("模板 {} 已删除", name.trim()), json)
        }
    }
}

async fn dispatch_database(
    ctx: &AppContext,
    cmd: DatabaseCommand,
    json: bool,
) -> Result<String, String> {
    match cmd {
        DatabaseCommand::List => {
            let databases = commands::databases::list_databases(ctx).await?;
            render(&databases, json, |d| {
                lines(d, "没有用户数据库", |db| match &db.comment {
                    Some(c) => format!("{}  ({})", db.name, c),
                    None => db.name.clone(),
                })
            })
        }
        DatabaseCommand::Info { name } => {
            let info = commands::databases::database_info(ctx, &name).await?;
            render(&info, json, |i| {
                format!(
                    "名称：{}\n所有者：{}\n编码：{}\n大小：{}\n连接数：{}\n模板：{}\n注释：{}",
                    i.name,
                    i.owner,
                    i.encoding,
                    i.size_pretty,
                    i.connection_count,
                    i.is_template,
                    i.comment.as_deref().unwrap_or("")
                )
            })
        }
        DatabaseCommand::Connections { name } => {
            let conns = commands::databases::active_connections(ctx, &name).await?;
            render(&conns, json, |c| {
                lines(c, "没有其他活动连接", |a| {
                    format!(
                        "{}  {}  {}:{}  {}  {}",
                        a.pid,
                        a.username.as_deref().unwrap_or("-"),
                        a.client_addr.as_deref().unwrap_or("local"),
                        a.client_port.map(|p| p.to_string()).unwrap_or_default(),
                        a.state.as_deref().unwrap_or("-"),
                        a.backend_start.as_deref().unwrap_or("")
                    )
                })
            })
        }
        DatabaseCommand::Create {
            name,
            template,
            comment,
        } => {
            commands::templates::create_database(ctx, &template, &name, comment.as_deref()).await?;
            done(format!("数据库 {} 已从模板 {} 创建", name.trim(), template.trim()), json)
        }
        DatabaseCommand::Delete { name, force } => {
            commands::databases::delete_database(ctx, &name, force).await?;
            done(format!("数据库 {} 已删除", name.trim()), json)
        }
    }
}

async fn dispatch_truncate(
    ctx: &AppContext,
    cmd: TruncateCommand,
    json: bool,
) -> Result<String, String> {
    match cmd {
        TruncateCommand::Schemas { database } => {
            let schemas = commands::truncate::list_schemas(ctx, &database).await?;
            render(&schemas, json, |s| lines(s, "没有用户模式", String::clone))
        }
        TruncateCommand::Tables { database, schema } => {
            let tables = commands::truncate::list_tables(ctx, &database, &schema).await?;
            render(&tables, json, |t| lines(t, "模式中没有表", String::clone))
        }
        TruncateCommand::Plan {
            database,
            schema,
            include_qgis_projects,
        } => {
            let plan =
                commands::truncate::plan(ctx, &database, &schema, !include_qgis_projects).await?;
            render(&plan, json, |p| {
                format!(
                    "将清空：{}\n跳过：{}",
                    p.to_truncate.join(", "),
                    p.excluded.join(", ")
                )
            })
        }
        TruncateCommand::Run {
            database,
            schema,
            include_qgis_projects,
        } => {
            let outcome = commands::truncate::truncate_tables(
                ctx,
                &database,
                &schema,
                !include_qgis_projects,
            )
            .await?;
            render(&outcome, json, |o| {
                let mut text = format!(
                    "{}.{}：已清空 {} 张表",
                    o.database,
                    o.schema,
                    o.report.truncated.len()
                );
                if !o.excluded.is_empty() {
                    text.push_str(&format!("，跳过 {}", o.excluded.join(", ")));
                }
                for (table, reason) in &o.report.failed {
                    text.push_str(&format!("\n清空失败：{}（{}）", table, reason));
                }
                text
            })
        }
    }
}

async fn dispatch_project(
    ctx: &AppContext,
    cmd: ProjectCommand,
    json: bool,
) -> Result<String, String> {
    match cmd {
        ProjectCommand::Find { database } => {
            let projects = commands::qgis_projects::find_projects(ctx, &database).await?;
            render(&projects, json, |p| {
                lines(p, "没有找到 QGIS 工程", |r| r.to_string())
            })
        }
        ProjectCommand::Fix {
            database,
            project,
            overrides,
            backup_dir,
        } => {
            let report = commands::qgis_projects::fix_project(
                ctx,
                &database,
                &project,
                &overrides.to_overrides(),
                backup_dir.as_deref(),
            )
            .await?;
            render(&report, json, |r| {
                let mut text = if r.content_changed {
                    format!("{}：已更新 {} 个图层连接", r.project, r.layers_updated)
                } else {
                    format!("{}：内容未变化，未写回数据库", r.project)
                };
                if let Some(backup) = &r.backup_path {
                    text.push_str(&format!("\n备份：{}", backup));
                }
                text
            })
        }
    }
}

fn dispatch_clean(ctx: &AppContext, cmd: CleanQgsCommand, json: bool) -> Result<String, String> {
    match cmd {
        CleanQgsCommand::Preview { file, keep } => {
            let changes = commands::clean_qgs::preview(&file, keep.options())?;
            render(&changes, json, |c| {
                lines(c, "未发现需要清理的凭据", |ch| {
                    format!("- {}\n+ {}", ch.original, ch.cleaned)
                })
            })
        }
        CleanQgsCommand::Run { file, keep } => {
            let outcome = commands::clean_qgs::clean(ctx, &file, keep.options())?;
            render(&outcome, json, |o| match &o.output_path {
                Some(path) => format!("已清理 {} 个数据源，输出：{}", o.changes, path),
                None => "未发现需要清理的凭据，未写出文件".to_string(),
            })
        }
    }
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    /// 测试命令行参数优先于已保存的连接设置
    #[test]
    fn test_resolve_prefers_flags_over_saved() {
        let args = ConnectionArgs {
            host: Some("cli.host".to_string()),
            port: None,
            user: None,
            password: Some("pw".to_string()),
            maintenance_db: "postgres".to_string(),
        };
        let saved = ConnectionProfile {
            host: Some("saved.host".to_string()),
            port: Some(6543),
            user: Some("saved_user".to_string()),
        };

        let config = args.resolve(&saved);
        assert_eq!(config.host, "cli.host");
        assert_eq!(config.port, 6543);
        assert_eq!(config.user, "saved_user");
        assert_eq!(config.password.as_deref(), Some("pw"));
    }

    /// 测试没有任何设置时使用默认值
    #[test]
    fn test_resolve_defaults() {
        let args = ConnectionArgs {
            maintenance_db: "postgres".to_string(),
            ..Default::default()
        };
        let config = args.resolve(&ConnectionProfile::default());
        assert_eq!(config, PgConfig::default());
    }

    #[test]
    fn test_parse_nested_subcommands() {
        let cli = parse(&[
            "kgr-toolbox",
            "--yes",
            "template",
            "create",
            "gis",
            "gis_tpl",
            "--drop-connections",
        ]);
        assert!(cli.assume_yes);
        match cli.command {
            Command::Template(TemplateCommand::Create {
                source,
                name,
                drop_connections,
            }) => {
                assert_eq!(source, "gis");
                assert_eq!(name, "gis_tpl");
                assert!(drop_connections);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    /// 测试修复参数转换，空值视为未指定
    #[test]
    fn test_fix_overrides() {
        let cli = parse(&[
            "kgr-toolbox",
            "project",
            "fix",
            "gis",
            "city",
            "--new-host",
            "db.new",
            "--new-port",
            "5433",
            "--new-user",
            " ",
        ]);
        let Command::Project(ProjectCommand::Fix { overrides, .. }) = cli.command else {
            panic!("expected project fix");
        };
        let o = overrides.to_overrides();
        assert_eq!(o.host.as_deref(), Some("db.new"));
        assert_eq!(o.port.as_deref(), Some("5433"));
        assert_eq!(o.user, None);
        assert!(o.dbname.is_none());
    }

    #[test]
    fn test_keep_args_and_log_level() {
        let cli = parse(&["kgr-toolbox", "-v", "clean-qgs", "preview", "a.qgs", "--keep-user"]);
        assert_eq!(cli.log_level(), "debug");
        let Command::CleanQgs(CleanQgsCommand::Preview { keep, .. }) = cli.command else {
            panic!("expected clean-qgs preview");
        };
        let opts = keep.options();
        assert!(!opts.remove_user);
        assert!(opts.remove_password);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["kgr-toolbox", "-v", "-q", "connect"]).is_err());
    }

    #[test]
    fn test_data_dir_flag() {
        let cli = parse(&["kgr-toolbox", "--data-dir", "/tmp/kgr", "history", "list"]);
        assert_eq!(cli.data_dir().unwrap(), PathBuf::from("/tmp/kgr"));
    }
}
