// ============================================================================
// [总线] 程序的组装车间
// ✅ 只能做：pub mod 暴露子模块、初始化日志与本地存储、分发子命令
// ⛔ 禁止：直接实现 command 函数
// ============================================================================

pub mod cli;
pub mod commands;
pub mod database;
pub mod models;
pub mod services;
pub mod utils;

use std::process::ExitCode;

use clap::Parser;

use crate::cli::Cli;
use crate::commands::AppContext;
use crate::database::Database;

// ============================================================================
// 应用入口
// ============================================================================

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG 优先于 -v / -q
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(format!("{},sqlx=warn", cli.log_level())),
    )
    .format_timestamp_secs()
    .init();

    match execute(cli) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<String, String> {
    // 初始化本地设置库，未给出的连接参数从中读取
    let data_dir = cli.data_dir()?;
    let db = Database::init(&data_dir)?;
    let saved = db.get_connection_profile()?;
    let config = cli.connection.resolve(&saved);
    log::debug!("连接参数：{}@{}:{}", config.user, config.host, config.port);

    let ctx = AppContext::new(db, config, cli.assume_yes);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("无法启动异步运行时：{}", e))?;

    runtime.block_on(cli::dispatch(&ctx, cli.command, cli.json))
}
