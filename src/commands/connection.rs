// ============================================================================
// 连接 Commands
// 测试连接、检查权限；连接成功后保存 host / port / user
// ============================================================================

use crate::commands::AppContext;
use crate::models::dtos::{ConnectionStatus, UserPrivileges};
use crate::utils::error::AppResult;

/// 测试连接，成功时保存连接参数（不含密码）
pub async fn connect(ctx: &AppContext) -> Result<ConnectionStatus, String> {
    let status = connect_inner(ctx).await;
    let config = ctx.pg.config();
    let target = format!("{}@{}:{}", config.user, config.host, config.port);
    ctx.record("connect", &target, &status, "连接成功");
    Ok(status?)
}

async fn connect_inner(ctx: &AppContext) -> AppResult<ConnectionStatus> {
    let server_version = ctx.pg.test_connection().await?;
    let privileges = ctx.pg.check_user_privileges().await?;
    let config = ctx.pg.config();

    ctx.store()?
        .save_connection_profile(&config.host, config.port, &config.user)?;
    log::info!("已连接到 {}:{}（{}）", config.host, config.port, server_version);

    Ok(ConnectionStatus {
        host: config.host.clone(),
        port: config.port,
        user: config.user.clone(),
        server_version,
        privileges,
    })
}

/// 查询当前用户权限
pub async fn check_privileges(ctx: &AppContext) -> Result<UserPrivileges, String> {
    Ok(ctx.pg.check_user_privileges().await?)
}
