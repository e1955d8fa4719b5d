// ============================================================================
// 操作历史 Commands
// ============================================================================

use crate::commands::AppContext;
use crate::models::dtos::OperationRecord;

/// 最近的操作记录
pub fn list_history(ctx: &AppContext, limit: usize) -> Result<Vec<OperationRecord>, String> {
    Ok(ctx.store()?.list_operations(limit)?)
}

/// 清空操作历史，返回删除条数
pub fn clear_history(ctx: &AppContext) -> Result<usize, String> {
    Ok(ctx.store()?.clear_operations()?)
}
