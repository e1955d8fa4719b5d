// ============================================================================
// 统一错误类型定义
// 使用 thiserror 派生宏，所有业务层函数都返回 AppResult<T>
// ============================================================================

use thiserror::Error;

/// 应用统一错误枚举
///
/// 每个变体对应一类失败场景。命令层通过 `impl From<AppError> for String`
/// 把错误转换为可直接展示给用户的文本。
#[derive(Debug, Error)]
pub enum AppError {
    /// 参数验证失败（如数据库名非法、未指定任何连接参数）
    #[error("验证失败：{0}")]
    ValidationError(String),

    /// 无法建立 PostgreSQL 连接
    #[error("连接失败：{0}")]
    ConnectionError(String),

    /// SQL 执行失败
    #[error("数据库操作失败：{0}")]
    DatabaseError(String),

    /// QGS/QGZ 工程文件解析或重写失败
    #[error("工程文件处理失败：{0}")]
    ProjectFileError(String),

    /// ZIP 归档或 GeoPackage 输出失败
    #[error("归档失败：{0}")]
    ArchiveError(String),

    /// 文件系统 IO 错误
    #[error("IO 错误：{0}")]
    IoError(#[from] std::io::Error),

    /// 本地设置库（SQLite）错误
    #[error("本地存储错误：{0}")]
    StoreError(String),

    /// 破坏性操作未确认（未传 --yes）
    #[error("已取消：{0}")]
    Cancelled(String),
}

/// 便捷类型别名，统一项目内的 Result 签名
pub type AppResult<T> = Result<T, AppError>;

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
                AppError::ConnectionError(err.to_string())
            }
            other => AppError::DatabaseError(other.to_string()),
        }
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::ArchiveError(err.to_string())
    }
}

impl From<quick_xml::Error> for AppError {
    fn from(err: quick_xml::Error) -> Self {
        AppError::ProjectFileError(format!("XML 解析错误：{}", err))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::StoreError(err.to_string())
    }
}

/// 将 AppError 转换为 String，命令层统一返回 `Result<T, String>`
impl From<AppError> for String {
    fn from(err: AppError) -> Self {
        err.to_string()
    }
}
