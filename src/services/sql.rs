// ============================================================================
// SQL 构造：标识符引用、名称校验、DDL 语句拼装
// 值一律走绑定参数；只有 DDL 中无法绑定的位置才经过这里转义
// ============================================================================

use crate::services::SYSTEM_DATABASES;
use crate::utils::error::{AppError, AppResult};

/// PostgreSQL 标识符最大字节数（NAMEDATALEN - 1）
const MAX_IDENTIFIER_LEN: usize = 63;

/// 用双引号包裹标识符，内部的 `"` 双写
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// 用单引号包裹字符串字面量，内部的 `'` 双写
///
/// 仅用于 `COMMENT ON DATABASE` 这类不支持绑定参数的 DDL。
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// 校验新建数据库名：字母或下划线开头，只含字母、数字、下划线
pub fn validate_database_name(name: &str) -> AppResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::ValidationError("数据库名不能为空".to_string()));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(AppError::ValidationError(format!(
            "数据库名过长（最多 {} 字节）",
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(AppError::ValidationError(
            "数据库名非法：只能使用字母、数字和下划线，且不能以数字开头".to_string(),
        ))
    }
}

/// 是否为内置系统数据库
pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES.contains(&name)
}

pub fn create_template_sql(source_db: &str, template_name: &str) -> String {
    format!(
        "CREATE DATABASE {} WITH TEMPLATE {} IS_TEMPLATE = true",
        quote_ident(template_name),
        quote_ident(source_db)
    )
}

pub fn create_from_template_sql(template_name: &str, new_db_name: &str) -> String {
    format!(
        "CREATE DATABASE {} WITH TEMPLATE {}",
        quote_ident(new_db_name),
        quote_ident(template_name)
    )
}

pub fn drop_database_sql(name: &str) -> String {
    format!("DROP DATABASE {}", quote_ident(name))
}

pub fn comment_on_database_sql(name: &str, comment: &str) -> String {
    format!(
        "COMMENT ON DATABASE {} IS {}",
        quote_ident(name),
        quote_literal(comment)
    )
}

pub fn truncate_table_sql(schema: &str, table: &str) -> String {
    format!(
        "TRUNCATE TABLE {}.{} CASCADE",
        quote_ident(schema),
        quote_ident(table)
    )
}

/// 限定名 `"schema"."table"`
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_plain_and_embedded_quote() {
        assert_eq!(quote_ident("roads"), "\"roads\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal_doubles_single_quote() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_validate_database_name() {
        assert!(validate_database_name("kgr_2024").is_ok());
        assert!(validate_database_name("_tmp").is_ok());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("   ").is_err());
        assert!(validate_database_name("1abc").is_err());
        assert!(validate_database_name("has-dash").is_err());
        assert!(validate_database_name("has space").is_err());
        assert!(validate_database_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_is_system_database() {
        assert!(is_system_database("postgres"));
        assert!(is_system_database("template0"));
        assert!(is_system_database("template1"));
        assert!(!is_system_database("kgr"));
    }

    #[test]
    fn test_ddl_builders_quote_identifiers() {
        assert_eq!(
            create_template_sql("src", "tpl"),
            "CREATE DATABASE \"tpl\" WITH TEMPLATE \"src\" IS_TEMPLATE = true"
        );
        assert_eq!(
            create_from_template_sql("tpl", "new_db"),
            "CREATE DATABASE \"new_db\" WITH TEMPLATE \"tpl\""
        );
        assert_eq!(drop_database_sql("x\"y"), "DROP DATABASE \"x\"\"y\"");
        assert_eq!(
            truncate_table_sql("public", "roads"),
            "TRUNCATE TABLE \"public\".\"roads\" CASCADE"
        );
    }

    #[test]
    fn test_comment_sql_escapes_literal() {
        assert_eq!(
            comment_on_database_sql("db", "O'Neil's data"),
            "COMMENT ON DATABASE \"db\" IS 'O''Neil''s data'"
        );
    }
}
