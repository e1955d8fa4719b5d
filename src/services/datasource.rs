// ============================================================================
// QGIS 数据源字符串（provider URI）解析与改写
// ============================================================================
//
// QGIS 在工程 XML 中以 `key=value` 序列描述 PostgreSQL 图层连接，例如：
//   dbname='gis' host=db.local port=5432 user='admin' sslmode=disable
//   key='id' srid=4326 type=Point table="public"."roads" (geom) sql=
//
// 解析结果保留原始顺序和原始引号形式，未改动的部分格式化后保持不变。
// `sql=` 的值一直延伸到字符串末尾，其中的空白原样保留。

use serde::{Deserialize, Serialize};

/// 需要加单引号输出的键（与 QGIS 自身的输出习惯一致）
const QUOTED_KEYS: &[&str] = &["dbname", "user", "password"];

/// 覆盖顺序：新增键时按此顺序插入
const OVERRIDE_KEYS: &[&str] = &["dbname", "host", "port", "user", "password"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// `key=value`，value 保留原始引号
    Pair { key: String, value: String },
    /// 无 `=` 的片段，如 `(geom)`
    Bare(String),
}

/// 用于修复工程图层连接的新参数，None 表示保持不变
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionOverrides {
    pub dbname: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub schema: Option<String>,
}

impl ConnectionOverrides {
    /// 是否一个参数都没有指定
    pub fn is_empty(&self) -> bool {
        self.dbname.is_none()
            && self.host.is_none()
            && self.port.is_none()
            && self.user.is_none()
            && self.password.is_none()
            && self.schema.is_none()
    }

    fn value_for(&self, key: &str) -> Option<&str> {
        match key {
            "dbname" => self.dbname.as_deref(),
            "host" => self.host.as_deref(),
            "port" => self.port.as_deref(),
            "user" => self.user.as_deref(),
            "password" => self.password.as_deref(),
            _ => None,
        }
    }
}

/// 解析后的数据源
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    tokens: Vec<Token>,
}

impl DataSource {
    /// 解析数据源字符串，不会失败：无法识别的片段作为裸片段保留
    pub fn parse(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let n = chars.len();
        let mut tokens = Vec::new();
        let mut i = 0;

        while i < n {
            while i < n && chars[i].is_whitespace() {
                i += 1;
            }
            if i >= n {
                break;
            }

            let start = i;
            while i < n
                && !chars[i].is_whitespace()
                && chars[i] != '='
                && chars[i] != '\''
                && chars[i] != '"'
            {
                i += 1;
            }

            if i < n && chars[i] == '=' && i > start {
                let key: String = chars[start..i].iter().collect();
                i += 1;
                let value = if key == "sql" {
                    let rest: String = chars[i..].iter().collect();
                    i = n;
                    rest.trim_end().to_string()
                } else {
                    read_value(&chars, &mut i)
                };
                tokens.push(Token::Pair { key, value });
            } else {
                i = start;
                tokens.push(Token::Bare(read_value(&chars, &mut i)));
            }
        }

        DataSource { tokens }
    }

    /// 取值（去掉单引号包裹与反斜杠转义）
    ///
    /// `sql=` 是原样的 SQL 表达式，不做去引号处理。
    pub fn get(&self, key: &str) -> Option<String> {
        if key == "sql" {
            return self.raw(key).map(str::to_string);
        }
        self.raw(key).map(unquote)
    }

    fn raw(&self, key: &str) -> Option<&str> {
        self.tokens.iter().find_map(|t| match t {
            Token::Pair { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.raw(key).is_some()
    }

    /// 含 dbname 键即视为 PostgreSQL 连接
    pub fn is_postgres(&self) -> bool {
        self.has_key("dbname")
    }

    /// 是否包含待清理的凭据
    pub fn has_credentials(&self, remove_user: bool, remove_password: bool) -> bool {
        (remove_user && self.has_key("user")) || (remove_password && self.has_key("password"))
    }

    /// 删除 user / password 键值对（无论是否带引号），返回删除的个数
    pub fn strip_credentials(&mut self, remove_user: bool, remove_password: bool) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|t| match t {
            Token::Pair { key, .. } => {
                !((remove_user && key == "user") || (remove_password && key == "password"))
            }
            Token::Bare(_) => true,
        });
        before - self.tokens.len()
    }

    /// 设置某个键的值；键不存在时插入到 `table=`（或 `sql=`）之前
    pub fn set(&mut self, key: &str, value: &str) {
        let formatted = format_value(key, value);
        if let Some(Token::Pair { value: v, .. }) = self
            .tokens
            .iter_mut()
            .find(|t| matches!(t, Token::Pair { key: k, .. } if k == key))
        {
            *v = formatted;
            return;
        }

        let insert_at = self
            .tokens
            .iter()
            .position(|t| matches!(t, Token::Pair { key: k, .. } if k == "table" || k == "sql"))
            .unwrap_or(self.tokens.len());
        self.tokens.insert(
            insert_at,
            Token::Pair {
                key: key.to_string(),
                value: formatted,
            },
        );
    }

    /// 应用新的连接参数，返回数据源是否发生变化
    pub fn apply_params(&mut self, overrides: &ConnectionOverrides) -> bool {
        let before = self.to_string();

        for key in OVERRIDE_KEYS {
            if let Some(value) = overrides.value_for(key) {
                self.set(key, value);
            }
        }

        if let Some(schema) = overrides.schema.as_deref() {
            self.set_schema(schema);
        }

        self.to_string() != before
    }

    /// 解析 `table="schema"."table" (geom)`，返回 (schema, table, 几何列)
    pub fn table_ref(&self) -> Option<(String, String, Option<String>)> {
        let idx = self
            .tokens
            .iter()
            .position(|t| matches!(t, Token::Pair { key, .. } if key == "table"))?;
        let raw = match &self.tokens[idx] {
            Token::Pair { value, .. } => value.as_str(),
            Token::Bare(_) => return None,
        };

        let parts = split_qualified(raw);
        let (schema, table) = match parts.as_slice() {
            [table] => ("public".to_string(), table.clone()),
            [schema, table] => (schema.clone(), table.clone()),
            _ => return None,
        };

        let geometry = match self.tokens.get(idx + 1) {
            Some(Token::Bare(b)) if b.starts_with('(') && b.ends_with(')') && b.len() > 2 => {
                Some(b[1..b.len() - 1].to_string())
            }
            _ => None,
        };

        Some((schema, table, geometry))
    }

    /// 改写 `table=` 中的 schema 部分，无 `table=` 时不做处理
    pub fn set_schema(&mut self, schema: &str) {
        let table = match self.table_ref() {
            Some((_, table, _)) => table,
            None => return,
        };
        let value = format!("{}.{}", quote_identifier(schema), quote_identifier(&table));
        for t in self.tokens.iter_mut() {
            if let Token::Pair { key, value: v } = t {
                if key == "table" {
                    *v = value;
                    break;
                }
            }
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for t in &self.tokens {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match t {
                Token::Pair { key, value } => write!(f, "{}={}", key, value)?,
                Token::Bare(b) => f.write_str(b)?,
            }
        }
        Ok(())
    }
}

/// 读取一个值：空白结束，单/双引号内的空白不结束
fn read_value(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    let n = chars.len();
    let mut in_single = false;
    let mut in_double = false;

    while *i < n {
        let c = chars[*i];
        if in_single {
            if c == '\\' && *i + 1 < n {
                *i += 2;
                continue;
            }
            if c == '\'' {
                in_single = false;
            }
        } else if in_double {
            if c == '"' {
                in_double = false;
            }
        } else if c.is_whitespace() {
            break;
        } else if c == '\'' {
            in_single = true;
        } else if c == '"' {
            in_double = true;
        }
        *i += 1;
    }

    chars[start..*i].iter().collect()
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        raw.to_string()
    }
}

fn format_value(key: &str, value: &str) -> String {
    let needs_quotes = QUOTED_KEYS.contains(&key)
        || value.is_empty()
        || value.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"');
    if needs_quotes {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    } else {
        value.to_string()
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// 拆分 `"a"."b"` 或 `a.b` 形式的限定名
fn split_qualified(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            '.' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

// ============================================================================
// 单元测试
// ============================================================================
