// ============================================================================
// 工程连接修复：改写数据库中保存的 QGZ 工程里的 PostgreSQL 连接参数
// 纯数据变换：字节块进，字节块出
// ============================================================================

use regex::{Captures, Regex};
use sha2::{Digest, Sha256};

use crate::services::datasource::{ConnectionOverrides, DataSource};
use crate::services::qgz::QgzArchive;
use crate::utils::error::{AppError, AppResult};

fn compile(pattern: &str) -> AppResult<Regex> {
    Regex::new(pattern).map_err(|e| AppError::ProjectFileError(format!("正则编译失败：{}", e)))
}

/// 对一个已反转义的数据源应用新参数，不是 PostgreSQL 或无变化时返回 None
fn repair_single(raw: &str, overrides: &ConnectionOverrides) -> Option<String> {
    let trimmed = raw.trim();
    let mut ds = DataSource::parse(trimmed);
    if !ds.is_postgres() {
        return None;
    }
    ds.apply_params(overrides).then(|| ds.to_string())
}

fn unescape(raw: &str) -> String {
    quick_xml::escape::unescape(raw)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// 改写工程 XML 中全部 PostgreSQL 数据源，返回 (新 XML, 改写的 <datasource> 个数)
///
/// `source="…"` 属性（图层树等处的引用）同样改写，但不计入图层数。
pub fn repair_xml(xml: &str, overrides: &ConnectionOverrides) -> AppResult<(String, usize)> {
    let datasource_re = compile(r"(?s)<datasource>(.*?)</datasource>")?;
    let source_attr_re = compile(r#"(\ssource=)"([^"]*)""#)?;

    let mut layers_updated = 0usize;
    let xml = datasource_re.replace_all(xml, |caps: &Captures| {
        match repair_single(&unescape(&caps[1]), overrides) {
            Some(fixed) => {
                layers_updated += 1;
                format!(
                    "<datasource>{}</datasource>",
                    quick_xml::escape::partial_escape(&fixed)
                )
            }
            None => caps[0].to_string(),
        }
    });

    let xml = source_attr_re.replace_all(&xml, |caps: &Captures| {
        match repair_single(&unescape(&caps[2]), overrides) {
            Some(fixed) => format!("{}\"{}\"", &caps[1], quick_xml::escape::escape(&fixed)),
            None => caps[0].to_string(),
        }
    });

    Ok((xml.into_owned(), layers_updated))
}

/// 修复数据库中保存的工程字节块
///
/// 1. 剥离 ZIP 魔数前的前缀
/// 2. 解包，改写 .qgs
/// 3. 重新打包（其余条目原样保留）
///
/// XML 没有变化时原样返回输入字节块，调用方据此跳过回写。
pub fn repair_project_blob(
    blob: &[u8],
    overrides: &ConnectionOverrides,
) -> AppResult<(Vec<u8>, usize)> {
    if overrides.is_empty() {
        return Err(AppError::ValidationError(
            "请至少指定一个要更新的连接参数".to_string(),
        ));
    }

    let mut archive = QgzArchive::from_bytes(blob)?;
    let xml = archive.project_xml()?;
    let (fixed, layers_updated) = repair_xml(&xml, overrides)?;
    if fixed == xml {
        log::info!("工程中没有需要更新的 PostgreSQL 数据源");
        return Ok((blob.to_vec(), layers_updated));
    }
    archive.replace_project_xml(&fixed)?;
    Ok((archive.to_bytes()?, layers_updated))
}

/// 内容摘要（SHA-256 十六进制），用于判断是否需要回写
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ============================================================================
// 单元测试
// ============================================================================
