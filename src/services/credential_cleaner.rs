// ============================================================================
// 凭据清理：移除 QGS/QGZ 工程中 PostgreSQL 数据源的 user / password
// 原文件保持不变，清理结果写入 `<文件名>_cleaned.<扩展名>`
// ============================================================================

use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::services::datasource::DataSource;
use crate::services::qgz::{read_project_file, write_project_file};
use crate::utils::error::{AppError, AppResult};

/// 清理选项，默认两项都清理
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanOptions {
    pub remove_user: bool,
    pub remove_password: bool,
}

impl Default for CleanOptions {
    fn default() -> Self {
        CleanOptions {
            remove_user: true,
            remove_password: true,
        }
    }
}

/// 预览中的一行：清理前后的数据源
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DatasourceChange {
    pub original: String,
    pub cleaned: String,
}

/// `<datasource>…</datasource>` 正则，(?s) 允许跨行
fn datasource_regex() -> AppResult<Regex> {
    Regex::new(r"(?s)<datasource>(.*?)</datasource>")
        .map_err(|e| AppError::ProjectFileError(format!("正则编译失败：{}", e)))
}

/// 对单个（已反转义的）数据源执行清理，不需要清理时返回 None
fn clean_single(raw: &str, opts: CleanOptions) -> Option<String> {
    let trimmed = raw.trim();
    let mut ds = DataSource::parse(trimmed);
    if !ds.is_postgres() || !ds.has_credentials(opts.remove_user, opts.remove_password) {
        return None;
    }
    ds.strip_credentials(opts.remove_user, opts.remove_password);
    let cleaned = ds.to_string();
    (cleaned != trimmed).then_some(cleaned)
}

fn unescape_text(raw: &str) -> String {
    quick_xml::escape::unescape(raw)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// 预览将被修改的数据源
pub fn preview_changes(xml: &str, opts: CleanOptions) -> AppResult<Vec<DatasourceChange>> {
    let changes = datasource_regex()?
        .captures_iter(xml)
        .filter_map(|caps| {
            let original = unescape_text(&caps[1]).trim().to_string();
            clean_single(&original, opts).map(|cleaned| DatasourceChange { original, cleaned })
        })
        .collect();
    Ok(changes)
}

/// 清理全部数据源，返回 (新 XML, 修改的数据源个数)
pub fn clean_xml(xml: &str, opts: CleanOptions) -> AppResult<(String, usize)> {
    let re = datasource_regex()?;
    let mut changes = 0usize;
    let cleaned = re.replace_all(xml, |caps: &Captures| {
        let original = unescape_text(&caps[1]);
        match clean_single(&original, opts) {
            Some(cleaned) => {
                changes += 1;
                format!(
                    "<datasource>{}</datasource>",
                    quick_xml::escape::partial_escape(&cleaned)
                )
            }
            None => caps[0].to_string(),
        }
    });
    Ok((cleaned.into_owned(), changes))
}

/// 输出路径：`<stem>_cleaned.<ext>`，与原文件同目录
pub fn cleaned_output_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let file_name = match path.extension() {
        Some(ext) => format!("{}_cleaned.{}", stem, ext.to_string_lossy()),
        None => format!("{}_cleaned", stem),
    };
    path.with_file_name(file_name)
}

/// 预览工程文件
pub fn preview_project_file(path: &Path, opts: CleanOptions) -> AppResult<Vec<DatasourceChange>> {
    let doc = read_project_file(path)?;
    preview_changes(&doc.xml, opts)
}

/// 清理结果
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CleanOutcome {
    /// 没有任何修改时为 None，不写文件
    pub output_path: Option<String>,
    pub changes: usize,
}

/// 清理工程文件并写出 `_cleaned` 副本
pub fn clean_project_file(path: &Path, opts: CleanOptions) -> AppResult<CleanOutcome> {
    if !path.exists() {
        return Err(AppError::ValidationError("所选文件不存在".to_string()));
    }
    if !opts.remove_user && !opts.remove_password {
        return Err(AppError::ValidationError(
            "至少需要选择一种要清理的凭据".to_string(),
        ));
    }

    let doc = read_project_file(path)?;
    let (cleaned, changes) = clean_xml(&doc.xml, opts)?;

    if changes == 0 {
        log::info!("文件中未发现需要清理的凭据：{}", path.display());
        return Ok(CleanOutcome {
            output_path: None,
            changes,
        });
    }

    let output = cleaned_output_path(path);
    write_project_file(&output, &doc, &cleaned)?;
    log::info!(
        "已清理 {} 个数据源，输出到 {}（原文件未修改）",
        changes,
        output.display()
    );

    Ok(CleanOutcome {
        output_path: Some(output.to_string_lossy().to_string()),
        changes,
    })
}

// ============================================================================
// 单元测试
// ============================================================================
