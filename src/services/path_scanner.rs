// ============================================================================
// 绝对路径检测与 CSV 路径相对化
// 便携工程输出后，扫描残留的 Windows 绝对路径供人工复核
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use regex::Regex;

use crate::utils::error::{AppError, AppResult};

/// 路径分类 → 去重排序后的路径
pub type PathReport = BTreeMap<String, BTreeSet<String>>;

pub const CATEGORY_CSV: &str = "CSV File References";
pub const CATEGORY_MEDIA: &str = "Image/Document References";
pub const CATEGORY_UI: &str = "UI Preferences/Directories";
pub const CATEGORY_OTHER: &str = "Other File Paths";

const MEDIA_EXTENSIONS: &[&str] = &[".svg", ".png", ".jpg", ".jpeg", ".tiff", ".pdf"];
const UI_KEYWORDS: &[&str] = &["browse", "export", "layout"];

fn compile(pattern: &str) -> AppResult<Regex> {
    Regex::new(pattern).map_err(|e| AppError::ProjectFileError(format!("正则编译失败：{}", e)))
}

/// 是否像一个需要关注的文件路径（排除 URL、命名空间、DTD 等）
fn is_likely_absolute_path(path: &str, skip: &Regex) -> bool {
    if skip.is_match(path) {
        return false;
    }
    path.len() > 3
        && (path.contains('/') || path.contains('\\'))
        && !path.starts_with("www.")
        && !path.ends_with(".org")
        && !path.ends_with(".com")
}

/// 按扩展名与关键字归类
pub fn categorize_path(path: &str) -> &'static str {
    let lower = path.to_lowercase();
    if lower.contains(".csv") {
        CATEGORY_CSV
    } else if MEDIA_EXTENSIONS.iter().any(|ext| lower.contains(ext)) {
        CATEGORY_MEDIA
    } else if UI_KEYWORDS.iter().any(|k| lower.contains(k)) {
        CATEGORY_UI
    } else {
        CATEGORY_OTHER
    }
}

/// 检测工程 XML 中残留的 Windows 绝对路径
///
/// `file:///X:/…` 形式的 URI 通过其中的盘符路径部分被同样识别。
pub fn detect_absolute_paths(xml: &str) -> AppResult<PathReport> {
    let drive_path = compile(r#"[A-Z]:[/\\][^"\s<>]*"#)?;
    let skip = compile(
        r"(?i)^https?://|^ftp://|xmlns|\.xsd$|\.dtd$|^qgis\.org|postgresql://|postgis:",
    )?;

    let mut found = PathReport::new();
    for m in drive_path.find_iter(xml) {
        let path = m.as_str();
        if !is_likely_absolute_path(path, &skip) {
            continue;
        }
        found
            .entry(categorize_path(path).to_string())
            .or_default()
            .insert(path.to_string());
    }
    Ok(found)
}

/// 把 LayerSource 选项中指向绝对路径的 CSV 改为相对路径
///
/// 仅当同名 CSV 已存在于输出目录时才替换，返回 (新 XML, 替换个数)。
pub fn relativize_csv_sources(xml: &str, output_dir: &Path) -> AppResult<(String, usize)> {
    let re = compile(r#"<Option name="LayerSource"[^>]*value="file:///([A-Z]:[/\\][^"]*\.csv[^"]*)""#)?;

    let mut updated = xml.to_string();
    let mut conversions = 0usize;
    let mut seen = BTreeSet::new();

    for caps in re.captures_iter(xml) {
        let csv_path = &caps[1];
        if !seen.insert(csv_path.to_string()) {
            continue;
        }
        let (file_part, query) = match csv_path.split_once('?') {
            Some((file, query)) => (file, Some(query)),
            None => (csv_path, None),
        };
        let file_name = match file_part.rsplit(['/', '\\']).next() {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        if !output_dir.join(file_name).exists() {
            log::debug!("输出目录中没有 {}，保留绝对路径", file_name);
            continue;
        }

        let new_source = match query {
            Some(q) => format!("file:///./{}?{}", file_name, q),
            None => format!("file:///./{}", file_name),
        };
        updated = updated.replace(&format!("file:///{}", csv_path), &new_source);
        conversions += 1;
        log::info!("CSV 路径已改为相对路径：{}", file_name);
    }

    Ok((updated, conversions))
}

/// 生成人工复核提示，每类最多列出 `max_examples` 个示例
pub fn summarize_paths(found: &PathReport, max_examples: usize) -> String {
    if found.is_empty() {
        return String::new();
    }

    let total: usize = found.values().map(|p| p.len()).sum();
    let mut lines = vec![
        "Manual review required: some absolute file paths remain in the portable project."
            .to_string(),
        String::new(),
    ];

    for (category, paths) in found {
        lines.push(format!("{} ({} path(s)):", category, paths.len()));
        for path in paths.iter().take(max_examples) {
            lines.push(format!("  - {}", path));
        }
        if paths.len() > max_examples {
            lines.push(format!("  ... and {} more", paths.len() - max_examples));
        }
        lines.push(String::new());
    }

    lines.push("What you should do:".to_string());
    lines.push(
        "  - CSV files: copy them into the project folder and use relative paths".to_string(),
    );
    lines.push("  - UI preferences: usually safe to ignore".to_string());
    lines.push(
        "  - Images/documents: copy referenced files into the project folder if needed".to_string(),
    );
    lines.push("  - Other paths: review and update as needed".to_string());
    lines.push(String::new());
    lines.push(format!("Total paths found: {}", total));

    lines.join("\n")
}

// ============================================================================
// 单元测试
// ============================================================================
