// ============================================================================
// 目录复制：便携归档时把工程目录的附属文件复制到输出目录
// 纯 Rust 函数，方便单元测试
// ============================================================================

use std::path::Path;

use crate::utils::error::{AppError, AppResult};

/// 递归复制目录及其所有内容到目标路径
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> AppResult<()> {
    std::fs::create_dir_all(dst).map_err(|e| {
        AppError::ArchiveError(format!("复制文件时出错 - 无法创建目录 {}: {}", dst.display(), e))
    })?;

    for entry in walkdir::WalkDir::new(src) {
        let entry = entry
            .map_err(|e| AppError::ArchiveError(format!("复制文件时出错 - 遍历目录失败: {}", e)))?;

        let relative_path = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| AppError::ArchiveError(format!("复制文件时出错 - 路径处理失败: {}", e)))?;
        let target_path = dst.join(relative_path);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target_path).map_err(|e| {
                AppError::ArchiveError(format!(
                    "复制文件时出错 - 无法创建目录 {}: {}",
                    target_path.display(),
                    e
                ))
            })?;
        } else {
            std::fs::copy(entry.path(), &target_path).map_err(|e| {
                AppError::ArchiveError(format!(
                    "复制文件时出错 - 无法复制 {} 到 {}: {}",
                    entry.path().display(),
                    target_path.display(),
                    e
                ))
            })?;
        }
    }

    Ok(())
}

/// 两个路径是否指向同一目录
pub fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// 复制工程目录的顶层条目（跳过 `skip_name` 与输出目录本身）
///
/// 目标中已存在的同名目录先删除再复制，返回复制的条目名。
pub fn copy_project_dir(src: &Path, dst: &Path, skip_name: &str) -> AppResult<Vec<String>> {
    let mut copied = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(src)
        .map_err(|e| {
            AppError::ArchiveError(format!("无法读取工程目录 {}: {}", src.display(), e))
        })?
        .collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        if name == skip_name || same_dir(&path, dst) {
            continue;
        }

        let target = dst.join(&name);
        if path.is_dir() {
            if target.exists() {
                std::fs::remove_dir_all(&target)?;
            }
            copy_dir_recursive(&path, &target)?;
        } else {
            std::fs::copy(&path, &target).map_err(|e| {
                AppError::ArchiveError(format!("复制文件时出错 - 无法复制 {}: {}", name, e))
            })?;
        }
        log::debug!("已复制 {}", name);
        copied.push(name);
    }

    Ok(copied)
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// 测试递归复制保留目录结构和文件内容
    #[test]
    fn test_copy_dir_recursive_basic() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();

        std::fs::create_dir_all(src.path().join("svg/icons")).unwrap();
        std::fs::write(src.path().join("svg/icons/a.svg"), "<svg/>").unwrap();
        std::fs::write(src.path().join("readme.txt"), "hi").unwrap();

        let target = dst.path().join("copy");
        copy_dir_recursive(src.path(), &target).unwrap();

        assert_eq!(std::fs::read_to_string(target.join("svg/icons/a.svg")).unwrap(), "<svg/>");
        assert_eq!(std::fs::read_to_string(target.join("readme.txt")).unwrap(), "hi");
    }

    /// 测试跳过工程文件、替换已有目录
    #[test]
    fn test_copy_project_dir_skips_project_and_replaces_dirs() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();

        std::fs::write(src.path().join("city.qgz"), "zip").unwrap();
        std::fs::write(src.path().join("points.csv"), "x,y").unwrap();
        std::fs::create_dir_all(src.path().join("styles")).unwrap();
        std::fs::write(src.path().join("styles/new.qml"), "new").unwrap();

        std::fs::create_dir_all(dst.path().join("styles")).unwrap();
        std::fs::write(dst.path().join("styles/stale.qml"), "old").unwrap();

        let copied = copy_project_dir(src.path(), dst.path(), "city.qgz").unwrap();
        assert_eq!(copied, vec!["points.csv", "styles"]);
        assert!(!dst.path().join("city.qgz").exists());
        assert!(dst.path().join("styles/new.qml").exists());
        assert!(!dst.path().join("styles/stale.qml").exists());
    }

    /// 测试输出目录位于工程目录内部时不会自我复制
    #[test]
    fn test_copy_project_dir_skips_nested_output() {
        let src = TempDir::new().unwrap();
        let out = src.path().join("portable");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(src.path().join("a.txt"), "a").unwrap();

        let copied = copy_project_dir(src.path(), &out, "p.qgs").unwrap();
        assert_eq!(copied, vec!["a.txt"]);
        assert!(!out.join("portable").exists());
    }

    #[test]
    fn test_same_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join(".");
        assert!(same_dir(dir.path(), &nested));
        assert!(!same_dir(dir.path(), &dir.path().join("other")));
    }
}
