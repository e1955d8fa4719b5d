// ============================================================================
// QGZ 工程归档：字节块前缀剥离、解包、替换 .qgs、重新打包
// 纯数据变换，不持有任何状态
// ============================================================================

use std::io::{Cursor, Read, Write};
use std::path::Path;

use crate::utils::error::{AppError, AppResult};

/// ZIP 本地文件头魔数
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// 返回第一个 ZIP 本地文件头的偏移
pub fn find_zip_start(bytes: &[u8]) -> Option<usize> {
    bytes.windows(ZIP_MAGIC.len()).position(|w| w == ZIP_MAGIC)
}

/// 去掉 ZIP 魔数之前的数据（数据库存储工程时可能带有前缀）
pub fn strip_blob_prefix(bytes: &[u8]) -> AppResult<&[u8]> {
    let start = find_zip_start(bytes).ok_or_else(|| {
        AppError::ArchiveError("数据中未找到 ZIP 文件头，无法识别为 QGZ 工程".to_string())
    })?;
    if start > 0 {
        log::debug!("剥离工程数据前缀 {} 字节", start);
    }
    Ok(&bytes[start..])
}

/// 归档中的单个条目
#[derive(Debug, Clone)]
struct ArchiveEntry {
    name: String,
    data: Vec<u8>,
    is_dir: bool,
    stored: bool,
}

/// 内存中的 QGZ 归档
#[derive(Debug, Clone)]
pub struct QgzArchive {
    entries: Vec<ArchiveEntry>,
}

impl QgzArchive {
    /// 从字节解包（自动剥离前缀）
    pub fn from_bytes(bytes: &[u8]) -> AppResult<Self> {
        let bytes = strip_blob_prefix(bytes)?;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = Vec::with_capacity(archive.len());

        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            entries.push(ArchiveEntry {
                name: file.name().to_string(),
                is_dir: file.is_dir(),
                stored: file.compression() == zip::CompressionMethod::Stored,
                data,
            });
        }

        Ok(QgzArchive { entries })
    }

    /// 以单个 .qgs 条目新建归档
    pub fn with_project(entry_name: &str, xml: &str) -> Self {
        QgzArchive {
            entries: vec![ArchiveEntry {
                name: entry_name.to_string(),
                data: xml.as_bytes().to_vec(),
                is_dir: false,
                stored: false,
            }],
        }
    }

    fn project_index(&self) -> AppResult<usize> {
        self.entries
            .iter()
            .position(|e| !e.is_dir && e.name.to_lowercase().ends_with(".qgs"))
            .ok_or_else(|| AppError::ArchiveError("QGZ 归档中没有 .qgs 文件".to_string()))
    }

    /// .qgs 条目名称
    pub fn project_entry(&self) -> AppResult<&str> {
        let idx = self.project_index()?;
        Ok(&self.entries[idx].name)
    }

    /// .qgs 内容（UTF-8）
    pub fn project_xml(&self) -> AppResult<String> {
        let idx = self.project_index()?;
        String::from_utf8(self.entries[idx].data.clone()).map_err(|e| {
            AppError::ProjectFileError(format!("工程文件不是有效的 UTF-8：{}", e))
        })
    }

    /// 替换 .qgs 内容，其余条目不动
    pub fn replace_project_xml(&mut self, xml: &str) -> AppResult<()> {
        let idx = self.project_index()?;
        self.entries[idx].data = xml.as_bytes().to_vec();
        Ok(())
    }

    /// 条目名称列表
    #[cfg(test)]
    pub(crate) fn entry_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// 重新打包为 ZIP 字节
    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));

        for entry in &self.entries {
            let method = if entry.stored {
                zip::CompressionMethod::Stored
            } else {
                zip::CompressionMethod::Deflated
            };
            let options = zip::write::SimpleFileOptions::default().compression_method(method);

            if entry.is_dir {
                writer.add_directory(entry.name.trim_end_matches('/'), options)?;
            } else {
                writer.start_file(entry.name.as_str(), options)?;
                writer.write_all(&entry.data)?;
            }
        }

        let cursor = writer.finish()?;
        Ok(cursor.into_inner())
    }
}

// ============================================================================
// 工程文件读写（.qgs / .qgz）
// ============================================================================

/// 工程文件容器类型
#[derive(Debug, Clone)]
pub enum ProjectContainer {
    Qgs,
    Qgz(QgzArchive),
}

/// 已读入内存的工程文件
#[derive(Debug, Clone)]
pub struct ProjectDocument {
    pub xml: String,
    pub container: ProjectContainer,
}

/// 是否为 .qgz 路径（大小写不敏感）
pub fn is_qgz_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("qgz"))
        .unwrap_or(false)
}

/// 读取 .qgs 或 .qgz 工程文件
pub fn read_project_file(path: &Path) -> AppResult<ProjectDocument> {
    if !path.is_file() {
        return Err(AppError::ProjectFileError(format!(
            "工程文件不存在：{}",
            path.display()
        )));
    }

    if is_qgz_path(path) {
        let bytes = std::fs::read(path)?;
        let archive = QgzArchive::from_bytes(&bytes)?;
        log::debug!(
            "读取 {} 中的工程条目 {}",
            path.display(),
            archive.project_entry()?
        );
        let xml = archive.project_xml()?;
        Ok(ProjectDocument {
            xml,
            container: ProjectContainer::Qgz(archive),
        })
    } else {
        let xml = std::fs::read_to_string(path)?;
        Ok(ProjectDocument {
            xml,
            container: ProjectContainer::Qgs,
        })
    }
}

/// 按输出路径的扩展名写回工程文件
///
/// 输出为 .qgz 时：源文件是 qgz 则沿用其全部附属条目，否则新建只含一个
/// .qgs 条目的归档，条目名取输出文件名。
pub fn write_project_file(path: &Path, doc: &ProjectDocument, xml: &str) -> AppResult<()> {
    if is_qgz_path(path) {
        let archive = match &doc.container {
            ProjectContainer::Qgz(source) => {
                let mut archive = source.clone();
                archive.replace_project_xml(xml)?;
                archive
            }
            ProjectContainer::Qgs => {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("project");
                QgzArchive::with_project(&format!("{}.qgs", stem), xml)
            }
        };
        std::fs::write(path, archive.to_bytes()?)?;
    } else {
        std::fs::write(path, xml)?;
    }
    Ok(())
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const SAMPLE_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<qgis><datasource>dbname='gis' user='u'</datasource></qgis>\n";

    /// 构造一个包含 .qgs 与 .qgd 附属数据的 qgz
    pub(crate) fn sample_qgz_bytes() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let deflated = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        let stored = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("demo.qgs", deflated).unwrap();
        writer.write_all(SAMPLE_XML.as_bytes()).unwrap();
        writer.start_file("demo.qgd", stored).unwrap();
        writer.write_all(&[0u8, 1, 2, 3, 255]).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_find_zip_start_with_prefix() {
        let mut blob = b"\\x0000prefix".to_vec();
        let offset = blob.len();
        blob.extend_from_slice(&sample_qgz_bytes());
        assert_eq!(find_zip_start(&blob), Some(offset));
        assert_eq!(strip_blob_prefix(&blob).unwrap().len(), blob.len() - offset);
    }

    #[test]
    fn test_strip_blob_prefix_without_magic() {
        let err = strip_blob_prefix(b"not a zip").unwrap_err();
        assert!(matches!(err, AppError::ArchiveError(_)));
    }

    #[test]
    fn test_archive_roundtrip_keeps_aux_entries() {
        let mut blob = b"PREFIX".to_vec();
        blob.extend_from_slice(&sample_qgz_bytes());

        let mut archive = QgzArchive::from_bytes(&blob).unwrap();
        assert_eq!(archive.project_entry().unwrap(), "demo.qgs");
        assert_eq!(archive.project_xml().unwrap(), SAMPLE_XML);

        archive.replace_project_xml("<qgis/>").unwrap();
        let repacked = archive.to_bytes().unwrap();
        assert_eq!(find_zip_start(&repacked), Some(0));

        let reread = QgzArchive::from_bytes(&repacked).unwrap();
        assert_eq!(reread.project_xml().unwrap(), "<qgis/>");
        assert_eq!(reread.entry_names(), vec!["demo.qgs", "demo.qgd"]);
        let aux = reread.entries.iter().find(|e| e.name == "demo.qgd").unwrap();
        assert_eq!(aux.data, vec![0u8, 1, 2, 3, 255]);
        assert!(aux.stored);
    }

    #[test]
    fn test_archive_without_qgs_entry() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("readme.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"hi").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let archive = QgzArchive::from_bytes(&bytes).unwrap();
        assert!(archive.project_xml().is_err());
    }

    #[test]
    fn test_read_write_project_files() {
        let dir = TempDir::new().unwrap();
        let qgz = dir.path().join("demo.qgz");
        std::fs::write(&qgz, sample_qgz_bytes()).unwrap();

        let doc = read_project_file(&qgz).unwrap();
        assert_eq!(doc.xml, SAMPLE_XML);

        let out = dir.path().join("demo_out.qgz");
        write_project_file(&out, &doc, "<qgis version=\"3\"/>").unwrap();
        let reread = read_project_file(&out).unwrap();
        assert_eq!(reread.xml, "<qgis version=\"3\"/>");

        // qgs 输入写成 qgz 时，条目名取输出文件名
        let qgs = dir.path().join("plain.qgs");
        std::fs::write(&qgs, SAMPLE_XML).unwrap();
        let doc = read_project_file(&qgs).unwrap();
        let packed = dir.path().join("packed.qgz");
        write_project_file(&packed, &doc, &doc.xml).unwrap();
        let archive = QgzArchive::from_bytes(&std::fs::read(&packed).unwrap()).unwrap();
        assert_eq!(archive.project_entry().unwrap(), "packed.qgs");
    }

    #[test]
    fn test_read_missing_project_file() {
        let dir = TempDir::new().unwrap();
        assert!(read_project_file(&dir.path().join("nope.qgs")).is_err());
    }
}
