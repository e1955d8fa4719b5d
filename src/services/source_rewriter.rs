// ============================================================================
// 工程数据源重写：把 PostgreSQL 图层改指向 GeoPackage，并清除连接凭据
// ============================================================================
//
// 基于 quick-xml 的流式重写：未涉及的事件原样输出（XML 声明、DOCTYPE、
// 注释、未改动的元素保持字节不变），只有需要改写的元素才重新序列化。
//
// 引用图层数据源的位置：
// - <maplayer> 的 <datasource> / <provider> 子元素
// - <layer-tree-layer id source providerKey>
// - <relation referencingLayer referencedLayer dataSource providerKey>
// - <Layer source provider>（布局、主题中的图层引用）
// - <LayerStyle layerid source provider>
// - <Atlas coverageLayer coverageLayerSource coverageLayerProvider>
// - <ProjectGpsSettings destinationLayer destinationLayerSource destinationLayerProvider>
// - <Option name="LayerProviderName" value="postgres"/>

use std::collections::HashMap;

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use crate::services::datasource::DataSource;
use crate::services::project_layers::LayerInfo;
use crate::services::OGR_PROVIDER;
use crate::utils::error::{AppError, AppResult};

/// 重写选项
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
pub struct RewriteOptions {
    /// 清除所有 PostgreSQL 数据源中的 user / password
    pub strip_credentials: bool,
    /// 工程中全部 PostgreSQL 图层都已转换时，连带改写 LayerProviderName 选项
    pub convert_all_provider_refs: bool,
}

/// 重写结果
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RewriteReport {
    pub xml: String,
    /// 实际改写了 <datasource> 的 maplayer 个数
    pub layers_rewritten: usize,
    /// 删除的 user / password 键值对个数
    pub credentials_removed: usize,
}

/// 去掉凭据后的规范化数据源，用于按内容匹配图层
fn normalized_source(source: &str) -> String {
    let mut ds = DataSource::parse(source);
    ds.strip_credentials(true, true);
    ds.to_string()
}

/// 对含 dbname= 的字符串清除凭据，返回 (新值, 删除个数)
fn strip_source_credentials(value: &str) -> (String, usize) {
    if !value.contains("dbname=") {
        return (value.to_string(), 0);
    }
    let mut ds = DataSource::parse(value.trim());
    let removed = ds.strip_credentials(true, true);
    if removed == 0 {
        (value.to_string(), 0)
    } else {
        (ds.to_string(), removed)
    }
}

/// 改写上下文
struct Rewriter<'a> {
    new_sources: &'a HashMap<String, String>,
    by_original_source: HashMap<String, &'a str>,
    opts: RewriteOptions,
    credentials_removed: usize,
}

impl<'a> Rewriter<'a> {
    fn new(
        new_sources: &'a HashMap<String, String>,
        layers: &[LayerInfo],
        opts: RewriteOptions,
    ) -> Self {
        let by_original_source = layers
            .iter()
            .filter_map(|l| {
                new_sources
                    .get(&l.id)
                    .map(|s| (normalized_source(&l.datasource), s.as_str()))
            })
            .collect();
        Rewriter {
            new_sources,
            by_original_source,
            opts,
            credentials_removed: 0,
        }
    }

    fn source_for(&self, layer_id: Option<&str>) -> Option<&'a str> {
        layer_id
            .and_then(|id| self.new_sources.get(id))
            .map(|s| s.as_str())
    }

    /// 计算元素的新属性；无变化时返回 None，调用方原样输出
    fn rewrite_element(&mut self, e: &BytesStart) -> AppResult<Option<BytesStart<'static>>> {
        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut attrs: Vec<(String, String)> = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|err| {
                AppError::ProjectFileError(format!("属性解析失败（{}）：{}", tag, err))
            })?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attrs.push((key, value));
        }
        let original = attrs.clone();

        let get = |attrs: &[(String, String)], key: &str| -> Option<String> {
            attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        };

        match tag.as_str() {
            "layer-tree-layer" => {
                if let Some(src) = self.source_for(get(&attrs, "id").as_deref()) {
                    set_attr(&mut attrs, "providerKey", OGR_PROVIDER);
                    set_attr(&mut attrs, "source", src);
                }
            }
            "relation" => {
                let referencing = self.source_for(get(&attrs, "referencingLayer").as_deref());
                let referenced = self.source_for(get(&attrs, "referencedLayer").as_deref());
                // 两端都已转换时以被引用图层为准
                if let Some(src) = referenced.or(referencing) {
                    set_attr(&mut attrs, "dataSource", src);
                    set_attr(&mut attrs, "providerKey", OGR_PROVIDER);
                }
            }
            "Layer" => {
                if let Some(source) = get(&attrs, "source") {
                    if source.to_lowercase().contains("postgres") || source.contains("dbname=") {
                        let matched = self
                            .source_for(get(&attrs, "id").as_deref())
                            .or_else(|| {
                                self.by_original_source
                                    .get(&normalized_source(&source))
                                    .copied()
                            });
                        if let Some(src) = matched {
                            set_attr(&mut attrs, "source", src);
                            set_attr(&mut attrs, "provider", OGR_PROVIDER);
                        }
                    }
                }
            }
            "LayerStyle" => {
                if let Some(src) = self.source_for(get(&attrs, "layerid").as_deref()) {
                    set_attr(&mut attrs, "source", src);
                    set_attr(&mut attrs, "provider", OGR_PROVIDER);
                }
            }
            "Atlas" => {
                if let Some(src) = self.source_for(get(&attrs, "coverageLayer").as_deref()) {
                    set_attr(&mut attrs, "coverageLayerSource", src);
                    set_attr(&mut attrs, "coverageLayerProvider", OGR_PROVIDER);
                }
            }
            "ProjectGpsSettings" => {
                if let Some(src) = self.source_for(get(&attrs, "destinationLayer").as_deref()) {
                    set_attr(&mut attrs, "destinationLayerSource", src);
                    set_attr(&mut attrs, "destinationLayerProvider", OGR_PROVIDER);
                }
            }
            "Option" => {
                if self.opts.convert_all_provider_refs
                    && get(&attrs, "name").as_deref() == Some("LayerProviderName")
                    && get(&attrs, "value").as_deref() == Some("postgres")
                {
                    set_attr(&mut attrs, "value", OGR_PROVIDER);
                }
            }
            _ => {}
        }

        if self.opts.strip_credentials {
            for (_, value) in attrs.iter_mut() {
                let (cleaned, removed) = strip_source_credentials(value);
                if removed > 0 {
                    *value = cleaned;
                    self.credentials_removed += removed;
                }
            }
        }

        if attrs == original {
            return Ok(None);
        }

        let mut start = BytesStart::new(tag);
        for (k, v) in &attrs {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        Ok(Some(start))
    }
}

fn set_attr(attrs: &mut Vec<(String, String)>, key: &str, value: &str) {
    match attrs.iter_mut().find(|(k, _)| k == key) {
        Some((_, v)) => *v = value.to_string(),
        None => attrs.push((key.to_string(), value.to_string())),
    }
}

/// maplayer 中需要整体替换文本的子元素
#[derive(Clone, Copy, PartialEq, Eq)]
enum MapField {
    Datasource,
    Provider,
}

/// 当前所在的 maplayer
struct OpenLayer {
    depth: usize,
    new_source: Option<String>,
    replaced: bool,
}

/// 重写工程 XML
///
/// `layers` 需为同一份 XML 的 `scan_layers` 结果，按出现顺序与 <maplayer> 对应。
pub fn rewrite_sources(
    xml: &str,
    new_sources: &HashMap<String, String>,
    layers: &[LayerInfo],
    opts: RewriteOptions,
) -> AppResult<RewriteReport> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut rewriter = Rewriter::new(new_sources, layers, opts);

    let mut depth = 0usize;
    let mut maplayer_index = 0usize;
    let mut open_layer: Option<OpenLayer> = None;
    // (字段类型, 是否已写入替换文本)
    let mut field: Option<(MapField, bool)> = None;
    let mut layers_rewritten = 0usize;

    loop {
        let event = reader.read_event()?;
        match event {
            Event::Start(e) => {
                depth += 1;
                let is_maplayer = e.name().as_ref() == b"maplayer";

                if open_layer.is_none() && is_maplayer {
                    let new_source = layers
                        .get(maplayer_index)
                        .and_then(|l| new_sources.get(&l.id))
                        .cloned();
                    maplayer_index += 1;
                    open_layer = Some(OpenLayer {
                        depth,
                        new_source,
                        replaced: false,
                    });
                } else if let Some(layer) = &open_layer {
                    if layer.new_source.is_some() && depth == layer.depth + 1 {
                        field = match e.name().as_ref() {
                            b"datasource" => Some((MapField::Datasource, false)),
                            b"provider" => Some((MapField::Provider, false)),
                            _ => None,
                        };
                    }
                }

                match rewriter.rewrite_element(&e)? {
                    Some(start) => writer.write_event(Event::Start(start))?,
                    None => writer.write_event(Event::Start(e))?,
                }
            }
            Event::Empty(e) => match rewriter.rewrite_element(&e)? {
                Some(start) => writer.write_event(Event::Empty(start))?,
                None => writer.write_event(Event::Empty(e))?,
            },
            Event::Text(t) => {
                if let Some((kind, written)) = field.as_mut() {
                    if !*written {
                        *written = true;
                        let text = replacement_text(*kind, open_layer.as_ref());
                        writer.write_event(Event::Text(BytesText::new(&text)))?;
                    }
                } else if rewriter.opts.strip_credentials {
                    let raw = t.unescape()?;
                    let (cleaned, removed) = strip_source_credentials(&raw);
                    if removed > 0 {
                        rewriter.credentials_removed += removed;
                        let escaped = quick_xml::escape::partial_escape(&cleaned).into_owned();
                        writer.write_event(Event::Text(BytesText::from_escaped(escaped)))?;
                    } else {
                        writer.write_event(Event::Text(t))?;
                    }
                } else {
                    writer.write_event(Event::Text(t))?;
                }
            }
            Event::End(e) => {
                if let Some((kind, written)) = field.take() {
                    if !written {
                        let text = replacement_text(kind, open_layer.as_ref());
                        writer.write_event(Event::Text(BytesText::new(&text)))?;
                    }
                    if kind == MapField::Datasource {
                        if let Some(layer) = open_layer.as_mut() {
                            layer.replaced = true;
                        }
                    }
                }

                if open_layer.as_ref().map(|l| l.depth == depth).unwrap_or(false) {
                    if let Some(layer) = open_layer.take() {
                        if layer.replaced {
                            layers_rewritten += 1;
                        }
                    }
                }

                depth = depth.saturating_sub(1);
                writer.write_event(Event::End(e))?;
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }

    let xml = String::from_utf8(writer.into_inner())
        .map_err(|e| AppError::ProjectFileError(format!("输出不是有效的 UTF-8：{}", e)))?;

    Ok(RewriteReport {
        xml,
        layers_rewritten,
        credentials_removed: rewriter.credentials_removed,
    })
}

fn replacement_text(kind: MapField, layer: Option<&OpenLayer>) -> String {
    match kind {
        MapField::Datasource => layer
            .and_then(|l| l.new_source.clone())
            .unwrap_or_default(),
        MapField::Provider => OGR_PROVIDER.to_string(),
    }
}

// ============================================================================
// 单元测试
// ============================================================================
