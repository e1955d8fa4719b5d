// ============================================================================
// 工程图层清单：从 QGS XML 中读出每个 <maplayer> 的基本信息
// ============================================================================

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::utils::error::AppResult;

/// 工程中的一个图层
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerInfo {
    /// 图层 ID（QGIS 内部唯一标识）
    pub id: String,
    /// 图层显示名称
    pub name: String,
    /// 数据 provider（如 postgres、ogr、delimitedtext）
    pub provider: String,
    /// 数据源字符串（已反转义）
    pub datasource: String,
    /// maplayer 的 type 属性（vector / raster / …）
    pub layer_type: String,
}

impl LayerInfo {
    /// 是否为 PostgreSQL 图层
    pub fn is_postgres(&self) -> bool {
        self.provider == "postgres" || self.datasource.to_lowercase().contains("postgresql")
    }

    pub fn is_vector(&self) -> bool {
        self.layer_type.is_empty() || self.layer_type == "vector"
    }

    /// 写入 GeoPackage 时使用的表名
    pub fn export_name(&self) -> String {
        let base = if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        };
        base.replace([' ', '/'], "_")
    }
}

/// 当前正在收集文本的子元素
#[derive(Clone, Copy)]
enum Field {
    Id,
    Name,
    Provider,
    Datasource,
}

/// 扫描工程中的全部 <maplayer>，按出现顺序返回
pub fn scan_layers(xml: &str) -> AppResult<Vec<LayerInfo>> {
    let mut reader = Reader::from_str(xml);
    let mut layers = Vec::new();

    let mut depth = 0usize;
    // (maplayer 所在深度, 收集中的图层)
    let mut current: Option<(usize, LayerInfo)> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                depth += 1;
                let qname = e.name();
                let tag = qname.as_ref();
                if current.is_none() && tag == b"maplayer" {
                    let mut layer = LayerInfo::default();
                    for attr in e.attributes().flatten() {
                        let value = attr.unescape_value()?.into_owned();
                        match attr.key.as_ref() {
                            b"id" => layer.id = value,
                            b"type" => layer.layer_type = value,
                            _ => {}
                        }
                    }
                    current = Some((depth, layer));
                } else if let Some((layer_depth, layer)) = current.as_mut() {
                    if depth == *layer_depth + 1 {
                        field = match tag {
                            b"id" => {
                                // <id> 子元素优先于属性
                                layer.id.clear();
                                Some(Field::Id)
                            }
                            b"layername" => Some(Field::Name),
                            b"provider" => Some(Field::Provider),
                            b"datasource" => Some(Field::Datasource),
                            _ => None,
                        };
                    }
                }
            }
            Event::Text(t) => {
                if let (Some((_, layer)), Some(f)) = (current.as_mut(), field) {
                    let text = t.unescape()?;
                    let slot = match f {
                        Field::Id => &mut layer.id,
                        Field::Name => &mut layer.name,
                        Field::Provider => &mut layer.provider,
                        Field::Datasource => &mut layer.datasource,
                    };
                    slot.push_str(&text);
                }
            }
            Event::End(_) => {
                field = None;
                if let Some((layer_depth, _)) = &current {
                    if *layer_depth == depth {
                        if let Some((_, mut layer)) = current.take() {
                            layer.id = layer.id.trim().to_string();
                            layer.name = layer.name.trim().to_string();
                            layer.provider = layer.provider.trim().to_string();
                            layer.datasource = layer.datasource.trim().to_string();
                            layers.push(layer);
                        }
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(layers)
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TWO_LAYER_PROJECT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE qgis PUBLIC 'http://mrcc.com/qgis.dtd' 'SYSTEM'>
<qgis projectname="demo" version="3.34.0">
  <layer-tree-group>
    <layer-tree-layer id="roads_1" name="Main roads" providerKey="postgres" source="dbname='gis' host=db user='admin' password='pw' table=&quot;public&quot;.&quot;roads&quot; (geom)"/>
    <layer-tree-layer id="rivers_2" name="rivers" providerKey="ogr" source="./rivers.shp"/>
  </layer-tree-group>
  <projectlayers>
    <maplayer type="vector" geometry="Line">
      <id>roads_1</id>
      <datasource>dbname='gis' host=db user='admin' password='pw' table=&quot;public&quot;.&quot;roads&quot; (geom)</datasource>
      <layername>Main roads</layername>
      <provider encoding="UTF-8">postgres</provider>
    </maplayer>
    <maplayer type="vector" geometry="Line">
      <id>rivers_2</id>
      <datasource>./rivers.shp</datasource>
      <layername>rivers</layername>
      <provider encoding="UTF-8">ogr</provider>
    </maplayer>
  </projectlayers>
</qgis>
"#;

    #[test]
    fn test_scan_layers_reads_children() {
        let layers = scan_layers(TWO_LAYER_PROJECT).unwrap();
        assert_eq!(layers.len(), 2);

        let roads = &layers[0];
        assert_eq!(roads.id, "roads_1");
        assert_eq!(roads.name, "Main roads");
        assert_eq!(roads.provider, "postgres");
        assert!(roads.datasource.contains("table=\"public\".\"roads\""));
        assert!(roads.is_postgres());
        assert!(roads.is_vector());
        assert_eq!(roads.export_name(), "Main_roads");

        let rivers = &layers[1];
        assert_eq!(rivers.provider, "ogr");
        assert!(!rivers.is_postgres());
    }

    #[test]
    fn test_scan_layers_empty_project() {
        assert!(scan_layers("<qgis/>").unwrap().is_empty());
    }

    #[test]
    fn test_export_name_replaces_separators() {
        let layer = LayerInfo {
            id: "x".to_string(),
            name: "a b/c".to_string(),
            ..Default::default()
        };
        assert_eq!(layer.export_name(), "a_b_c");
    }
}
