//! 几何值模块
//!
//! 本模块负责两个后端共用的几何处理:
//! - 几何值解析与形状分类(GeoJSON 对象 → 数值对 → `"lat,lon"` → geohash,严格按此顺序)
//! - 过滤区域解析(`minLon,minLat,maxLon,maxLat` 或 `POLYGON((x y, ...))`)
//! - OGC within 判定(仅边界接触不算在内)
//! - geotile 网格(`z/x/y`)的键、边界与中心计算
//!
//! 坐标一律为 (经度, 纬度),经度范围 [-180, 180],纬度范围 [-90, 90]。

use crate::{ValueError, ValueResult};
use geo::{
    BoundingRect, Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint,
    MultiPolygon, Point, Polygon, Rect, Within,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// 几何形状分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeClass {
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
    GeometryCollection,
    Envelope,
}

impl ShapeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeClass::Point => "Point",
            ShapeClass::MultiPoint => "MultiPoint",
            ShapeClass::LineString => "LineString",
            ShapeClass::MultiLineString => "MultiLineString",
            ShapeClass::Polygon => "Polygon",
            ShapeClass::MultiPolygon => "MultiPolygon",
            ShapeClass::GeometryCollection => "GeometryCollection",
            ShapeClass::Envelope => "Envelope",
        }
    }

    pub fn is_point(&self) -> bool {
        matches!(self, ShapeClass::Point)
    }

    /// # Brief
    /// 非零编码,用于原子槽位存储(0 表示未解析)
    pub fn to_code(self) -> u8 {
        match self {
            ShapeClass::Point => 1,
            ShapeClass::MultiPoint => 2,
            ShapeClass::LineString => 3,
            ShapeClass::MultiLineString => 4,
            ShapeClass::Polygon => 5,
            ShapeClass::MultiPolygon => 6,
            ShapeClass::GeometryCollection => 7,
            ShapeClass::Envelope => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ShapeClass::Point),
            2 => Some(ShapeClass::MultiPoint),
            3 => Some(ShapeClass::LineString),
            4 => Some(ShapeClass::MultiLineString),
            5 => Some(ShapeClass::Polygon),
            6 => Some(ShapeClass::MultiPolygon),
            7 => Some(ShapeClass::GeometryCollection),
            8 => Some(ShapeClass::Envelope),
            _ => None,
        }
    }

    fn from_geojson_type(name: &str) -> Option<Self> {
        let class = match name.to_ascii_lowercase().as_str() {
            "point" => ShapeClass::Point,
            "multipoint" => ShapeClass::MultiPoint,
            "linestring" => ShapeClass::LineString,
            "multilinestring" => ShapeClass::MultiLineString,
            "polygon" => ShapeClass::Polygon,
            "multipolygon" => ShapeClass::MultiPolygon,
            "geometrycollection" => ShapeClass::GeometryCollection,
            "envelope" => ShapeClass::Envelope,
            _ => return None,
        };
        Some(class)
    }
}

impl fmt::Display for ShapeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 几何值的输入写法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeForm {
    /// 带 type 与坐标结构的对象
    Structured,
    /// `[lon, lat]`
    NumericPair,
    /// `"lat,lon"`
    LatLonString,
    /// geohash 字符串
    Geohash,
}

/// 一次形状推断的结果
#[derive(Debug, Clone, PartialEq)]
pub struct InferredShape {
    pub class: ShapeClass,
    pub form: ShapeForm,
    pub geometry: Geometry<f64>,
}

impl InferredShape {
    pub fn point(&self) -> Option<Point<f64>> {
        match &self.geometry {
            Geometry::Point(p) => Some(*p),
            _ => None,
        }
    }
}

/// # Brief
/// 解析几何值并推断其形状分类
///
/// 按固定顺序尝试:
/// 1. 带 `type` 和 `coordinates`/`geometries` 的对象,按声明类型分类
/// 2. 两个数字组成的数组,视为 (经度, 纬度)
/// 3. `"lat,lon"` 字符串
/// 4. geohash 字符串,取单元格中心点
///
/// 以 `{` 开头的字符串按 JSON 文本解析后再分类(关系后端以文本保存几何)。
///
/// # Arguments
/// * `sample` - 原始几何值
///
/// # Returns
/// 形状分类与解析出的几何;无法识别或存在歧义时返回错误
pub fn infer_shape(sample: &JsonValue) -> ValueResult<InferredShape> {
    match sample {
        JsonValue::Object(map) => {
            let structured = map.contains_key("type")
                && (map.contains_key("coordinates") || map.contains_key("geometries"));
            let lat_lon = map.contains_key("lat") && map.contains_key("lon");
            if structured && lat_lon {
                return Err(ValueError::AmbiguousGeometry(sample.to_string()));
            }
            if !structured {
                return Err(ValueError::UnrecognizedGeometry(sample.to_string()));
            }
            let (class, geometry) = parse_geojson(map)?;
            Ok(InferredShape {
                class,
                form: ShapeForm::Structured,
                geometry,
            })
        }
        JsonValue::Array(items) => {
            let pair: Vec<f64> = items.iter().filter_map(JsonValue::as_f64).collect();
            if items.len() != 2 || pair.len() != 2 {
                return Err(ValueError::UnrecognizedGeometry(sample.to_string()));
            }
            let point = checked_point(pair[0], pair[1])?;
            Ok(InferredShape {
                class: ShapeClass::Point,
                form: ShapeForm::NumericPair,
                geometry: Geometry::Point(point),
            })
        }
        JsonValue::String(text) => {
            let text = text.trim();
            if text.starts_with('{') {
                let parsed: JsonValue = serde_json::from_str(text)
                    .map_err(|e| ValueError::InvalidGeometry(e.to_string()))?;
                return infer_shape(&parsed);
            }
            if text.contains(',') {
                let point = parse_lat_lon(text)?;
                return Ok(InferredShape {
                    class: ShapeClass::Point,
                    form: ShapeForm::LatLonString,
                    geometry: Geometry::Point(point),
                });
            }
            let (center, _) = decode_geohash(text)?;
            Ok(InferredShape {
                class: ShapeClass::Point,
                form: ShapeForm::Geohash,
                geometry: Geometry::Point(center),
            })
        }
        other => Err(ValueError::UnrecognizedGeometry(other.to_string())),
    }
}

/// 解析任意受支持写法的几何值
pub fn parse_geometry(value: &JsonValue) -> ValueResult<Geometry<f64>> {
    infer_shape(value).map(|shape| shape.geometry)
}

fn parse_lat_lon(text: &str) -> ValueResult<Point<f64>> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    if parts.len() != 2 {
        return Err(ValueError::UnrecognizedGeometry(text.to_string()));
    }
    let lat: f64 = parts[0]
        .parse()
        .map_err(|_| ValueError::UnrecognizedGeometry(text.to_string()))?;
    let lon: f64 = parts[1]
        .parse()
        .map_err(|_| ValueError::UnrecognizedGeometry(text.to_string()))?;
    checked_point(lon, lat)
}

fn checked_coord(lon: f64, lat: f64) -> ValueResult<Coord<f64>> {
    if !lon.is_finite() || !lat.is_finite() {
        return Err(ValueError::InvalidGeometry(format!(
            "non-finite coordinate ({}, {})",
            lon, lat
        )));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(ValueError::InvalidGeometry(format!(
            "longitude {} out of range [-180, 180]",
            lon
        )));
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err(ValueError::InvalidGeometry(format!(
            "latitude {} out of range [-90, 90]",
            lat
        )));
    }
    Ok(Coord { x: lon, y: lat })
}

fn checked_point(lon: f64, lat: f64) -> ValueResult<Point<f64>> {
    checked_coord(lon, lat).map(Point::from)
}

// ============================================================================
// GeoJSON
// ============================================================================

fn parse_geojson(map: &Map<String, JsonValue>) -> ValueResult<(ShapeClass, Geometry<f64>)> {
    let type_name = map
        .get("type")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ValueError::InvalidGeometry("geometry type must be a string".to_string()))?;
    let class = ShapeClass::from_geojson_type(type_name)
        .ok_or_else(|| ValueError::UnrecognizedGeometry(format!("geometry type {}", type_name)))?;

    if class == ShapeClass::GeometryCollection {
        let members = map
            .get("geometries")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| ValueError::InvalidGeometry("geometries must be an array".to_string()))?;
        let mut parts = Vec::with_capacity(members.len());
        for member in members {
            let obj = member.as_object().ok_or_else(|| {
                ValueError::InvalidGeometry("collection member must be an object".to_string())
            })?;
            parts.push(parse_geojson(obj)?.1);
        }
        return Ok((class, Geometry::GeometryCollection(GeometryCollection(parts))));
    }

    let coords = map
        .get("coordinates")
        .ok_or_else(|| ValueError::InvalidGeometry("missing coordinates".to_string()))?;
    let geometry = match class {
        ShapeClass::Point => Geometry::Point(Point::from(position(coords)?)),
        ShapeClass::MultiPoint => Geometry::MultiPoint(MultiPoint(
            positions(coords)?.into_iter().map(Point::from).collect(),
        )),
        ShapeClass::LineString => Geometry::LineString(line(coords)?),
        ShapeClass::MultiLineString => Geometry::MultiLineString(MultiLineString(
            array(coords)?.iter().map(line).collect::<ValueResult<_>>()?,
        )),
        ShapeClass::Polygon => Geometry::Polygon(polygon(coords)?),
        ShapeClass::MultiPolygon => Geometry::MultiPolygon(MultiPolygon(
            array(coords)?.iter().map(polygon).collect::<ValueResult<_>>()?,
        )),
        ShapeClass::Envelope => {
            let corners = positions(coords)?;
            if corners.len() != 2 {
                return Err(ValueError::InvalidGeometry(
                    "envelope needs [[minLon, maxLat], [maxLon, minLat]]".to_string(),
                ));
            }
            Geometry::Rect(Rect::new(corners[0], corners[1]))
        }
        ShapeClass::GeometryCollection => {
            return Err(ValueError::InvalidGeometry("missing geometries".to_string()))
        }
    };
    Ok((class, geometry))
}

fn array(value: &JsonValue) -> ValueResult<&Vec<JsonValue>> {
    value
        .as_array()
        .ok_or_else(|| ValueError::InvalidGeometry(format!("expected array, found {}", value)))
}

fn position(value: &JsonValue) -> ValueResult<Coord<f64>> {
    let items = array(value)?;
    if items.len() < 2 {
        return Err(ValueError::InvalidGeometry(format!("bad position {}", value)));
    }
    match (items[0].as_f64(), items[1].as_f64()) {
        (Some(lon), Some(lat)) => checked_coord(lon, lat),
        _ => Err(ValueError::InvalidGeometry(format!("bad position {}", value))),
    }
}

fn positions(value: &JsonValue) -> ValueResult<Vec<Coord<f64>>> {
    array(value)?.iter().map(position).collect()
}

fn line(value: &JsonValue) -> ValueResult<LineString<f64>> {
    let coords = positions(value)?;
    if coords.len() < 2 {
        return Err(ValueError::InvalidGeometry(
            "line string needs at least 2 positions".to_string(),
        ));
    }
    Ok(LineString(coords))
}

fn ring(coords: Vec<Coord<f64>>) -> ValueResult<LineString<f64>> {
    if coords.len() < 4 {
        return Err(ValueError::InvalidGeometry(
            "polygon ring needs at least 4 positions".to_string(),
        ));
    }
    if coords.first() != coords.last() {
        return Err(ValueError::InvalidGeometry("polygon ring is not closed".to_string()));
    }
    Ok(LineString(coords))
}

fn polygon(value: &JsonValue) -> ValueResult<Polygon<f64>> {
    let mut rings = array(value)?
        .iter()
        .map(|r| positions(r).and_then(ring))
        .collect::<ValueResult<Vec<_>>>()?;
    if rings.is_empty() {
        return Err(ValueError::InvalidGeometry("polygon without rings".to_string()));
    }
    let exterior = rings.remove(0);
    Ok(Polygon::new(exterior, rings))
}

fn coord_json(c: &Coord<f64>) -> JsonValue {
    json!([c.x, c.y])
}

fn line_json(line: &LineString<f64>) -> JsonValue {
    JsonValue::Array(line.0.iter().map(coord_json).collect())
}

fn polygon_json(poly: &Polygon<f64>) -> JsonValue {
    let mut rings = vec![line_json(poly.exterior())];
    rings.extend(poly.interiors().iter().map(line_json));
    JsonValue::Array(rings)
}

/// # Brief
/// 将几何输出为 GeoJSON 对象
///
/// 矩形输出为 `envelope`,其余类型按标准 GeoJSON 输出。
pub fn to_geojson(geometry: &Geometry<f64>) -> JsonValue {
    match geometry {
        Geometry::Point(p) => json!({"type": "Point", "coordinates": [p.x(), p.y()]}),
        Geometry::MultiPoint(mp) => json!({
            "type": "MultiPoint",
            "coordinates": mp.0.iter().map(|p| coord_json(&p.0)).collect::<Vec<_>>(),
        }),
        Geometry::LineString(ls) => json!({"type": "LineString", "coordinates": line_json(ls)}),
        Geometry::MultiLineString(mls) => json!({
            "type": "MultiLineString",
            "coordinates": mls.0.iter().map(line_json).collect::<Vec<_>>(),
        }),
        Geometry::Polygon(poly) => json!({"type": "Polygon", "coordinates": polygon_json(poly)}),
        Geometry::MultiPolygon(mp) => json!({
            "type": "MultiPolygon",
            "coordinates": mp.0.iter().map(polygon_json).collect::<Vec<_>>(),
        }),
        Geometry::GeometryCollection(gc) => json!({
            "type": "GeometryCollection",
            "geometries": gc.0.iter().map(to_geojson).collect::<Vec<_>>(),
        }),
        Geometry::Rect(rect) => json!({
            "type": "envelope",
            "coordinates": [[rect.min().x, rect.max().y], [rect.max().x, rect.min().y]],
        }),
        Geometry::Line(line) => json!({
            "type": "LineString",
            "coordinates": [coord_json(&line.start), coord_json(&line.end)],
        }),
        Geometry::Triangle(tri) => {
            let poly = tri.to_polygon();
            json!({"type": "Polygon", "coordinates": polygon_json(&poly)})
        }
    }
}

/// 几何的外包框 `[minLon, minLat, maxLon, maxLat]`
pub fn bounding_box(geometry: &Geometry<f64>) -> Option<[f64; 4]> {
    geometry
        .bounding_rect()
        .map(|r| [r.min().x, r.min().y, r.max().x, r.max().y])
}

// ============================================================================
// geohash
// ============================================================================

const GEOHASH_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// # Brief
/// 解码 geohash
///
/// # Returns
/// (单元格中心点, 单元格范围)
pub fn decode_geohash(hash: &str) -> ValueResult<(Point<f64>, Rect<f64>)> {
    if hash.is_empty() || hash.len() > 12 {
        return Err(ValueError::InvalidGeohash(hash.to_string()));
    }
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let mut even = true;
    for byte in hash.bytes() {
        let idx = GEOHASH_ALPHABET
            .iter()
            .position(|&c| c == byte.to_ascii_lowercase())
            .ok_or_else(|| ValueError::InvalidGeohash(hash.to_string()))?;
        for shift in (0..5).rev() {
            let bit = (idx >> shift) & 1 == 1;
            if even {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }
    let cell = Rect::new(
        Coord { x: lon_lo, y: lat_lo },
        Coord { x: lon_hi, y: lat_hi },
    );
    let center = Point::new((lon_lo + lon_hi) / 2.0, (lat_lo + lat_hi) / 2.0);
    Ok((center, cell))
}

// ============================================================================
// 过滤区域
// ============================================================================

/// 空间过滤区域
///
/// 由 bbox 字符串或 `POLYGON((...))` 描述构造,构造时即完成校验。
#[derive(Debug, Clone, PartialEq)]
pub struct Area {
    raw: String,
    polygon: Polygon<f64>,
    bbox: Option<Rect<f64>>,
}

impl Area {
    /// # Brief
    /// 解析区域描述
    ///
    /// # Arguments
    /// * `raw` - `"minLon,minLat,maxLon,maxLat"` 或 `POLYGON((x y, ...)[, (...)])`
    pub fn parse(raw: &str) -> ValueResult<Self> {
        let text = raw.trim();
        let is_polygon = text
            .get(..7)
            .map(|p| p.eq_ignore_ascii_case("polygon"))
            .unwrap_or(false);
        if is_polygon {
            let polygon = parse_wkt_polygon(&text[7..])?;
            return Ok(Self {
                raw: text.to_string(),
                polygon,
                bbox: None,
            });
        }

        let numbers: Vec<f64> = text
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| ValueError::InvalidGeometry(format!("bad bbox: {}", raw)))?;
        if numbers.len() != 4 {
            return Err(ValueError::InvalidGeometry(format!(
                "bbox needs 4 numbers, found {}",
                numbers.len()
            )));
        }
        let min = checked_coord(numbers[0], numbers[1])?;
        let max = checked_coord(numbers[2], numbers[3])?;
        if min.x >= max.x || min.y >= max.y {
            return Err(ValueError::InvalidGeometry(format!(
                "bbox minimum must be below maximum: {}",
                raw
            )));
        }
        let rect = Rect::new(min, max);
        Ok(Self {
            raw: text.to_string(),
            polygon: rect.to_polygon(),
            bbox: Some(rect),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn polygon(&self) -> &Polygon<f64> {
        &self.polygon
    }

    pub fn bbox(&self) -> Option<&Rect<f64>> {
        self.bbox.as_ref()
    }

    /// 文档后端使用的形状:bbox 输出为 envelope,其余输出为 Polygon
    pub fn to_shape_json(&self) -> JsonValue {
        match &self.bbox {
            Some(rect) => to_geojson(&Geometry::Rect(*rect)),
            None => to_geojson(&Geometry::Polygon(self.polygon.clone())),
        }
    }

    /// 关系后端绑定的 GeoJSON 文本(始终为 Polygon)
    pub fn to_geojson_text(&self) -> String {
        to_geojson(&Geometry::Polygon(self.polygon.clone())).to_string()
    }

    /// # Brief
    /// OGC within:几何完全位于区域内部,仅边界接触不算
    pub fn contains(&self, geometry: &Geometry<f64>) -> bool {
        geometry.is_within(&self.polygon)
    }
}

impl FromStr for Area {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Area::parse(s)
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// 区域几何(已解析的 GeoJSON 形状)是否包含目标几何
pub fn geometry_within(geometry: &Geometry<f64>, area: &Geometry<f64>) -> bool {
    match area {
        Geometry::Polygon(poly) => geometry.is_within(poly),
        Geometry::Rect(rect) => geometry.is_within(&rect.to_polygon()),
        _ => false,
    }
}

fn parse_wkt_polygon(body: &str) -> ValueResult<Polygon<f64>> {
    let body = body.trim();
    let inner = body
        .strip_prefix('(')
        .and_then(|b| b.strip_suffix(')'))
        .ok_or_else(|| ValueError::InvalidGeometry(format!("bad polygon: {}", body)))?;

    let mut rings = Vec::new();
    let mut current: Option<String> = None;
    for ch in inner.chars() {
        if let Some(buf) = current.as_mut() {
            match ch {
                ')' => {
                    let text = std::mem::take(buf);
                    current = None;
                    rings.push(parse_wkt_ring(&text)?);
                }
                '(' => {
                    return Err(ValueError::InvalidGeometry(format!(
                        "unbalanced parentheses in polygon: {}",
                        body
                    )))
                }
                c => buf.push(c),
            }
        } else {
            match ch {
                '(' => current = Some(String::new()),
                c if c == ',' || c.is_whitespace() => {}
                c => {
                    return Err(ValueError::InvalidGeometry(format!(
                        "unexpected '{}' in polygon",
                        c
                    )))
                }
            }
        }
    }
    if current.is_some() || rings.is_empty() {
        return Err(ValueError::InvalidGeometry(format!("bad polygon: {}", body)));
    }
    let exterior = rings.remove(0);
    Ok(Polygon::new(exterior, rings))
}

fn parse_wkt_ring(text: &str) -> ValueResult<LineString<f64>> {
    let coords = text
        .split(',')
        .map(|pair| {
            let nums: Vec<f64> = pair
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<_, _>>()
                .map_err(|_| ValueError::InvalidGeometry(format!("bad position: {}", pair)))?;
            if nums.len() != 2 {
                return Err(ValueError::InvalidGeometry(format!("bad position: {}", pair)));
            }
            checked_coord(nums[0], nums[1])
        })
        .collect::<ValueResult<Vec<_>>>()?;
    ring(coords)
}

// ============================================================================
// geotile
// ============================================================================

/// geotile 最大缩放级别
pub const MAX_GEOTILE_PRECISION: u8 = 29;

const MAX_TILE_LAT: f64 = 85.051_128_779_806_59;

/// Web 墨卡托瓦片 `z/x/y`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeoTile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl GeoTile {
    /// # Brief
    /// 计算点所在的瓦片
    ///
    /// 纬度先截断到墨卡托可表示范围,瓦片坐标截断到 `[0, 2^z - 1]`。
    pub fn from_point(lon: f64, lat: f64, z: u8) -> Self {
        let z = z.min(MAX_GEOTILE_PRECISION);
        let n = f64::from(1u32 << z);
        let max = (1u64 << z) - 1;
        let lat = lat.clamp(-MAX_TILE_LAT, MAX_TILE_LAT);
        let x = ((lon + 180.0) / 360.0 * n).floor();
        let lat_rad = lat.to_radians();
        let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor();
        let clamp = |v: f64| -> u32 { (v.max(0.0) as u64).min(max) as u32 };
        Self { z, x: clamp(x), y: clamp(y) }
    }

    /// 解析 `z/x/y` 键
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.split('/');
        let z: u8 = parts.next()?.parse().ok()?;
        let x: u32 = parts.next()?.parse().ok()?;
        let y: u32 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || z > MAX_GEOTILE_PRECISION {
            return None;
        }
        let limit = 1u64 << z;
        if u64::from(x) >= limit || u64::from(y) >= limit {
            return None;
        }
        Some(Self { z, x, y })
    }

    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.z, self.x, self.y)
    }

    /// 瓦片范围 `[minLon, minLat, maxLon, maxLat]`
    pub fn bounds(&self) -> [f64; 4] {
        let n = f64::from(1u32 << self.z);
        let lon = |x: f64| x / n * 360.0 - 180.0;
        let lat = |y: f64| (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
        let x = f64::from(self.x);
        let y = f64::from(self.y);
        [lon(x), lat(y + 1.0), lon(x + 1.0), lat(y)]
    }

    /// 瓦片中心 `[lon, lat]`
    pub fn center(&self) -> [f64; 2] {
        let [min_lon, min_lat, max_lon, max_lat] = self.bounds();
        [(min_lon + max_lon) / 2.0, (min_lat + max_lat) / 2.0]
    }
}

impl fmt::Display for GeoTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}
