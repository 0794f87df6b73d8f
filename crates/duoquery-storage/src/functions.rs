//! SQLite 扩展函数模块
//!
//! 为每个池化连接注册关系编译器用到的空间与时间函数,
//! 函数名与 PostGIS/TimescaleDB 保持一致:
//! - `ST_GeomFromGeoJSON(text)`、`ST_Within(geom, area)`
//! - `ST_XMin/ST_XMax/ST_YMin/ST_YMax(geom)`、`ST_X/ST_Y(point)`
//! - `time_bucket(unit, value, ts)`:与文档后端相同的日历/固定宽度分桶
//! - `geotile_key(z, point)`:`z/x/y` 瓦片键
//! - `floor(x)`
//! - `like(pattern, text[, escape])`:覆盖内建 LIKE,与文档后端共用 `WildcardPattern`
//!
//! 几何以 GeoJSON 文本存储,时间以 UTC 毫秒整数存储。NULL 输入返回 NULL。

use chrono::{DateTime, Utc};
use duoquery_common::time::{parse_datetime, truncate};
use duoquery_common::IntervalUnit;
use crate::pattern::WildcardPattern;
use duoquery_value::geometry::{
    bounding_box, geometry_within, parse_geometry, to_geojson, GeoTile, MAX_GEOTILE_PRECISION,
};
use geo::{Geometry, Point};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Error, Result};
use serde_json::Value as JsonValue;
use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn user_error(message: impl Into<String>) -> Error {
    let message: String = message.into();
    Error::UserFunctionError(message.into())
}

fn geometry_arg(ctx: &Context<'_>, idx: usize) -> Result<Option<Geometry<f64>>> {
    let text: Option<String> = ctx.get(idx)?;
    match text {
        None => Ok(None),
        Some(text) => parse_geometry(&JsonValue::String(text))
            .map(Some)
            .map_err(|e| Error::UserFunctionError(Box::new(e))),
    }
}

fn point_arg(ctx: &Context<'_>, idx: usize, function: &str) -> Result<Option<Point<f64>>> {
    match geometry_arg(ctx, idx)? {
        None => Ok(None),
        Some(Geometry::Point(p)) => Ok(Some(p)),
        Some(_) => Err(user_error(format!("{} requires a point geometry", function))),
    }
}

/// 毫秒整数或规范化文本
fn timestamp_arg(ctx: &Context<'_>, idx: usize) -> Result<Option<DateTime<Utc>>> {
    match ctx.get_raw(idx) {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or_else(|| user_error(format!("timestamp out of range: {}", ms))),
        ValueRef::Text(text) => {
            let text = String::from_utf8_lossy(text);
            parse_datetime(&text)
                .map(Some)
                .ok_or_else(|| user_error(format!("bad timestamp {:?}", text)))
        }
        _ => Err(user_error("timestamp must be an integer or text")),
    }
}

fn bound(ctx: &Context<'_>, corner: usize) -> Result<Option<f64>> {
    Ok(geometry_arg(ctx, 0)?
        .as_ref()
        .and_then(bounding_box)
        .map(|b| b[corner]))
}

/// `X LIKE Y ESCAPE Z` 调用 `like(Y, X, Z)`;编译后的模式缓存在参数 0 的辅助数据上
fn like(ctx: &Context<'_>) -> Result<Option<bool>> {
    let escape = if ctx.len() > 2 {
        let escape: Option<String> = ctx.get(2)?;
        let Some(escape) = escape else {
            return Ok(None);
        };
        let mut chars = escape.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => return Err(user_error("ESCAPE expression must be a single character")),
        }
    } else {
        None
    };
    let text: Option<String> = ctx.get(1)?;
    let (Some(text), Some(_)) = (text, ctx.get::<Option<String>>(0)?) else {
        return Ok(None);
    };
    let pattern: Arc<WildcardPattern> = ctx.get_or_create_aux(0, |raw| -> Result<_, BoxError> {
        Ok(WildcardPattern::sql_like(raw.as_str()?, escape)?)
    })?;
    Ok(Some(pattern.matches(&text)))
}

/// # Brief
/// 在连接上注册全部扩展函数
pub fn register_functions(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("ST_GeomFromGeoJSON", 1, flags, |ctx| {
        Ok(geometry_arg(ctx, 0)?.map(|g| to_geojson(&g).to_string()))
    })?;

    conn.create_scalar_function("ST_Within", 2, flags, |ctx| {
        match (geometry_arg(ctx, 0)?, geometry_arg(ctx, 1)?) {
            (Some(geometry), Some(area)) => Ok(Some(geometry_within(&geometry, &area))),
            _ => Ok(None),
        }
    })?;

    conn.create_scalar_function("ST_XMin", 1, flags, |ctx| bound(ctx, 0))?;
    conn.create_scalar_function("ST_YMin", 1, flags, |ctx| bound(ctx, 1))?;
    conn.create_scalar_function("ST_XMax", 1, flags, |ctx| bound(ctx, 2))?;
    conn.create_scalar_function("ST_YMax", 1, flags, |ctx| bound(ctx, 3))?;

    conn.create_scalar_function("ST_X", 1, flags, |ctx| {
        Ok(point_arg(ctx, 0, "ST_X")?.map(|p| p.x()))
    })?;
    conn.create_scalar_function("ST_Y", 1, flags, |ctx| {
        Ok(point_arg(ctx, 0, "ST_Y")?.map(|p| p.y()))
    })?;

    conn.create_scalar_function("time_bucket", 3, flags, |ctx| {
        let unit: String = ctx.get(0)?;
        let value: i64 = ctx.get(1)?;
        let Some(ts) = timestamp_arg(ctx, 2)? else {
            return Ok(None);
        };
        let unit: IntervalUnit = unit.parse().map_err(|e| Error::UserFunctionError(Box::new(e)))?;
        let value = u32::try_from(value)
            .map_err(|_| user_error(format!("time_bucket value out of range: {}", value)))?;
        let start = truncate(ts, unit, value)
            .ok_or_else(|| user_error("time_bucket: timestamp out of range"))?;
        Ok(Some(start.timestamp_millis()))
    })?;

    conn.create_scalar_function("geotile_key", 2, flags, |ctx| {
        let z: i64 = ctx.get(0)?;
        let z = u8::try_from(z)
            .ok()
            .filter(|z| *z <= MAX_GEOTILE_PRECISION)
            .ok_or_else(|| user_error(format!("geotile precision out of range: {}", z)))?;
        Ok(point_arg(ctx, 1, "geotile_key")?.map(|p| GeoTile::from_point(p.x(), p.y(), z).key()))
    })?;

    conn.create_scalar_function("like", 2, flags, like)?;
    conn.create_scalar_function("like", 3, flags, like)?;

    conn.create_scalar_function("floor", 1, flags, |ctx| {
        let x: Option<f64> = ctx.get(0)?;
        Ok(x.map(f64::floor))
    })?;

    Ok(())
}
