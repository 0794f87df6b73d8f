//! 集合解析器模块
//!
//! 把逻辑集合名映射到物理后端目标与字段路径,并推断、缓存几何形状分类:
//! - **CollectionDefinition**: 注册时提供的集合元数据(serde)
//! - **CollectionReference**: 元数据 + 两个原子形状槽位(geometry / centroid)
//! - **CollectionStore**: 元数据持久化边界,`MemoryCollectionStore` 为内存实现
//! - **FieldTypeLookup**: 字段类型查询边界,`FieldTypeCache` 为可失效的缓存实现
//!
//! 形状槽位在首次推断时写入。并发推断对同一样本结果相同,
//! 因此只需一次原子写入,后写者覆盖先写者。

use crate::{QueryError, QueryResult};
use dashmap::DashMap;
use duoquery_common::{BackendKind, CollectionName, FieldType};
use duoquery_value::geometry::infer_shape;
use duoquery_value::ShapeClass;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 形状推断目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeTarget {
    Geometry,
    Centroid,
}

impl fmt::Display for ShapeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeTarget::Geometry => f.write_str("geometry"),
            ShapeTarget::Centroid => f.write_str("centroid"),
        }
    }
}

/// 集合定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDefinition {
    /// 逻辑集合名
    pub name: CollectionName,
    pub backend: BackendKind,
    /// 物理目标(索引名或表名)
    pub target: String,
    /// 标识字段(逻辑名)
    pub id_field: String,
    #[serde(default)]
    pub geometry_field: Option<String>,
    #[serde(default)]
    pub centroid_field: Option<String>,
    #[serde(default)]
    pub timestamp_field: Option<String>,
    /// 逻辑名 → 物理路径;物理路径缺省时与逻辑名相同
    #[serde(default)]
    pub fields: IndexMap<String, Option<String>>,
    /// 不出现在投影中的字段
    #[serde(default)]
    pub exclude_fields: Vec<String>,
}

impl CollectionDefinition {
    /// # Brief
    /// 校验定义:特殊字段必须是已声明字段
    pub fn validate(&self) -> QueryResult<()> {
        if self.target.trim().is_empty() {
            return Err(QueryError::Validation(format!(
                "collection {} has an empty target",
                self.name.as_str()
            )));
        }
        let special = [
            Some(&self.id_field),
            self.geometry_field.as_ref(),
            self.centroid_field.as_ref(),
            self.timestamp_field.as_ref(),
        ];
        for field in special.into_iter().flatten() {
            if !self.fields.contains_key(field) {
                return Err(QueryError::Validation(format!(
                    "collection {} references undeclared field {}",
                    self.name.as_str(),
                    field
                )));
            }
        }
        Ok(())
    }
}

/// 集合引用
///
/// 除形状槽位外只读。槽位值 0 表示尚未推断。
#[derive(Debug)]
pub struct CollectionReference {
    definition: CollectionDefinition,
    geometry_shape: AtomicU8,
    centroid_shape: AtomicU8,
}

impl CollectionReference {
    pub fn new(definition: CollectionDefinition) -> Self {
        Self {
            definition,
            geometry_shape: AtomicU8::new(0),
            centroid_shape: AtomicU8::new(0),
        }
    }

    pub fn definition(&self) -> &CollectionDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        self.definition.name.as_str()
    }

    pub fn backend(&self) -> BackendKind {
        self.definition.backend
    }

    pub fn target(&self) -> &str {
        &self.definition.target
    }

    pub fn id_field(&self) -> &str {
        &self.definition.id_field
    }

    pub fn geometry_field(&self) -> Option<&str> {
        self.definition.geometry_field.as_deref()
    }

    pub fn centroid_field(&self) -> Option<&str> {
        self.definition.centroid_field.as_deref()
    }

    pub fn timestamp_field(&self) -> Option<&str> {
        self.definition.timestamp_field.as_deref()
    }

    /// 已声明的逻辑字段(声明顺序)
    pub fn declared_fields(&self) -> impl Iterator<Item = &str> {
        self.definition.fields.keys().map(String::as_str)
    }

    pub fn is_excluded(&self, field: &str) -> bool {
        self.definition.exclude_fields.iter().any(|f| f == field)
    }

    /// # Brief
    /// 逻辑字段的物理路径
    ///
    /// # Returns
    /// 未声明的字段返回 NotFound
    pub fn physical(&self, field: &str) -> QueryResult<&str> {
        match self.definition.fields.get_key_value(field) {
            Some((_, Some(path))) => Ok(path.as_str()),
            Some((logical, None)) => Ok(logical.as_str()),
            None => Err(QueryError::NotFound(format!(
                "field {} in collection {}",
                field,
                self.name()
            ))),
        }
    }

    fn slot(&self, target: ShapeTarget) -> &AtomicU8 {
        match target {
            ShapeTarget::Geometry => &self.geometry_shape,
            ShapeTarget::Centroid => &self.centroid_shape,
        }
    }

    /// 已缓存的形状分类
    pub fn shape(&self, target: ShapeTarget) -> Option<ShapeClass> {
        ShapeClass::from_code(self.slot(target).load(Ordering::Acquire))
    }

    /// 写入形状分类(单次原子写入)
    pub fn set_shape(&self, target: ShapeTarget, class: ShapeClass) {
        self.slot(target).store(class.to_code(), Ordering::Release);
    }

    /// 槽位对应的逻辑字段
    pub fn shape_field(&self, target: ShapeTarget) -> Option<&str> {
        match target {
            ShapeTarget::Geometry => self.geometry_field(),
            ShapeTarget::Centroid => self.centroid_field(),
        }
    }

    /// 点来源:优先 centroid 字段,否则 geometry 字段
    pub fn point_source(&self) -> Option<(&str, ShapeTarget)> {
        self.centroid_field()
            .map(|f| (f, ShapeTarget::Centroid))
            .or_else(|| self.geometry_field().map(|f| (f, ShapeTarget::Geometry)))
    }

    /// 字段对应槽位中缓存的形状;字段不是 geometry/centroid 字段时返回 None
    pub fn field_shape(&self, field: &str) -> Option<ShapeClass> {
        if self.centroid_field() == Some(field) {
            return self.shape(ShapeTarget::Centroid);
        }
        if self.geometry_field() == Some(field) {
            return self.shape(ShapeTarget::Geometry);
        }
        None
    }

    /// # Brief
    /// 要求字段存储的是点
    ///
    /// 未推断的槽位视为兼容,由后端在执行时拒绝非点数据。
    ///
    /// # Returns
    /// 已知为非点形状时返回 Backend 错误(400)
    pub fn require_point(&self, field: &str, field_type: FieldType, usage: &str) -> QueryResult<()> {
        if field_type == FieldType::GeoPoint {
            return Ok(());
        }
        match self.field_shape(field) {
            Some(class) if !class.is_point() => Err(QueryError::backend(
                400,
                format!(
                    "{} on field {} of collection {} is unsupported by storage",
                    usage,
                    field,
                    self.name()
                ),
                Some(format!("field holds {} values, a point is required", class)),
            )),
            _ => Ok(()),
        }
    }
}

/// 集合元数据存储
pub trait CollectionStore: Send + Sync {
    fn get(&self, name: &str) -> QueryResult<Arc<CollectionReference>>;
    fn put(&self, collection: Arc<CollectionReference>) -> QueryResult<()>;
    fn delete(&self, name: &str) -> QueryResult<()>;
}

/// 内存集合存储
#[derive(Default)]
pub struct MemoryCollectionStore {
    collections: DashMap<String, Arc<CollectionReference>>,
}

impl MemoryCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl CollectionStore for MemoryCollectionStore {
    fn get(&self, name: &str) -> QueryResult<Arc<CollectionReference>> {
        self.collections
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QueryError::NotFound(format!("collection {}", name)))
    }

    fn put(&self, collection: Arc<CollectionReference>) -> QueryResult<()> {
        collection.definition().validate()?;
        self.collections
            .insert(collection.name().to_string(), collection);
        Ok(())
    }

    fn delete(&self, name: &str) -> QueryResult<()> {
        self.collections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| QueryError::NotFound(format!("collection {}", name)))
    }
}

/// 字段类型查询
pub trait FieldTypeLookup: Send + Sync {
    /// # Brief
    /// 查询字段声明类型
    ///
    /// # Returns
    /// 未知字段返回 NotFound
    fn field_type(&self, collection: &CollectionReference, field: &str) -> QueryResult<FieldType>;
}

/// 字段类型缓存
///
/// 由外部协作者填充和失效,按 (集合, 字段) 索引。
#[derive(Default)]
pub struct FieldTypeCache {
    types: DashMap<(String, String), FieldType>,
}

impl FieldTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, collection: &str, field: &str, field_type: FieldType) {
        self.types
            .insert((collection.to_string(), field.to_string()), field_type);
    }

    pub fn register_all(&self, collection: &str, types: &IndexMap<String, FieldType>) {
        for (field, field_type) in types {
            self.register(collection, field, *field_type);
        }
        debug!("Registered {} field types for {}", types.len(), collection);
    }

    pub fn invalidate(&self, collection: &str, field: &str) {
        self.types
            .remove(&(collection.to_string(), field.to_string()));
    }

    pub fn invalidate_collection(&self, collection: &str) {
        self.types.retain(|(c, _), _| c != collection);
    }
}

impl FieldTypeLookup for FieldTypeCache {
    fn field_type(&self, collection: &CollectionReference, field: &str) -> QueryResult<FieldType> {
        self.types
            .get(&(collection.name().to_string(), field.to_string()))
            .map(|entry| *entry.value())
            .ok_or_else(|| {
                QueryError::NotFound(format!(
                    "field {} in collection {}",
                    field,
                    collection.name()
                ))
            })
    }
}

/// 集合解析器
#[derive(Clone)]
pub struct CollectionResolver {
    store: Arc<dyn CollectionStore>,
}

impl CollectionResolver {
    pub fn new(store: Arc<dyn CollectionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CollectionStore> {
        &self.store
    }

    /// 解析逻辑集合名
    pub fn resolve(&self, name: &str) -> QueryResult<Arc<CollectionReference>> {
        self.store.get(name)
    }

    /// # Brief
    /// 根据样本值推断形状分类并写回集合引用
    ///
    /// 优先级:结构化几何对象 > 数值对 > `"lat,lon"` 字符串 > geohash。
    ///
    /// # Arguments
    /// * `collection` - 集合引用
    /// * `sample` - 样本值
    /// * `target` - geometry 或 centroid 槽位
    ///
    /// # Returns
    /// 推断出的形状;无法识别或存在歧义时返回 Validation 错误,槽位不变
    pub fn infer_shape(
        &self,
        collection: &CollectionReference,
        sample: &JsonValue,
        target: ShapeTarget,
    ) -> QueryResult<ShapeClass> {
        let inferred = infer_shape(sample).map_err(|e| {
            QueryError::Validation(format!(
                "cannot classify {} of collection {}: {}",
                target,
                collection.name(),
                e
            ))
        })?;
        collection.set_shape(target, inferred.class);
        info!(
            "Cached {} shape {} for collection {}",
            target,
            inferred.class,
            collection.name()
        );
        Ok(inferred.class)
    }
}
