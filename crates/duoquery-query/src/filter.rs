//! 过滤器模块
//!
//! 过滤器是多值组的有序序列:组之间为 AND,组内表达式之间为 OR。
//! 空过滤器匹配全部记录,空组在构造时被拒绝。构造后只暴露遍历与成员查询。

use crate::expression::Expression;
use crate::{QueryError, QueryResult};
use duoquery_value::Document;

/// 多值组:组内任一表达式满足即可
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    expressions: Vec<Expression>,
}

impl Group {
    pub fn new(expressions: Vec<Expression>) -> QueryResult<Self> {
        if expressions.is_empty() {
            return Err(QueryError::Validation(
                "filter group must contain at least one expression".to_string(),
            ));
        }
        Ok(Self { expressions })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Expression> {
        self.expressions.iter()
    }

    pub fn len(&self) -> usize {
        self.expressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    pub fn contains(&self, expression: &Expression) -> bool {
        self.expressions.contains(expression)
    }

    /// 记录满足组内至少一个表达式
    pub fn matches(&self, record: &Document) -> bool {
        self.expressions
            .iter()
            .any(|e| e.evaluate(record.get_path(e.field())))
    }
}

impl<'a> IntoIterator for &'a Group {
    type Item = &'a Expression;
    type IntoIter = std::slice::Iter<'a, Expression>;

    fn into_iter(self) -> Self::IntoIter {
        self.expressions.iter()
    }
}

/// 过滤器:AND-of-ORs
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    groups: Vec<Group>,
}

impl Filter {
    pub fn new(groups: Vec<Group>) -> Self {
        Self { groups }
    }

    /// 匹配全部记录的空过滤器
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Group> {
        self.groups.iter()
    }

    pub fn contains(&self, group: &Group) -> bool {
        self.groups.contains(group)
    }

    /// 所有表达式(按组顺序)
    pub fn expressions(&self) -> impl Iterator<Item = &Expression> {
        self.groups.iter().flat_map(Group::iter)
    }

    /// # Brief
    /// 参照语义:记录满足每个组中的至少一个表达式
    ///
    /// 记录按逻辑字段名取值,用于验证两个编译器的判定结果。
    pub fn matches(&self, record: &Document) -> bool {
        self.groups.iter().all(|g| g.matches(record))
    }
}

impl<'a> IntoIterator for &'a Filter {
    type Item = &'a Group;
    type IntoIter = std::slice::Iter<'a, Group>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.iter()
    }
}
