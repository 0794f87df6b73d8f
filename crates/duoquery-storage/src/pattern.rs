//! 通配模式模块
//!
//! 文档存储的 `wildcard` 查询、SQLite 的 `like()` 和请求侧的参照判定共用这一个匹配器。
//! 模式编译为锚定的 `^...$` 正则;大小写不敏感时按 Unicode 简单折叠,与 PostgreSQL `ILIKE` 一致。

use crate::{StorageError, StorageResult};
use regex::Regex;

/// 编译后的通配模式
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    regex: Regex,
}

impl WildcardPattern {
    /// # Brief
    /// 编译搜索引擎通配语法:`*` 任意串,`?` 单个字符,`\` 转义
    ///
    /// # Arguments
    /// * `raw` - 模式文本
    /// * `case_insensitive` - 是否忽略大小写
    pub fn wildcard(raw: &str, case_insensitive: bool) -> StorageResult<Self> {
        Self::compile(raw, '*', '?', Some('\\'), case_insensitive)
    }

    /// # Brief
    /// 编译 SQL LIKE 语法:`%` 任意串,`_` 单个字符,总是忽略大小写
    ///
    /// # Arguments
    /// * `raw` - 模式文本
    /// * `escape` - `ESCAPE` 子句指定的转义字符
    pub fn sql_like(raw: &str, escape: Option<char>) -> StorageResult<Self> {
        Self::compile(raw, '%', '_', escape, true)
    }

    fn compile(
        raw: &str,
        any_run: char,
        any_one: char,
        escape: Option<char>,
        case_insensitive: bool,
    ) -> StorageResult<Self> {
        let mut source = String::with_capacity(raw.len() + 8);
        source.push_str(if case_insensitive { "(?is)^" } else { "(?s)^" });
        let mut buf = [0u8; 4];
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if Some(c) == escape {
                let literal = chars.next().unwrap_or(c);
                source.push_str(&regex::escape(literal.encode_utf8(&mut buf)));
            } else if c == any_run {
                source.push_str(".*");
            } else if c == any_one {
                source.push('.');
            } else {
                source.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
        source.push('$');
        let regex = Regex::new(&source)
            .map_err(|e| StorageError::MalformedQuery(format!("invalid pattern {:?}: {}", raw, e)))?;
        Ok(Self { regex })
    }

    /// 整串匹配
    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// 编译后的正则源码
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

impl PartialEq for WildcardPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_syntax() {
        let p = WildcardPattern::wildcard("*arch*", true).unwrap();
        assert!(p.matches("Senior Architect"));
        assert!(!p.matches("Engineer"));
        assert_eq!(p.as_str(), "(?is)^.*arch.*$");

        let p = WildcardPattern::wildcard("a?c", false).unwrap();
        assert!(p.matches("abc"));
        assert!(!p.matches("ABC"));
        assert!(!p.matches("abbc"));

        let p = WildcardPattern::wildcard(r"100\*", false).unwrap();
        assert!(p.matches("100*"));
        assert!(!p.matches("1000"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let p = WildcardPattern::wildcard("a.b(c)+[d]", false).unwrap();
        assert!(p.matches("a.b(c)+[d]"));
        assert!(!p.matches("axb(c)+[d]"));
        let p = WildcardPattern::wildcard("line*", false).unwrap();
        assert!(p.matches("line one\nline two"));
    }

    #[test]
    fn test_sql_like_syntax() {
        let p = WildcardPattern::sql_like(r"%a\_b%", Some('\\')).unwrap();
        assert!(p.matches("XA_BX"));
        assert!(!p.matches("XAzBX"));
        let p = WildcardPattern::sql_like("h_llo", None).unwrap();
        assert!(p.matches("HELLO"));
        assert!(!p.matches("hllo"));
    }

    #[test]
    fn test_unicode_case_folding() {
        let p = WildcardPattern::wildcard("*straße*", true).unwrap();
        assert!(p.matches("Hauptstraße"));
        let p = WildcardPattern::wildcard("émile", true).unwrap();
        assert!(p.matches("ÉMILE"));
        let p = WildcardPattern::sql_like("%Ω%", None).unwrap();
        assert!(p.matches("ω"));
    }
}
