//! 主体映射规则
//!
//! 规则语法与 Hadoop `hadoop.security.auth_to_local` 一致：
//!
//! - `DEFAULT`：主体属于默认 realm 时取第一个组件
//! - `RULE:[n:fmt](filter)s/pattern/replacement/g/L`：只作用于恰好有
//!   `n` 个组件的主体。`fmt` 中 `$0` 为 realm，`$1`..`$n` 为各组件；
//!   格式化结果必须完整匹配 `filter`，然后执行可选的 sed 替换，
//!   末尾的 `/L` 表示转为小写
//!
//! 映射结果中不能包含 `/` 或 `@`，否则视为该规则不匹配。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use hdfs_guard_common::{Error, Result};

/// 配置文件中的规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRuleSpec {
    /// 规则文本
    pub rule: String,
    /// 匹配到的用户是否为超级用户
    #[serde(default)]
    pub superuser: bool,
}

impl MappingRuleSpec {
    /// 普通规则
    pub fn new(rule: &str) -> Self {
        Self {
            rule: rule.to_string(),
            superuser: false,
        }
    }

    /// 超级用户规则
    pub fn superuser(rule: &str) -> Self {
        Self {
            rule: rule.to_string(),
            superuser: true,
        }
    }
}

/// 拆分后的 Kerberos 名称
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KerberosName {
    /// `/` 分隔的组件
    pub components: Vec<String>,
    /// realm，未写明时为 None
    pub realm: Option<String>,
}

impl KerberosName {
    /// 解析 `a/b@REALM` 形式的主体
    pub fn parse(principal: &str) -> Result<Self> {
        let (name, realm) = match principal.rsplit_once('@') {
            Some((name, realm)) if !realm.is_empty() => (name, Some(realm.to_string())),
            Some(_) => return Err(Error::Unmapped(format!("realm 为空: {}", principal))),
            None => (principal, None),
        };
        if name.is_empty() || name.contains('@') {
            return Err(Error::Unmapped(format!("无效的主体: {}", principal)));
        }
        let components: Vec<String> = name.split('/').map(str::to_string).collect();
        if components.iter().any(String::is_empty) {
            return Err(Error::Unmapped(format!("无效的主体: {}", principal)));
        }
        Ok(Self { components, realm })
    }
}

/// sed 风格替换
#[derive(Debug, Clone)]
struct Substitution {
    pattern: Regex,
    replacement: String,
    global: bool,
}

#[derive(Debug, Clone)]
enum RuleKind {
    Default,
    Rule {
        components: usize,
        format: String,
        filter: Regex,
        substitution: Option<Substitution>,
        lowercase: bool,
    },
}

/// 已编译的映射规则
#[derive(Debug, Clone)]
pub struct MappingRule {
    kind: RuleKind,
    superuser: bool,
    source: String,
}

impl MappingRule {
    /// 编译一条规则
    pub fn parse(spec: &MappingRuleSpec) -> Result<Self> {
        let source = spec.rule.trim().to_string();
        let kind = if source == "DEFAULT" {
            RuleKind::Default
        } else if let Some(body) = source.strip_prefix("RULE:") {
            parse_rule_body(body).map_err(|reason| {
                Error::InvalidRule(format!("{}: {}", source, reason))
            })?
        } else {
            return Err(Error::InvalidRule(format!(
                "{}: 规则必须以 RULE: 开头或为 DEFAULT",
                source
            )));
        };

        Ok(Self {
            kind,
            superuser: spec.superuser,
            source,
        })
    }

    /// 编译规则列表，保持顺序
    pub fn parse_all(specs: &[MappingRuleSpec]) -> Result<Vec<Self>> {
        specs.iter().map(Self::parse).collect()
    }

    /// 是否为超级用户规则
    pub fn is_superuser(&self) -> bool {
        self.superuser
    }

    /// 规则原文
    pub fn source(&self) -> &str {
        &self.source
    }

    /// 转回配置形式
    pub fn spec(&self) -> MappingRuleSpec {
        MappingRuleSpec {
            rule: self.source.clone(),
            superuser: self.superuser,
        }
    }

    /// 对主体应用规则，不匹配时返回 None
    pub fn apply(&self, name: &KerberosName, default_realm: &str) -> Option<String> {
        let mapped = match &self.kind {
            RuleKind::Default => {
                let realm = name.realm.as_deref().unwrap_or(default_realm);
                if realm != default_realm {
                    return None;
                }
                name.components.first()?.clone()
            }
            RuleKind::Rule {
                components,
                format,
                filter,
                substitution,
                lowercase,
            } => {
                if name.components.len() != *components {
                    return None;
                }
                let realm = name.realm.as_deref().unwrap_or(default_realm);
                let base = expand_format(format, realm, &name.components)?;
                if !filter.is_match(&base) {
                    return None;
                }
                let mut result = match substitution {
                    Some(sub) if sub.global => sub
                        .pattern
                        .replace_all(&base, sub.replacement.as_str())
                        .into_owned(),
                    Some(sub) => sub
                        .pattern
                        .replace(&base, sub.replacement.as_str())
                        .into_owned(),
                    None => base,
                };
                if *lowercase {
                    result = result.to_lowercase();
                }
                result
            }
        };

        if mapped.is_empty() || mapped.contains('/') || mapped.contains('@') {
            return None;
        }
        Some(mapped)
    }
}

impl fmt::Display for MappingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// 解析 `[n:fmt](filter)s/pattern/replacement/g/L` 部分
fn parse_rule_body(body: &str) -> std::result::Result<RuleKind, String> {
    let rest = body
        .strip_prefix('[')
        .ok_or_else(|| "缺少 [n:fmt]".to_string())?;
    let close = rest.find(']').ok_or_else(|| "缺少 ]".to_string())?;
    let (count, format) = rest[..close]
        .split_once(':')
        .ok_or_else(|| "[n:fmt] 中缺少 :".to_string())?;
    let components: usize = count
        .trim()
        .parse()
        .map_err(|_| format!("无效的组件数: {}", count))?;
    if components == 0 {
        return Err("组件数必须大于 0".to_string());
    }
    check_format(format, components)?;

    let mut rest = &rest[close + 1..];
    let mut filter = Regex::new("^(?:.*)$").map_err(|e| e.to_string())?;
    if rest.starts_with('(') {
        let end = matching_paren(rest).ok_or_else(|| "过滤表达式缺少 )".to_string())?;
        let pattern = &rest[1..end];
        filter = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| format!("无效的过滤表达式: {}", e))?;
        rest = &rest[end + 1..];
    }

    let mut substitution = None;
    if let Some(sed) = rest.strip_prefix("s/") {
        let (parsed, remainder) = parse_substitution(sed)?;
        substitution = Some(parsed);
        rest = remainder;
    }

    let lowercase = match rest {
        "" => false,
        "/L" => true,
        other => return Err(format!("无法识别的后缀: {}", other)),
    };

    Ok(RuleKind::Rule {
        components,
        format: format.to_string(),
        filter,
        substitution,
        lowercase,
    })
}

/// 解析 `pattern/replacement/[g]`，返回剩余部分
fn parse_substitution(sed: &str) -> std::result::Result<(Substitution, &str), String> {
    let (pattern, after) = split_unescaped(sed).ok_or_else(|| "替换表达式缺少 /".to_string())?;
    let (replacement, after) =
        split_unescaped(after).ok_or_else(|| "替换表达式缺少结尾的 /".to_string())?;
    let (global, rest) = match after.strip_prefix('g') {
        Some(rest) => (true, rest),
        None => (false, after),
    };

    let pattern = Regex::new(&pattern.replace("\\/", "/"))
        .map_err(|e| format!("无效的替换表达式: {}", e))?;
    Ok((
        Substitution {
            pattern,
            replacement: braced_backreferences(&replacement.replace("\\/", "/")),
            global,
        },
        rest,
    ))
}

/// 在第一个未转义的 `/` 处切分
fn split_unescaped(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'/' => return Some((&s[..i], &s[i + 1..])),
            _ => i += 1,
        }
    }
    None
}

/// 找到与开头 `(` 配对的 `)`
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// `$1` 之后紧跟字母时 regex 会当作命名分组，统一写成 `${1}`
fn braced_backreferences(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().map(|d| d.is_ascii_digit()).unwrap_or(false) {
            out.push_str("${");
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                out.push(d);
                chars.next();
            }
            out.push('}');
        } else {
            out.push(c);
        }
    }
    out
}

fn check_format(format: &str, components: usize) -> std::result::Result<(), String> {
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            continue;
        }
        let index = chars
            .next()
            .and_then(|d| d.to_digit(10))
            .ok_or_else(|| format!("格式 {} 中 $ 后必须是数字", format))?;
        if index as usize > components {
            return Err(format!("格式引用了 ${}，但只有 {} 个组件", index, components));
        }
    }
    Ok(())
}

fn expand_format(format: &str, realm: &str, components: &[String]) -> Option<String> {
    let mut out = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let index = chars.next()?.to_digit(10)? as usize;
        if index == 0 {
            out.push_str(realm);
        } else {
            out.push_str(components.get(index - 1)?);
        }
    }
    Some(out)
}
