//! RFC 6570 URI templates, the subset resource templates need.
//!
//! Supports the level-1 simple form plus the `+`, `#`, `.`, `/`, `?` and
//! `&` operators, for both expansion and matching. Matching is the inverse
//! used by `resources/read`: given a concrete URI, recover the variable
//! values a template would have expanded from.

use std::collections::HashMap;
use std::fmt;

use crate::utils::error::{McpError, McpResult};

const MAX_TEMPLATE_LENGTH: usize = 1_000_000;
const MAX_TEMPLATE_EXPRESSIONS: usize = 10_000;

/// Variable values recovered by [`UriTemplate::match_uri`] or supplied to
/// [`UriTemplate::expand`].
pub type UriVariables = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    /// `{var}`: comma-joined, strict encoding
    Simple,
    /// `{+var}`: reserved characters pass through
    Reserved,
    /// `{#var}`: fragment
    Fragment,
    /// `{.var}`: dot-prefixed label
    Label,
    /// `{/var}`: path segment
    Path,
    /// `{?var}`: query string
    Query,
    /// `{&var}`: query continuation
    QueryContinuation,
}

impl Operator {
    fn parse(expression: &str) -> (Self, &str) {
        match expression.chars().next() {
            Some('+') => (Operator::Reserved, &expression[1..]),
            Some('#') => (Operator::Fragment, &expression[1..]),
            Some('.') => (Operator::Label, &expression[1..]),
            Some('/') => (Operator::Path, &expression[1..]),
            Some('?') => (Operator::Query, &expression[1..]),
            Some('&') => (Operator::QueryContinuation, &expression[1..]),
            _ => (Operator::Simple, expression),
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Operator::Simple | Operator::Reserved => "",
            Operator::Fragment => "#",
            Operator::Label => ".",
            Operator::Path => "/",
            Operator::Query => "?",
            Operator::QueryContinuation => "&",
        }
    }

    fn separator(&self) -> char {
        match self {
            Operator::Simple | Operator::Reserved | Operator::Fragment => ',',
            Operator::Label => '.',
            Operator::Path => '/',
            Operator::Query | Operator::QueryContinuation => '&',
        }
    }

    fn is_query(&self) -> bool {
        matches!(self, Operator::Query | Operator::QueryContinuation)
    }
}

#[derive(Debug, Clone)]
enum Part {
    Text(String),
    Expression { operator: Operator, names: Vec<String> },
}

/// A parsed RFC 6570 URI template.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    template: String,
    parts: Vec<Part>,
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.template.fmt(f)
    }
}

impl UriTemplate {
    /// Parse a template string.
    pub fn new(template: impl Into<String>) -> McpResult<Self> {
        let template = template.into();
        if template.len() > MAX_TEMPLATE_LENGTH {
            return Err(McpError::InvalidParams(format!(
                "URI template exceeds maximum length of {MAX_TEMPLATE_LENGTH}"
            )));
        }
        let parts = parse_parts(&template)?;
        Ok(Self { template, parts })
    }

    /// The raw template string.
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// The variable names appearing in the template, in order.
    pub fn variable_names(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Expression { names, .. } => Some(names.iter().map(String::as_str)),
                Part::Text(_) => None,
            })
            .flatten()
            .collect()
    }

    /// Expand the template with the given variables. Missing variables
    /// expand to nothing.
    pub fn expand(&self, variables: &UriVariables) -> String {
        let mut output = String::with_capacity(self.template.len());
        for part in &self.parts {
            match part {
                Part::Text(text) => output.push_str(text),
                Part::Expression { operator, names } => {
                    let mut rendered = Vec::new();
                    for name in names {
                        let Some(value) = variables.get(name) else {
                            continue;
                        };
                        if operator.is_query() {
                            rendered.push(format!(
                                "{name}={}",
                                encode(value, matches!(operator, Operator::Reserved))
                            ));
                        } else {
                            rendered.push(encode(
                                value,
                                matches!(operator, Operator::Reserved | Operator::Fragment),
                            ));
                        }
                    }
                    if rendered.is_empty() {
                        continue;
                    }
                    output.push_str(operator.prefix());
                    let separator = operator.separator();
                    output.push_str(&rendered.join(&separator.to_string()));
                }
            }
        }
        output
    }

    /// Match a concrete URI against the template, recovering variable
    /// values. Returns `None` when the URI does not fit.
    pub fn match_uri(&self, uri: &str) -> Option<UriVariables> {
        let mut variables = UriVariables::new();
        let mut rest = uri;
        let mut parts = self.parts.iter().peekable();

        while let Some(part) = parts.next() {
            match part {
                Part::Text(text) => {
                    rest = rest.strip_prefix(text.as_str())?;
                }
                Part::Expression { operator, names } if operator.is_query() => {
                    // Query expressions consume name=value pairs wherever
                    // they sit in the remaining query string.
                    for name in names {
                        if let Some(value) = find_query_value(rest, name) {
                            variables.insert(name.clone(), decode(&value));
                        }
                    }
                    // The query tail is consumed wholesale.
                    rest = "";
                }
                Part::Expression { operator, names } => {
                    rest = rest.strip_prefix(operator.prefix())?;
                    // The expression's value runs until the next literal.
                    let until = match parts.peek() {
                        Some(Part::Text(text)) => rest.find(text.as_str())?,
                        Some(Part::Expression { operator, .. }) if operator.is_query() => {
                            rest.find('?').unwrap_or(rest.len())
                        }
                        _ => rest.len(),
                    };
                    let span = &rest[..until];
                    rest = &rest[until..];

                    // Reserved expansions may span segments; everything else
                    // stops at a slash.
                    if !matches!(operator, Operator::Reserved | Operator::Fragment)
                        && span.contains('/')
                        && !matches!(operator, Operator::Path)
                    {
                        return None;
                    }

                    let separator = operator.separator();
                    let mut values = span.split(separator);
                    for name in names {
                        let value = values.next()?;
                        if value.is_empty() {
                            return None;
                        }
                        variables.insert(name.clone(), decode(value));
                    }
                }
            }
        }

        if rest.is_empty() || rest.starts_with('?') {
            Some(variables)
        } else {
            None
        }
    }
}

fn parse_parts(template: &str) -> McpResult<Vec<Part>> {
    let mut parts = Vec::new();
    let mut remaining = template;
    let mut expressions = 0usize;

    while let Some(open) = remaining.find('{') {
        if open > 0 {
            parts.push(Part::Text(remaining[..open].to_string()));
        }
        let Some(close) = remaining[open..].find('}') else {
            return Err(McpError::InvalidParams(
                "unclosed template expression".into(),
            ));
        };
        expressions += 1;
        if expressions > MAX_TEMPLATE_EXPRESSIONS {
            return Err(McpError::InvalidParams(
                "template has too many expressions".into(),
            ));
        }
        let raw = &remaining[open + 1..open + close];
        let (operator, names_raw) = Operator::parse(raw);
        let names: Vec<String> = names_raw
            .split(',')
            .map(|name| name.trim().trim_end_matches('*').to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            return Err(McpError::InvalidParams(format!(
                "template expression {{{raw}}} has no variable names"
            )));
        }
        parts.push(Part::Expression { operator, names });
        remaining = &remaining[open + close + 1..];
    }
    if !remaining.is_empty() {
        parts.push(Part::Text(remaining.to_string()));
    }
    Ok(parts)
}

fn find_query_value(haystack: &str, name: &str) -> Option<String> {
    let query = haystack.strip_prefix('?').unwrap_or(haystack);
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

fn is_reserved(c: char) -> bool {
    matches!(
        c,
        ':' | '/' | '?' | '#' | '[' | ']' | '@' | '!' | '$' | '&' | '\'' | '(' | ')' | '*' | '+'
            | ',' | ';' | '='
    )
}

fn encode(value: &str, allow_reserved: bool) -> String {
    let mut output = String::with_capacity(value.len());
    for c in value.chars() {
        if is_unreserved(c) || (allow_reserved && is_reserved(c)) {
            output.push(c);
        } else {
            let mut buffer = [0u8; 4];
            for byte in c.encode_utf8(&mut buffer).bytes() {
                output.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    output
}

fn decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&value[i + 1..i + 3], 16) {
                output.push(byte);
                i += 3;
                continue;
            }
        }
        output.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&output).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> UriVariables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_simple_expansion() {
        let template = UriTemplate::new("file:///notes/{name}").unwrap();
        assert_eq!(
            template.expand(&vars(&[("name", "todo list")])),
            "file:///notes/todo%20list"
        );
    }

    #[test]
    fn test_reserved_expansion_keeps_slashes() {
        let template = UriTemplate::new("file://{+path}").unwrap();
        assert_eq!(
            template.expand(&vars(&[("path", "/a/b/c")])),
            "file:///a/b/c"
        );
    }

    #[test]
    fn test_query_expansion() {
        let template = UriTemplate::new("db://query{?table,limit}").unwrap();
        assert_eq!(
            template.expand(&vars(&[("table", "users"), ("limit", "10")])),
            "db://query?table=users&limit=10"
        );
        // Missing variables are skipped.
        assert_eq!(
            template.expand(&vars(&[("table", "users")])),
            "db://query?table=users"
        );
    }

    #[test]
    fn test_match_simple() {
        let template = UriTemplate::new("file:///notes/{name}").unwrap();
        let variables = template.match_uri("file:///notes/shopping").unwrap();
        assert_eq!(variables.get("name").map(String::as_str), Some("shopping"));

        // A simple variable does not span path segments.
        assert!(template.match_uri("file:///notes/a/b").is_none());
        assert!(template.match_uri("file:///other/shopping").is_none());
    }

    #[test]
    fn test_match_multiple_variables() {
        let template = UriTemplate::new("repo://{owner}/{name}/contents").unwrap();
        let variables = template.match_uri("repo://octo/mcp/contents").unwrap();
        assert_eq!(variables.get("owner").map(String::as_str), Some("octo"));
        assert_eq!(variables.get("name").map(String::as_str), Some("mcp"));
    }

    #[test]
    fn test_match_reserved_spans_segments() {
        let template = UriTemplate::new("file://{+path}").unwrap();
        let variables = template.match_uri("file:///a/b/c").unwrap();
        assert_eq!(variables.get("path").map(String::as_str), Some("/a/b/c"));
    }

    #[test]
    fn test_match_decodes_percent_escapes() {
        let template = UriTemplate::new("file:///notes/{name}").unwrap();
        let variables = template.match_uri("file:///notes/todo%20list").unwrap();
        assert_eq!(
            variables.get("name").map(String::as_str),
            Some("todo list")
        );
    }

    #[test]
    fn test_match_query_variables() {
        let template = UriTemplate::new("db://query{?table}").unwrap();
        let variables = template.match_uri("db://query?table=users").unwrap();
        assert_eq!(variables.get("table").map(String::as_str), Some("users"));
    }

    #[test]
    fn test_round_trip() {
        let template = UriTemplate::new("api://{host}/v1{/resource}").unwrap();
        let input = vars(&[("host", "example"), ("resource", "tools")]);
        let expanded = template.expand(&input);
        assert_eq!(expanded, "api://example/v1/tools");
        assert_eq!(template.match_uri(&expanded).unwrap(), input);
    }

    #[test]
    fn test_unclosed_expression_is_rejected() {
        assert!(UriTemplate::new("file:///{name").is_err());
        assert!(UriTemplate::new("file:///{}").is_err());
    }

    #[test]
    fn test_variable_names() {
        let template = UriTemplate::new("repo://{owner}/{name}{?ref}").unwrap();
        assert_eq!(template.variable_names(), vec!["owner", "name", "ref"]);
    }
}
