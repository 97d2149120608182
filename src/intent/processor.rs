// Template processor - deterministic rendering of SQL/DSL template bodies
// Supports {{ var }} substitution with filter chains, nested {% if %}
// blocks, SQL/JSON safety filters, and a stateful joiner. preserve_unknown
// mode round-trips undefined variables as {{ var }} so a template can be
// partially rendered now and finished later.

use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::DomainConfig;

/// A parsed template node.
#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Output(Expr),
    If { condition: Expr, body: Vec<Node> },
    SetJoiner { name: String, separator: String },
}

/// `path.to.var | filter | filter` or `name()` for joiner invocation.
#[derive(Debug, Clone)]
struct Expr {
    path: Vec<String>,
    filters: Vec<String>,
    is_call: bool,
}

impl Expr {
    /// Canonical source form, used to round-trip unknowns.
    fn source(&self) -> String {
        let mut text = self.path.join(".");
        if self.is_call {
            text.push_str("()");
        }
        for filter in &self.filters {
            text.push_str(" | ");
            text.push_str(filter);
        }
        text
    }
}

/// Renders template text against the domain-derived base context plus
/// runtime parameters.
pub struct TemplateProcessor {
    base_context: Map<String, Value>,
}

impl TemplateProcessor {
    pub fn new(domain: &DomainConfig) -> Self {
        Self {
            base_context: build_base_context(domain),
        }
    }

    /// Processor with an empty domain context, for standalone rendering.
    pub fn bare() -> Self {
        Self {
            base_context: Map::new(),
        }
    }

    pub fn from_shared(domain: &Arc<DomainConfig>) -> Self {
        Self::new(domain)
    }

    /// A copy of the base context for inspection or extension.
    pub fn context(&self) -> Map<String, Value> {
        self.base_context.clone()
    }

    /// Render a template with runtime parameters merged over the base
    /// context. `preserve_unknown=false` errors on undefined value use;
    /// `true` re-emits the original `{{ var }}` syntax instead.
    pub fn render(
        &self,
        template: &str,
        parameters: &HashMap<String, Value>,
        preserve_unknown: bool,
    ) -> Result<String> {
        if template.is_empty() {
            return Ok(String::new());
        }

        let nodes = parse(template)?;

        let mut context = self.base_context.clone();
        for (key, value) in parameters {
            context.insert(key.clone(), value.clone());
        }

        let mut joiners: HashMap<String, JoinerState> = HashMap::new();
        let mut output = String::new();
        render_nodes(&nodes, &context, &mut joiners, preserve_unknown, &mut output)?;

        Ok(collapse_blank_lines(&output).trim().to_string())
    }

    /// Render a SQL body. Identical to `render`; named for call-site intent.
    pub fn render_sql(
        &self,
        sql_template: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<String> {
        self.render(sql_template, parameters, false)
    }
}

struct JoinerState {
    separator: String,
    used: bool,
}

/// The base context every template sees: domain identity, primary/secondary
/// entities and their tables, and per-entity descriptors.
fn build_base_context(domain: &DomainConfig) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert("domain_name".to_string(), json!(domain.domain_name));
    context.insert("domain_type".to_string(), json!(domain.domain_type));

    if let Some(primary) = domain.primary_entity() {
        context.insert("primary_entity".to_string(), json!(primary.name));
        if let Some(table) = &primary.table_name {
            context.insert("primary_table".to_string(), json!(table));
        }
    }

    let secondary = domain.secondary_entities();
    if let Some(first) = secondary.first() {
        context.insert("secondary_entity".to_string(), json!(first.name));
        if let Some(table) = &first.table_name {
            context.insert("secondary_table".to_string(), json!(table));
        }
    }
    context.insert("has_secondary_entity".to_string(), json!(!secondary.is_empty()));

    let mut entities = Map::new();
    let mut tables = Map::new();
    for (name, entity) in &domain.entities {
        entities.insert(
            name.clone(),
            json!({
                "name": entity.name,
                "entity_type": entity.entity_type,
                "table_name": entity.table_name,
                "primary_key": entity.primary_key,
                "display_name": entity.display_name,
                "display_name_field": entity.display_name_field,
                "searchable_fields": entity.searchable_fields,
                "common_filters": entity.common_filters,
            }),
        );
        if let Some(table) = &entity.table_name {
            tables.insert(name.clone(), json!(table));
        }
    }
    context.insert("entities".to_string(), Value::Object(entities));
    context.insert("tables".to_string(), Value::Object(tables));

    context
}

// Parsing ------------------------------------------------------------------

fn parse(template: &str) -> Result<Vec<Node>> {
    static TAG: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"(?s)\{\{.*?\}\}|\{%.*?%\}").expect("valid regex")
    });

    let mut stack: Vec<(Expr, Vec<Node>)> = Vec::new();
    let mut current: Vec<Node> = Vec::new();
    let mut cursor = 0;

    for tag in TAG.find_iter(template) {
        if tag.start() > cursor {
            current.push(Node::Text(template[cursor..tag.start()].to_string()));
        }
        cursor = tag.end();

        let raw = tag.as_str();
        if let Some(inner) = raw.strip_prefix("{{").and_then(|r| r.strip_suffix("}}")) {
            current.push(Node::Output(parse_expr(inner.trim())?));
        } else if let Some(inner) = raw.strip_prefix("{%").and_then(|r| r.strip_suffix("%}")) {
            let statement = inner.trim();
            if let Some(condition) = statement.strip_prefix("if ") {
                stack.push((parse_expr(condition.trim())?, std::mem::take(&mut current)));
            } else if statement == "endif" {
                let (condition, parent) = stack
                    .pop()
                    .ok_or_else(|| anyhow!("'endif' without matching 'if'"))?;
                let body = std::mem::replace(&mut current, parent);
                current.push(Node::If { condition, body });
            } else if let Some(assignment) = statement.strip_prefix("set ") {
                current.push(parse_set(assignment.trim())?);
            } else {
                return Err(anyhow!("Unsupported template statement: {{% {statement} %}}"));
            }
        }
    }

    if cursor < template.len() {
        current.push(Node::Text(template[cursor..].to_string()));
    }
    if !stack.is_empty() {
        return Err(anyhow!("Unclosed 'if' block in template"));
    }

    Ok(current)
}

fn parse_expr(text: &str) -> Result<Expr> {
    let mut segments = text.split('|').map(str::trim);
    let head = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("Empty template expression"))?;

    let (variable, is_call) = match head.strip_suffix("()") {
        Some(name) => (name.trim(), true),
        None => (head, false),
    };

    if variable.is_empty() {
        return Err(anyhow!("Empty variable in template expression"));
    }

    Ok(Expr {
        path: variable.split('.').map(str::to_string).collect(),
        filters: segments.map(str::to_string).collect(),
        is_call,
    })
}

/// `{% set comma = joiner(", ") %}`
fn parse_set(assignment: &str) -> Result<Node> {
    static SET: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r#"^(\w+)\s*=\s*joiner\(\s*(?:"([^"]*)"|'([^']*)')?\s*\)$"#).expect("valid regex")
    });

    let captures = SET
        .captures(assignment)
        .ok_or_else(|| anyhow!("Unsupported set statement: {assignment}"))?;

    let name = captures.get(1).map(|m| m.as_str().to_string()).unwrap();
    let separator = captures
        .get(2)
        .or_else(|| captures.get(3))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| ", ".to_string());

    Ok(Node::SetJoiner { name, separator })
}

// Rendering ----------------------------------------------------------------

fn render_nodes(
    nodes: &[Node],
    context: &Map<String, Value>,
    joiners: &mut HashMap<String, JoinerState>,
    preserve_unknown: bool,
    output: &mut String,
) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => output.push_str(text),
            Node::SetJoiner { name, separator } => {
                joiners.insert(
                    name.clone(),
                    JoinerState {
                        separator: separator.clone(),
                        used: false,
                    },
                );
            }
            Node::Output(expr) => {
                if expr.is_call {
                    let name = expr.path.join(".");
                    match joiners.get_mut(&name) {
                        Some(state) => {
                            if state.used {
                                output.push_str(&state.separator);
                            } else {
                                state.used = true;
                            }
                        }
                        None if preserve_unknown => {
                            output.push_str(&format!("{{{{ {} }}}}", expr.source()));
                        }
                        None => return Err(anyhow!("Undefined joiner '{name}'")),
                    }
                    continue;
                }

                match resolve(context, &expr.path) {
                    Some(value) => output.push_str(&apply_filters(&value, &expr.filters)?),
                    // Undefined in boolean position is fine; in value
                    // position it either round-trips or errors
                    None if preserve_unknown => {
                        output.push_str(&format!("{{{{ {} }}}}", expr.source()));
                    }
                    None => {
                        return Err(anyhow!(
                            "Undefined template variable '{}'",
                            expr.path.join(".")
                        ))
                    }
                }
            }
            Node::If { condition, body } => {
                let truthy = resolve(context, &condition.path)
                    .map(|value| is_truthy(&value))
                    .unwrap_or(false);
                if truthy {
                    render_nodes(body, context, joiners, preserve_unknown, output)?;
                }
            }
        }
    }
    Ok(())
}

fn resolve(context: &Map<String, Value>, path: &[String]) -> Option<Value> {
    let mut current = context.get(path.first()?)?;
    for segment in &path[1..] {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

/// Missing, null, false, empty string/array/object, and zero are false.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn apply_filters(value: &Value, filters: &[String]) -> Result<String> {
    if filters.is_empty() {
        return Ok(plain_text(value));
    }

    let mut current = value.clone();
    let mut rendered: Option<String> = None;

    for filter in filters {
        let text = match filter.as_str() {
            "sql_string" => sql_string(&current),
            "sql_list" => sql_list(&current),
            "sql_identifier" => sql_identifier(&current),
            "json" | "tojson" => serde_json::to_string(&current)?,
            other => return Err(anyhow!("Unknown template filter '{other}'")),
        };
        current = Value::String(text.clone());
        rendered = Some(text);
    }

    Ok(rendered.unwrap_or_else(|| plain_text(value)))
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// NULL for null, otherwise single-quoted with embedded quotes doubled.
pub fn sql_string(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        other => {
            let text = plain_text(other);
            format!("'{}'", text.replace('\'', "''"))
        }
    }
}

/// NULL for empty, single value via sql_string, arrays comma-joined.
pub fn sql_list(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Array(items) if items.is_empty() => "NULL".to_string(),
        Value::Array(items) => items
            .iter()
            .map(sql_string)
            .collect::<Vec<_>>()
            .join(", "),
        other => sql_string(other),
    }
}

/// Double-quote-wrapped identifier with embedded double quotes doubled.
pub fn sql_identifier(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => {
            let text = plain_text(other);
            format!("\"{}\"", text.replace('"', "\"\""))
        }
    }
}

fn collapse_blank_lines(text: &str) -> String {
    let mut lines = Vec::new();
    let mut previous_blank = false;
    for line in text.lines() {
        let blank = line.trim().is_empty();
        if blank && previous_blank {
            continue;
        }
        lines.push(line);
        previous_blank = blank;
    }
    lines.join("\n")
}
