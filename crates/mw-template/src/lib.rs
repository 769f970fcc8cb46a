//! Stateless, thread-safe template engine (§4.5 / §4.3-2).
//!
//! Grammar: `{{identifier}}` substitution, `{{#if identifier}}…{{/if}}`
//! conditionals, `{{#each identifier}}…{{/each}}` loops. Loop bodies pull
//! per-iteration values from `{list}_{i}_{field}` keys in `template_data`,
//! scoped over the outer data for the duration of that iteration.

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unresolved placeholder token: {0}")]
    UnresolvedToken(String),
    #[error("unbalanced html tag: {0}")]
    UnbalancedHtml(String),
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

fn each_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{\{#each\s+(\w+)\}\}(.*?)\{\{/each\}\}").unwrap())
}

fn if_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{\{#if\s+(\w+)\}\}(.*?)\{\{/if\}\}").unwrap())
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").unwrap())
}

fn unresolved_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{[^}]*\}\}").unwrap())
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<(/?)([a-zA-Z][a-zA-Z0-9]*)((?:[^>]*))>").unwrap())
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Exact-match lookup, falling back to a case-insensitive key scan.
fn lookup(data: &Value, key: &str) -> Option<String> {
    let obj = data.as_object()?;
    if let Some(v) = obj.get(key) {
        return value_to_string(v);
    }
    let lower = key.to_lowercase();
    obj.iter()
        .find(|(k, _)| k.to_lowercase() == lower)
        .and_then(|(_, v)| value_to_string(v))
}

fn is_falsy_or_empty(s: &str) -> bool {
    s.is_empty() || s.eq_ignore_ascii_case("false")
}

/// Builds the data view used to render one `{{#each}}` iteration: outer
/// `data` plus every `{list}_{i}_{field}` key exposed as bare `{field}`.
fn scope_for_iteration(data: &Value, list_name: &str, index: usize) -> Value {
    let mut map = data.as_object().cloned().unwrap_or_default();
    let prefix = format!("{list_name}_{index}_");
    let overrides: Vec<(String, Value)> = data
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| k.strip_prefix(prefix.as_str()).map(|field| (field.to_string(), v.clone())))
                .collect()
        })
        .unwrap_or_default();
    for (field, value) in overrides {
        map.insert(field, value);
    }
    Value::Object(map)
}

fn apply_conditionals(template: &str, data: &Value) -> String {
    let mut result = template.to_string();
    while if_re().is_match(&result) {
        result = if_re()
            .replace_all(&result, |caps: &Captures| {
                let key = &caps[1];
                let inner = &caps[2];
                match lookup(data, key) {
                    Some(v) if !is_falsy_or_empty(&v) => inner.to_string(),
                    _ => String::new(),
                }
            })
            .to_string();
    }
    result
}

fn substitute_placeholders(template: &str, data: &Value) -> String {
    placeholder_re()
        .replace_all(template, |caps: &Captures| match lookup(data, &caps[1]) {
            Some(v) => v,
            None => caps[0].to_string(),
        })
        .to_string()
}

fn expand_each(template: &str, data: &Value) -> String {
    let mut result = template.to_string();
    while each_re().is_match(&result) {
        result = each_re()
            .replace_all(&result, |caps: &Captures| {
                let list_name = &caps[1];
                let inner = &caps[2];
                let count = lookup(data, &format!("{list_name}_count"))
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(0);

                let mut rendered = String::new();
                for i in 0..count {
                    let scope = scope_for_iteration(data, list_name, i);
                    let after_if = apply_conditionals(inner, &scope);
                    rendered.push_str(&substitute_placeholders(&after_if, &scope));
                }
                rendered
            })
            .to_string();
    }
    result
}

fn validate_no_unresolved(rendered: &str) -> Result<(), TemplateError> {
    match unresolved_re().find(rendered) {
        Some(m) => Err(TemplateError::UnresolvedToken(m.as_str().to_string())),
        None => Ok(()),
    }
}

fn validate_html_balance(html: &str) -> Result<(), TemplateError> {
    let mut stack: Vec<String> = Vec::new();
    for caps in tag_re().captures_iter(html) {
        let closing = &caps[1] == "/";
        let name = caps[2].to_lowercase();
        let attrs = &caps[3];

        if VOID_ELEMENTS.contains(&name.as_str()) || attrs.trim_end().ends_with('/') {
            continue;
        }

        if closing {
            match stack.pop() {
                Some(open) if open == name => {}
                _ => return Err(TemplateError::UnbalancedHtml(name)),
            }
        } else {
            stack.push(name);
        }
    }

    match stack.pop() {
        Some(name) => Err(TemplateError::UnbalancedHtml(name)),
        None => Ok(()),
    }
}

fn render(template: &str, data: &Value) -> (String, Result<(), TemplateError>) {
    let after_each = expand_each(template, data);
    let after_if = apply_conditionals(&after_each, data);
    let rendered = substitute_placeholders(&after_if, data);
    let check = validate_no_unresolved(&rendered);
    (rendered, check)
}

/// Render a subject line: placeholders, conditionals, loops, then validate
/// no tokens are left unresolved.
pub fn render_subject(template: &str, data: &Value) -> Result<String, TemplateError> {
    let (rendered, check) = render(template, data);
    check?;
    Ok(rendered)
}

/// Render a body. When `is_html` the result must also have balanced,
/// non-void HTML tags.
pub fn render_body(template: &str, data: &Value, is_html: bool) -> Result<String, TemplateError> {
    let (rendered, check) = render(template, data);
    check?;
    if is_html {
        validate_html_balance(&rendered)?;
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholder_substitution() {
        let data = json!({"UserName": "Ada"});
        assert_eq!(render_subject("Welcome {{UserName}}", &data).unwrap(), "Welcome Ada");
    }

    #[test]
    fn test_placeholder_case_insensitive_fallback() {
        let data = json!({"username": "Ada"});
        assert_eq!(render_subject("Welcome {{UserName}}", &data).unwrap(), "Welcome Ada");
    }

    #[test]
    fn test_conditional_true_and_false() {
        let truthy = json!({"Activated": "true"});
        let body = render_body("{{#if Activated}}OK{{/if}}", &truthy, false).unwrap();
        assert!(body.contains("OK"));

        let falsy = json!({"Activated": "false"});
        let body = render_body("{{#if Activated}}OK{{/if}}", &falsy, false).unwrap();
        assert!(!body.contains("OK"));
    }

    #[test]
    fn test_conditional_missing_key_is_falsy() {
        let data = json!({});
        let body = render_body("{{#if Activated}}OK{{/if}}", &data, false).unwrap();
        assert!(!body.contains("OK"));
    }

    #[test]
    fn test_each_loop_renders_per_iteration_fields() {
        let data = json!({
            "items_count": "2",
            "items_0_name": "Widget",
            "items_1_name": "Gadget",
        });
        let body = render_body("{{#each items}}- {{name}}\n{{/each}}", &data, false).unwrap();
        assert_eq!(body, "- Widget\n- Gadget\n");
    }

    #[test]
    fn test_each_loop_falls_back_to_outer_scope() {
        let data = json!({
            "items_count": "1",
            "items_0_name": "Widget",
            "Currency": "USD",
        });
        let body = render_body("{{#each items}}{{name}} ({{Currency}}){{/each}}", &data, false).unwrap();
        assert_eq!(body, "Widget (USD)");
    }

    #[test]
    fn test_unresolved_placeholder_is_validation_error() {
        let data = json!({});
        let err = render_subject("Hi {{UserName}}", &data).unwrap_err();
        assert!(matches!(err, TemplateError::UnresolvedToken(_)));
    }

    #[test]
    fn test_unbalanced_html_rejected() {
        let data = json!({});
        let err = render_body("<div><p>Hi</div>", &data, true).unwrap_err();
        assert!(matches!(err, TemplateError::UnbalancedHtml(_)));
    }

    #[test]
    fn test_balanced_html_with_void_elements_accepted() {
        let data = json!({"UserName": "Ada"});
        let body = render_body("<div><p>Hi {{UserName}}</p><br><img src=\"x\"/></div>", &data, true).unwrap();
        assert!(body.contains("Hi Ada"));
    }
}
