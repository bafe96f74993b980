//! Cookie sessions carried on a network identity.
//!
//! The pool stores an opaque `session_state` per identity. Fetchers in this
//! crate use the shape `{"cookies": {"<domain>": {"<name>": "<value>"}}}` so a
//! single identity can keep separate sessions on several shops.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

/// Cookies stored for `domain`, in name order.
pub fn cookies_for(state: Option<&Value>, domain: &str) -> BTreeMap<String, String> {
    state
        .and_then(|s| s.get("cookies"))
        .and_then(|c| c.get(domain))
        .and_then(Value::as_object)
        .map(|jar| {
            jar.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// `Cookie` request header for `domain`, if the session holds any cookies.
pub fn cookie_header(state: Option<&Value>, domain: &str) -> Option<String> {
    let jar = cookies_for(state, domain);
    if jar.is_empty() {
        return None;
    }
    Some(
        jar.iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Parses the `name=value` pair at the head of a `Set-Cookie` header.
///
/// Returns `None` for malformed headers. An empty value or an expiry in the
/// past is reported as `(name, None)`, meaning "delete".
pub fn parse_set_cookie(header: &str) -> Option<(String, Option<String>)> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let value = value.trim().trim_matches('"');

    let expired = parts.any(|attr| {
        let attr = attr.trim().to_ascii_lowercase();
        attr == "max-age=0" || attr.starts_with("max-age=-")
    });
    if expired || value.is_empty() {
        Some((name.to_string(), None))
    } else {
        Some((name.to_string(), Some(value.to_string())))
    }
}

/// Folds `updates` into the session's jar for `domain`.
///
/// Returns the new session state, or `None` when nothing changed and the
/// identity had no state to begin with.
pub fn merge_cookies<I>(state: Option<&Value>, domain: &str, updates: I) -> Option<Value>
where
    I: IntoIterator<Item = (String, Option<String>)>,
{
    let mut jar = cookies_for(state, domain);
    let mut changed = false;
    for (name, value) in updates {
        changed = true;
        match value {
            Some(value) => {
                jar.insert(name, value);
            }
            None => {
                jar.remove(&name);
            }
        }
    }
    if !changed {
        return state.cloned();
    }

    let mut root = match state {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let mut all = root
        .remove("cookies")
        .and_then(|c| match c {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();
    if jar.is_empty() {
        all.remove(domain);
    } else {
        all.insert(domain.to_string(), json!(jar));
    }
    root.insert("cookies".into(), Value::Object(all));
    Some(Value::Object(root))
}
