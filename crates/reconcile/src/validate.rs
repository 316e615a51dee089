//! Spec comparison helpers: immutable-field checking and desired-subset
//! drift detection.
//!
//! Desired specs arrive in snake_case while live objects come back from the
//! API server in camelCase; every path lookup tries both spellings.

use serde_json::{Map, Value as Json};

use kubestate_core::Error;

/// Looks up a dotted path, accepting either spelling of each segment.
fn lookup_path<'a>(map: &'a Map<String, Json>, path: &str) -> Option<&'a Json> {
    let mut current = map;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let value = current
            .get(segment)
            .or_else(|| current.get(&snake_to_camel(segment)))?;
        if segments.peek().is_none() {
            return Some(value);
        }
        current = value.as_object()?;
    }
    None
}

fn snake_to_camel(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut upper_next = false;
    for c in segment.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Rejects a replace that would alter a field the cluster treats as
/// immutable. A field only counts when both specs carry it and the values
/// differ; omitting a field in the desired spec leaves it alone.
pub fn check_immutable(
    observed: &Map<String, Json>,
    desired: &Map<String, Json>,
    fields: &[&str],
) -> Result<(), Error> {
    for field in fields {
        let (Some(old), Some(new)) = (lookup_path(observed, field), lookup_path(desired, field))
        else {
            continue;
        };
        if old != new {
            return Err(Error::ImmutableField { field: field.to_string() });
        }
    }
    Ok(())
}

/// True when the desired spec asks for anything the observed spec does not
/// already have. Comparison is desired-subset: keys absent from the desired
/// spec are cluster-managed and never count as drift.
pub fn specs_differ(desired: &Map<String, Json>, observed: &Map<String, Json>) -> bool {
    for (key, wanted) in desired {
        let Some(current) = observed.get(key).or_else(|| observed.get(&snake_to_camel(key)))
        else {
            return true;
        };
        match (wanted, current) {
            (Json::Object(w), Json::Object(c)) => {
                if specs_differ(w, c) {
                    return true;
                }
            }
            _ => {
                if wanted != current {
                    return true;
                }
            }
        }
    }
    false
}
