//! Evaluates the query DSL against documents held in memory

use serde_json::{Map, Value, json};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::Error;

/// A document being evaluated
#[derive(Debug, Clone, Copy)]
pub struct DocRef<'a> {
    /// The id this document is stored under
    pub document_id: &'a str,
    /// The id of the record this document was built from
    pub id: &'a str,
    /// The type of this document
    pub type_name: &'a str,
    /// The source of this document
    pub source: &'a Value,
}

/// Build the error for a query we can not parse
///
/// # Arguments
///
/// * `reason` - Why this query could not be parsed
fn parsing_error<T: std::fmt::Display>(reason: T) -> Error {
    Error::Service {
        status: 400,
        kind: "parsing_exception".to_owned(),
        reason: reason.to_string(),
    }
}

/// Split a single key clause into its name and body
///
/// # Arguments
///
/// * `clause` - The clause to split
fn split_clause(clause: &Value) -> Result<(&String, &Value), Error> {
    match clause.as_object() {
        Some(map) if map.len() == 1 => map
            .iter()
            .next()
            .ok_or_else(|| parsing_error("empty clause")),
        _ => Err(parsing_error(format!("malformed query clause: {clause}"))),
    }
}

/// Get the single field and its settings from a field level query
///
/// Keys like `boost` are skipped.
///
/// # Arguments
///
/// * `body` - The body of the field level query
fn split_field(body: &Value) -> Result<(&String, &Value), Error> {
    body.as_object()
        .and_then(|map| map.iter().find(|(key, _)| !matches!(key.as_str(), "boost" | "_name")))
        .ok_or_else(|| parsing_error(format!("query is missing a field: {body}")))
}

/// Collect the values for a dotted path, flattening arrays
///
/// # Arguments
///
/// * `value` - The value to walk
/// * `path` - The remaining path segments
/// * `found` - Where to put found values
fn collect_path<'a>(value: &'a Value, path: &[&str], found: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_path(item, path, found)),
        Value::Null => (),
        _ => match path.split_first() {
            None => found.push(value),
            Some((head, rest)) => {
                if let Some(child) = value.get(*head) {
                    collect_path(child, rest, found);
                }
            }
        },
    }
}

/// Get the values a document has for a field
///
/// # Arguments
///
/// * `doc` - The document to look in
/// * `field` - The field to get
pub fn field_values(doc: &DocRef<'_>, field: &str) -> Vec<Value> {
    match field {
        "_id" => vec![json!(doc.document_id)],
        "_type" => vec![json!(doc.type_name)],
        _ => {
            let path = field.split('.').collect::<Vec<&str>>();
            let mut found = Vec::default();
            collect_path(doc.source, &path, &mut found);
            found.into_iter().cloned().collect()
        }
    }
}

/// Compare two scalar values
///
/// Numbers and numeric strings are compared numerically.
///
/// # Arguments
///
/// * `left` - The first value
/// * `right` - The second value
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    // try to compare as numbers first
    let as_number = |value: &Value| match value {
        Value::Number(num) => num.as_f64(),
        Value::String(raw) => raw.parse::<f64>().ok(),
        _ => None,
    };
    if let (Some(left), Some(right)) = (as_number(left), as_number(right)) {
        return left.partial_cmp(&right);
    }
    match (left, right) {
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

/// Check if two scalar values are equal
///
/// # Arguments
///
/// * `left` - The first value
/// * `right` - The second value
fn loose_eq(left: &Value, right: &Value) -> bool {
    compare(left, right) == Some(Ordering::Equal)
}

/// Get the value out of a field query that may use a `value` or `query` key
///
/// # Arguments
///
/// * `settings` - The field settings
/// * `key` - The key the value may be nested under
fn unwrap_value<'a>(settings: &'a Value, key: &str) -> &'a Value {
    match settings {
        Value::Object(map) => map.get(key).unwrap_or(settings),
        _ => settings,
    }
}

/// Get the clauses in a bool section that may be a single clause or a list
///
/// # Arguments
///
/// * `section` - The section to get clauses from
fn clauses(section: Option<&Value>) -> Vec<&Value> {
    match section {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::default(),
        Some(other) => vec![other],
    }
}

/// Resolve a minimum should match value against a number of clauses
///
/// # Arguments
///
/// * `raw` - The minimum should match value
/// * `total` - The number of should clauses
fn minimum_should_match(raw: &Value, total: usize) -> Result<usize, Error> {
    let required = match raw {
        Value::Number(num) => num.as_i64(),
        Value::String(raw) => match raw.strip_suffix('%') {
            Some(percent) => percent
                .parse::<i64>()
                .ok()
                .map(|percent| (total as i64 * percent) / 100),
            None => raw.parse::<i64>().ok(),
        },
        _ => None,
    };
    let required =
        required.ok_or_else(|| parsing_error(format!("invalid minimum_should_match [{raw}]")))?;
    // negative values are how many clauses may be missing
    if required < 0 {
        Ok(total.saturating_sub(required.unsigned_abs() as usize))
    } else {
        Ok(required as usize)
    }
}

/// Lowercase and split text into tokens
///
/// # Arguments
///
/// * `text` - The text to split
fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Check if a document matches a bool query
///
/// # Arguments
///
/// * `body` - The body of the bool query
/// * `doc` - The document to check
fn matches_bool(body: &Value, doc: &DocRef<'_>) -> Result<bool, Error> {
    for clause in clauses(body.get("must"))
        .into_iter()
        .chain(clauses(body.get("filter")))
    {
        if !matches(clause, doc)? {
            return Ok(false);
        }
    }
    for clause in clauses(body.get("must_not")) {
        if matches(clause, doc)? {
            return Ok(false);
        }
    }
    let should = clauses(body.get("should"));
    if should.is_empty() {
        return Ok(true);
    }
    // figure out how many should clauses are required
    let required = match body.get("minimum_should_match") {
        Some(raw) => minimum_should_match(raw, should.len())?,
        None if body.get("must").is_none() && body.get("filter").is_none() => 1,
        None => 0,
    };
    let mut hit = 0;
    for clause in should {
        if matches(clause, doc)? {
            hit += 1;
        }
    }
    Ok(hit >= required)
}

/// Check if a document matches a range query
///
/// # Arguments
///
/// * `body` - The body of the range query
/// * `doc` - The document to check
fn matches_range(body: &Value, doc: &DocRef<'_>) -> Result<bool, Error> {
    let (field, bounds) = split_field(body)?;
    let bounds = bounds
        .as_object()
        .ok_or_else(|| parsing_error(format!("[range] bounds must be an object: {bounds}")))?;
    let values = field_values(doc, field);
    Ok(values.iter().any(|value| {
        bounds.iter().all(|(op, bound)| match op.as_str() {
            "gt" => compare(value, bound) == Some(Ordering::Greater),
            "gte" => matches!(compare(value, bound), Some(Ordering::Greater | Ordering::Equal)),
            "lt" => compare(value, bound) == Some(Ordering::Less),
            "lte" => matches!(compare(value, bound), Some(Ordering::Less | Ordering::Equal)),
            // formats and boosts do not change what matches
            _ => true,
        })
    }))
}

/// Check if a document matches a query clause
///
/// # Arguments
///
/// * `query` - The query to check
/// * `doc` - The document to check
pub fn matches(query: &Value, doc: &DocRef<'_>) -> Result<bool, Error> {
    let (kind, body) = split_clause(query)?;
    match kind.as_str() {
        "match_all" => Ok(true),
        "match_none" => Ok(false),
        "term" => {
            let (field, settings) = split_field(body)?;
            let expected = unwrap_value(settings, "value");
            Ok(field_values(doc, field)
                .iter()
                .any(|value| loose_eq(value, expected)))
        }
        "terms" => {
            let (field, expected) = split_field(body)?;
            let expected = expected
                .as_array()
                .ok_or_else(|| parsing_error(format!("[terms] values must be a list: {body}")))?;
            Ok(field_values(doc, field)
                .iter()
                .any(|value| expected.iter().any(|exp| loose_eq(value, exp))))
        }
        "ids" => {
            let ids = clauses(body.get("values"));
            Ok(ids.iter().any(|id| match id {
                Value::String(id) => id == doc.document_id,
                other => other.to_string() == doc.document_id,
            }))
        }
        "exists" => {
            let field = body
                .get("field")
                .and_then(Value::as_str)
                .ok_or_else(|| parsing_error("[exists] requires a field"))?;
            Ok(!field_values(doc, field).is_empty())
        }
        "prefix" => {
            let (field, settings) = split_field(body)?;
            let prefix = unwrap_value(settings, "value").as_str().unwrap_or_default();
            Ok(field_values(doc, field)
                .iter()
                .any(|value| value.as_str().is_some_and(|value| value.starts_with(prefix))))
        }
        "match" | "match_phrase" => {
            let (field, settings) = split_field(body)?;
            let expected = unwrap_value(settings, "query");
            let values = field_values(doc, field);
            match expected {
                Value::String(text) => {
                    let wanted = tokens(text);
                    Ok(values.iter().any(|value| {
                        let have = match value {
                            Value::String(value) => tokens(value),
                            other => vec![other.to_string().to_lowercase()],
                        };
                        if kind == "match_phrase" {
                            have.windows(wanted.len().max(1)).any(|window| window == wanted)
                        } else {
                            wanted.iter().any(|token| have.contains(token))
                        }
                    }))
                }
                other => Ok(values.iter().any(|value| loose_eq(value, other))),
            }
        }
        "range" => matches_range(body, doc),
        "bool" => matches_bool(body, doc),
        "dis_max" => {
            for clause in clauses(body.get("queries")) {
                if matches(clause, doc)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        "constant_score" => match body.get("filter") {
            Some(filter) => matches(filter, doc),
            None => Err(parsing_error("[constant_score] requires a filter")),
        },
        "function_score" => match body.get("query") {
            Some(query) => matches(query, doc),
            None => Ok(true),
        },
        unknown => Err(parsing_error(format!("unknown query [{unknown}]"))),
    }
}

/// Get the numeric values of a field across documents
///
/// # Arguments
///
/// * `docs` - The documents to look in
/// * `field` - The field to get values for
fn numbers(docs: &[DocRef<'_>], field: &str) -> Vec<f64> {
    docs.iter()
        .flat_map(|doc| field_values(doc, field))
        .filter_map(|value| match value {
            Value::Number(num) => num.as_f64(),
            Value::String(raw) => raw.parse::<f64>().ok(),
            _ => None,
        })
        .collect()
}

/// Compute a terms aggregation
///
/// # Arguments
///
/// * `body` - The body of the terms aggregation
/// * `docs` - The documents to aggregate
/// * `sub` - Any sub aggregations to compute per bucket
fn terms_aggregation(
    body: &Value,
    docs: &[DocRef<'_>],
    sub: Option<&Map<String, Value>>,
) -> Result<Value, Error> {
    let field = body
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| parsing_error("[terms] aggregation requires a field"))?;
    let size = body.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;
    // bucket our documents by their values
    let mut buckets: BTreeMap<String, (Value, Vec<DocRef<'_>>)> = BTreeMap::default();
    for doc in docs {
        let mut seen = Vec::default();
        for value in field_values(doc, field) {
            let key = match &value {
                Value::String(raw) => raw.clone(),
                other => other.to_string(),
            };
            if seen.contains(&key) {
                continue;
            }
            seen.push(key.clone());
            buckets.entry(key).or_insert_with(|| (value, Vec::default())).1.push(*doc);
        }
    }
    let mut buckets = buckets.into_values().collect::<Vec<_>>();
    // the biggest buckets come first
    buckets.sort_by(|(_, left), (_, right)| right.len().cmp(&left.len()));
    let other = buckets.iter().skip(size).map(|(_, docs)| docs.len()).sum::<usize>();
    let mut rendered = Vec::with_capacity(buckets.len().min(size));
    for (key, bucket_docs) in buckets.into_iter().take(size) {
        let mut bucket = Map::default();
        bucket.insert("key".to_owned(), key);
        bucket.insert("doc_count".to_owned(), json!(bucket_docs.len()));
        if let Some(sub) = sub {
            bucket.extend(aggregate(sub, &bucket_docs)?);
        }
        rendered.push(Value::Object(bucket));
    }
    Ok(json!({
        "doc_count_error_upper_bound": 0,
        "sum_other_doc_count": other,
        "buckets": rendered,
    }))
}

/// Compute a set of named aggregations
///
/// # Arguments
///
/// * `aggregations` - The aggregations to compute by name
/// * `docs` - The documents to aggregate
pub fn aggregate(
    aggregations: &Map<String, Value>,
    docs: &[DocRef<'_>],
) -> Result<Map<String, Value>, Error> {
    let mut results = Map::default();
    for (name, definition) in aggregations {
        let definition = definition
            .as_object()
            .ok_or_else(|| parsing_error(format!("aggregation [{name}] must be an object")))?;
        // get any sub aggregations
        let sub = definition
            .get("aggs")
            .or_else(|| definition.get("aggregations"))
            .and_then(Value::as_object);
        let (kind, body) = definition
            .iter()
            .find(|(key, _)| !matches!(key.as_str(), "aggs" | "aggregations" | "meta"))
            .ok_or_else(|| parsing_error(format!("aggregation [{name}] has no type")))?;
        let field = body.get("field").and_then(Value::as_str).unwrap_or_default();
        let result = match kind.as_str() {
            "terms" => terms_aggregation(body, docs, sub)?,
            "value_count" => json!({"value": docs.iter().map(|doc| field_values(doc, field).len()).sum::<usize>()}),
            "min" => json!({"value": numbers(docs, field).into_iter().reduce(f64::min)}),
            "max" => json!({"value": numbers(docs, field).into_iter().reduce(f64::max)}),
            "sum" => json!({"value": numbers(docs, field).into_iter().sum::<f64>()}),
            "avg" => {
                let values = numbers(docs, field);
                let avg = (!values.is_empty())
                    .then(|| values.iter().sum::<f64>() / values.len() as f64);
                json!({ "value": avg })
            }
            unknown => {
                return Err(parsing_error(format!(
                    "unknown aggregation type [{unknown}] for [{name}]"
                )));
            }
        };
        results.insert(name.clone(), result);
    }
    Ok(results)
}

/// Parse the sort terms of a search into fields and whether they are descending
///
/// # Arguments
///
/// * `sort` - The sort terms to parse
pub fn parse_sort(sort: Option<&Value>) -> Result<Vec<(String, bool)>, Error> {
    let mut parsed = Vec::default();
    for term in clauses(sort) {
        match term {
            // scores sort descending by default
            Value::String(field) => parsed.push((field.clone(), field == "_score")),
            Value::Object(map) => {
                for (field, order) in map {
                    let order = unwrap_value(order, "order");
                    let desc = match order.as_str() {
                        Some("desc") => true,
                        Some("asc") => false,
                        _ => return Err(parsing_error(format!("invalid sort order [{order}]"))),
                    };
                    parsed.push((field.clone(), desc));
                }
            }
            other => return Err(parsing_error(format!("invalid sort term [{other}]"))),
        }
    }
    Ok(parsed)
}

/// Compare two documents using parsed sort terms
///
/// Documents missing a sort value always sort last.
///
/// # Arguments
///
/// * `sort` - The parsed sort terms
/// * `left` - The first document and its score
/// * `right` - The second document and its score
pub fn compare_docs(
    sort: &[(String, bool)],
    left: (&DocRef<'_>, f64),
    right: (&DocRef<'_>, f64),
) -> Ordering {
    for (field, desc) in sort {
        let (left_value, right_value) = if field == "_score" {
            (Some(json!(left.1)), Some(json!(right.1)))
        } else {
            (
                field_values(left.0, field).into_iter().next(),
                field_values(right.0, field).into_iter().next(),
            )
        };
        let ordering = match (left_value, right_value) {
            (Some(left), Some(right)) => {
                let ordering = compare(&left, &right).unwrap_or(Ordering::Equal);
                if *desc { ordering.reverse() } else { ordering }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Get the values a document is sorted by
///
/// # Arguments
///
/// * `sort` - The parsed sort terms
/// * `doc` - The document to get sort values for
/// * `score` - The score of the document
pub fn sort_values(sort: &[(String, bool)], doc: &DocRef<'_>, score: f64) -> Vec<Value> {
    sort.iter()
        .map(|(field, _)| {
            if field == "_score" {
                json!(score)
            } else {
                field_values(doc, field).into_iter().next().unwrap_or(Value::Null)
            }
        })
        .collect()
}

/// Check if a set of sort values sorts after a `search_after` cursor
///
/// # Arguments
///
/// * `sort` - The parsed sort terms
/// * `values` - The sort values to check
/// * `after` - The cursor to compare against
pub fn sorts_after(sort: &[(String, bool)], values: &[Value], after: &[Value]) -> bool {
    for ((_, desc), (value, after)) in sort.iter().zip(values.iter().zip(after)) {
        let ordering = match (value.is_null(), after.is_null()) {
            (false, false) => {
                let ordering = compare(value, after).unwrap_or(Ordering::Equal);
                if *desc { ordering.reverse() } else { ordering }
            }
            // missing values sort last
            (false, true) => Ordering::Less,
            (true, false) => Ordering::Greater,
            (true, true) => Ordering::Equal,
        };
        match ordering {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => (),
        }
    }
    false
}

/// Build a mapping error
///
/// # Arguments
///
/// * `reason` - Why this document could not be mapped
fn mapping_error(reason: String) -> Value {
    json!({"type": "mapper_parsing_exception", "reason": reason})
}

/// Check a single value against its field mapping
///
/// # Arguments
///
/// * `field` - The name of the field
/// * `mapping` - The mapping for this field
/// * `value` - The value to check
fn validate_value(field: &str, mapping: &Value, value: &Value) -> Result<(), Value> {
    // arrays are checked item by item
    if let Value::Array(items) = value {
        return items
            .iter()
            .try_for_each(|item| validate_value(field, mapping, item));
    }
    if value.is_null() {
        return Ok(());
    }
    let kind = mapping
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(if mapping.get("properties").is_some() { "object" } else { "" });
    let valid = match kind {
        "object" | "nested" => {
            if !value.is_object() {
                return Err(mapping_error(format!(
                    "object mapping for [{field}] tried to parse field [{field}] as object, but found a concrete value"
                )));
            }
            // check any nested properties
            if let Some(properties) = mapping.get("properties").and_then(Value::as_object) {
                validate(properties, value)?;
            }
            true
        }
        "integer" | "long" | "short" | "byte" => match value {
            Value::Number(num) => num.is_i64() || num.is_u64(),
            Value::String(raw) => raw.parse::<i64>().is_ok(),
            _ => false,
        },
        "float" | "double" | "half_float" | "scaled_float" => match value {
            Value::Number(_) => true,
            Value::String(raw) => raw.parse::<f64>().is_ok(),
            _ => false,
        },
        "boolean" => match value {
            Value::Bool(_) => true,
            Value::String(raw) => raw == "true" || raw == "false",
            _ => false,
        },
        "date" => value.is_string() || value.is_number(),
        // everything else only rejects objects
        _ => !value.is_object(),
    };
    if valid {
        Ok(())
    } else {
        Err(mapping_error(format!(
            "failed to parse field [{field}] of type [{kind}]"
        )))
    }
}

/// Check a document against a set of mapped properties
///
/// # Arguments
///
/// * `properties` - The mapped properties
/// * `source` - The document to check
pub fn validate(properties: &Map<String, Value>, source: &Value) -> Result<(), Value> {
    let Some(source) = source.as_object() else {
        return Err(mapping_error("document must be an object".to_owned()));
    };
    for (field, mapping) in properties {
        if let Some(value) = source.get(field) {
            validate_value(field, mapping, value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn doc(source: &Value) -> DocRef<'_> {
        DocRef {
            document_id: "city#1",
            id: "1",
            type_name: "city",
            source,
        }
    }

    #[test]
    fn bool_queries() {
        let source = json!({"name": "Johny", "age": 40, "tags": ["a", "b"]});
        let doc = doc(&source);
        let query = json!({"bool": {"filter": [
            {"term": {"name": "Johny"}},
            {"range": {"age": {"lte": 42}}}
        ]}});
        assert!(matches(&query, &doc).unwrap());
        let query = json!({"bool": {"should": [
            {"term": {"name": "Bob"}},
            {"term": {"tags": "b"}}
        ], "minimum_should_match": 1}});
        assert!(matches(&query, &doc).unwrap());
        let query = json!({"bool": {"must_not": [{"terms": {"tags": ["a"]}}]}});
        assert!(!matches(&query, &doc).unwrap());
        assert!(matches(&json!({"ids": {"values": ["city#1"]}}), &doc).unwrap());
        assert!(!matches(&json!({"ids": {"values": ["country#1"]}}), &doc).unwrap());
        assert!(matches(&json!({"match": {"name": "johny walker"}}), &doc).unwrap());
    }

    #[test]
    fn search_after_cursors() {
        let sort = parse_sort(Some(&json!([{"rating": "desc"}, "name"]))).unwrap();
        let source = json!({"name": "b", "rating": 3});
        let values = sort_values(&sort, &doc(&source), 1.0);
        assert_eq!(values, vec![json!(3), json!("b")]);
        assert!(sorts_after(&sort, &values, &[json!(4), json!("z")]));
        assert!(sorts_after(&sort, &values, &[json!(3), json!("a")]));
        assert!(!sorts_after(&sort, &values, &[json!(3), json!("b")]));
        assert!(!sorts_after(&sort, &values, &[json!(2), json!("a")]));
    }

    #[test]
    fn unknown_queries_are_rejected() {
        let source = json!({});
        let err = matches(&json!({"fuzzy_logic": {}}), &doc(&source)).unwrap_err();
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn mappings() {
        let properties = json!({"name": {"type": "object"}, "age": {"type": "integer"}});
        let properties = properties.as_object().unwrap();
        assert!(validate(properties, &json!({"name": {"first": "a"}, "age": 3})).is_ok());
        let err = validate(properties, &json!({"name": "a"})).unwrap_err();
        assert_eq!(err["type"], "mapper_parsing_exception");
        assert!(validate(properties, &json!({"age": "old"})).is_err());
    }
}
