//! Query planning and per-shard execution
//!
//! A query is a list of predicates, a result limit, and an optional
//! continuation span. Planning happens once: the best predicate that maps to
//! an index becomes the driving predicate and fixes the scan index and
//! direction; every predicate (the driving one included) is then re-checked
//! as a filter against each fetched span. Each shard produces a bounded,
//! ordered candidate list; the shard lists are merged in global scan order
//! until the limit is reached.

use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::data::error::DataError;
use crate::data::store::index;
use crate::data::store::shard::ShardStore;
use crate::data::types::{Span, SpanId, decode};

/// Result cap applied when a query does not specify one.
pub const DEFAULT_QUERY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryOp {
    #[serde(rename = "eq")]
    Eq,
    #[serde(rename = "lt")]
    Lt,
    #[serde(rename = "le")]
    Le,
    #[serde(rename = "gt")]
    Gt,
    #[serde(rename = "ge")]
    Ge,
    #[serde(rename = "cn")]
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryField {
    #[serde(rename = "spanid")]
    SpanId,
    #[serde(rename = "begin")]
    Begin,
    #[serde(rename = "end")]
    End,
    #[serde(rename = "duration")]
    Duration,
    #[serde(rename = "description")]
    Description,
    #[serde(rename = "tracerid")]
    TracerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub op: QueryOp,
    pub field: QueryField,
    pub val: String,
}

fn default_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    #[serde(rename = "pred", default)]
    pub predicates: Vec<Predicate>,
    #[serde(rename = "lim", default = "default_limit")]
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Span>,
}

/// A predicate with its value parsed into the field's domain.
#[derive(Debug, Clone)]
struct ParsedPredicate {
    op: QueryOp,
    field: QueryField,
    value: FieldValue,
}

#[derive(Debug, Clone)]
enum FieldValue {
    Id(SpanId),
    Time(i64),
    Text(String),
}

impl ParsedPredicate {
    fn parse(pred: &Predicate) -> Result<ParsedPredicate, DataError> {
        if pred.op == QueryOp::Contains && pred.field != QueryField::Description {
            return Err(DataError::bad_query(format!(
                "The contains operator only applies to the description field, not {:?}",
                pred.field
            )));
        }
        let value = match pred.field {
            QueryField::SpanId => FieldValue::Id(pred.val.parse().map_err(|e| {
                DataError::bad_query(format!("Failed to parse span id '{}': {}", pred.val, e))
            })?),
            QueryField::Begin | QueryField::End | QueryField::Duration => {
                FieldValue::Time(pred.val.parse().map_err(|e| {
                    DataError::bad_query(format!(
                        "Failed to parse time value '{}': {}",
                        pred.val, e
                    ))
                })?)
            }
            QueryField::Description | QueryField::TracerId => {
                FieldValue::Text(pred.val.clone())
            }
        };
        Ok(ParsedPredicate {
            op: pred.op,
            field: pred.field,
            value,
        })
    }

    /// Whether the span satisfies this predicate.
    fn matches(&self, span: &Span) -> bool {
        match (&self.value, self.field) {
            (FieldValue::Id(v), QueryField::SpanId) => compare(self.op, span.id.cmp(v)),
            (FieldValue::Time(v), QueryField::Begin) => compare(self.op, span.begin.cmp(v)),
            (FieldValue::Time(v), QueryField::End) => compare(self.op, span.end.cmp(v)),
            (FieldValue::Time(v), QueryField::Duration) => {
                compare(self.op, span.duration().cmp(v))
            }
            (FieldValue::Text(v), QueryField::Description) => {
                if self.op == QueryOp::Contains {
                    span.description.contains(v.as_str())
                } else {
                    compare(self.op, span.description.as_str().cmp(v.as_str()))
                }
            }
            (FieldValue::Text(v), QueryField::TracerId) => {
                compare(self.op, span.tracer_id.as_str().cmp(v.as_str()))
            }
            _ => false,
        }
    }
}

fn compare(op: QueryOp, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        QueryOp::Eq => ordering == Equal,
        QueryOp::Lt => ordering == Less,
        QueryOp::Le => ordering != Greater,
        QueryOp::Gt => ordering == Greater,
        QueryOp::Ge => ordering != Less,
        QueryOp::Contains => false,
    }
}

/// The per-shard scan a query compiles into. Shared across shards.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    family: u8,
    reverse: bool,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    /// Composite (sort-key, id) position of the continuation span; the scan
    /// starts strictly past it in scan order.
    continuation: Option<Vec<u8>>,
    /// Scans proven empty at plan time (e.g. GT on the maximum id).
    empty: bool,
    filters: Vec<ParsedPredicate>,
    limit: usize,
}

impl ScanPlan {
    pub fn reverse(&self) -> bool {
        self.reverse
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Compile a query into its shard scan.
    pub fn build(query: &Query) -> Result<ScanPlan, DataError> {
        let filters = query
            .predicates
            .iter()
            .map(ParsedPredicate::parse)
            .collect::<Result<Vec<_>, _>>()?;

        // Pick the driving predicate: the lowest-ranked field among the
        // comparisons that map to an index. Contains never drives.
        let driving = filters
            .iter()
            .filter(|p| p.op != QueryOp::Contains)
            .min_by_key(|p| field_rank(p.field));

        let (family, reverse, mut lower, mut upper, mut empty) = match driving {
            None => {
                // Fall back to a forward scan of the begin-time index.
                let (lower, upper) = family_bounds(index::BEGIN_TIME);
                (index::BEGIN_TIME, false, lower, upper, false)
            }
            Some(pred) => {
                let family = field_family(pred.field);
                let reverse = matches!(pred.op, QueryOp::Lt | QueryOp::Le);
                let (mut lower, mut upper) = family_bounds(family);
                let mut empty = false;
                apply_driving_bound(pred, family, &mut lower, &mut upper, &mut empty);
                (family, reverse, lower, upper, empty)
            }
        };

        let continuation = query
            .prev
            .as_ref()
            .map(|prev| continuation_key(family, prev));
        if let Some(cont) = &continuation {
            // Tighten the range so the scan starts strictly past the token.
            if reverse {
                tighten_upper(&mut upper, Bound::Excluded(cont.clone()));
            } else {
                tighten_lower(&mut lower, Bound::Excluded(cont.clone()));
            }
        }
        if bounds_empty(&lower, &upper) {
            empty = true;
        }

        Ok(ScanPlan {
            family,
            reverse,
            lower,
            upper,
            continuation,
            empty,
            filters,
            limit: query.limit,
        })
    }
}

fn field_rank(field: QueryField) -> u32 {
    match field {
        QueryField::SpanId => 0,
        QueryField::Begin => 1,
        QueryField::End => 2,
        QueryField::Duration => 3,
        QueryField::Description => 4,
        QueryField::TracerId => 5,
    }
}

fn field_family(field: QueryField) -> u8 {
    match field {
        QueryField::SpanId => index::PRIMARY,
        QueryField::Begin => index::BEGIN_TIME,
        QueryField::End => index::END_TIME,
        QueryField::Duration => index::DURATION,
        QueryField::Description => index::DESCRIPTION,
        QueryField::TracerId => index::TRACER_ID,
    }
}

/// The whole-family key range.
fn family_bounds(family: u8) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let lower = Bound::Included(vec![family]);
    let upper = match index::prefix_successor(&[family]) {
        Some(key) => Bound::Excluded(key),
        None => Bound::Unbounded,
    };
    (lower, upper)
}

/// Narrow the family range according to the driving predicate.
fn apply_driving_bound(
    pred: &ParsedPredicate,
    family: u8,
    lower: &mut Bound<Vec<u8>>,
    upper: &mut Bound<Vec<u8>>,
    empty: &mut bool,
) {
    match &pred.value {
        FieldValue::Id(id) => {
            let key = index::primary_key(id);
            match pred.op {
                QueryOp::Ge => tighten_lower(lower, Bound::Included(key)),
                QueryOp::Gt => {
                    if id.is_max() {
                        *empty = true;
                    } else {
                        tighten_lower(lower, Bound::Included(index::primary_key(&id.next())));
                    }
                }
                QueryOp::Eq => {
                    tighten_lower(lower, Bound::Included(key));
                    if !id.is_max() {
                        tighten_upper(
                            upper,
                            Bound::Excluded(index::primary_key(&id.next())),
                        );
                    }
                }
                QueryOp::Le => {
                    if !id.is_max() {
                        tighten_upper(
                            upper,
                            Bound::Excluded(index::primary_key(&id.next())),
                        );
                    }
                }
                QueryOp::Lt => tighten_upper(upper, Bound::Excluded(key)),
                QueryOp::Contains => {}
            }
        }
        FieldValue::Time(v) => {
            let prefix = index::time_prefix(family, *v);
            match pred.op {
                QueryOp::Ge => tighten_lower(lower, Bound::Included(prefix)),
                QueryOp::Gt => match v.checked_add(1) {
                    Some(succ) => {
                        tighten_lower(lower, Bound::Included(index::time_prefix(family, succ)))
                    }
                    None => *empty = true,
                },
                QueryOp::Eq => {
                    tighten_upper(
                        upper,
                        successor_bound(&prefix),
                    );
                    tighten_lower(lower, Bound::Included(prefix));
                }
                QueryOp::Le => match v.checked_add(1) {
                    Some(succ) => {
                        tighten_upper(upper, Bound::Excluded(index::time_prefix(family, succ)))
                    }
                    None => {}
                },
                QueryOp::Lt => tighten_upper(upper, Bound::Excluded(prefix)),
                QueryOp::Contains => {}
            }
        }
        FieldValue::Text(s) => {
            // The prefix ends in the 0x00 separator, so its successor sits
            // past every id under this exact value.
            let prefix = index::string_prefix(family, s);
            match pred.op {
                QueryOp::Ge => tighten_lower(lower, Bound::Included(prefix)),
                QueryOp::Gt => match index::prefix_successor(&prefix) {
                    Some(succ) => tighten_lower(lower, Bound::Included(succ)),
                    None => *empty = true,
                },
                QueryOp::Eq => {
                    tighten_upper(upper, successor_bound(&prefix));
                    tighten_lower(lower, Bound::Included(prefix));
                }
                QueryOp::Le => tighten_upper(upper, successor_bound(&prefix)),
                QueryOp::Lt => tighten_upper(upper, Bound::Excluded(prefix)),
                QueryOp::Contains => {}
            }
        }
    }
}

fn successor_bound(prefix: &[u8]) -> Bound<Vec<u8>> {
    match index::prefix_successor(prefix) {
        Some(succ) => Bound::Excluded(succ),
        None => Bound::Unbounded,
    }
}

fn tighten_lower(current: &mut Bound<Vec<u8>>, candidate: Bound<Vec<u8>>) {
    if bound_key(&candidate).is_none() {
        return;
    }
    let replace = match (bound_key(current), bound_key(&candidate)) {
        (None, _) => true,
        (Some(cur), Some(new)) => {
            new > cur || (new == cur && matches!(candidate, Bound::Excluded(_)))
        }
        _ => false,
    };
    if replace {
        *current = candidate;
    }
}

fn tighten_upper(current: &mut Bound<Vec<u8>>, candidate: Bound<Vec<u8>>) {
    if bound_key(&candidate).is_none() {
        return;
    }
    let replace = match (bound_key(current), bound_key(&candidate)) {
        (None, _) => true,
        (Some(cur), Some(new)) => {
            new < cur || (new == cur && matches!(candidate, Bound::Excluded(_)))
        }
        _ => false,
    };
    if replace {
        *current = candidate;
    }
}

fn bound_key(bound: &Bound<Vec<u8>>) -> Option<&[u8]> {
    match bound {
        Bound::Included(key) | Bound::Excluded(key) => Some(key),
        Bound::Unbounded => None,
    }
}

fn bounds_empty(lower: &Bound<Vec<u8>>, upper: &Bound<Vec<u8>>) -> bool {
    match (bound_key(lower), bound_key(upper)) {
        (Some(lo), Some(hi)) => {
            lo > hi
                || (lo == hi
                    && (matches!(lower, Bound::Excluded(_)) || matches!(upper, Bound::Excluded(_))))
        }
        _ => false,
    }
}

/// The composite index key the continuation span occupies in `family`.
fn continuation_key(family: u8, prev: &Span) -> Vec<u8> {
    match family {
        index::PRIMARY => index::primary_key(&prev.id),
        index::BEGIN_TIME => index::time_key(family, prev.begin, &prev.id),
        index::END_TIME => index::time_key(family, prev.end, &prev.id),
        index::DURATION => index::time_key(family, prev.duration(), &prev.id),
        index::DESCRIPTION => index::string_key(family, &prev.description, &prev.id),
        index::TRACER_ID => index::string_key(family, &prev.tracer_id, &prev.id),
        _ => unreachable!("not a scan family: {}", family),
    }
}

/// The ordered candidates one shard contributes, plus how many spans the scan
/// examined to produce them.
pub struct ShardScanResult {
    pub hits: Vec<(Vec<u8>, Span)>,
    pub scanned: u64,
}

/// Execute the plan against a single shard. Blocking.
pub fn scan_shard(shard: &ShardStore, plan: &ScanPlan) -> Result<ShardScanResult, DataError> {
    let mut result = ShardScanResult {
        hits: Vec::new(),
        scanned: 0,
    };
    if plan.empty || plan.limit == 0 {
        return Ok(result);
    }

    let iter = shard.range_scan(plan.lower.clone(), plan.upper.clone(), plan.reverse);
    for kv in iter {
        let (key, value) = kv?;
        // The continuation bound already trims one side; the same-key entry
        // can still surface on an inclusive scan start, so skip it explicitly.
        if let Some(cont) = &plan.continuation {
            if key.as_ref() == cont.as_slice() {
                continue;
            }
        }

        let span = if plan.family == index::PRIMARY {
            decode(value.as_ref())?
        } else {
            let Some(id) = index::id_from_index_key(key.as_ref()) else {
                continue;
            };
            match shard.get(&index::primary_key(&id))? {
                Some(bytes) => decode(&bytes)?,
                // Index entry without a primary record; nothing to return.
                None => continue,
            }
        };
        result.scanned += 1;

        if plan.filters.iter().all(|f| f.matches(&span)) {
            result.hits.push((key.to_vec(), span));
            if result.hits.len() >= plan.limit {
                break;
            }
        }
    }
    Ok(result)
}

/// Merge per-shard candidate lists into global scan order, capped at `limit`.
/// Composite keys embed the span id, so ties cannot occur across shards.
pub fn merge_shard_results(
    per_shard: Vec<Vec<(Vec<u8>, Span)>>,
    reverse: bool,
    limit: usize,
) -> Vec<Span> {
    let mut queues: Vec<std::collections::VecDeque<(Vec<u8>, Span)>> =
        per_shard.into_iter().map(Into::into).collect();
    let mut out = Vec::with_capacity(limit.min(64));
    while out.len() < limit {
        let mut best: Option<usize> = None;
        for idx in 0..queues.len() {
            let Some((key, _)) = queues[idx].front() else {
                continue;
            };
            let better = match best {
                None => true,
                Some(best_idx) => {
                    let best_key = &queues[best_idx].front().expect("nonempty").0;
                    if reverse {
                        key > best_key
                    } else {
                        key < best_key
                    }
                }
            };
            if better {
                best = Some(idx);
            }
        }
        let Some(idx) = best else { break };
        let (_, span) = queues[idx].pop_front().expect("nonempty");
        out.push(span);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(op: QueryOp, field: QueryField, val: &str) -> Predicate {
        Predicate {
            op,
            field,
            val: val.to_string(),
        }
    }

    #[test]
    fn test_query_json_shape() {
        let json = r#"{"pred":[{"op":"ge","field":"begin","val":"125"}],"lim":5}"#;
        let query: Query = serde_json::from_str(json).unwrap();
        assert_eq!(query.predicates.len(), 1);
        assert_eq!(query.predicates[0].op, QueryOp::Ge);
        assert_eq!(query.predicates[0].field, QueryField::Begin);
        assert_eq!(query.limit, 5);
        assert!(query.prev.is_none());
    }

    #[test]
    fn test_default_limit() {
        let query: Query = serde_json::from_str(r#"{"pred":[]}"#).unwrap();
        assert_eq!(query.limit, DEFAULT_QUERY_LIMIT);
    }

    #[test]
    fn test_plan_picks_lowest_ranked_field() {
        let query = Query {
            predicates: vec![
                pred(QueryOp::Eq, QueryField::Description, "getFileDescriptors"),
                pred(QueryOp::Le, QueryField::Begin, "125"),
            ],
            limit: 2,
            prev: None,
        };
        let plan = ScanPlan::build(&query).unwrap();
        assert_eq!(plan.family, index::BEGIN_TIME);
        assert!(plan.reverse);
        assert_eq!(plan.filters.len(), 2);
    }

    #[test]
    fn test_plan_contains_cannot_drive() {
        let query = Query {
            predicates: vec![pred(QueryOp::Contains, QueryField::Description, "Fd")],
            limit: 5,
            prev: None,
        };
        let plan = ScanPlan::build(&query).unwrap();
        assert_eq!(plan.family, index::BEGIN_TIME);
        assert!(!plan.reverse);
    }

    #[test]
    fn test_plan_rejects_contains_on_other_fields() {
        let query = Query {
            predicates: vec![pred(QueryOp::Contains, QueryField::TracerId, "x")],
            limit: 5,
            prev: None,
        };
        assert!(matches!(
            ScanPlan::build(&query),
            Err(DataError::BadQuery(_))
        ));
    }

    #[test]
    fn test_plan_rejects_bad_values() {
        for (field, val) in [
            (QueryField::SpanId, "not-hex"),
            (QueryField::Begin, "12.5"),
            (QueryField::Duration, ""),
        ] {
            let query = Query {
                predicates: vec![pred(QueryOp::Ge, field, val)],
                limit: 5,
                prev: None,
            };
            assert!(
                matches!(ScanPlan::build(&query), Err(DataError::BadQuery(_))),
                "{:?} {:?} should be rejected",
                field,
                val
            );
        }
    }

    #[test]
    fn test_plan_gt_on_max_is_empty() {
        let query = Query {
            predicates: vec![pred(
                QueryOp::Gt,
                QueryField::SpanId,
                "ffffffffffffffffffffffffffffffff",
            )],
            limit: 5,
            prev: None,
        };
        assert!(ScanPlan::build(&query).unwrap().empty);
        let query = Query {
            predicates: vec![pred(QueryOp::Gt, QueryField::Begin, &i64::MAX.to_string())],
            limit: 5,
            prev: None,
        };
        assert!(ScanPlan::build(&query).unwrap().empty);
    }

    #[test]
    fn test_merge_orders_across_shards() {
        let a = vec![
            (vec![1u8], span_with_begin(1)),
            (vec![4u8], span_with_begin(4)),
        ];
        let b = vec![
            (vec![2u8], span_with_begin(2)),
            (vec![3u8], span_with_begin(3)),
        ];
        let merged = merge_shard_results(vec![a.clone(), b.clone()], false, 10);
        let begins: Vec<i64> = merged.iter().map(|s| s.begin).collect();
        assert_eq!(begins, vec![1, 2, 3, 4]);

        let a_rev: Vec<_> = a.into_iter().rev().collect();
        let b_rev: Vec<_> = b.into_iter().rev().collect();
        let merged = merge_shard_results(vec![a_rev, b_rev], true, 3);
        let begins: Vec<i64> = merged.iter().map(|s| s.begin).collect();
        assert_eq!(begins, vec![4, 3, 2]);
    }

    fn span_with_begin(begin: i64) -> Span {
        Span {
            id: "00000000000000000000000000000001".parse().unwrap(),
            begin,
            end: begin,
            description: String::new(),
            tracer_id: String::new(),
            parents: vec![],
            info: Default::default(),
            timeline: vec![],
        }
    }
}
