use crate::canonical::CanonicalLog;
use crate::config::types::AggregationPolicy;
use crate::template::field_value;
use serde_json::Value;
use std::collections::HashMap;

struct Group {
    output_index: usize,
    count: u64,
    first_time: i64,
    last_time: i64,
}

/// Collapse duplicate records within one batch.
///
/// The aggregation key is the tuple of `policy.key_fields` values from
/// each record's extracted fields. Records sharing a key collapse into
/// the first occurrence, whose event gains `aggregated_count`,
/// `aggregated_first_time`, and `aggregated_last_time` covering the
/// group. Records missing any key field pass through unaggregated, in
/// place. Groups of one stay untouched.
pub fn aggregate_batch(
    policy: &AggregationPolicy,
    batch: Vec<(CanonicalLog, Vec<(String, String)>)>,
) -> Vec<CanonicalLog> {
    if !policy.enabled || policy.key_fields.is_empty() {
        return batch.into_iter().map(|(log, _)| log).collect();
    }

    let mut output: Vec<CanonicalLog> = Vec::with_capacity(batch.len());
    let mut groups: HashMap<Vec<String>, Group> = HashMap::new();

    for (log, fields) in batch {
        let key: Option<Vec<String>> = policy
            .key_fields
            .iter()
            .map(|name| field_value(&fields, name).map(|v| v.to_string()))
            .collect();

        let Some(key) = key else {
            // Missing key field: pass through, preserving position
            output.push(log);
            continue;
        };

        match groups.get_mut(&key) {
            Some(group) => {
                group.count += 1;
                group.last_time = log.time;
            }
            None => {
                groups.insert(
                    key,
                    Group {
                        output_index: output.len(),
                        count: 1,
                        first_time: log.time,
                        last_time: log.time,
                    },
                );
                output.push(log);
            }
        }
    }

    for group in groups.values() {
        if group.count < 2 {
            continue;
        }
        let log = &mut output[group.output_index];
        annotate(
            &mut log.event,
            group.count,
            group.first_time,
            group.last_time,
        );
    }

    output
}

/// Attach the aggregation keys to an event. Non-object events are
/// wrapped as `{"raw": <original>}` first so the annotations always
/// live in a JSON object.
fn annotate(event: &mut Value, count: u64, first_time: i64, last_time: i64) {
    if !event.is_object() {
        let original = event.take();
        *event = serde_json::json!({ "raw": original });
    }

    if let Value::Object(map) = event {
        map.insert("aggregated_count".to_string(), count.into());
        map.insert("aggregated_first_time".to_string(), first_time.into());
        map.insert("aggregated_last_time".to_string(), last_time.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::RawRecord;
    use crate::template::extract_fields;

    fn policy(keys: &[&str]) -> AggregationPolicy {
        AggregationPolicy {
            key_fields: keys.iter().map(|k| k.to_string()).collect(),
            enabled: true,
        }
    }

    fn entry(payload: &str, time: i64) -> (CanonicalLog, Vec<(String, String)>) {
        let record = RawRecord::new(payload.to_string());
        let mut log = CanonicalLog::from_raw(&record, "s");
        log.time = time;
        let fields = extract_fields(payload);
        (log, fields)
    }

    #[test]
    fn test_duplicates_collapse_with_counts() {
        let batch: Vec<_> = (0..5)
            .map(|i| entry("user=alice msg=hi", 100 + i))
            .chain((0..3).map(|i| entry("user=bob msg=hi", 200 + i)))
            .collect();

        let output = aggregate_batch(&policy(&["user"]), batch);
        assert_eq!(output.len(), 2);

        let alice = output[0].event.as_object().unwrap();
        assert_eq!(alice["aggregated_count"], 5);
        assert_eq!(alice["aggregated_first_time"], 100);
        assert_eq!(alice["aggregated_last_time"], 104);

        let bob = output[1].event.as_object().unwrap();
        assert_eq!(bob["aggregated_count"], 3);
    }

    #[test]
    fn test_missing_key_field_passes_through() {
        let batch = vec![
            entry("user=alice a=1", 1),
            entry("msg=no-user-here", 2),
            entry("user=alice a=2", 3),
        ];

        let output = aggregate_batch(&policy(&["user"]), batch);
        assert_eq!(output.len(), 2);

        // The keyless record kept its original payload untouched
        assert_eq!(
            output[1].event,
            Value::String("msg=no-user-here".to_string())
        );
        assert_eq!(
            output[0].event.as_object().unwrap()["aggregated_count"],
            2
        );
    }

    #[test]
    fn test_singleton_groups_untouched() {
        let batch = vec![entry("user=alice", 1), entry("user=bob", 2)];
        let output = aggregate_batch(&policy(&["user"]), batch);

        assert_eq!(output.len(), 2);
        for log in &output {
            assert!(log.event.is_string());
        }
    }

    #[test]
    fn test_json_event_annotated_in_place() {
        let batch = vec![
            entry(r#"{"user":"alice","n":1}"#, 10),
            entry(r#"{"user":"alice","n":2}"#, 11),
        ];

        let output = aggregate_batch(&policy(&["user"]), batch);
        assert_eq!(output.len(), 2);

        let first = output[0].event.as_object().unwrap();
        // First occurrence's payload survives with annotations added
        assert_eq!(first["n"], 1);
        assert_eq!(first["aggregated_count"], 2);
    }

    #[test]
    fn test_string_event_wrapped_before_annotation() {
        let batch = vec![entry("user=alice x", 1), entry("user=alice x", 2)];
        let output = aggregate_batch(&policy(&["user"]), batch);

        assert_eq!(output.len(), 1);
        let obj = output[0].event.as_object().unwrap();
        assert_eq!(obj["raw"], "user=alice x");
        assert_eq!(obj["aggregated_count"], 2);
    }

    #[test]
    fn test_multi_field_key() {
        let batch = vec![
            entry("user=alice host=a", 1),
            entry("user=alice host=b", 2),
            entry("user=alice host=a", 3),
        ];

        let output = aggregate_batch(&policy(&["user", "host"]), batch);
        assert_eq!(output.len(), 2);
    }

    #[test]
    fn test_disabled_policy_is_identity() {
        let batch = vec![entry("user=alice", 1), entry("user=alice", 2)];
        let disabled = AggregationPolicy {
            key_fields: vec!["user".to_string()],
            enabled: false,
        };

        let output = aggregate_batch(&disabled, batch);
        assert_eq!(output.len(), 2);
    }

    #[test]
    fn test_order_of_first_occurrences_preserved() {
        let batch = vec![
            entry("user=carol", 1),
            entry("user=alice", 2),
            entry("user=carol", 3),
            entry("user=bob", 4),
        ];

        let output = aggregate_batch(&policy(&["user"]), batch);
        let users: Vec<String> = output
            .iter()
            .map(|l| match &l.event {
                Value::Object(m) => m["raw"].as_str().unwrap().to_string(),
                Value::String(s) => s.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(users, vec!["user=carol", "user=alice", "user=bob"]);
    }
}
