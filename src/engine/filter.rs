use crate::config::types::FilterRule;
use crate::template::field_value;

/// Decide whether a record should be dropped.
///
/// Semantics: a record is dropped only when every enabled rule matches
/// its extracted fields (string comparison). A rule whose field is
/// absent does not match, which keeps the record. An empty or fully
/// disabled rule set passes everything through.
pub fn should_drop(rules: &[FilterRule], fields: &[(String, String)]) -> bool {
    let mut saw_enabled = false;

    for rule in rules {
        if !rule.enabled {
            continue;
        }
        saw_enabled = true;

        match field_value(fields, &rule.field_name) {
            Some(value) if value == rule.match_value => {}
            _ => return false,
        }
    }

    saw_enabled
}
