//! Context alias resolution.
//!
//! Threads link to external business entities through a string type-tag plus
//! a numeric id. Some entity types were stored under more than one tag over
//! the record layer's history, so listing "threads for this context" must
//! OR-match every historical variant. The table is static; resolution is a
//! pure lookup with no I/O.

const CONTEXT_ALIASES: &[(&str, &[&str])] = &[
    ("deal", &["deal", "crm.deal", "pipeline.deal"]),
    ("ticket", &["ticket", "support.ticket"]),
    ("contact", &["contact", "crm.contact"]),
    ("company", &["company", "crm.company", "account"]),
];

/// Every identifier string that may appear in a stored thread's context tag
/// for the given logical entity type. Unknown tags resolve to themselves so
/// filtering still works for entity types added after this table.
pub fn resolve_context_variants(entity_type: &str) -> Vec<String> {
    let normalized = entity_type.trim().to_ascii_lowercase();
    for (canonical, variants) in CONTEXT_ALIASES {
        if *canonical == normalized || variants.contains(&normalized.as_str()) {
            return variants.iter().map(|variant| variant.to_string()).collect();
        }
    }
    vec![normalized]
}
