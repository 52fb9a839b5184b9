use std::collections::BTreeMap;

/// Tag mapping of an entity. Ordered so that equality and serialization are
/// deterministic.
pub type Tags = BTreeMap<String, String>;

pub const MAX_TAG_LENGTH: usize = 255;

/// Keys that carry no meaning for the map itself.
const BORING_KEYS: [&str; 4] = ["attribution", "created_by", "source", "odbl"];
const BORING_PREFIXES: [&str; 3] = ["tiger:", "source:", "source_ref"];

pub fn truncate(value: &str) -> String {
    if value.chars().count() <= MAX_TAG_LENGTH {
        value.to_string()
    } else {
        value.chars().take(MAX_TAG_LENGTH).collect()
    }
}

pub fn truncated(tags: &Tags) -> Tags {
    tags.iter()
        .map(|(key, value)| (truncate(key), truncate(value)))
        .collect()
}

pub fn is_interesting_key(key: &str) -> bool {
    !BORING_KEYS.contains(&key)
        && !BORING_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

pub fn has_interesting_tags(tags: &Tags) -> bool {
    tags.keys().any(|key| is_interesting_key(key))
}

/// Union of two tag sets, or `None` when a key carries different values.
pub fn merge(ours: &Tags, other: &Tags) -> Option<Tags> {
    let mut merged = ours.clone();
    for (key, value) in other {
        match merged.get(key) {
            Some(existing) if existing != value => return None,
            Some(_) => (),
            None => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Some(merged)
}

const KEY_REVERSALS: [(&str, &str); 4] = [
    (":right", ":left"),
    (":left", ":right"),
    (":forward", ":backward"),
    (":backward", ":forward"),
];

/// Key as seen when walking the way the other way round.
pub fn reverse_key(key: &str) -> String {
    for (suffix, replacement) in KEY_REVERSALS {
        if let Some(stem) = key.strip_suffix(suffix) {
            return format!("{}{}", stem, replacement);
        }
    }
    key.to_string()
}

pub fn reverse_value(key: &str, value: &str) -> String {
    if key == "incline" && value.parse::<f64>().is_ok() {
        return match value.strip_prefix('-') {
            Some(positive) => positive.to_string(),
            None => format!("-{}", value.trim_start_matches('+')),
        };
    }
    let swapped = match (key, value) {
        ("incline" | "direction", "up") => "down",
        ("incline" | "direction", "down") => "up",
        ("incline" | "direction", _) => value,
        (_, "left") => "right",
        (_, "right") => "left",
        _ => value,
    };
    swapped.to_string()
}
