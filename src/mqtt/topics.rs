//! MQTT topic names and topic filters.
//!
//! - `+` matches exactly one level
//! - `#` matches the parent level and everything below it, and must be last
//! - filters starting with a wildcard never match `$`-prefixed topics (`$SYS/...`)

use anyhow::{bail, Result};

const SINGLE_LEVEL_WILD: &str = "+";
const MULTI_LEVEL_WILD: &str = "#";
const SEPARATOR: char = '/';
const MAX_TOPIC_BYTES: usize = 65_535;

/// Validate a topic name used for PUBLISH.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    check_common(topic, "topic name")?;
    if topic.contains(['+', '#']) {
        bail!("topic name {topic:?} must not contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter used for SUBSCRIBE/UNSUBSCRIBE.
pub fn validate_filter(filter: &str) -> Result<()> {
    check_common(filter, "topic filter")?;
    let levels: Vec<&str> = filter.split(SEPARATOR).collect();
    let last = levels.len() - 1;
    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != MULTI_LEVEL_WILD || idx != last) {
            bail!("'#' must occupy the whole last level in {filter:?}");
        }
        if level.contains('+') && *level != SINGLE_LEVEL_WILD {
            bail!("'+' must occupy a whole level in {filter:?}");
        }
    }
    Ok(())
}

fn check_common(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{what} must not be empty");
    }
    if value.len() > MAX_TOPIC_BYTES {
        bail!("{what} exceeds {MAX_TOPIC_BYTES} bytes");
    }
    if value.contains('\0') {
        bail!("{what} must not contain NUL");
    }
    Ok(())
}

/// Check if a topic filter matches a topic name.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let filter_parts: Vec<&str> = filter.split(SEPARATOR).collect();
    let topic_parts: Vec<&str> = topic.split(SEPARATOR).collect();

    let mut fi = 0;
    let mut ti = 0;

    while fi < filter_parts.len() {
        let fp = filter_parts[fi];

        if fp == MULTI_LEVEL_WILD {
            return true;
        }

        if ti >= topic_parts.len() {
            return false;
        }

        if fp != SINGLE_LEVEL_WILD && fp != topic_parts[ti] {
            return false;
        }

        fi += 1;
        ti += 1;
    }

    ti == topic_parts.len()
}
