use std::net::IpAddr;

use chrono::{DateTime, Utc};

use telemesh_attr::AttributeValue;

use crate::errors::ExprError;

/// `ip("10.0.0.1")` — parses into network-order octets.
pub fn ip(arg: &str) -> Result<AttributeValue, ExprError> {
    let parsed: IpAddr = arg.parse().map_err(|_| ExprError::MalformedArg {
        builtin: "ip".to_string(),
        detail: format!("{arg:?} is not an IP address"),
    })?;
    let octets = match parsed {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    Ok(AttributeValue::IpAddress(octets))
}

/// `match(str, pattern)` — exact match, or a single `*` wildcard at the
/// pattern's start or end covering whole `.`-delimited prefixes/suffixes.
pub fn wildcard_match(value: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        return value.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    value == pattern
}

/// `timestamp("2017-01-01T00:00:00Z")` — RFC 3339.
pub fn timestamp(arg: &str) -> Result<AttributeValue, ExprError> {
    let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339(arg)
        .map_err(|err| ExprError::MalformedArg {
            builtin: "timestamp".to_string(),
            detail: format!("{arg:?}: {err}"),
        })?
        .with_timezone(&Utc);
    Ok(AttributeValue::Timestamp(parsed))
}
