use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

/// The unit a duration was written in. Retained so that persisting a
/// configuration re-emits the value the way the user wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Hours,
    Minutes,
    Seconds,
    Milliseconds,
}

impl DurationUnit {
    pub fn suffix(&self) -> &'static str {
        match self {
            DurationUnit::Hours => "h",
            DurationUnit::Minutes => "min",
            DurationUnit::Seconds => "s",
            DurationUnit::Milliseconds => "ms",
        }
    }

    pub fn millis_per_unit(&self) -> u64 {
        match self {
            DurationUnit::Hours => 3_600_000,
            DurationUnit::Minutes => 60_000,
            DurationUnit::Seconds => 1_000,
            DurationUnit::Milliseconds => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue {
    pub millis: u64,
    pub unit: DurationUnit,
}

impl DurationValue {
    pub fn new(millis: u64, unit: DurationUnit) -> Self {
        Self { millis, unit }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }
}

impl fmt::Display for DurationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let per_unit = self.unit.millis_per_unit();
        if self.millis % per_unit == 0 {
            write!(f, "{}{}", self.millis / per_unit, self.unit.suffix())
        } else {
            // The stored value no longer divides evenly; fall back to ms.
            write!(f, "{}ms", self.millis)
        }
    }
}

/// One entry of a host-pattern-list parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// Matches any host.
    Any,
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    /// Address plus prefix length, e.g. `10.0.0.0/8`.
    Subnet4(Ipv4Addr, u8),
    Subnet6(Ipv6Addr, u8),
    /// A hostname pattern; `%` and `*` are single- and multi-char wildcards.
    Hostname(String),
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Any => write!(f, "*"),
            HostPattern::Ipv4(a) => write!(f, "{a}"),
            HostPattern::Ipv6(a) => write!(f, "{a}"),
            HostPattern::Subnet4(a, p) => write!(f, "{a}/{p}"),
            HostPattern::Subnet6(a, p) => write!(f, "{a}/{p}"),
            HostPattern::Hostname(h) => write!(f, "{h}"),
        }
    }
}

impl HostPattern {
    pub fn is_hostname(&self) -> bool {
        matches!(self, HostPattern::Hostname(_))
    }
}

/// Rate limiting triple used by throttling-typed parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Throttling {
    pub count: u64,
    pub window_ms: u64,
    pub suppress_ms: u64,
}

impl fmt::Display for Throttling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}ms,{}ms", self.count, self.window_ms, self.suppress_ms)
    }
}

/// A compiled regex parameter. Equality is on the source pattern; the
/// compiled form is a validation artifact.
#[derive(Debug, Clone)]
pub struct RegexValue {
    pub pattern: String,
    pub compiled: regex::Regex,
}

impl PartialEq for RegexValue {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

/// A password that must not leak into logs or serialized output.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(pub String);

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*****")
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*****")
    }
}

/// A materialized, validated parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Count(u64),
    Int(i64),
    Size(u64),
    Duration(DurationValue),
    Percent(u8),
    Path(PathBuf),
    Regex(RegexValue),
    String(String),
    StringList(Vec<String>),
    HostPatternList(Vec<HostPattern>),
    /// Reference to a routing target (server or service).
    Target(String),
    TargetList(Vec<String>),
    Server(String),
    ServerList(Vec<String>),
    Service(String),
    FilterList(Vec<String>),
    Module(String),
    /// Canonical alias of a closed-set enum.
    Enum(String),
    EnumList(Vec<String>),
    Password(Password),
    Throttling(Throttling),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Count(v) => Some(*v as i64),
            Value::Size(v) => Some(*v as i64),
            Value::Percent(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Value::Duration(d) => Some(d.as_duration()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s)
            | Value::Target(s)
            | Value::Server(s)
            | Value::Service(s)
            | Value::Module(s)
            | Value::Enum(s) => Some(s),
            Value::Password(p) => Some(&p.0),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            Value::StringList(v)
            | Value::TargetList(v)
            | Value::ServerList(v)
            | Value::FilterList(v)
            | Value::EnumList(v) => Some(v),
            _ => None,
        }
    }

    /// Names of objects this value makes the owner depend on.
    pub fn dependencies(&self) -> Vec<String> {
        match self {
            Value::Target(s) | Value::Server(s) | Value::Service(s) => vec![s.clone()],
            Value::TargetList(v) | Value::ServerList(v) | Value::FilterList(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    /// Serialize back to configuration-file syntax. Formatting then parsing
    /// yields an equal value.
    pub fn to_config_string(&self) -> String {
        match self {
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Count(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Size(v) => format_size(*v),
            Value::Duration(d) => d.to_string(),
            Value::Percent(v) => format!("{v}%"),
            Value::Path(p) => p.display().to_string(),
            Value::Regex(r) => r.pattern.clone(),
            Value::String(s)
            | Value::Target(s)
            | Value::Server(s)
            | Value::Service(s)
            | Value::Module(s)
            | Value::Enum(s) => s.clone(),
            Value::StringList(v)
            | Value::TargetList(v)
            | Value::ServerList(v)
            | Value::FilterList(v)
            | Value::EnumList(v) => v.join(","),
            Value::HostPatternList(v) => v
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(","),
            Value::Password(p) => p.0.clone(),
            Value::Throttling(t) => t.to_string(),
        }
    }

    /// JSON form for admin payloads. Passwords are masked.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Bool(b) => json!(b),
            Value::Count(v) => json!(v),
            Value::Int(v) => json!(v),
            Value::Size(v) => json!(v),
            Value::Duration(d) => json!(d.to_string()),
            Value::Percent(v) => json!(format!("{v}%")),
            Value::Password(_) => json!("*****"),
            Value::StringList(v)
            | Value::TargetList(v)
            | Value::ServerList(v)
            | Value::FilterList(v)
            | Value::EnumList(v) => json!(v),
            other => json!(other.to_config_string()),
        }
    }
}

/// Re-emit a size with the largest suffix that divides it exactly,
/// preferring the binary suffixes.
pub fn format_size(value: u64) -> String {
    const BINARY: [(u64, &str); 4] = [
        (1 << 40, "Ti"),
        (1 << 30, "Gi"),
        (1 << 20, "Mi"),
        (1 << 10, "Ki"),
    ];
    const DECIMAL: [(u64, &str); 4] = [
        (1_000_000_000_000, "T"),
        (1_000_000_000, "G"),
        (1_000_000, "M"),
        (1_000, "K"),
    ];
    if value == 0 {
        return "0".to_string();
    }
    for (mult, suffix) in BINARY.iter().chain(DECIMAL.iter()) {
        if value % mult == 0 {
            return format!("{}{}", value / mult, suffix);
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_masked_in_debug() {
        let v = Value::Password(Password("s3cret".to_string()));
        assert!(!format!("{v:?}").contains("s3cret"));
        assert_eq!(v.to_json(), serde_json::json!("*****"));
    }

    #[test]
    fn size_formatting_picks_largest_suffix() {
        assert_eq!(format_size(2048), "2Ki");
        assert_eq!(format_size(2000), "2K");
        assert_eq!(format_size(1 << 30), "1Gi");
        assert_eq!(format_size(1234), "1234");
        assert_eq!(format_size(0), "0");
    }

    #[test]
    fn duration_display_uses_original_unit() {
        let d = DurationValue::new(120_000, DurationUnit::Minutes);
        assert_eq!(d.to_string(), "2min");
        let d = DurationValue::new(1500, DurationUnit::Seconds);
        assert_eq!(d.to_string(), "1500ms");
    }
}
