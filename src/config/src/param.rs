use crate::value::{
    format_size, DurationUnit, DurationValue, HostPattern, Password, RegexValue, Throttling, Value,
};
use crate::{ConfigError, Result};
use bitflags::bitflags;
use std::path::{Path, PathBuf};

bitflags! {
    /// Filesystem checks applied to path-typed parameters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PathOptions: u8 {
        const R = 0b0000_0001;
        const W = 0b0000_0010;
        const X = 0b0000_0100;
        /// The path must exist.
        const F = 0b0000_1000;
        /// Create missing directories instead of failing.
        const C = 0b0001_0000;
    }
}

/// Whether a parameter may change on a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifiability {
    Startup,
    Runtime,
}

/// What kind of value a parameter holds, along with per-kind validation data.
#[derive(Debug, Clone)]
pub enum ParamKind {
    Bool,
    Count,
    Int { min: i64, max: i64 },
    Size,
    Duration,
    Percent,
    Path { options: PathOptions },
    Regex,
    String,
    StringList,
    HostPatternList,
    Target,
    TargetList,
    Server,
    ServerList,
    Service,
    FilterList,
    Module,
    Enum { aliases: Vec<&'static str> },
    EnumList { aliases: Vec<&'static str> },
    Password,
    Throttling,
}

/// One declared parameter of a module's specification.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub description: String,
    pub kind: ParamKind,
    pub modifiability: Modifiability,
    pub mandatory: bool,
    pub default: Option<Value>,
}

impl Param {
    pub fn new(name: &str, description: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            kind,
            modifiability: Modifiability::Startup,
            mandatory: false,
            default: None,
        }
    }

    pub fn at_runtime(mut self) -> Self {
        self.modifiability = Modifiability::Runtime;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// string -> value, with an error message citing the offending input.
    pub fn parse(&self, input: &str) -> Result<Value> {
        let input = input.trim();
        match &self.kind {
            ParamKind::Bool => parse_bool(input),
            ParamKind::Count => parse_count(input),
            ParamKind::Int { min, max } => parse_int(input, *min, *max),
            ParamKind::Size => parse_size(input),
            ParamKind::Duration => parse_duration(input),
            ParamKind::Percent => parse_percent(input),
            ParamKind::Path { options } => parse_path(input, *options),
            ParamKind::Regex => parse_regex(input),
            ParamKind::String => Ok(Value::String(unquote(input)?)),
            ParamKind::StringList => Ok(Value::StringList(split_list(input))),
            ParamKind::HostPatternList => parse_host_pattern_list(input),
            ParamKind::Target => Ok(Value::Target(input.to_string())),
            ParamKind::TargetList => Ok(Value::TargetList(split_list(input))),
            ParamKind::Server => Ok(Value::Server(input.to_string())),
            ParamKind::ServerList => Ok(Value::ServerList(split_list(input))),
            ParamKind::Service => Ok(Value::Service(input.to_string())),
            ParamKind::FilterList => Ok(Value::FilterList(split_filter_list(input))),
            ParamKind::Module => Ok(Value::Module(input.to_string())),
            ParamKind::Enum { aliases } => parse_enum(input, aliases).map(Value::Enum),
            ParamKind::EnumList { aliases } => {
                let values = split_list(input)
                    .iter()
                    .map(|v| parse_enum(v, aliases))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::EnumList(values))
            }
            ParamKind::Password => Ok(Value::Password(Password(input.to_string()))),
            ParamKind::Throttling => parse_throttling(input),
        }
    }

    /// value -> string; `parse(format(v)) == v` for every valid value.
    pub fn format(&self, value: &Value) -> String {
        value.to_config_string()
    }

    /// json -> value. Strings go through the string parser, numbers map to
    /// the numeric kinds directly.
    pub fn from_json(&self, json: &serde_json::Value) -> Result<Value> {
        match json {
            serde_json::Value::String(s) => self.parse(s),
            serde_json::Value::Bool(b) if matches!(self.kind, ParamKind::Bool) => {
                Ok(Value::Bool(*b))
            }
            serde_json::Value::Number(n) => match &self.kind {
                ParamKind::Count => Ok(Value::Count(n.as_u64().ok_or_else(|| {
                    ConfigError::invalid(format!("'{}': expected a non-negative integer", self.name))
                })?)),
                ParamKind::Int { min, max } => {
                    let v = n.as_i64().ok_or_else(|| {
                        ConfigError::invalid(format!("'{}': expected an integer", self.name))
                    })?;
                    check_range(v, *min, *max)?;
                    Ok(Value::Int(v))
                }
                ParamKind::Size => Ok(Value::Size(n.as_u64().ok_or_else(|| {
                    ConfigError::invalid(format!("'{}': expected a non-negative size", self.name))
                })?)),
                _ => Err(ConfigError::invalid(format!(
                    "'{}': expected a json string, but got a json number",
                    self.name
                ))),
            },
            other => Err(ConfigError::invalid(format!(
                "'{}': expected a json string, but got {other}",
                self.name
            ))),
        }
    }

    pub fn to_json(&self, value: &Value) -> serde_json::Value {
        value.to_json()
    }
}

fn parse_bool(input: &str) -> Result<Value> {
    match input.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
        "false" | "no" | "off" | "0" => Ok(Value::Bool(false)),
        _ => Err(ConfigError::invalid(format!("Invalid boolean: {input}"))),
    }
}

fn parse_count(input: &str) -> Result<Value> {
    input
        .parse::<u64>()
        .map(Value::Count)
        .map_err(|_| ConfigError::invalid(format!("Invalid count: {input}")))
}

fn check_range(value: i64, min: i64, max: i64) -> Result<()> {
    if value < min || value > max {
        return Err(ConfigError::invalid(format!(
            "Value {value} is out of range [{min}, {max}]"
        )));
    }
    Ok(())
}

fn parse_int(input: &str, min: i64, max: i64) -> Result<Value> {
    let value = input
        .parse::<i64>()
        .map_err(|_| ConfigError::invalid(format!("Invalid integer: {input}")))?;
    check_range(value, min, max)?;
    Ok(Value::Int(value))
}

/// K/M/G/T are powers of 1000, Ki/Mi/Gi/Ti powers of 1024.
fn parse_size(input: &str) -> Result<Value> {
    let err = || ConfigError::invalid(format!("Invalid size: {input}"));
    let (digits, suffix) = split_suffix(input);
    let base: u64 = digits.parse().map_err(|_| err())?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "K" | "k" => 1_000,
        "M" | "m" => 1_000_000,
        "G" | "g" => 1_000_000_000,
        "T" | "t" => 1_000_000_000_000,
        "Ki" | "ki" => 1 << 10,
        "Mi" | "mi" => 1 << 20,
        "Gi" | "gi" => 1 << 30,
        "Ti" | "ti" => 1 << 40,
        _ => return Err(err()),
    };
    base.checked_mul(multiplier)
        .map(Value::Size)
        .ok_or_else(err)
}

/// A duration must carry one of the h/min/s/ms suffixes; the suffix is
/// retained so persistence round-trips.
fn parse_duration(input: &str) -> Result<Value> {
    let err = || ConfigError::invalid(format!("Invalid duration: {input}"));
    let (digits, suffix) = split_suffix(input);
    let base: u64 = digits.parse().map_err(|_| err())?;
    let unit = match suffix {
        "h" => DurationUnit::Hours,
        "min" => DurationUnit::Minutes,
        "s" => DurationUnit::Seconds,
        "ms" => DurationUnit::Milliseconds,
        _ => return Err(err()),
    };
    let millis = base.checked_mul(unit.millis_per_unit()).ok_or_else(err)?;
    Ok(Value::Duration(DurationValue::new(millis, unit)))
}

fn parse_percent(input: &str) -> Result<Value> {
    let err = || ConfigError::invalid(format!("Invalid percentage: {input}"));
    let digits = input.strip_suffix('%').ok_or_else(err)?;
    let value: u8 = digits.trim().parse().map_err(|_| err())?;
    if value > 100 {
        return Err(err());
    }
    Ok(Value::Percent(value))
}

fn parse_path(input: &str, options: PathOptions) -> Result<Value> {
    let path = PathBuf::from(input);
    validate_path(&path, options)?;
    Ok(Value::Path(path))
}

fn validate_path(path: &Path, options: PathOptions) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if !path.exists() {
        if options.contains(PathOptions::C) {
            std::fs::create_dir_all(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        } else if options.contains(PathOptions::F) {
            return Err(ConfigError::invalid(format!(
                "Path does not exist: {}",
                path.display()
            )));
        } else {
            // Nothing to check against; the file will be created later.
            return Ok(());
        }
    }

    let metadata = std::fs::metadata(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mode = metadata.permissions().mode();
    let mut missing = Vec::new();
    if options.contains(PathOptions::R) && mode & 0o444 == 0 {
        missing.push("readable");
    }
    if options.contains(PathOptions::W) && mode & 0o222 == 0 {
        missing.push("writable");
    }
    if options.contains(PathOptions::X) && mode & 0o111 == 0 {
        missing.push("executable");
    }
    if !missing.is_empty() {
        return Err(ConfigError::invalid(format!(
            "Path {} is not {}",
            path.display(),
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Optionally slash-delimited; `/abc/` and `abc` are the same pattern.
fn parse_regex(input: &str) -> Result<Value> {
    let pattern = if input.len() >= 2 && input.starts_with('/') && input.ends_with('/') {
        &input[1..input.len() - 1]
    } else {
        input
    };
    let compiled = regex::Regex::new(pattern)
        .map_err(|e| ConfigError::invalid(format!("Invalid regex '{input}': {e}")))?;
    Ok(Value::Regex(RegexValue {
        pattern: pattern.to_string(),
        compiled,
    }))
}

fn parse_enum(input: &str, aliases: &[&'static str]) -> Result<String> {
    let input = input.trim();
    for alias in aliases {
        if alias.eq_ignore_ascii_case(input) {
            return Ok(alias.to_string());
        }
    }
    Err(ConfigError::invalid(format!(
        "'{input}' is not a valid value. Valid values are: {}",
        aliases.join(", ")
    )))
}

fn parse_host_pattern_list(input: &str) -> Result<Value> {
    let patterns = split_list(input)
        .iter()
        .map(|entry| parse_host_pattern(entry))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::HostPatternList(patterns))
}

fn parse_host_pattern(entry: &str) -> Result<HostPattern> {
    if entry == "*" {
        return Ok(HostPattern::Any);
    }
    if let Some((addr, prefix)) = entry.split_once('/') {
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ConfigError::invalid(format!("Invalid subnet: {entry}")))?;
        if let Ok(v4) = addr.parse() {
            if prefix > 32 {
                return Err(ConfigError::invalid(format!("Invalid subnet: {entry}")));
            }
            return Ok(HostPattern::Subnet4(v4, prefix));
        }
        if let Ok(v6) = addr.parse() {
            if prefix > 128 {
                return Err(ConfigError::invalid(format!("Invalid subnet: {entry}")));
            }
            return Ok(HostPattern::Subnet6(v6, prefix));
        }
        return Err(ConfigError::invalid(format!("Invalid subnet: {entry}")));
    }
    if let Ok(v4) = entry.parse() {
        return Ok(HostPattern::Ipv4(v4));
    }
    if let Ok(v6) = entry.parse() {
        return Ok(HostPattern::Ipv6(v6));
    }
    if entry.is_empty() {
        return Err(ConfigError::invalid("Empty host pattern".to_string()));
    }
    Ok(HostPattern::Hostname(entry.to_string()))
}

/// `{count, window, suppress}`, durations with the usual suffixes.
fn parse_throttling(input: &str) -> Result<Value> {
    let err = || ConfigError::invalid(format!("Invalid throttling value: {input}"));
    let parts: Vec<&str> = input.split(',').map(|p| p.trim()).collect();
    if parts.len() != 3 {
        return Err(err());
    }
    let count: u64 = parts[0].parse().map_err(|_| err())?;
    let window = parse_duration_ms(parts[1]).ok_or_else(err)?;
    let suppress = parse_duration_ms(parts[2]).ok_or_else(err)?;
    Ok(Value::Throttling(Throttling {
        count,
        window_ms: window,
        suppress_ms: suppress,
    }))
}

fn parse_duration_ms(input: &str) -> Option<u64> {
    match parse_duration(input) {
        Ok(Value::Duration(d)) => Some(d.millis),
        _ => input.parse().ok(),
    }
}

fn split_suffix(input: &str) -> (&str, &str) {
    let pos = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    (&input[..pos], input[pos..].trim())
}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Filter chains accept both `a|b` and `a,b`.
fn split_filter_list(input: &str) -> Vec<String> {
    input
        .split(['|', ','])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn unquote(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'"' || bytes[0] == b'\'') {
        if bytes[bytes.len() - 1] != bytes[0] {
            return Err(ConfigError::invalid(format!(
                "A quoted string must end with the same quote: {input}"
            )));
        }
        return Ok(input[1..input.len() - 1].to_string());
    }
    Ok(input.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(kind: ParamKind) -> Param {
        Param::new("p", "test parameter", kind)
    }

    #[test]
    fn bool_literals() {
        let p = param(ParamKind::Bool);
        for t in ["true", "YES", "On", "1"] {
            assert_eq!(p.parse(t).unwrap(), Value::Bool(true), "{t}");
        }
        for f in ["false", "no", "OFF", "0"] {
            assert_eq!(p.parse(f).unwrap(), Value::Bool(false), "{f}");
        }
        assert!(p.parse("maybe").is_err());
    }

    #[test]
    fn duration_suffixes() {
        let p = param(ParamKind::Duration);
        let cases = [
            ("10s", 10_000),
            ("500ms", 500),
            ("2min", 120_000),
            ("1h", 3_600_000),
        ];
        for (input, millis) in cases {
            match p.parse(input).unwrap() {
                Value::Duration(d) => assert_eq!(d.millis, millis, "{input}"),
                v => panic!("unexpected value {v:?}"),
            }
        }
        let err = p.parse("10").unwrap_err();
        assert!(err.to_string().contains("Invalid duration"), "{err}");
    }

    #[test]
    fn duration_round_trip() {
        let p = param(ParamKind::Duration);
        for input in ["10s", "500ms", "2min", "1h", "90min"] {
            let v = p.parse(input).unwrap();
            assert_eq!(p.parse(&p.format(&v)).unwrap(), v, "{input}");
        }
    }

    #[test]
    fn size_suffixes() {
        let p = param(ParamKind::Size);
        assert_eq!(p.parse("2K").unwrap(), Value::Size(2_000));
        assert_eq!(p.parse("2Ki").unwrap(), Value::Size(2_048));
        assert_eq!(p.parse("1G").unwrap(), Value::Size(1_000_000_000));
        assert_eq!(p.parse("1Gi").unwrap(), Value::Size(1 << 30));
        assert_eq!(p.parse("17").unwrap(), Value::Size(17));
        let err = p.parse("2X").unwrap_err();
        assert!(err.to_string().contains("Invalid size: 2X"));
    }

    #[test]
    fn size_round_trip() {
        let p = param(ParamKind::Size);
        for input in ["2K", "2Ki", "1G", "1Gi", "17", "1T"] {
            let v = p.parse(input).unwrap();
            assert_eq!(p.parse(&p.format(&v)).unwrap(), v, "{input}");
        }
    }

    #[test]
    fn percent_bounds() {
        let p = param(ParamKind::Percent);
        assert_eq!(p.parse("42%").unwrap(), Value::Percent(42));
        assert!(p.parse("101%").is_err());
        assert!(p.parse("42").is_err());
    }

    #[test]
    fn int_range() {
        let p = param(ParamKind::Int { min: 1, max: 8 });
        assert_eq!(p.parse("4").unwrap(), Value::Int(4));
        assert!(p.parse("0").is_err());
        assert!(p.parse("9").is_err());
    }

    #[test]
    fn regex_slash_delimiters() {
        let p = param(ParamKind::Regex);
        let a = p.parse("/^select/").unwrap();
        let b = p.parse("^select").unwrap();
        assert_eq!(a, b);
        assert!(p.parse("/(unclosed/").is_err());
    }

    #[test]
    fn host_patterns() {
        let p = param(ParamKind::HostPatternList);
        match p.parse("10.0.0.0/8, db-%.example.com, *").unwrap() {
            Value::HostPatternList(list) => {
                assert_eq!(list.len(), 3);
                assert!(matches!(list[0], HostPattern::Subnet4(_, 8)));
                assert!(list[1].is_hostname());
                assert_eq!(list[2], HostPattern::Any);
            }
            v => panic!("unexpected value {v:?}"),
        }
        assert!(p.parse("10.0.0.0/40").is_err());
    }

    #[test]
    fn enum_aliases_case_insensitive() {
        let p = param(ParamKind::Enum {
            aliases: vec!["always", "on_conflict"],
        });
        assert_eq!(p.parse("ALWAYS").unwrap(), Value::Enum("always".to_string()));
        assert!(p.parse("sometimes").is_err());
    }

    #[test]
    fn throttling_triple() {
        let p = param(ParamKind::Throttling);
        assert_eq!(
            p.parse("10, 1000ms, 10000ms").unwrap(),
            Value::Throttling(Throttling {
                count: 10,
                window_ms: 1000,
                suppress_ms: 10_000,
            })
        );
        assert!(p.parse("10, 1000ms").is_err());
    }

    #[test]
    fn filter_list_accepts_pipes() {
        let p = param(ParamKind::FilterList);
        assert_eq!(
            p.parse("cache | capture").unwrap(),
            Value::FilterList(vec!["cache".to_string(), "capture".to_string()])
        );
    }

    #[test]
    fn format_size_round_trips_through_parse() {
        for v in [0u64, 1, 999, 1000, 1024, 1536, 1 << 20, 3_000_000] {
            let formatted = format_size(v);
            match parse_size(&formatted).unwrap() {
                Value::Size(parsed) => assert_eq!(parsed, v, "{formatted}"),
                _ => unreachable!(),
            }
        }
    }
}
