//! Flag namespace shared by every component of a service context.
//!
//! Components declare their options into a [`FlagSet`] while the context is
//! being built. Each option is exposed both as a long command-line flag
//! (`--redis-url`) and as an environment variable (`REDIS_URL`). After a
//! successful parse the set is frozen and only read from.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use thiserror::Error;

/// Value type of a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    String,
    Int,
    Bool,
    Duration,
    Uint64,
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlagKind::String => "string",
            FlagKind::Int => "int",
            FlagKind::Bool => "bool",
            FlagKind::Duration => "duration",
            FlagKind::Uint64 => "uint64",
        };
        f.write_str(s)
    }
}

/// A typed flag value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagValue {
    String(String),
    Int(i64),
    Bool(bool),
    Duration(Duration),
    Uint64(u64),
}

impl FlagValue {
    pub fn kind(&self) -> FlagKind {
        match self {
            FlagValue::String(_) => FlagKind::String,
            FlagValue::Int(_) => FlagKind::Int,
            FlagValue::Bool(_) => FlagKind::Bool,
            FlagValue::Duration(_) => FlagKind::Duration,
            FlagValue::Uint64(_) => FlagKind::Uint64,
        }
    }

    /// Parse a raw command-line or environment value as `kind`.
    pub fn parse(kind: FlagKind, raw: &str) -> Result<Self, String> {
        match kind {
            FlagKind::String => Ok(FlagValue::String(raw.to_string())),
            FlagKind::Int => raw
                .trim()
                .parse::<i64>()
                .map(FlagValue::Int)
                .map_err(|e| e.to_string()),
            FlagKind::Uint64 => raw
                .trim()
                .parse::<u64>()
                .map(FlagValue::Uint64)
                .map_err(|e| e.to_string()),
            FlagKind::Bool => parse_bool(raw.trim()).map(FlagValue::Bool),
            FlagKind::Duration => humantime::parse_duration(raw.trim())
                .map(FlagValue::Duration)
                .map_err(|e| e.to_string()),
        }
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::String(s) => f.write_str(s),
            FlagValue::Int(n) => write!(f, "{n}"),
            FlagValue::Bool(b) => write!(f, "{b}"),
            // `1m30s`, not `1m 30s`: env files keep quotes verbatim.
            FlagValue::Duration(d) => {
                let spaced = humantime::format_duration(*d).to_string();
                f.write_str(&spaced.replace(' ', ""))
            }
            FlagValue::Uint64(n) => write!(f, "{n}"),
        }
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("'{other}' is not a boolean")),
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for String {}
    impl Sealed for i64 {}
    impl Sealed for bool {}
    impl Sealed for std::time::Duration {}
    impl Sealed for u64 {}
}

/// Rust types that can back a flag.
pub trait FlagType: Sized + sealed::Sealed {
    const KIND: FlagKind;
    fn into_value(self) -> FlagValue;
    fn from_value(value: &FlagValue) -> Option<Self>;
}

impl FlagType for String {
    const KIND: FlagKind = FlagKind::String;
    fn into_value(self) -> FlagValue {
        FlagValue::String(self)
    }
    fn from_value(value: &FlagValue) -> Option<Self> {
        match value {
            FlagValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FlagType for i64 {
    const KIND: FlagKind = FlagKind::Int;
    fn into_value(self) -> FlagValue {
        FlagValue::Int(self)
    }
    fn from_value(value: &FlagValue) -> Option<Self> {
        match value {
            FlagValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl FlagType for bool {
    const KIND: FlagKind = FlagKind::Bool;
    fn into_value(self) -> FlagValue {
        FlagValue::Bool(self)
    }
    fn from_value(value: &FlagValue) -> Option<Self> {
        match value {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FlagType for Duration {
    const KIND: FlagKind = FlagKind::Duration;
    fn into_value(self) -> FlagValue {
        FlagValue::Duration(self)
    }
    fn from_value(value: &FlagValue) -> Option<Self> {
        match value {
            FlagValue::Duration(d) => Some(*d),
            _ => None,
        }
    }
}

impl FlagType for u64 {
    const KIND: FlagKind = FlagKind::Uint64;
    fn into_value(self) -> FlagValue {
        FlagValue::Uint64(self)
    }
    fn from_value(value: &FlagValue) -> Option<Self> {
        match value {
            FlagValue::Uint64(n) => Some(*n),
            _ => None,
        }
    }
}

/// Typed handle to a flag. Cheap to clone; carries only the name.
pub struct Flag<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Flag<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for Flag<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> fmt::Debug for Flag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Flag").field(&self.name).finish()
    }
}

/// Declared option: name, help, default and current value.
#[derive(Debug, Clone)]
pub struct FlagSpec {
    name: String,
    env: String,
    help: String,
    default: FlagValue,
    value: FlagValue,
}

impl FlagSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Environment variable bound to this flag.
    pub fn env_name(&self) -> &str {
        &self.env
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn kind(&self) -> FlagKind {
        self.default.kind()
    }

    pub fn default_value(&self) -> &FlagValue {
        &self.default
    }

    /// Current value: the default until a parse overrides it.
    pub fn value(&self) -> &FlagValue {
        &self.value
    }

    fn to_arg(&self) -> Arg {
        let mut help = self.help.clone();
        let default = self.default.to_string();
        if !default.is_empty() {
            help = format!("{help} [default: {default}]");
        }

        let arg = Arg::new(self.name.clone())
            .long(self.name.clone())
            .env(self.env.clone())
            .help(help)
            .action(ArgAction::Set)
            .value_name(self.kind().to_string().to_uppercase());

        match self.kind() {
            FlagKind::Bool => arg
                .num_args(0..=1)
                .require_equals(true)
                .default_missing_value("true"),
            // Negative numbers and dash-leading strings are values.
            _ => arg.num_args(1).allow_hyphen_values(true),
        }
    }
}

/// Errors raised while declaring, parsing or reading flags.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("flag(s) registered more than once: {}", .names.join(", "))]
    DuplicateFlag { names: Vec<String> },
    #[error("invalid value '{value}' for flag '--{flag}': {reason}")]
    InvalidValue {
        flag: String,
        value: String,
        reason: String,
    },
    #[error("unknown flag '{0}'")]
    UnknownFlag(String),
    #[error("flag '{flag}' is a {actual} flag, not {expected}")]
    TypeMismatch {
        flag: String,
        expected: FlagKind,
        actual: FlagKind,
    },
    #[error("flags were already parsed")]
    AlreadyParsed,
    #[error(transparent)]
    Cli(#[from] clap::Error),
}

/// Map a flag name to its environment variable: upper-case, every
/// non-alphanumeric character replaced by `_`.
pub fn env_name(flag: &str) -> String {
    flag.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Ordered set of flags declared by the components of one context.
#[derive(Debug, Default)]
pub struct FlagSet {
    specs: Vec<FlagSpec>,
    index: HashMap<String, usize>,
    duplicates: Vec<String>,
    frozen: bool,
}

impl FlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `flag` with its default and help text.
    ///
    /// A second declaration of the same name is kept out of the set and
    /// reported by the next parse.
    pub fn register<T: FlagType>(&mut self, flag: &Flag<T>, default: T, help: impl Into<String>) {
        if self.frozen {
            tracing::warn!(flag = flag.name(), "Ignoring flag registered after parsing");
            return;
        }
        if self.index.contains_key(flag.name()) {
            tracing::debug!(flag = flag.name(), "Duplicate flag registration");
            self.duplicates.push(flag.name().to_string());
            return;
        }

        let default = default.into_value();
        self.index.insert(flag.name().to_string(), self.specs.len());
        self.specs.push(FlagSpec {
            name: flag.name().to_string(),
            env: env_name(flag.name()),
            help: help.into(),
            value: default.clone(),
            default,
        });
    }

    pub fn string(
        &mut self,
        name: impl Into<String>,
        default: impl Into<String>,
        help: impl Into<String>,
    ) -> Flag<String> {
        self.declare(name, default.into(), help)
    }

    pub fn int(&mut self, name: impl Into<String>, default: i64, help: impl Into<String>) -> Flag<i64> {
        self.declare(name, default, help)
    }

    pub fn bool(&mut self, name: impl Into<String>, default: bool, help: impl Into<String>) -> Flag<bool> {
        self.declare(name, default, help)
    }

    pub fn duration(
        &mut self,
        name: impl Into<String>,
        default: Duration,
        help: impl Into<String>,
    ) -> Flag<Duration> {
        self.declare(name, default, help)
    }

    pub fn uint64(&mut self, name: impl Into<String>, default: u64, help: impl Into<String>) -> Flag<u64> {
        self.declare(name, default, help)
    }

    fn declare<T: FlagType>(
        &mut self,
        name: impl Into<String>,
        default: T,
        help: impl Into<String>,
    ) -> Flag<T> {
        let flag = Flag::new(name);
        self.register(&flag, default, help);
        flag
    }

    /// Current value of `flag`.
    pub fn get<T: FlagType>(&self, flag: &Flag<T>) -> Result<T, ConfigError> {
        let spec = self
            .lookup(flag.name())
            .ok_or_else(|| ConfigError::UnknownFlag(flag.name().to_string()))?;
        T::from_value(spec.value()).ok_or_else(|| ConfigError::TypeMismatch {
            flag: flag.name().to_string(),
            expected: T::KIND,
            actual: spec.kind(),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<&FlagSpec> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    /// Flags in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &FlagSpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Override a value programmatically before parsing.
    pub fn set(&mut self, name: &str, raw: &str) -> Result<(), ConfigError> {
        if self.frozen {
            return Err(ConfigError::AlreadyParsed);
        }
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| ConfigError::UnknownFlag(name.to_string()))?;
        self.assign(idx, raw)
    }

    fn assign(&mut self, idx: usize, raw: &str) -> Result<(), ConfigError> {
        let spec = &mut self.specs[idx];
        spec.value = FlagValue::parse(spec.kind(), raw).map_err(|reason| ConfigError::InvalidValue {
            flag: spec.name.clone(),
            value: raw.to_string(),
            reason,
        })?;
        Ok(())
    }

    /// Add every flag as a long option with its environment binding.
    pub fn augment_command(&self, cmd: Command) -> Command {
        self.specs.iter().fold(cmd, |cmd, spec| cmd.arg(spec.to_arg()))
    }

    /// Read values from matches produced by a command built with
    /// [`FlagSet::augment_command`], validate them and freeze the set.
    ///
    /// Flags absent from the matches keep their defaults.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), ConfigError> {
        if self.frozen {
            return Err(ConfigError::AlreadyParsed);
        }
        if !self.duplicates.is_empty() {
            let mut names = self.duplicates.clone();
            names.sort();
            names.dedup();
            return Err(ConfigError::DuplicateFlag { names });
        }

        for idx in 0..self.specs.len() {
            let raw = match matches.try_get_one::<String>(&self.specs[idx].name) {
                Ok(Some(raw)) => raw.clone(),
                Ok(None) | Err(_) => continue,
            };
            self.assign(idx, &raw)?;
        }

        self.frozen = true;
        tracing::debug!(flags = self.specs.len(), "Flags parsed and frozen");
        Ok(())
    }

    /// Parse `args` (first item is the binary name) together with the
    /// environment.
    pub fn parse_from<I, T>(&mut self, bin_name: &str, args: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cmd = self.augment_command(Command::new(bin_name.to_string()));
        let matches = cmd.try_get_matches_from(args)?;
        self.apply_matches(&matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (FlagSet, Flag<String>, Flag<i64>, Flag<bool>, Flag<Duration>) {
        let mut flags = FlagSet::new();
        let url = flags.string("tstcache-url", "localhost:6379", "redis url");
        let pool = flags.int("tstcache-pool-size", 10, "pool size");
        let otel = flags.bool("tstcache-is-otel", false, "enable tracing");
        let timeout = flags.duration("tstcache-timeout", Duration::from_secs(5), "dial timeout");
        (flags, url, pool, otel, timeout)
    }

    #[test]
    fn env_names_are_upper_snake_case() {
        assert_eq!(env_name("redis-url"), "REDIS_URL");
        assert_eq!(env_name("gin.port"), "GIN_PORT");
        assert_eq!(env_name("otel-v2/endpoint"), "OTEL_V2_ENDPOINT");
    }

    #[test]
    fn defaults_are_readable_before_parse() {
        let (flags, url, pool, otel, timeout) = sample();
        assert_eq!(flags.get(&url).unwrap(), "localhost:6379");
        assert_eq!(flags.get(&pool).unwrap(), 10);
        assert!(!flags.get(&otel).unwrap());
        assert_eq!(flags.get(&timeout).unwrap(), Duration::from_secs(5));
        assert!(!flags.is_frozen());
    }

    #[test]
    fn command_line_values_override_defaults() {
        let (mut flags, url, pool, otel, timeout) = sample();
        flags
            .parse_from(
                "svc",
                [
                    "svc",
                    "--tstcache-url",
                    "cache:6380",
                    "--tstcache-pool-size=32",
                    "--tstcache-is-otel",
                    "--tstcache-timeout",
                    "250ms",
                ],
            )
            .unwrap();

        assert_eq!(flags.get(&url).unwrap(), "cache:6380");
        assert_eq!(flags.get(&pool).unwrap(), 32);
        assert!(flags.get(&otel).unwrap());
        assert_eq!(flags.get(&timeout).unwrap(), Duration::from_millis(250));
        assert!(flags.is_frozen());
    }

    #[test]
    fn explicit_false_for_bool_flag() {
        let mut flags = FlagSet::new();
        let on = flags.bool("feature-on", true, "toggle");
        flags.parse_from("svc", ["svc", "--feature-on=false"]).unwrap();
        assert!(!flags.get(&on).unwrap());
    }

    #[test]
    fn invalid_value_names_the_flag() {
        let (mut flags, ..) = sample();
        let err = flags
            .parse_from("svc", ["svc", "--tstcache-pool-size", "many"])
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { flag, value, .. } => {
                assert_eq!(flag, "tstcache-pool-size");
                assert_eq!(value, "many");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!flags.is_frozen());
    }

    #[test]
    fn duplicate_registration_surfaces_at_parse_time() {
        let mut flags = FlagSet::new();
        flags.string("db-dsn", "a", "first");
        flags.string("db-dsn", "b", "second");

        // First declaration wins for introspection.
        assert_eq!(flags.len(), 1);
        assert_eq!(flags.lookup("db-dsn").unwrap().help(), "first");

        let err = flags.parse_from("svc", ["svc"]).unwrap_err();
        match err {
            ConfigError::DuplicateFlag { names } => assert_eq!(names, vec!["db-dsn".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn second_parse_is_rejected() {
        let (mut flags, ..) = sample();
        flags.parse_from("svc", ["svc"]).unwrap();
        assert!(matches!(
            flags.parse_from("svc", ["svc"]),
            Err(ConfigError::AlreadyParsed)
        ));
        assert!(matches!(
            flags.set("tstcache-url", "x"),
            Err(ConfigError::AlreadyParsed)
        ));
    }

    #[test]
    fn wrong_type_and_unknown_flag() {
        let (flags, ..) = sample();
        let as_int: Flag<i64> = Flag::new("tstcache-url");
        assert!(matches!(
            flags.get(&as_int),
            Err(ConfigError::TypeMismatch {
                expected: FlagKind::Int,
                actual: FlagKind::String,
                ..
            })
        ));
        let missing: Flag<String> = Flag::new("nope");
        assert!(matches!(flags.get(&missing), Err(ConfigError::UnknownFlag(_))));
    }

    #[test]
    fn unknown_command_line_flag_is_a_cli_error() {
        let (mut flags, ..) = sample();
        let err = flags.parse_from("svc", ["svc", "--bogus", "1"]).unwrap_err();
        assert!(matches!(err, ConfigError::Cli(_)));
    }

    #[test]
    fn dash_leading_values_are_accepted() {
        let mut flags = FlagSet::new();
        let offset = flags.int("tz-offset", 0, "offset in hours");
        let prefix = flags.string("tz-prefix", "", "key prefix");
        flags
            .parse_from("svc", ["svc", "--tz-offset", "-5", "--tz-prefix", "-tmp"])
            .unwrap();
        assert_eq!(flags.get(&offset).unwrap(), -5);
        assert_eq!(flags.get(&prefix).unwrap(), "-tmp");
    }

    #[test]
    fn durations_render_without_spaces_and_parse_back() {
        let rendered = FlagValue::Duration(Duration::from_millis(90_250)).to_string();
        assert_eq!(rendered, "1m30s250ms");
        let parsed = FlagValue::parse(FlagKind::Duration, &rendered).unwrap();
        assert_eq!(parsed, FlagValue::Duration(Duration::from_millis(90_250)));
    }

    #[test]
    fn programmatic_set_validates_type() {
        let (mut flags, _, pool, ..) = sample();
        flags.set("tstcache-pool-size", "7").unwrap();
        assert_eq!(flags.get(&pool).unwrap(), 7);
        assert!(flags.set("tstcache-pool-size", "-x").is_err());
        assert!(matches!(flags.set("missing", "1"), Err(ConfigError::UnknownFlag(_))));
    }
}
