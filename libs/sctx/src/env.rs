//! Environment-file rendering of a flag namespace (`outenv`).
//!
//! Produces one `NAME=value` line per registered flag, in registration order,
//! with the current default or parsed value. Nothing here touches a component.

use std::fmt;
use std::io::{self, Write};

use crate::flags::{FlagSet, FlagSpec};

/// Renders a [`FlagSet`] as environment assignments.
#[derive(Debug, Clone, Copy)]
pub struct EnvTemplate<'a> {
    flags: &'a FlagSet,
    with_help: bool,
}

impl<'a> EnvTemplate<'a> {
    pub fn new(flags: &'a FlagSet) -> Self {
        Self {
            flags,
            with_help: false,
        }
    }

    /// Precede each assignment with a `# <help>` comment line.
    pub fn with_help(mut self, yes: bool) -> Self {
        self.with_help = yes;
        self
    }

    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        write!(out, "{self}")
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EnvTemplate<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for spec in self.flags.iter() {
            if self.with_help {
                writeln!(f, "# {} (--{}, {})", spec.help(), spec.name(), spec.kind())?;
            }
            writeln!(f, "{}", assignment(spec))?;
        }
        Ok(())
    }
}

fn assignment(spec: &FlagSpec) -> String {
    format!("{}={}", spec.env_name(), quote(&spec.value().to_string()))
}

// Values with whitespace or shell/env-file metacharacters are double-quoted.
fn quote(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '\\' | '$' | '`'));
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`");
    format!("\"{escaped}\"")
}

impl FlagSet {
    pub fn env_template(&self) -> EnvTemplate<'_> {
        EnvTemplate::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn flags() -> FlagSet {
        let mut flags = FlagSet::new();
        flags.string("gin-host", "0.0.0.0", "bind host");
        flags.int("gin-port", 3000, "bind port");
        flags.bool("redis-is-otel", false, "enable tracing");
        flags.duration("http-idle-conn-timeout", Duration::from_secs(90), "idle timeout");
        flags.uint64("kafka-batch-bytes", 1_048_576, "batch size");
        flags.string("db-dsn", "", "data source name");
        flags
    }

    #[test]
    fn one_line_per_flag_in_registration_order() {
        let out = flags().env_template().render();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "GIN_HOST=0.0.0.0",
                "GIN_PORT=3000",
                "REDIS_IS_OTEL=false",
                "HTTP_IDLE_CONN_TIMEOUT=1m30s",
                "KAFKA_BATCH_BYTES=1048576",
                "DB_DSN=",
            ]
        );
    }

    #[test]
    fn help_comments_precede_assignments() {
        let out = flags().env_template().with_help(true).render();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 12);
        assert_eq!(lines[0], "# bind host (--gin-host, string)");
        assert_eq!(lines[1], "GIN_HOST=0.0.0.0");
        assert_eq!(lines[2], "# bind port (--gin-port, int)");
    }

    #[test]
    fn parsed_values_are_rendered() {
        let mut flags = flags();
        flags
            .parse_from("svc", ["svc", "--gin-port", "8080", "--db-dsn", "postgres://u:p@h/db"])
            .unwrap();
        let out = flags.env_template().render();
        assert!(out.contains("GIN_PORT=8080\n"));
        assert!(out.contains("DB_DSN=postgres://u:p@h/db\n"));
    }

    #[test]
    fn quoting_escapes_metacharacters() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("a b"), "\"a b\"");
        assert_eq!(quote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote("$HOME"), "\"\\$HOME\"");
    }

    #[test]
    fn writes_to_any_sink() {
        let mut buf: Vec<u8> = Vec::new();
        flags().env_template().write_to(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap().lines().count(), 6);
    }
}
