//! # Source definition grammar.
//!
//! A capture source is named by an opaque string:
//!
//! ```text
//! interface(:key=value(,key=value)*)?
//! ```
//!
//! - `interface` is non-empty and everything up to the first `:`;
//! - keys match `[A-Za-z_][A-Za-z0-9_]*`;
//! - values are percent-decoded (`%2c` for a literal comma, `%3d` for `=`).
//!
//! Parsing is lossless: the original string is retained verbatim and
//! [`Display`](std::fmt::Display) reproduces it byte-for-byte, so a
//! definition can be stored, shipped to a capture child, and re-parsed
//! without drift.
//!
//! The option `type` is reserved: it names the driver that should own the
//! source, with `auto` (or absence) meaning "probe for one".

use std::fmt;
use std::str::FromStr;

use crate::error::CaptureError;

/// Reserved option naming the driver.
const TYPE_OPTION: &str = "type";
/// `type` value requesting a probe.
const TYPE_AUTO: &str = "auto";

/// Parsed, lossless view of a source definition string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDefinition {
    raw: String,
    interface: String,
    options: Vec<(String, String)>,
}

impl SourceDefinition {
    /// The interface component.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// All options in definition order, values percent-decoded.
    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// First value of an option, if present.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Driver named by the `type` option; `None` when absent or `auto`.
    pub fn driver_hint(&self) -> Option<&str> {
        self.option(TYPE_OPTION).filter(|t| *t != TYPE_AUTO)
    }

    /// The definition exactly as given.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for SourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for SourceDefinition {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CaptureError::InvalidDefinition {
            definition: s.to_string(),
            reason: reason.to_string(),
        };

        let (interface, rest) = match s.split_once(':') {
            Some((iface, rest)) => (iface, Some(rest)),
            None => (s, None),
        };
        if interface.is_empty() {
            return Err(invalid("empty interface"));
        }

        let mut options = Vec::new();
        if let Some(rest) = rest {
            if rest.is_empty() {
                return Err(invalid("trailing ':' without options"));
            }
            for pair in rest.split(',') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| invalid("option without '='"))?;
                if !valid_key(key) {
                    return Err(invalid("option key must match [A-Za-z_][A-Za-z0-9_]*"));
                }
                let value = percent_decode(value)
                    .ok_or_else(|| invalid("malformed percent escape in option value"))?;
                options.push((key.to_string(), value));
            }
        }

        Ok(Self {
            raw: s.to_string(),
            interface: interface.to_string(),
            options,
        })
    }
}

fn valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn percent_decode(value: &str) -> Option<String> {
    if !value.contains('%') {
        return Some(value.to_string());
    }
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = char::from(*bytes.get(i + 1)?).to_digit(16)?;
            let lo = char::from(*bytes.get(i + 2)?).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
