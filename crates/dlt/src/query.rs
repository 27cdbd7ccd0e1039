//! Queries over recorded DLT frames

use regex::Regex;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::frame::DltFrame;
use itf_common::{Error, Result};

/// Frame field a query can match on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Ecu,
    Apid,
    Ctid,
    Payload,
    MessageType,
    Subtype,
    Counter,
    SessionId,
    MessageId,
    Timestamp,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::Ecu,
        Field::Apid,
        Field::Ctid,
        Field::Payload,
        Field::MessageType,
        Field::Subtype,
        Field::Counter,
        Field::SessionId,
        Field::MessageId,
        Field::Timestamp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Ecu => "ecu",
            Field::Apid => "apid",
            Field::Ctid => "ctid",
            Field::Payload => "payload",
            Field::MessageType => "type",
            Field::Subtype => "subtype",
            Field::Counter => "counter",
            Field::SessionId => "session_id",
            Field::MessageId => "message_id",
            Field::Timestamp => "timestamp",
        }
    }

    /// Textual form of this field in `frame`; absent fields are empty
    pub fn value<'a>(self, frame: &'a DltFrame) -> Cow<'a, str> {
        fn opt<T: ToString>(v: Option<T>) -> Cow<'static, str> {
            v.map(|v| Cow::Owned(v.to_string())).unwrap_or_default()
        }
        match self {
            Field::Ecu => Cow::Borrowed(frame.ecu()),
            Field::Apid => Cow::Borrowed(frame.apid()),
            Field::Ctid => Cow::Borrowed(frame.ctid()),
            Field::Payload => frame.text(),
            Field::MessageType => opt(frame.message_type()),
            Field::Subtype => match (frame.message_type(), frame.subtype()) {
                (Some(t), Some(s)) => match t.subtype_name(s) {
                    Some(name) => Cow::Borrowed(name),
                    None => Cow::Owned(s.to_string()),
                },
                _ => Cow::Borrowed(""),
            },
            Field::Counter => Cow::Owned(frame.counter().to_string()),
            Field::SessionId => opt(frame.session_id()),
            Field::MessageId => opt(frame.payload().message_id()),
            Field::Timestamp => opt(frame.timestamp()),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Field::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Field::ALL.iter().map(|f| f.name()).collect();
                Error::InvalidQuery(format!(
                    "unknown field '{}' (expected one of: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// How a field value is compared
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Equality with the field's textual form
    Exact(String),
    /// Unanchored regular expression search
    Pattern(Regex),
}

impl Matcher {
    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Matcher::Pattern)
            .map_err(|e| Error::InvalidQuery(format!("invalid pattern '{}': {}", pattern, e)))
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(expected) => expected == value,
            Matcher::Pattern(regex) => regex.is_match(value),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Exact(v) => write!(f, "={}", v),
            Matcher::Pattern(r) => write!(f, "~{}", r.as_str()),
        }
    }
}

/// Matcher as it appears in configuration: a literal string or `{ regex = "..." }`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MatcherSpec {
    Literal(String),
    Regex { regex: String },
}

/// Conjunction of per-field matchers
///
/// The empty query matches every frame.
#[derive(Debug, Clone, Default)]
pub struct Query {
    matchers: BTreeMap<Field, Matcher>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value`
    pub fn exact(mut self, field: &str, value: impl Into<String>) -> Result<Self> {
        self.matchers
            .insert(field.parse()?, Matcher::Exact(value.into()));
        Ok(self)
    }

    /// Require `field` to contain a match for `pattern`
    pub fn pattern(mut self, field: &str, pattern: &str) -> Result<Self> {
        self.matchers.insert(field.parse()?, Matcher::pattern(pattern)?);
        Ok(self)
    }

    /// Build from configuration-style field specs
    pub fn from_specs<K: AsRef<str>>(
        specs: impl IntoIterator<Item = (K, MatcherSpec)>,
    ) -> Result<Self> {
        specs.into_iter().try_fold(Query::new(), |query, (field, spec)| match spec {
            MatcherSpec::Literal(value) => query.exact(field.as_ref(), value),
            MatcherSpec::Regex { regex } => query.pattern(field.as_ref(), &regex),
        })
    }

    /// Parse command-line terms: `field=literal` or `field~regex`
    pub fn parse_terms<S: AsRef<str>>(terms: &[S]) -> Result<Self> {
        terms.iter().try_fold(Query::new(), |query, term| {
            let term = term.as_ref();
            match term.find(['=', '~']) {
                Some(i) if term.as_bytes()[i] == b'=' => query.exact(&term[..i], &term[i + 1..]),
                Some(i) => query.pattern(&term[..i], &term[i + 1..]),
                None => Err(Error::InvalidQuery(format!(
                    "expected field=value or field~regex, got '{}'",
                    term
                ))),
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn matcher(&self, field: Field) -> Option<&Matcher> {
        self.matchers.get(&field)
    }

    /// Literal application ID, when the query pins one
    pub(crate) fn exact_apid(&self) -> Option<&str> {
        match self.matchers.get(&Field::Apid)? {
            Matcher::Exact(apid) => Some(apid),
            Matcher::Pattern(_) => None,
        }
    }

    pub fn matches(&self, frame: &DltFrame) -> bool {
        self.matchers
            .iter()
            .all(|(field, matcher)| matcher.matches(&field.value(frame)))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .matchers
            .iter()
            .map(|(field, matcher)| format!("{}{}", field, matcher))
            .collect();
        write!(f, "{{{}}}", terms.join(", "))
    }
}
