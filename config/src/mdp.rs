//! Minimal model of GROMACS `.mdp` parameter files.
//!
//! Only what is needed to apply overrides to a template: entries are kept in
//! order, comments and blank lines are preserved verbatim.

use std::fmt;

/// A key/value change applied to an `.mdp` file.
#[derive(Clone, Debug, PartialEq)]
pub struct MdpOverride {
    pub key: &'static str,
    pub value: String,
    /// Repeat the value once per existing token (e.g. one `ref_t` per coupling group).
    pub broadcast: bool,
}

impl MdpOverride {
    pub fn scalar(key: &'static str, value: impl ToString) -> Self {
        Self {
            key,
            value: value.to_string(),
            broadcast: false,
        }
    }

    pub fn per_group(key: &'static str, value: impl ToString) -> Self {
        Self {
            key,
            value: value.to_string(),
            broadcast: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Line {
    Entry {
        key: String,
        value: String,
        comment: Option<String>,
    },
    Verbatim(String),
}

/// Parsed `.mdp` file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MdpFile {
    lines: Vec<Line>,
}

/// GROMACS treats `-` and `_` in option names as equivalent.
fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace('-', "_")
}

impl MdpFile {
    pub fn parse(text: &str) -> Result<Self, MdpError> {
        let mut lines = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let (body, comment) = match raw.split_once(';') {
                Some((body, comment)) => (body, Some(comment.to_string())),
                None => (raw, None),
            };
            if body.trim().is_empty() {
                lines.push(Line::Verbatim(raw.to_string()));
                continue;
            }
            let (key, value) = body
                .split_once('=')
                .ok_or_else(|| MdpError::Syntax(idx + 1, raw.to_string()))?;
            if key.trim().is_empty() {
                return Err(MdpError::Syntax(idx + 1, raw.to_string()));
            }
            lines.push(Line::Entry {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
                comment,
            });
        }
        Ok(Self { lines })
    }

    fn find(&self, key: &str) -> Option<usize> {
        let wanted = normalize_key(key);
        self.lines
            .iter()
            .position(|l| matches!(l, Line::Entry { key, .. } if normalize_key(key) == wanted))
    }

    /// Value of an entry, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        match &self.lines[self.find(key)?] {
            Line::Entry { value, .. } => Some(value),
            Line::Verbatim(_) => None,
        }
    }

    /// Replace an entry's value, or append the entry if absent.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.find(key) {
            Some(idx) => {
                if let Line::Entry { value: v, .. } = &mut self.lines[idx] {
                    *v = value;
                }
            }
            None => self.lines.push(Line::Entry {
                key: key.to_string(),
                value,
                comment: None,
            }),
        }
    }

    /// Set `value` once per whitespace-separated token of the existing entry.
    pub fn set_broadcast(&mut self, key: &str, value: &str) {
        let groups = self
            .get(key)
            .map_or(1, |v| v.split_whitespace().count().max(1));
        self.set(key, vec![value; groups].join(" "));
    }

    pub fn apply(&mut self, overrides: &[MdpOverride]) {
        for o in overrides {
            if o.broadcast {
                self.set_broadcast(o.key, &o.value);
            } else {
                self.set(o.key, o.value.clone());
            }
        }
    }
}

impl fmt::Display for MdpFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            match line {
                Line::Entry {
                    key,
                    value,
                    comment,
                } => {
                    write!(f, "{key:<24}= {value}")?;
                    if let Some(comment) = comment {
                        write!(f, " ;{comment}")?;
                    }
                    writeln!(f)?;
                }
                Line::Verbatim(raw) => writeln!(f, "{raw}")?,
            }
        }
        Ok(())
    }
}

/// Errors that can occur when parsing an `.mdp` file.
#[derive(Debug, thiserror::Error)]
pub enum MdpError {
    #[error("mdp syntax error on line {0}: {1:?}")]
    Syntax(usize, String),
}
