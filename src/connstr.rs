//! Connection string parsing for the database endpoint: flat
//! `Key=Value;Key=Value;` text with case-insensitive keys, tolerant of a
//! single trailing separator.

use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

/// Parsed connection string options. Key lookup is case-insensitive;
/// the original pair order is preserved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionString {
    pairs: Vec<(String, String)>,
}

impl ConnectionString {
    /// Parses `Key=Value;Key=Value;` text.
    ///
    /// Exactly one trailing `;` is stripped; values may contain `/` and
    /// `:` (URLs survive intact) but never an unescaped `;`, so no
    /// separator character is ever left inside a parsed value.
    ///
    /// # Example
    ///
    /// ```
    /// use docindex::connstr::ConnectionString;
    ///
    /// let options = ConnectionString::parse("Url=http://localhost:10301;").unwrap();
    /// assert_eq!(options.url(), Some("http://localhost:10301"));
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let input = input.strip_suffix(';').unwrap_or(input);

        let mut pairs = Vec::new();
        if input.is_empty() {
            return Ok(Self { pairs });
        }
        for segment in input.split(';') {
            let Some((key, value)) = segment.split_once('=') else {
                return Err(Error::ConfigError(ErrorKind::ConfigError(format!(
                    "connection string segment '{segment}' is not a Key=Value pair"
                ))));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::ConfigError(ErrorKind::ConfigError(
                    "connection string contains a pair with an empty key".to_string(),
                )));
            }
            pairs.push((key.to_ascii_lowercase(), value.trim().to_string()));
        }
        Ok(Self { pairs })
    }

    /// Value for a key, matched case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        let wanted = key.to_ascii_lowercase();
        self.pairs
            .iter()
            .find(|(k, _)| *k == wanted)
            .map(|(_, v)| v.as_str())
    }

    pub fn url(&self) -> Option<&str> {
        self.get("url")
    }

    pub fn database(&self) -> Option<&str> {
        self.get("database")
    }

    pub fn api_key(&self) -> Option<&str> {
        self.get("apikey")
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
