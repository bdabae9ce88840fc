//! Display-form codec for email addresses.
//!
//! Receivers expose their sender and recipients as
//! `"<first> <last> <email>"` strings; the email component is wrapped in
//! angle brackets on output and accepted bare or bracketed on input.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl EmailAddress {
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: email.into(),
        }
    }

    /// Parse the display form produced by [`fmt::Display`].
    ///
    /// The last whitespace-separated token is the address, optionally
    /// wrapped in `<...>`; everything before it is `first [last]`.
    pub fn parse(value: &str) -> Result<Self> {
        let mut tokens: Vec<&str> = value.split_whitespace().collect();
        let email = tokens
            .pop()
            .ok_or_else(|| Error::bad_request("empty email entry"))?;
        let email = email
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .unwrap_or(email);
        if email.is_empty() || !email.contains('@') {
            return Err(Error::bad_request(format!("invalid email `{value}`")));
        }

        let first_name = tokens.first().copied().unwrap_or_default().to_string();
        let last_name = if tokens.len() > 1 {
            tokens[1..].join(" ")
        } else {
            String::new()
        };

        Ok(Self {
            first_name,
            last_name,
            email: email.to_string(),
        })
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let email = &self.email;
        match (self.first_name.is_empty(), self.last_name.is_empty()) {
            (true, true) => write!(f, "<{email}>"),
            (false, true) => write!(f, "{} <{email}>", self.first_name),
            (true, false) => write!(f, "{} <{email}>", self.last_name),
            (false, false) => write!(f, "{} {} <{email}>", self.first_name, self.last_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let address = EmailAddress::new("Jane", "Doe", "jane.doe@example.com");
        let text = address.to_string();
        assert_eq!(text, "Jane Doe <jane.doe@example.com>");
        assert_eq!(EmailAddress::parse(&text).unwrap(), address);
    }

    #[test]
    fn parse_accepts_bare_address() {
        let parsed = EmailAddress::parse("foo bar foo@bar.com").unwrap();
        assert_eq!(parsed, EmailAddress::new("foo", "bar", "foo@bar.com"));
    }

    #[test]
    fn parse_accepts_missing_names() {
        let parsed = EmailAddress::parse("u1 <u1@x>").unwrap();
        assert_eq!(parsed, EmailAddress::new("u1", "", "u1@x"));

        let parsed = EmailAddress::parse("<ops@example.com>").unwrap();
        assert_eq!(parsed, EmailAddress::new("", "", "ops@example.com"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(EmailAddress::parse("").is_err());
        assert!(EmailAddress::parse("   ").is_err());
        assert!(EmailAddress::parse("Jane Doe not-an-address").is_err());
        assert!(EmailAddress::parse("Jane Doe <>").is_err());
    }
}
