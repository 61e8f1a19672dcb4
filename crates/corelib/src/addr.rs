//! Address codec.
//!
//! Backends report connection endpoints as text of the form
//! `<public-key>:<port>`, or `<public-key>:~` when the endpoint has no fixed
//! port. This module turns that text into an [`Addr`] and back.
//!
//! Parsing happens once per connection or listener, so the implementation
//! favours clarity over speed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddrError;
use crate::keys::PublicKey;

/// Port value meaning "no fixed port".
pub const ANY_PORT: u16 = 0;

/// Text used in place of a port number when the port is [`ANY_PORT`].
pub const ANY_PORT_TEXT: &str = "~";

/// A public-key addressed endpoint.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Addr {
    pub pk: PublicKey,
    pub port: u16,
}

impl Addr {
    pub fn new(pk: PublicKey, port: u16) -> Self {
        Self { pk, port }
    }

    /// Parses the textual address form.
    ///
    /// # Errors
    ///
    /// - [`AddrError::Format`] unless the text has exactly two `:`-separated fields
    /// - [`AddrError::InvalidKey`] if the first field is not a public key
    /// - [`AddrError::Port`] if the second field is neither `~` nor a `u16`
    pub fn parse(text: &str) -> Result<Self, AddrError> {
        let fields: Vec<&str> = text.split(':').collect();
        let [pk_text, port_text] = fields.as_slice() else {
            return Err(AddrError::Format(text.to_string()));
        };

        let pk = PublicKey::from_hex(pk_text).map_err(|source| AddrError::InvalidKey {
            text: pk_text.to_string(),
            source,
        })?;

        let port = if *port_text == ANY_PORT_TEXT {
            ANY_PORT
        } else {
            port_text
                .parse::<u16>()
                .map_err(|_| AddrError::Port(port_text.to_string()))?
        };

        Ok(Self { pk, port })
    }

    /// True when the address has no fixed port.
    pub fn is_any_port(&self) -> bool {
        self.port == ANY_PORT
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any_port() {
            write!(f, "{}:{}", self.pk, ANY_PORT_TEXT)
        } else {
            write!(f, "{}:{}", self.pk, self.port)
        }
    }
}

impl FromStr for Addr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Addr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn test_parse_numeric_port() {
        let pk = KeyPair::generate().public_key();
        let addr = Addr::parse(&format!("{}:1234", pk)).unwrap();
        assert_eq!(addr, Addr::new(pk, 1234));
    }

    #[test]
    fn test_parse_any_port() {
        let pk = KeyPair::generate().public_key();
        let addr = Addr::parse(&format!("{}:~", pk)).unwrap();
        assert_eq!(addr.port, ANY_PORT);
        assert!(addr.is_any_port());
        assert_eq!(addr.to_string(), format!("{}:~", pk));
    }

    #[test]
    fn test_zero_port_normalizes_to_tilde() {
        let pk = KeyPair::generate().public_key();
        let addr = Addr::parse(&format!("{}:0", pk)).unwrap();
        assert_eq!(addr.to_string(), format!("{}:~", pk));
    }

    #[test]
    fn test_port_out_of_range() {
        let pk = KeyPair::generate().public_key();
        assert_eq!(
            Addr::parse(&format!("{}:65536", pk)),
            Err(AddrError::Port("65536".into()))
        );
    }

    #[test]
    fn test_invalid_key_keeps_text() {
        match Addr::parse("nothex:10") {
            Err(AddrError::InvalidKey { text, .. }) => assert_eq!(text, "nothex"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_field_count() {
        assert!(matches!(Addr::parse(""), Err(AddrError::Format(_))));
        assert!(matches!(Addr::parse("abc"), Err(AddrError::Format(_))));
        assert!(matches!(Addr::parse("a:b:c"), Err(AddrError::Format(_))));
    }
}
