//! Pairing URI parsing (`wc:<topic>@<version>?bridge=<url>&key=<hex>`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::TransportError;

const SCHEME: &str = "wc";
const DEFAULT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingUri {
    pub topic: String,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl PairingUri {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| TransportError::InvalidUri(format!("{raw}: {e}")))?;
        if url.scheme() != SCHEME {
            return Err(TransportError::InvalidUri(format!(
                "expected `{SCHEME}:` scheme, got `{}:`",
                url.scheme()
            )));
        }

        let (topic, version) = match url.path().split_once('@') {
            Some((topic, version)) => {
                let version = version
                    .parse()
                    .map_err(|_| TransportError::InvalidUri(format!("bad version `{version}`")))?;
                (topic, version)
            }
            None => (url.path(), DEFAULT_VERSION),
        };
        if topic.is_empty() {
            return Err(TransportError::InvalidUri("missing topic".into()));
        }

        let mut bridge = None;
        let mut key = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "bridge" => bridge = Some(value.into_owned()),
                "key" => key = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            topic: topic.to_owned(),
            version,
            bridge,
            key,
        })
    }
}

impl FromStr for PairingUri {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}:{}@{}", self.topic, self.version)?;
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(bridge) = &self.bridge {
            query.append_pair("bridge", bridge);
        }
        if let Some(key) = &self.key {
            query.append_pair("key", key);
        }
        let query = query.finish();
        if !query.is_empty() {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_full_uri() {
        let uri = PairingUri::parse(
            "wc:8a5e5bdc-a0e4-4702-ba63-8f1a5655744f@1?bridge=https%3A%2F%2Fbridge.example.org&key=41791102999c",
        )
        .unwrap();
        assert_eq!(uri.topic, "8a5e5bdc-a0e4-4702-ba63-8f1a5655744f");
        assert_eq!(uri.version, 1);
        assert_eq!(uri.bridge.as_deref(), Some("https://bridge.example.org"));
        assert_eq!(uri.key.as_deref(), Some("41791102999c"));
    }

    #[test]
    fn bare_topic_defaults_version() {
        let uri: PairingUri = "wc:abc".parse().unwrap();
        assert_eq!(uri.topic, "abc");
        assert_eq!(uri.version, 1);
        assert!(uri.bridge.is_none());
        assert!(uri.key.is_none());
    }

    #[test]
    fn rejects_other_schemes() {
        assert_matches!(
            PairingUri::parse("https://example.org/abc"),
            Err(TransportError::InvalidUri(_))
        );
    }

    #[test]
    fn rejects_missing_topic_and_bad_version() {
        assert_matches!(PairingUri::parse("wc:@1"), Err(TransportError::InvalidUri(_)));
        assert_matches!(PairingUri::parse("wc:abc@one"), Err(TransportError::InvalidUri(_)));
        assert_matches!(PairingUri::parse("not a uri"), Err(TransportError::InvalidUri(_)));
    }

    #[test]
    fn display_reencodes_query() {
        let uri = PairingUri {
            topic: "t1".into(),
            version: 1,
            bridge: Some("http://127.0.0.1:9091".into()),
            key: None,
        };
        let s = uri.to_string();
        assert_eq!(s, "wc:t1@1?bridge=http%3A%2F%2F127.0.0.1%3A9091");
        assert_eq!(PairingUri::parse(&s).unwrap(), uri);
    }
}
