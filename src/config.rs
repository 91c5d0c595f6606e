//! The persisted YAML configuration document.
//!
//! Documents are dispatched on (apiVersion, kind) so future schema
//! revisions can coexist; only `Config` v1alpha1 is defined today. The
//! document is informational to the transport core: the caller decodes it
//! and feeds the result into the control surface.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The API version this crate reads and writes.
pub const API_VERSION: &str = "noisysockets.github.com/v1alpha1";

/// The only kind defined under [`API_VERSION`].
pub const KIND_CONFIG: &str = "Config";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeMeta {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
}

/// Configuration for one tunnel interface and its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub api_version: String,
    pub kind: String,
    /// Optional hostname of this peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port to listen on; absent means pick one at random.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    /// Base64-encoded 32-byte private key.
    pub private_key: String,
    /// Addresses assigned to this peer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    /// DNS servers to use for host resolution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
    /// Known peers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<PeerConfig>,
}

/// Configuration for a known peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    /// Optional hostname of the peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base64-encoded 32-byte public key.
    pub public_key: String,
    /// Where to send the peer's packets; absent means learn it from
    /// received packets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Addresses assigned to the peer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    /// Route traffic without a better match through this peer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default_gateway: bool,
}

fn decode_key(value: &str, field: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })?;
    bytes.try_into().map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })
}

/// Parse an address that may or may not carry a prefix length.
fn parse_address(value: &str) -> Result<IpNet, ConfigError> {
    if value.contains('/') {
        value.parse().map_err(|_| ConfigError::InvalidAddress {
            value: value.to_string(),
        })
    } else {
        let addr: IpAddr = value.parse().map_err(|_| ConfigError::InvalidAddress {
            value: value.to_string(),
        })?;
        Ok(IpNet::from(addr))
    }
}

impl Config {
    /// Parse a YAML document, dispatching on (apiVersion, kind).
    pub fn from_yaml(document: &str) -> Result<Self, ConfigError> {
        let meta: TypeMeta = serde_yaml::from_str(document)?;
        match (meta.api_version.as_str(), meta.kind.as_str()) {
            (API_VERSION, KIND_CONFIG) => Ok(serde_yaml::from_str(document)?),
            _ => Err(ConfigError::UnsupportedKind {
                api_version: meta.api_version,
                kind: meta.kind,
            }),
        }
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self, ConfigError> {
        let mut document = String::new();
        reader.read_to_string(&mut document)?;
        Self::from_yaml(&document)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn private_key_bytes(&self) -> Result<[u8; 32], ConfigError> {
        decode_key(&self.private_key, "privateKey")
    }

    /// The interface addresses, parsed.
    pub fn addresses(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.ips.iter().map(|ip| parse_address(ip)).collect()
    }
}

impl PeerConfig {
    pub fn public_key_bytes(&self) -> Result<[u8; 32], ConfigError> {
        decode_key(&self.public_key, "publicKey")
    }

    /// The configured endpoint, if any. Name resolution is the caller's
    /// concern; only literal socket addresses are accepted here.
    pub fn endpoint_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.endpoint
            .as_deref()
            .map(|endpoint| {
                endpoint.parse().map_err(|_| ConfigError::InvalidAddress {
                    value: endpoint.to_string(),
                })
            })
            .transpose()
    }

    pub fn addresses(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.ips.iter().map(|ip| parse_address(ip)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
apiVersion: noisysockets.github.com/v1alpha1
kind: Config
name: gateway
listenPort: 51820
privateKey: gI6EdUSYvn8ugXOt8QQD6Yc+JyiZxIhp3GInSWRfWGE=
ips:
  - 10.7.0.1
dnsServers:
  - 10.7.0.1
peers:
  - name: laptop
    publicKey: HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=
    endpoint: 203.0.113.9:51820
    ips:
      - 10.7.0.2
"#;

    #[test]
    fn parses_v1alpha1_document() {
        let config = Config::from_yaml(DOCUMENT).unwrap();
        assert_eq!(config.name.as_deref(), Some("gateway"));
        assert_eq!(config.listen_port, Some(51820));
        assert_eq!(config.peers.len(), 1);

        let key = config.private_key_bytes().unwrap();
        assert_eq!(key.len(), 32);

        let peer = &config.peers[0];
        assert_eq!(peer.name.as_deref(), Some("laptop"));
        peer.public_key_bytes().unwrap();
        assert_eq!(
            peer.endpoint_addr().unwrap(),
            Some("203.0.113.9:51820".parse().unwrap())
        );
        assert!(!peer.default_gateway);
    }

    #[test]
    fn rejects_unknown_kind() {
        let document = "apiVersion: noisysockets.github.com/v1alpha1\nkind: Mystery\n";
        assert!(matches!(
            Config::from_yaml(document),
            Err(ConfigError::UnsupportedKind { .. })
        ));
    }

    #[test]
    fn rejects_bad_keys_and_addresses() {
        let mut config = Config::from_yaml(DOCUMENT).unwrap();
        config.private_key = "not base64!!".into();
        assert!(matches!(
            config.private_key_bytes(),
            Err(ConfigError::InvalidKey { .. })
        ));

        config.peers[0].endpoint = Some("nowhere".into());
        assert!(matches!(
            config.peers[0].endpoint_addr(),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn addresses_accept_bare_and_prefixed_forms() {
        let config = Config::from_yaml(DOCUMENT).unwrap();
        let addrs = config.addresses().unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].prefix_len(), 32);

        assert!(parse_address("10.7.0.0/24").is_ok());
        assert!(parse_address("fd00::1").is_ok());
        assert!(parse_address("bogus").is_err());
    }

    #[test]
    fn roundtrips_through_yaml() {
        let config = Config::from_yaml(DOCUMENT).unwrap();
        let rendered = config.to_yaml().unwrap();
        let reparsed = Config::from_yaml(&rendered).unwrap();
        assert_eq!(reparsed.peers.len(), config.peers.len());
        assert_eq!(reparsed.private_key, config.private_key);
    }
}
