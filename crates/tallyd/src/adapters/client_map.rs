//! Peer key -> client name mapping read from WireGuard server configs.
//!
//! Provisioning scripts write a `# Client = <name>` comment ahead of each
//! `[Peer]` section; the section's `PublicKey` is bound to that name.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tally_common::UNKNOWN_CLIENT;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct ClientMap {
    names: HashMap<String, String>,
}

impl ClientMap {
    /// Parse one config file's text
    pub fn parse(text: &str) -> Self {
        let mut map = Self::default();
        map.merge_text(text);
        map
    }

    /// Load several config files; later files override earlier ones and
    /// missing files are skipped
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Self {
        let mut map = Self::default();
        for path in paths {
            let path = path.as_ref();
            match fs::read_to_string(path) {
                Ok(text) => map.merge_text(&text),
                Err(e) => debug!("Client config {} not read: {}", path.display(), e),
            }
        }
        map
    }

    fn merge_text(&mut self, text: &str) {
        let mut pending_name: Option<String> = None;
        let mut in_peer = false;

        for line in text.lines() {
            let line = line.trim();

            if let Some(rest) = line.strip_prefix('#') {
                if let Some((k, v)) = rest.split_once('=') {
                    if k.trim().eq_ignore_ascii_case("client") {
                        let name = v.trim();
                        if !name.is_empty() {
                            pending_name = Some(name.to_string());
                        }
                    }
                }
            } else if line.starts_with('[') {
                in_peer = line.eq_ignore_ascii_case("[peer]");
                if !in_peer {
                    pending_name = None;
                }
            } else if in_peer {
                if let Some((k, v)) = line.split_once('=') {
                    if k.trim().eq_ignore_ascii_case("publickey") {
                        if let Some(name) = pending_name.take() {
                            // Keys are base64 and may end in '='
                            let key = v.trim();
                            self.names.insert(key.to_string(), name);
                        }
                    }
                }
            }
        }
    }

    /// Client name for a peer key, `UNKNOWN_CLIENT` when unmapped
    pub fn resolve(&self, public_key: &str) -> &str {
        self.names
            .get(public_key)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_CLIENT)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VPN_CONF: &str = r#"
[Interface]
PrivateKey = cHJpdmF0ZQ==
Address = 10.29.8.1/24

# Client = alice
[Peer]
PublicKey = YWxpY2Vfa2V5Cg==
AllowedIPs = 10.29.8.2/32

[Peer]
PublicKey = bm9uYW1lCg==
AllowedIPs = 10.29.8.3/32

# Client = bob
[Peer]
PresharedKey = c2hhcmVk
PublicKey = Ym9iX2tleQo=
"#;

    #[test]
    fn test_binds_named_peers() {
        let map = ClientMap::parse(VPN_CONF);
        assert_eq!(map.resolve("YWxpY2Vfa2V5Cg=="), "alice");
        assert_eq!(map.resolve("Ym9iX2tleQo="), "bob");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_unnamed_peer_is_unknown() {
        let map = ClientMap::parse(VPN_CONF);
        // The name of the previous peer must not leak into this one
        assert_eq!(map.resolve("bm9uYW1lCg=="), UNKNOWN_CLIENT);
        assert_eq!(map.resolve("missing"), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_later_files_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = dir.path().join("vpn.conf");
        let second = dir.path().join("antizapret.conf");
        fs::write(&first, "# Client = old\n[Peer]\nPublicKey = K=\n").unwrap();
        fs::write(&second, "# Client = new\n[Peer]\nPublicKey = K=\n").unwrap();
        let missing = dir.path().join("absent.conf");

        let map = ClientMap::load(&[first, missing, second]);
        assert_eq!(map.resolve("K="), "new");
    }
}
