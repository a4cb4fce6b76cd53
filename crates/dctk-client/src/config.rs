//! Client configuration and the hub URL grammar.

use crate::{ClientError, ClientResult};

/// How peer connections negotiate TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMode {
    /// Use TLS when both sides advertise it.
    #[default]
    PreferEncryption,
    /// Never use TLS between peers.
    DisableEncryption,
    /// Refuse plain peer connections.
    ForceEncryption,
}

/// Client configuration. Validated synchronously at construction.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `[nmdc[s]|adc[s]]://host[:port]`; a missing scheme means NMDC.
    pub hub_url: String,
    /// Nick, unique per hub session, case-sensitive.
    pub nick: String,
    /// Hub password, empty when none is required.
    pub password: String,
    pub description: String,
    pub email: String,
    /// Advertise the hub-socket local address instead of a public one.
    pub private_ip: bool,
    /// Peer listen port; zero in passive mode.
    pub tcp_port: u16,
    /// UDP port for search results.
    pub udp_port: u16,
    /// TLS peer listen port; zero disables the encrypted listener.
    pub tcp_tls_port: u16,
    /// Accept no inbound peer connections.
    pub is_passive: bool,
    pub peer_encryption_mode: EncryptionMode,
    /// Never offer or accept zlib on transfers.
    pub peer_disable_compression: bool,
    pub download_slots: u32,
    pub upload_slots: u32,
    /// Keep-alive period; the receive timeout is five times this.
    pub hub_keepalive_secs: u64,
    /// Bounded hub redial attempts after a drop, with a fixed delay.
    pub hub_reconnect_tries: u32,
    /// Do not dial the hub until `hub_connect` is called.
    pub hub_manual_connect: bool,
    /// Advertised client name.
    pub client_string: String,
    /// `Pk` value sent with `$Lock`.
    pub pk_value: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_url: "nmdc://127.0.0.1:411".to_string(),
            nick: String::new(),
            password: String::new(),
            description: String::new(),
            email: String::new(),
            private_ip: false,
            tcp_port: 3009,
            udp_port: 3009,
            tcp_tls_port: 0,
            is_passive: false,
            peer_encryption_mode: EncryptionMode::default(),
            peer_disable_compression: false,
            download_slots: 6,
            upload_slots: 10,
            hub_keepalive_secs: 120,
            hub_reconnect_tries: 3,
            hub_manual_connect: false,
            client_string: "dctk".to_string(),
            pk_value: "dctk-0.1".to_string(),
        }
    }
}

impl ClientConfig {
    /// Check everything that can be checked without touching the network.
    pub fn validate(&self) -> ClientResult<HubUrl> {
        let url = HubUrl::parse(&self.hub_url)?;
        if self.nick.is_empty() {
            return Err(ClientError::Config("nick must not be empty".into()));
        }
        if self.nick.contains([' ', '|', '$', '<', '>']) {
            return Err(ClientError::Config(format!(
                "nick contains forbidden characters: {}",
                self.nick
            )));
        }
        if !self.is_passive && (self.tcp_port == 0 || self.udp_port == 0) {
            return Err(ClientError::Config(
                "active mode requires tcp_port and udp_port".into(),
            ));
        }
        if self.download_slots == 0 || self.upload_slots == 0 {
            return Err(ClientError::Config("slot counts must be positive".into()));
        }
        if self.hub_keepalive_secs == 0 {
            return Err(ClientError::Config("keep-alive period must be positive".into()));
        }
        Ok(url)
    }
}

/// A parsed hub address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubUrl {
    /// ADC dialect; false means NMDC.
    pub adc: bool,
    /// TLS to the hub.
    pub secure: bool,
    pub host: String,
    pub port: u16,
}

impl HubUrl {
    /// Parse `[nmdc[s]|adc[s]]://host[:port]`. Default NMDC port 411,
    /// ADC 412; TLS variants one above.
    pub fn parse(raw: &str) -> ClientResult<HubUrl> {
        let bad = || ClientError::Config(format!("invalid hub url: {}", raw));

        let (scheme, rest) = match raw.split_once("://") {
            Some((s, r)) => (s, r),
            None => ("nmdc", raw),
        };
        let (adc, secure) = match scheme {
            "nmdc" => (false, false),
            "nmdcs" => (false, true),
            "adc" => (true, false),
            "adcs" => (true, true),
            _ => return Err(bad()),
        };

        if rest.is_empty() || rest.contains('/') {
            return Err(bad());
        }
        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().map_err(|_| bad())?),
            None => {
                let default = match (adc, secure) {
                    (false, false) => 411,
                    (false, true) => 412,
                    (true, false) => 412,
                    (true, true) => 413,
                };
                (rest.to_string(), default)
            }
        };
        if host.is_empty() {
            return Err(bad());
        }
        Ok(HubUrl {
            adc,
            secure,
            host,
            port,
        })
    }

    /// `host:port` form, used in `$Lock` refs and search results.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schemes() {
        let url = HubUrl::parse("nmdc://hub.example.com").unwrap();
        assert_eq!((url.adc, url.secure, url.port), (false, false, 411));

        let url = HubUrl::parse("adcs://hub.example.com").unwrap();
        assert_eq!((url.adc, url.secure, url.port), (true, true, 413));

        let url = HubUrl::parse("adc://10.0.0.1:1511").unwrap();
        assert_eq!(url.host, "10.0.0.1");
        assert_eq!(url.port, 1511);
    }

    #[test]
    fn test_missing_scheme_defaults_to_nmdc() {
        let url = HubUrl::parse("hub.example.com:4111").unwrap();
        assert!(!url.adc);
        assert_eq!(url.port, 4111);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(HubUrl::parse("http://hub.example.com").is_err());
        assert!(HubUrl::parse("nmdc://").is_err());
        assert!(HubUrl::parse("nmdc://host:notaport").is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut conf = ClientConfig {
            nick: "alice".into(),
            ..Default::default()
        };
        assert!(conf.validate().is_ok());

        conf.nick = "bad nick".into();
        assert!(conf.validate().is_err());

        conf.nick = "alice".into();
        conf.is_passive = false;
        conf.tcp_port = 0;
        assert!(conf.validate().is_err());

        conf.is_passive = true;
        assert!(conf.validate().is_ok());
    }
}
