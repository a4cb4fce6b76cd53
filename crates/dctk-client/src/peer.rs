//! Peers known from the hub userlist.

use dctk_proto::nmdc::NmdcMyInfo;

/// One peer as advertised by the hub. Created on first mention in the
/// userlist, removed on quit.
#[derive(Debug, Clone, Default)]
pub struct Peer {
    /// Unique per hub session, case-sensitive.
    pub nick: String,
    pub description: String,
    pub email: String,
    pub share_size: u64,
    pub is_operator: bool,
    pub is_bot: bool,
    /// A passive peer accepts no inbound connections.
    pub is_passive: bool,
    /// ADC client id, 24 bytes.
    pub client_id: Option<Vec<u8>>,
    /// ADC session id.
    pub sid: Option<String>,
    /// Address as reported by the hub, for UDP search results.
    pub ip: Option<String>,
    pub udp_port: Option<u16>,
    /// ADC TLS keyprint, `SHA256/<b32>`.
    pub fingerprint: Option<String>,
}

impl Peer {
    /// Build or refresh from an NMDC `$MyINFO`.
    pub fn apply_my_info(&mut self, info: &NmdcMyInfo) {
        self.nick = info.nick.clone();
        self.description = info.description.clone();
        self.email = info.email.clone();
        self.share_size = info.share_size;
        self.is_passive = info.is_passive();
    }

    /// Merge ADC `INF` fields. Unknown keys are ignored.
    pub fn apply_adc_fields(&mut self, fields: &[(String, String)]) {
        for (key, value) in fields {
            match key.as_str() {
                "NI" => self.nick = value.clone(),
                "DE" => self.description = value.clone(),
                "EM" => self.email = value.clone(),
                "SS" => self.share_size = value.parse().unwrap_or(0),
                "ID" => {
                    if let Ok(raw) = dctk_hash::base32_decode(value) {
                        self.client_id = Some(raw);
                    }
                }
                "I4" => self.ip = Some(value.clone()),
                "U4" => self.udp_port = value.parse().ok(),
                "SU" => {
                    let features: Vec<&str> = value.split(',').collect();
                    self.is_passive = !features.contains(&"TCP4");
                }
                "CT" => {
                    let ct: u32 = value.parse().unwrap_or(0);
                    self.is_bot = ct & 1 != 0;
                    self.is_operator = ct & 4 != 0;
                }
                "KP" => self.fingerprint = Some(value.clone()),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_adc_fields() {
        let mut peer = Peer::default();
        peer.apply_adc_fields(&[
            ("NI".into(), "alice".into()),
            ("SS".into(), "4096".into()),
            ("SU".into(), "TCP4,UDP4".into()),
            ("CT".into(), "4".into()),
            ("KP".into(), "SHA256/ABCD".into()),
        ]);
        assert_eq!(peer.nick, "alice");
        assert_eq!(peer.share_size, 4096);
        assert!(!peer.is_passive);
        assert!(peer.is_operator);
        assert!(!peer.is_bot);
        assert_eq!(peer.fingerprint.as_deref(), Some("SHA256/ABCD"));
    }

    #[test]
    fn test_passive_without_tcp4() {
        let mut peer = Peer::default();
        peer.apply_adc_fields(&[("SU".into(), "UDP4".into())]);
        assert!(peer.is_passive);
    }
}
