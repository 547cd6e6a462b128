use std::net::IpAddr;
use tracing::debug;

type IpDetector = fn() -> Option<IpAddr>;

fn detect_lan_ip() -> Option<IpAddr> {
    match local_ip_address::local_ip() {
        Ok(ip) => Some(ip),
        Err(e) => {
            debug!("[hub] LAN IP detection failed: {e}");
            None
        }
    }
}

/// Base URL publique du hub telle que les sondes doivent la voir.
/// Réévaluée à chaque appel : l'IP LAN peut changer (DHCP, changement de Wi-Fi).
#[derive(Clone)]
pub struct PublicBase {
    override_base: Option<String>,
    port: u16,
    detect: IpDetector,
}

impl PublicBase {
    pub fn new(override_base: Option<String>, port: u16) -> Self {
        Self { override_base, port, detect: detect_lan_ip }
    }

    #[cfg(test)]
    pub fn with_detector(override_base: Option<String>, port: u16, detect: IpDetector) -> Self {
        Self { override_base, port, detect }
    }

    pub fn resolve(&self) -> Option<String> {
        if let Some(base) = self.override_base.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            return Some(base.trim_end_matches('/').to_string());
        }
        let ip = (self.detect)()?;
        let host = match ip {
            IpAddr::V6(v6) => format!("[{v6}]"),
            IpAddr::V4(v4) => v4.to_string(),
        };
        Some(format!("http://{}:{}", host, self.port))
    }
}
