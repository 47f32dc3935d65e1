use std::net::{IpAddr, Ipv4Addr};

use serde::Serialize;
use sysinfo::Networks;

use crate::publisher::{EndpointSource, PublishedEndpoint};

pub const LOCALHOST: &str = "localhost";

/// First non-loopback, non-link-local IPv4 address of this host, or
/// `"localhost"` when there is none.
pub fn local_address() -> String {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<(&String, Vec<IpAddr>)> = networks
        .list()
        .iter()
        .map(|(name, data)| {
            let addrs = data.ip_networks().iter().map(|net| net.addr).collect();
            (name, addrs)
        })
        .collect();
    // interface enumeration order is unspecified; keep the pick stable
    interfaces.sort_by(|a, b| a.0.cmp(b.0));
    select_address(interfaces.into_iter().flat_map(|(_, addrs)| addrs))
}

pub fn select_address(candidates: impl IntoIterator<Item = IpAddr>) -> String {
    candidates
        .into_iter()
        .find_map(|addr| match addr {
            IpAddr::V4(v4) if is_external_v4(v4) => Some(v4.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| LOCALHOST.to_string())
}

fn is_external_v4(addr: Ipv4Addr) -> bool {
    !addr.is_loopback() && !addr.is_link_local() && !addr.is_unspecified()
}

#[derive(Clone, Debug, Serialize)]
pub struct PortMap {
    pub api: u16,
    pub preview: Option<u16>,
}

/// Snapshot handed to the UI collaborator on request.
#[derive(Clone, Debug, Serialize)]
pub struct NetworkInfo {
    pub tunnel_url: Option<String>,
    pub network_ip: String,
    pub local_api_url: String,
    pub network_api_url: String,
    pub ports: PortMap,
    pub has_tunnel: bool,
}

impl NetworkInfo {
    pub fn from_endpoint(endpoint: &PublishedEndpoint, network_ip: String, ports: PortMap) -> Self {
        let public = endpoint.is_public && endpoint.source == EndpointSource::Tunnel;
        Self {
            tunnel_url: public.then(|| endpoint.url.clone()),
            local_api_url: format!("http://{LOCALHOST}:{}", ports.api),
            network_api_url: format!("http://{network_ip}:{}", ports.api),
            network_ip,
            ports,
            has_tunnel: public,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn skips_loopback_link_local_and_v6() {
        let picked = select_address([
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(169, 254, 10, 2)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4)),
        ]);
        assert_eq!(picked, "192.168.1.10");
    }

    #[test]
    fn falls_back_to_localhost() {
        assert_eq!(select_address([IpAddr::V4(Ipv4Addr::LOCALHOST)]), LOCALHOST);
        assert_eq!(select_address(Vec::new()), LOCALHOST);
    }

    #[test]
    fn host_address_is_never_loopback() {
        let addr = local_address();
        if addr != LOCALHOST {
            let parsed: Ipv4Addr = addr.parse().unwrap();
            assert!(!parsed.is_loopback());
        }
    }

    #[test]
    fn network_info_reports_tunnel_only_when_public() {
        let ports = PortMap {
            api: 3001,
            preview: Some(4173),
        };
        let local = PublishedEndpoint::local("http://localhost:3001");
        let info = NetworkInfo::from_endpoint(&local, "192.168.1.10".to_string(), ports.clone());
        assert!(!info.has_tunnel);
        assert_eq!(info.tunnel_url, None);
        assert_eq!(info.network_api_url, "http://192.168.1.10:3001");

        let public = PublishedEndpoint::tunnel("https://abcd-1234.trycloudflare.com");
        let info = NetworkInfo::from_endpoint(&public, "192.168.1.10".to_string(), ports);
        assert!(info.has_tunnel);
        assert_eq!(info.local_api_url, "http://localhost:3001");
    }
}
