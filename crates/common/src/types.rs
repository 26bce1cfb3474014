use crate::config::protocol::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};
use crate::error::{LurkerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Transport protocol of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// Port used when an address string omits one
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Tcp => DEFAULT_TCP_PORT,
            Self::Udp => DEFAULT_UDP_PORT,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = LurkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Self::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Self::Udp),
            other => Err(LurkerError::invalid_address(format!(
                "unknown protocol: {}",
                other
            ))),
        }
    }
}

/// A network endpoint: protocol, IP and port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    pub protocol: Protocol,
    pub ip: IpAddr,
    pub port: u16,
}

impl Addr {
    pub fn new(protocol: Protocol, ip: IpAddr, port: u16) -> Self {
        Self { protocol, ip, port }
    }

    pub fn tcp(ip: IpAddr, port: u16) -> Self {
        Self::new(Protocol::Tcp, ip, port)
    }

    pub fn udp(ip: IpAddr, port: u16) -> Self {
        Self::new(Protocol::Udp, ip, port)
    }

    pub fn from_socket(protocol: Protocol, addr: SocketAddr) -> Self {
        Self::new(protocol, addr.ip(), addr.port())
    }

    /// Network name, "tcp" or "udp"
    pub fn network(&self) -> &'static str {
        self.protocol.as_str()
    }

    /// Dial target for either transport
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Same host and port, reached over another transport
    pub fn with_protocol(&self, protocol: Protocol) -> Self {
        Self { protocol, ..*self }
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self { port, ..*self }
    }

    /// Parse `[proto://]host[:port][/qualifier]`.
    ///
    /// The host must be an IP literal (IPv6 hosts with a port are written in
    /// brackets). A missing protocol means TCP and a missing port means the
    /// protocol's default port. Anything after the first `/` is returned as
    /// the qualifier.
    pub fn parse(input: &str) -> Result<(Addr, Option<String>)> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(LurkerError::invalid_address("empty address"));
        }

        let (protocol, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (scheme.parse::<Protocol>()?, rest),
            None => (Protocol::Tcp, trimmed),
        };

        let (host_port, qualifier) = match rest.split_once('/') {
            Some((host_port, qualifier)) => {
                let qualifier = Some(qualifier.to_string()).filter(|q| !q.is_empty());
                (host_port, qualifier)
            }
            None => (rest, None),
        };

        let addr = Self::parse_host_port(protocol, host_port)?;
        Ok((addr, qualifier))
    }

    fn parse_host_port(protocol: Protocol, host_port: &str) -> Result<Addr> {
        if let Ok(addr) = host_port.parse::<SocketAddr>() {
            return Ok(Self::from_socket(protocol, addr));
        }

        if let Ok(ip) = host_port.parse::<IpAddr>() {
            return Ok(Self::new(protocol, ip, protocol.default_port()));
        }

        if let Some(inner) = host_port
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
        {
            let ip = inner
                .parse::<IpAddr>()
                .map_err(|e| LurkerError::invalid_address(format!("{}: {}", host_port, e)))?;
            return Ok(Self::new(protocol, ip, protocol.default_port()));
        }

        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| LurkerError::invalid_address(format!("missing host: {}", host_port)))?;

        let port = port
            .parse::<u16>()
            .map_err(|_| LurkerError::invalid_address(format!("invalid port: {}", port)))?;

        let ip = host.parse::<IpAddr>().map_err(|_| {
            LurkerError::invalid_address(format!("host is not an IP address: {}", host))
        })?;

        Ok(Self::new(protocol, ip, port))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for Addr {
    type Err = LurkerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).map(|(addr, _)| addr)
    }
}

impl From<Addr> for SocketAddr {
    fn from(addr: Addr) -> Self {
        addr.socket_addr()
    }
}

/// Service descriptor a peer advertises: who it is and which ports it
/// listens on for reverse connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Caller supplied peer identity
    pub id: String,

    /// Internal address as seen by the peer itself
    pub isp: IpAddr,

    pub port_udp: u16,

    pub port_hole: u16,

    pub port_tcp: u16,

    /// Opaque application payload
    #[serde(default, with = "base64_bytes")]
    pub ext_data: Vec<u8>,
}

impl Service {
    pub fn new(id: impl Into<String>, isp: IpAddr) -> Self {
        Self {
            id: id.into(),
            isp,
            port_udp: DEFAULT_UDP_PORT,
            port_hole: crate::config::protocol::DEFAULT_HOLE_PORT,
            port_tcp: DEFAULT_TCP_PORT,
            ext_data: Vec::new(),
        }
    }

    pub fn with_ports(mut self, port_tcp: u16, port_udp: u16, port_hole: u16) -> Self {
        self.port_tcp = port_tcp;
        self.port_udp = port_udp;
        self.port_hole = port_hole;
        self
    }

    pub fn with_ext_data(mut self, ext_data: Vec<u8>) -> Self {
        self.ext_data = ext_data;
        self
    }

    /// Address of this service's TCP port on the given host
    pub fn tcp_addr(&self, ip: IpAddr) -> Addr {
        Addr::tcp(ip, self.port_tcp)
    }

    /// Address of this service's hole punching port on the given host
    pub fn hole_addr(&self, ip: IpAddr) -> Addr {
        Addr::udp(ip, self.port_hole)
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| LurkerError::malformed_service(e.to_string()))
    }

    /// Decode from the JSON wire form
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| LurkerError::malformed_service(e.to_string()))
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new(String::new(), IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

/// Byte payloads travel as base64 strings; `null` decodes to empty
pub mod base64_bytes {
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => BASE64
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn sample_service() -> Service {
        Service::new("abc", IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
            .with_ports(16004, 16005, 16006)
            .with_ext_data(vec![0, 1, 2, 255])
    }

    #[test]
    fn test_addr_display() {
        let v4 = Addr::tcp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 16004);
        assert_eq!(v4.to_string(), "10.0.0.1:16004");
        assert_eq!(v4.network(), "tcp");

        let v6 = Addr::udp(IpAddr::V6(Ipv6Addr::LOCALHOST), 53);
        assert_eq!(v6.to_string(), "[::1]:53");
        assert_eq!(v6.network(), "udp");
    }

    #[test]
    fn test_parse_host_port() {
        let (addr, qualifier) = Addr::parse("1.2.3.4:5678").unwrap();
        assert_eq!(addr, Addr::tcp(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 5678));
        assert!(qualifier.is_none());
    }

    #[test]
    fn test_parse_scheme_and_qualifier() {
        let (addr, qualifier) = Addr::parse("udp://1.2.3.4:99/nat-full-cone").unwrap();
        assert_eq!(addr.protocol, Protocol::Udp);
        assert_eq!(addr.port, 99);
        assert_eq!(qualifier.as_deref(), Some("nat-full-cone"));
    }

    #[test]
    fn test_parse_default_port() {
        let (addr, _) = Addr::parse("1.2.3.4").unwrap();
        assert_eq!(addr.port, DEFAULT_TCP_PORT);

        let (addr, _) = Addr::parse("udp://[::1]").unwrap();
        assert_eq!(addr.ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(addr.port, DEFAULT_UDP_PORT);
    }

    #[test]
    fn test_parse_ipv6_with_port() {
        let (addr, _) = Addr::parse("[::1]:16004").unwrap();
        assert_eq!(addr.ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(addr.port, 16004);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Addr::parse("").is_err());
        assert!(Addr::parse("example.com:80").is_err());
        assert!(Addr::parse("1.2.3.4:70000").is_err());
        assert!(Addr::parse("sctp://1.2.3.4:1").is_err());
    }

    #[test]
    fn test_service_roundtrip() {
        let service = sample_service();
        let encoded = service.encode().unwrap();
        assert_eq!(Service::decode(&encoded).unwrap(), service);
    }

    #[test]
    fn test_service_roundtrip_edge_values() {
        let service = Service::new("", IpAddr::V6(Ipv6Addr::LOCALHOST)).with_ports(0, 65535, 1);
        let decoded = Service::decode(&service.encode().unwrap()).unwrap();
        assert_eq!(decoded, service);
        assert!(decoded.ext_data.is_empty());
    }

    #[test]
    fn test_service_ext_data_is_base64() {
        let encoded = sample_service().encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["ext_data"], "AAEC/w==");
    }

    #[test]
    fn test_service_null_ext_data() {
        let json = br#"{"id":"x","isp":"127.0.0.1","port_udp":1,"port_hole":2,"port_tcp":3,"ext_data":null}"#;
        let service = Service::decode(json).unwrap();
        assert!(service.ext_data.is_empty());
    }

    #[test]
    fn test_service_decode_malformed() {
        let encoded = sample_service().encode().unwrap();
        let truncated = &encoded[..encoded.len() / 2];
        assert!(matches!(
            Service::decode(truncated),
            Err(LurkerError::MalformedService(_))
        ));

        let wrong_type = br#"{"id":7,"isp":"127.0.0.1","port_udp":1,"port_hole":2,"port_tcp":3}"#;
        assert!(matches!(
            Service::decode(wrong_type),
            Err(LurkerError::MalformedService(_))
        ));

        let out_of_range =
            br#"{"id":"x","isp":"127.0.0.1","port_udp":70000,"port_hole":2,"port_tcp":3}"#;
        assert!(Service::decode(out_of_range).is_err());
    }
}
