//! Network addresses: legacy and BIP 155 encodings, grouping and
//! reachability classification.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use galvan_core::{DecodeError, Decoder, Encoder};

/// BIP 155 network identifiers.
const NETWORK_IPV4: u8 = 1;
const NETWORK_IPV6: u8 = 2;
const NETWORK_TORV3: u8 = 4;

/// An address in one of the supported networks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddrV2 {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    /// Tor v3 onion service public key (32 bytes).
    TorV3([u8; 32]),
    /// A network we do not know; kept opaque so gossip can pass it on.
    Unknown { network: u8, bytes: Vec<u8> },
}

/// An address plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetAddress {
    pub addr: AddrV2,
    pub port: u16,
}

/// An address entry as gossiped: last-seen time, services, address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedAddress {
    /// Last-seen time (Unix seconds, u32 on the wire).
    pub time: u32,
    pub services: u64,
    pub address: NetAddress,
}

impl NetAddress {
    pub fn ipv4(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr: AddrV2::Ipv4(addr),
            port,
        }
    }

    pub fn ipv6(addr: Ipv6Addr, port: u16) -> Self {
        Self {
            addr: AddrV2::Ipv6(addr),
            port,
        }
    }

    pub fn from_socket(addr: std::net::SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Self::ipv4(ip, addr.port()),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => Self::ipv4(v4, addr.port()),
                None => Self::ipv6(ip, addr.port()),
            },
        }
    }

    /// Whether the address may appear in gossip: routable, known
    /// network, nonzero port.
    pub fn is_routable(&self) -> bool {
        if self.port == 0 {
            return false;
        }
        match &self.addr {
            AddrV2::Ipv4(ip) => {
                !(ip.is_loopback()
                    || ip.is_private()
                    || ip.is_link_local()
                    || ip.is_broadcast()
                    || ip.is_unspecified()
                    || ip.is_documentation())
            }
            AddrV2::Ipv6(ip) => {
                let segments = ip.segments();
                let link_local = (segments[0] & 0xffc0) == 0xfe80;
                let unique_local = (segments[0] & 0xfe00) == 0xfc00;
                !(ip.is_loopback() || ip.is_unspecified() || link_local || unique_local)
            }
            AddrV2::TorV3(_) => true,
            AddrV2::Unknown { .. } => false,
        }
    }

    /// Whether the address fits the legacy 16-byte IP encoding.
    pub fn is_addr_v1_compatible(&self) -> bool {
        matches!(self.addr, AddrV2::Ipv4(_) | AddrV2::Ipv6(_))
    }

    /// BIP 155 network identifier of this address.
    pub fn network_id(&self) -> u8 {
        match &self.addr {
            AddrV2::Ipv4(_) => NETWORK_IPV4,
            AddrV2::Ipv6(_) => NETWORK_IPV6,
            AddrV2::TorV3(_) => NETWORK_TORV3,
            AddrV2::Unknown { network, .. } => *network,
        }
    }

    /// Group key for addrman bucketing: addresses in one group come
    /// from one operator, so they share buckets. IPv4 groups by /16,
    /// IPv6 by /32, other networks by identity.
    pub fn group_key(&self) -> Vec<u8> {
        match &self.addr {
            AddrV2::Ipv4(ip) => {
                let octets = ip.octets();
                vec![NETWORK_IPV4, octets[0], octets[1]]
            }
            AddrV2::Ipv6(ip) => {
                let octets = ip.octets();
                vec![NETWORK_IPV6, octets[0], octets[1], octets[2], octets[3]]
            }
            AddrV2::TorV3(key) => {
                let mut group = vec![NETWORK_TORV3];
                group.extend_from_slice(&key[..4]);
                group
            }
            AddrV2::Unknown { network, bytes } => {
                let mut group = vec![*network];
                group.extend_from_slice(&bytes[..bytes.len().min(4)]);
                group
            }
        }
    }

    /// Stable serialization of the full address, for hashing.
    pub fn identity_key(&self) -> Vec<u8> {
        let mut key = match &self.addr {
            AddrV2::Ipv4(ip) => {
                let mut k = vec![NETWORK_IPV4];
                k.extend_from_slice(&ip.octets());
                k
            }
            AddrV2::Ipv6(ip) => {
                let mut k = vec![NETWORK_IPV6];
                k.extend_from_slice(&ip.octets());
                k
            }
            AddrV2::TorV3(pubkey) => {
                let mut k = vec![NETWORK_TORV3];
                k.extend_from_slice(pubkey);
                k
            }
            AddrV2::Unknown { network, bytes } => {
                let mut k = vec![*network];
                k.extend_from_slice(bytes);
                k
            }
        };
        key.extend_from_slice(&self.port.to_be_bytes());
        key
    }

    /// The 16-byte legacy IP field (IPv4 mapped into IPv6).
    fn legacy_ip_bytes(&self) -> [u8; 16] {
        match &self.addr {
            AddrV2::Ipv4(ip) => ip.to_ipv6_mapped().octets(),
            AddrV2::Ipv6(ip) => ip.octets(),
            // Not v1-compatible; encodes as all zero.
            _ => [0u8; 16],
        }
    }

    /// Write the legacy services + ip + port triple (26 bytes).
    pub fn encode_legacy(&self, services: u64, enc: &mut Encoder) {
        enc.write_u64_le(services);
        enc.write_bytes(&self.legacy_ip_bytes());
        enc.write_u16_be(self.port);
    }

    /// Read the legacy triple, returning (services, address).
    pub fn decode_legacy(dec: &mut Decoder<'_>) -> Result<(u64, Self), DecodeError> {
        let services = dec.read_u64_le()?;
        let ip_bytes: [u8; 16] = dec.read_fixed()?;
        let port = dec.read_u16_be()?;
        let ip6 = Ipv6Addr::from(ip_bytes);
        let address = match ip6.to_ipv4_mapped() {
            Some(v4) => Self::ipv4(v4, port),
            None => Self::ipv6(ip6, port),
        };
        Ok((services, address))
    }

    /// Write the BIP 155 network id + length-prefixed address + port.
    pub fn encode_v2(&self, enc: &mut Encoder) {
        match &self.addr {
            AddrV2::Ipv4(ip) => {
                enc.write_u8(NETWORK_IPV4);
                enc.write_compact_size(4);
                enc.write_bytes(&ip.octets());
            }
            AddrV2::Ipv6(ip) => {
                enc.write_u8(NETWORK_IPV6);
                enc.write_compact_size(16);
                enc.write_bytes(&ip.octets());
            }
            AddrV2::TorV3(pubkey) => {
                enc.write_u8(NETWORK_TORV3);
                enc.write_compact_size(32);
                enc.write_bytes(pubkey);
            }
            AddrV2::Unknown { network, bytes } => {
                enc.write_u8(*network);
                enc.write_compact_size(bytes.len() as u64);
                enc.write_bytes(bytes);
            }
        }
        enc.write_u16_be(self.port);
    }

    /// Read the BIP 155 encoding. Known networks must carry exactly
    /// their defined length; unknown networks are kept opaque up to
    /// the BIP's 512-byte cap.
    pub fn decode_v2(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        const MAX_ADDRV2_SIZE: u64 = 512;

        let network = dec.read_u8()?;
        let len = dec.read_compact_size()?;
        if len > MAX_ADDRV2_SIZE {
            return Err(DecodeError::OversizedLength {
                size: len,
                max: MAX_ADDRV2_SIZE,
            });
        }
        let bytes = dec.read_bytes(len as usize)?;
        let addr = match (network, len) {
            (NETWORK_IPV4, 4) => {
                AddrV2::Ipv4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
            }
            (NETWORK_IPV6, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                AddrV2::Ipv6(Ipv6Addr::from(octets))
            }
            (NETWORK_TORV3, 32) => {
                let mut pubkey = [0u8; 32];
                pubkey.copy_from_slice(bytes);
                AddrV2::TorV3(pubkey)
            }
            (NETWORK_IPV4, _) | (NETWORK_IPV6, _) | (NETWORK_TORV3, _) => {
                return Err(DecodeError::InvalidValue("addrv2 length"))
            }
            _ => AddrV2::Unknown {
                network,
                bytes: bytes.to_vec(),
            },
        };
        let port = dec.read_u16_be()?;
        Ok(Self { addr, port })
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            AddrV2::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            AddrV2::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            AddrV2::TorV3(_) => write!(f, "<torv3>:{}", self.port),
            AddrV2::Unknown { network, .. } => write!(f, "<net{}>:{}", network, self.port),
        }
    }
}

impl TimedAddress {
    /// Legacy 30-byte entry: u32 time + services + ip + port.
    pub fn encode_legacy(&self, enc: &mut Encoder) {
        enc.write_u32_le(self.time);
        self.address.encode_legacy(self.services, enc);
    }

    pub fn decode_legacy(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let time = dec.read_u32_le()?;
        let (services, address) = NetAddress::decode_legacy(dec)?;
        Ok(Self {
            time,
            services,
            address,
        })
    }

    /// BIP 155 entry: u32 time + compact-size services + v2 address.
    pub fn encode_v2(&self, enc: &mut Encoder) {
        enc.write_u32_le(self.time);
        enc.write_compact_size(self.services);
        self.address.encode_v2(enc);
    }

    pub fn decode_v2(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let time = dec.read_u32_le()?;
        let services = dec.read_compact_size()?;
        let address = NetAddress::decode_v2(dec)?;
        Ok(Self {
            time,
            services,
            address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str, port: u16) -> NetAddress {
        NetAddress::ipv4(s.parse().unwrap(), port)
    }

    #[test]
    fn test_legacy_roundtrip_ipv4() {
        let addr = v4("8.8.8.8", 8333);
        let mut enc = Encoder::new();
        addr.encode_legacy(9, &mut enc);
        let bytes = enc.into_inner();
        assert_eq!(bytes.len(), 26);

        let mut dec = Decoder::new(&bytes);
        let (services, decoded) = NetAddress::decode_legacy(&mut dec).unwrap();
        assert_eq!(services, 9);
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_legacy_roundtrip_ipv6() {
        let addr = NetAddress::ipv6("2001:db8::1".parse().unwrap(), 18333);
        let mut enc = Encoder::new();
        addr.encode_legacy(1, &mut enc);
        let bytes = enc.into_inner();
        let mut dec = Decoder::new(&bytes);
        let (_, decoded) = NetAddress::decode_legacy(&mut dec).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_v2_roundtrip() {
        let cases = [
            v4("1.2.3.4", 8333),
            NetAddress::ipv6("2001:db8::7".parse().unwrap(), 1),
            NetAddress {
                addr: AddrV2::TorV3([0xabu8; 32]),
                port: 9050,
            },
            NetAddress {
                addr: AddrV2::Unknown {
                    network: 9,
                    bytes: vec![1, 2, 3],
                },
                port: 7,
            },
        ];
        for addr in cases {
            let mut enc = Encoder::new();
            addr.encode_v2(&mut enc);
            let bytes = enc.into_inner();
            let mut dec = Decoder::new(&bytes);
            assert_eq!(NetAddress::decode_v2(&mut dec).unwrap(), addr);
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn test_v2_wrong_known_length_rejected() {
        // IPv4 with 5 address bytes.
        let mut enc = Encoder::new();
        enc.write_u8(1);
        enc.write_compact_size(5);
        enc.write_bytes(&[1, 2, 3, 4, 5]);
        enc.write_u16_be(8333);
        let bytes = enc.into_inner();
        let mut dec = Decoder::new(&bytes);
        assert!(NetAddress::decode_v2(&mut dec).is_err());
    }

    #[test]
    fn test_routable_classification() {
        assert!(v4("8.8.8.8", 8333).is_routable());
        assert!(!v4("127.0.0.1", 8333).is_routable());
        assert!(!v4("10.0.0.1", 8333).is_routable());
        assert!(!v4("192.168.1.1", 8333).is_routable());
        assert!(!v4("169.254.1.1", 8333).is_routable());
        assert!(!v4("8.8.8.8", 0).is_routable());
        assert!(!NetAddress::ipv6("fe80::1".parse().unwrap(), 8333).is_routable());
        assert!(!NetAddress::ipv6("fc00::1".parse().unwrap(), 8333).is_routable());
        assert!(NetAddress {
            addr: AddrV2::TorV3([1u8; 32]),
            port: 9050,
        }
        .is_routable());
    }

    #[test]
    fn test_group_key_shares_slash16() {
        assert_eq!(
            v4("1.2.3.4", 8333).group_key(),
            v4("1.2.9.9", 1234).group_key()
        );
        assert_ne!(
            v4("1.2.3.4", 8333).group_key(),
            v4("1.3.3.4", 8333).group_key()
        );
    }

    #[test]
    fn test_identity_key_includes_port() {
        assert_ne!(
            v4("1.2.3.4", 8333).identity_key(),
            v4("1.2.3.4", 8334).identity_key()
        );
    }

    #[test]
    fn test_timed_address_roundtrips() {
        let entry = TimedAddress {
            time: 1_700_000_000,
            services: 0x409,
            address: v4("5.6.7.8", 8333),
        };

        let mut enc = Encoder::new();
        entry.encode_legacy(&mut enc);
        let bytes = enc.into_inner();
        assert_eq!(bytes.len(), 30);
        let mut dec = Decoder::new(&bytes);
        assert_eq!(TimedAddress::decode_legacy(&mut dec).unwrap(), entry);

        let mut enc = Encoder::new();
        entry.encode_v2(&mut enc);
        let bytes = enc.into_inner();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(TimedAddress::decode_v2(&mut dec).unwrap(), entry);
    }
}
