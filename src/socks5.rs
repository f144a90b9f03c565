//! SOCKS5 wire shapes shared by the local proxy's front end (`spec.md`
//! §4.f) and the tunnel handshake's inner DST.ADDR/DST.PORT payload
//! (`spec.md` §4.g) — both describe the same ATYP/address/port triple.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// A CONNECT target: either a literal address or a domain name to be
/// resolved by the remote proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

/// A parsed `CMD=CONNECT` request: `VER CMD RSV ATYP DST.ADDR DST.PORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub address: Address,
}

/// Parse a SOCKS5 request (or the tunnel handshake's inner payload, which
/// is the same ATYP/address/port shape prefixed by a version byte).
/// Returns the parsed request and the number of bytes consumed.
pub fn parse_request(buf: &[u8]) -> Result<(ConnectRequest, usize)> {
    if buf.len() < 4 {
        return Err(Error::protocol("request too short"));
    }
    if buf[0] != SOCKS_VERSION {
        return Err(Error::protocol("unsupported SOCKS version"));
    }
    if buf[1] != CMD_CONNECT {
        return Err(Error::protocol("only CONNECT is supported"));
    }
    // buf[2] is RSV, ignored.
    let atyp = buf[3];
    let mut pos = 4;

    let address = match atyp {
        ATYP_IPV4 => {
            if buf.len() < pos + 4 + 2 {
                return Err(Error::protocol("truncated IPv4 address"));
            }
            let octets: [u8; 4] = buf[pos..pos + 4].try_into().unwrap();
            pos += 4;
            let port = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap());
            pos += 2;
            Address::Ip(SocketAddr::from((Ipv4Addr::from(octets), port)))
        }
        ATYP_IPV6 => {
            if buf.len() < pos + 16 + 2 {
                return Err(Error::protocol("truncated IPv6 address"));
            }
            let octets: [u8; 16] = buf[pos..pos + 16].try_into().unwrap();
            pos += 16;
            let port = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap());
            pos += 2;
            Address::Ip(SocketAddr::from((Ipv6Addr::from(octets), port)))
        }
        ATYP_DOMAIN => {
            if buf.len() < pos + 1 {
                return Err(Error::protocol("truncated domain length"));
            }
            let len = buf[pos] as usize;
            pos += 1;
            if buf.len() < pos + len + 2 {
                return Err(Error::protocol("truncated domain name"));
            }
            let domain = std::str::from_utf8(&buf[pos..pos + len])
                .map_err(|_| Error::protocol("domain name is not valid UTF-8"))?
                .to_string();
            pos += len;
            let port = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap());
            pos += 2;
            Address::Domain(domain, port)
        }
        other => return Err(Error::protocol(format!("unsupported ATYP {other}"))),
    };

    Ok((ConnectRequest { address }, pos))
}

/// Encode a CONNECT request's ATYP/address/port payload, as carried both
/// by the live SOCKS5 request and by the tunnel handshake's inner
/// payload. `version_byte` lets the handshake frame reuse this for its
/// leading `0x05` version marker (`spec.md` §4.g).
pub fn encode_request(version_byte: u8, address: &Address) -> Vec<u8> {
    let mut out = vec![version_byte, CMD_CONNECT, 0x00];
    match address {
        Address::Ip(SocketAddr::V4(addr)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        Address::Ip(SocketAddr::V6(addr)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        Address::Domain(domain, port) => {
            out.push(ATYP_DOMAIN);
            out.push(domain.len() as u8);
            out.extend_from_slice(domain.as_bytes());
            out.extend_from_slice(&port.to_be_bytes());
        }
    }
    out
}

/// Encode the `VER REP RSV ATYP BND.ADDR BND.PORT` reply sent back to the
/// SOCKS5 client. `rep = REP_SUCCEEDED` on success.
pub fn encode_reply(rep: u8, bound: SocketAddr) -> Vec<u8> {
    let mut out = vec![SOCKS_VERSION, rep, 0x00];
    match bound {
        SocketAddr::V4(addr) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}

/// How many bytes the `VER NMETHODS METHODS...` greeting will total once
/// `buf` has enough of it to say, or `None` if `buf` doesn't yet cover
/// the `NMETHODS` byte.
pub fn greeting_len_hint(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    Some(2 + buf[1] as usize)
}

/// How many bytes a `CMD=CONNECT` request will total once `buf` has
/// enough of it to say, or `None` if `buf` doesn't yet cover the ATYP
/// byte (or, for a domain name, its length byte).
pub fn request_len_hint(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    match buf[3] {
        ATYP_IPV4 => Some(4 + 4 + 2),
        ATYP_IPV6 => Some(4 + 16 + 2),
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return None;
            }
            Some(4 + 1 + buf[4] as usize + 2)
        }
        _ => Some(buf.len()), // unknown ATYP: let parse_request raise the real error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    #[test]
    fn parses_ipv4_connect_request() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);
        let encoded = encode_request(SOCKS_VERSION, &Address::Ip(SocketAddr::V4(addr)));
        let (req, consumed) = parse_request(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(req.address, Address::Ip(SocketAddr::V4(addr)));
    }

    #[test]
    fn parses_domain_connect_request() {
        let encoded = encode_request(
            SOCKS_VERSION,
            &Address::Domain("example.com".to_string(), 443),
        );
        let (req, consumed) = parse_request(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(req.address, Address::Domain("example.com".to_string(), 443));
    }

    #[test]
    fn rejects_non_connect_command() {
        let mut buf = encode_request(SOCKS_VERSION, &Address::Domain("x".into(), 1));
        buf[1] = 0x03; // UDP ASSOCIATE
        assert!(parse_request(&buf).is_err());
    }

    #[test]
    fn rejects_truncated_domain() {
        let mut buf = encode_request(SOCKS_VERSION, &Address::Domain("example.com".into(), 1));
        buf.truncate(buf.len() - 3);
        assert!(parse_request(&buf).is_err());
    }
}
