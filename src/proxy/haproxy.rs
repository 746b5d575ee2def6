//! HAProxy PROXY-protocol preamble parsing.
//!
//! A load balancer in front of the proxy may prepend one PROXY-protocol
//! message to the connection so the original client address survives the
//! hop. Both the v1 text form (`PROXY TCP4 ...\r\n`) and the v2 binary form
//! are recognized. The preamble is only legal as the very first bytes of a
//! connection; the frontend closes the recognition window after the first
//! frame either way.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BytesMut};

use crate::proxy::error::{ProxyError, Result};

/// 12-byte signature opening a v2 preamble.
const V2_SIGNATURE: &[u8; 12] = b"\r\n\r\n\x00\r\nQUIT\n";

/// v1 lines are at most 107 bytes including CRLF.
const V1_MAX_LINE: usize = 107;

const V1_MAGIC: &[u8; 6] = b"PROXY ";

/// Addresses carried by a PROXY-protocol preamble. `UNKNOWN`/`UNSPEC`
/// preambles carry none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPreamble {
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

/// Outcome of probing the head of the inbound byte stream.
#[derive(Debug)]
pub enum PreambleParse {
    /// A preamble was present; its bytes have been consumed.
    Preamble(ProxyPreamble),
    /// The stream does not open with a preamble; nothing was consumed.
    NotPreamble,
    /// Can't tell yet, more bytes needed.
    Incomplete,
}

/// Probe `src` for a PROXY-protocol preamble.
pub fn try_parse(src: &mut BytesMut) -> Result<PreambleParse> {
    if src.is_empty() {
        return Ok(PreambleParse::Incomplete);
    }

    if starts_with_prefix(src, V2_SIGNATURE) {
        if src.len() < V2_SIGNATURE.len() {
            return Ok(PreambleParse::Incomplete);
        }
        return parse_v2(src);
    }

    if starts_with_prefix(src, V1_MAGIC) {
        if src.len() < V1_MAGIC.len() {
            return Ok(PreambleParse::Incomplete);
        }
        return parse_v1(src);
    }

    Ok(PreambleParse::NotPreamble)
}

/// True when `src` could still turn out to start with `magic`: either it
/// already does, or it is a proper prefix of it.
fn starts_with_prefix(src: &BytesMut, magic: &[u8]) -> bool {
    let probe = src.len().min(magic.len());
    src[..probe] == magic[..probe]
}

fn parse_v1(src: &mut BytesMut) -> Result<PreambleParse> {
    let window = src.len().min(V1_MAX_LINE);
    let Some(newline) = src[..window].iter().position(|&b| b == b'\n') else {
        if src.len() >= V1_MAX_LINE {
            return Err(ProxyError::malformed(
                "PROXY v1 line exceeds 107 bytes without terminator",
            ));
        }
        return Ok(PreambleParse::Incomplete);
    };

    let line = src.split_to(newline + 1);
    let text = std::str::from_utf8(&line)
        .map_err(|_| ProxyError::malformed("PROXY v1 line is not ASCII"))?
        .trim_end_matches(['\r', '\n']);

    let mut parts = text.split(' ');
    let _magic = parts.next();
    match parts.next() {
        Some("UNKNOWN") => Ok(PreambleParse::Preamble(ProxyPreamble {
            source: None,
            destination: None,
        })),
        Some(family @ ("TCP4" | "TCP6")) => {
            let (src_ip, dst_ip, src_port, dst_port) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            );
            let (Some(src_ip), Some(dst_ip), Some(src_port), Some(dst_port)) =
                (src_ip, dst_ip, src_port, dst_port)
            else {
                return Err(ProxyError::malformed("PROXY v1 line missing fields"));
            };
            let source = parse_v1_addr(family, src_ip, src_port)?;
            let destination = parse_v1_addr(family, dst_ip, dst_port)?;
            Ok(PreambleParse::Preamble(ProxyPreamble {
                source: Some(source),
                destination: Some(destination),
            }))
        }
        other => Err(ProxyError::malformed(format!(
            "PROXY v1 unknown address family {other:?}"
        ))),
    }
}

fn parse_v1_addr(family: &str, ip: &str, port: &str) -> Result<SocketAddr> {
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::malformed(format!("PROXY v1 bad port {port:?}")))?;
    let ip: IpAddr = match family {
        "TCP4" => ip
            .parse::<Ipv4Addr>()
            .map(IpAddr::V4)
            .map_err(|_| ProxyError::malformed(format!("PROXY v1 bad IPv4 address {ip:?}")))?,
        _ => ip
            .parse::<Ipv6Addr>()
            .map(IpAddr::V6)
            .map_err(|_| ProxyError::malformed(format!("PROXY v1 bad IPv6 address {ip:?}")))?,
    };
    Ok(SocketAddr::new(ip, port))
}

fn parse_v2(src: &mut BytesMut) -> Result<PreambleParse> {
    // Signature (12) + version/command (1) + family/transport (1) + length (2).
    if src.len() < 16 {
        return Ok(PreambleParse::Incomplete);
    }
    let ver_cmd = src[12];
    let family = src[13];
    let addr_len = u16::from_be_bytes([src[14], src[15]]) as usize;
    if src.len() < 16 + addr_len {
        return Ok(PreambleParse::Incomplete);
    }

    if ver_cmd >> 4 != 0x2 {
        return Err(ProxyError::malformed(format!(
            "PROXY v2 bad version nibble {:#x}",
            ver_cmd >> 4
        )));
    }

    src.advance(16);
    let mut addresses = src.split_to(addr_len);

    // LOCAL command or UNSPEC family: health checks and the like, no
    // addresses to extract.
    if ver_cmd & 0x0f == 0x0 || family >> 4 == 0x0 {
        return Ok(PreambleParse::Preamble(ProxyPreamble {
            source: None,
            destination: None,
        }));
    }

    match family >> 4 {
        0x1 => {
            if addresses.len() < 12 {
                return Err(ProxyError::malformed("PROXY v2 IPv4 block truncated"));
            }
            let src_ip = Ipv4Addr::from(addresses.get_u32());
            let dst_ip = Ipv4Addr::from(addresses.get_u32());
            let src_port = addresses.get_u16();
            let dst_port = addresses.get_u16();
            Ok(PreambleParse::Preamble(ProxyPreamble {
                source: Some(SocketAddr::new(IpAddr::V4(src_ip), src_port)),
                destination: Some(SocketAddr::new(IpAddr::V4(dst_ip), dst_port)),
            }))
        }
        0x2 => {
            if addresses.len() < 36 {
                return Err(ProxyError::malformed("PROXY v2 IPv6 block truncated"));
            }
            let mut octets = [0u8; 16];
            addresses.copy_to_slice(&mut octets);
            let src_ip = Ipv6Addr::from(octets);
            addresses.copy_to_slice(&mut octets);
            let dst_ip = Ipv6Addr::from(octets);
            let src_port = addresses.get_u16();
            let dst_port = addresses.get_u16();
            Ok(PreambleParse::Preamble(ProxyPreamble {
                source: Some(SocketAddr::new(IpAddr::V6(src_ip), src_port)),
                destination: Some(SocketAddr::new(IpAddr::V6(dst_ip), dst_port)),
            }))
        }
        other => Err(ProxyError::malformed(format!(
            "PROXY v2 unsupported address family {other:#x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn v1_tcp4_line() {
        let mut buf = BytesMut::from(&b"PROXY TCP4 192.168.0.1 10.0.0.2 56324 9092\r\n\x00\x00\x00\x10"[..]);
        let parsed = try_parse(&mut buf).unwrap();
        let PreambleParse::Preamble(preamble) = parsed else {
            panic!("expected preamble, got {parsed:?}");
        };
        assert_eq!(
            preamble.source,
            Some("192.168.0.1:56324".parse().unwrap())
        );
        assert_eq!(preamble.destination, Some("10.0.0.2:9092".parse().unwrap()));
        // The Kafka length prefix after the preamble stays in the buffer.
        assert_eq!(&buf[..], &[0x00, 0x00, 0x00, 0x10]);
    }

    #[test]
    fn v1_unknown_family_has_no_addresses() {
        let mut buf = BytesMut::from(&b"PROXY UNKNOWN\r\n"[..]);
        let PreambleParse::Preamble(preamble) = try_parse(&mut buf).unwrap() else {
            panic!("expected preamble");
        };
        assert_eq!(preamble.source, None);
        assert!(buf.is_empty());
    }

    #[test]
    fn v1_partial_line_is_incomplete() {
        let mut buf = BytesMut::from(&b"PROXY TCP4 192.168."[..]);
        assert!(matches!(
            try_parse(&mut buf).unwrap(),
            PreambleParse::Incomplete
        ));
        assert_eq!(buf.len(), 19);
    }

    #[test]
    fn v1_bad_address_is_malformed() {
        let mut buf = BytesMut::from(&b"PROXY TCP4 not-an-ip 10.0.0.2 1 2\r\n"[..]);
        assert!(try_parse(&mut buf).is_err());
    }

    #[test]
    fn v2_tcp4_block() {
        let mut buf = BytesMut::new();
        buf.put_slice(V2_SIGNATURE);
        buf.put_u8(0x21); // version 2, PROXY command
        buf.put_u8(0x11); // TCP over IPv4
        buf.put_u16(12);
        buf.put_slice(&[192, 168, 0, 1]);
        buf.put_slice(&[10, 0, 0, 2]);
        buf.put_u16(56324);
        buf.put_u16(9092);
        buf.put_u32(0x0000_0010); // following Kafka length prefix

        let PreambleParse::Preamble(preamble) = try_parse(&mut buf).unwrap() else {
            panic!("expected preamble");
        };
        assert_eq!(preamble.source, Some("192.168.0.1:56324".parse().unwrap()));
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn v2_local_command_has_no_addresses() {
        let mut buf = BytesMut::new();
        buf.put_slice(V2_SIGNATURE);
        buf.put_u8(0x20); // LOCAL
        buf.put_u8(0x00); // UNSPEC
        buf.put_u16(0);

        let PreambleParse::Preamble(preamble) = try_parse(&mut buf).unwrap() else {
            panic!("expected preamble");
        };
        assert_eq!(preamble.source, None);
        assert!(buf.is_empty());
    }

    #[test]
    fn kafka_frame_is_not_a_preamble() {
        // An ApiVersions request frame: length prefix then api key 18.
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x0c, 0x00, 0x12][..]);
        assert!(matches!(
            try_parse(&mut buf).unwrap(),
            PreambleParse::NotPreamble
        ));
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn single_byte_matching_magic_is_incomplete() {
        let mut buf = BytesMut::from(&b"P"[..]);
        assert!(matches!(
            try_parse(&mut buf).unwrap(),
            PreambleParse::Incomplete
        ));

        let mut buf = BytesMut::from(&b"\r"[..]);
        assert!(matches!(
            try_parse(&mut buf).unwrap(),
            PreambleParse::Incomplete
        ));
    }
}
