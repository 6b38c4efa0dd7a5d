//! IP packet parsing and building using smoltcp wire types.
//!
//! Parsing leans on `smoltcp::wire` for header validation; response packets
//! (synthesized ACKs, FINs, RSTs and inbound data segments) are built by
//! hand with Internet checksum helpers so the engine controls every header
//! field.

use crate::error::{EngineError, Result};
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }
    pub fn fin_only() -> Self {
        Self { fin: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin {
            flags |= 0x01;
        }
        if self.syn {
            flags |= 0x02;
        }
        if self.rst {
            flags |= 0x04;
        }
        if self.psh {
            flags |= 0x08;
        }
        if self.ack {
            flags |= 0x10;
        }
        if self.urg {
            flags |= 0x20;
        }
        flags
    }
}

#[derive(Debug, Clone)]
pub struct TcpSegmentInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload_len: usize,
}

#[derive(Debug, Clone)]
pub struct UdpDatagramInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: usize,
}

#[derive(Debug, Clone)]
pub enum TransportInfo {
    Tcp(TcpSegmentInfo),
    Udp(UdpDatagramInfo),
    Other(u8),
}

/// Metadata extracted from a raw IP packet. Payload bytes stay in the raw
/// buffer and are sliced out on demand.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub version: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: IpProtocol,
    pub payload_offset: usize,
    pub total_len: usize,
    pub transport: TransportInfo,
}

impl ParsedPacket {
    pub fn src_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(SocketAddr::new(self.src_addr, t.src_port)),
            TransportInfo::Udp(u) => Some(SocketAddr::new(self.src_addr, u.src_port)),
            _ => None,
        }
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(SocketAddr::new(self.dst_addr, t.dst_port)),
            TransportInfo::Udp(u) => Some(SocketAddr::new(self.dst_addr, u.dst_port)),
            _ => None,
        }
    }

    /// The transport payload carried by `raw`, the buffer this packet was
    /// parsed from.
    pub fn payload<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        let end = self.total_len.min(raw.len());
        if self.payload_offset < end {
            &raw[self.payload_offset..end]
        } else {
            &[]
        }
    }
}

/// Parse a raw IP packet.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(EngineError::PacketTooShort { expected: 1, actual: 0 });
    }

    match (data[0] >> 4) & 0x0F {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        v => Err(EngineError::InvalidIpVersion(v)),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<ParsedPacket> {
    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("IPv4: {}", e)))?;

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let protocol = pkt.next_header();
    let (transport, transport_header_len) = parse_transport(protocol, pkt.payload())?;

    Ok(ParsedPacket {
        version: 4,
        src_addr: IpAddr::V4(pkt.src_addr()),
        dst_addr: IpAddr::V4(pkt.dst_addr()),
        protocol,
        payload_offset: ihl + transport_header_len,
        total_len,
        transport,
    })
}

fn parse_ipv6(data: &[u8]) -> Result<ParsedPacket> {
    let pkt = Ipv6Packet::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("IPv6: {}", e)))?;

    let total_len = 40 + pkt.payload().len();
    let protocol = pkt.next_header();
    let (transport, transport_header_len) = parse_transport(protocol, pkt.payload())?;

    Ok(ParsedPacket {
        version: 6,
        src_addr: IpAddr::V6(pkt.src_addr()),
        dst_addr: IpAddr::V6(pkt.dst_addr()),
        protocol,
        payload_offset: 40 + transport_header_len,
        total_len,
        transport,
    })
}

fn parse_transport(protocol: IpProtocol, payload: &[u8]) -> Result<(TransportInfo, usize)> {
    match protocol {
        IpProtocol::Tcp => parse_tcp(payload),
        IpProtocol::Udp => parse_udp(payload),
        other => Ok((TransportInfo::Other(other.into()), 0)),
    }
}

fn parse_tcp(data: &[u8]) -> Result<(TransportInfo, usize)> {
    let pkt = TcpPacket::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("TCP: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    let mut mss = None;

    // walk the options block for an MSS option
    if header_len > 20 && data.len() >= header_len {
        let opts = &data[20..header_len];
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                0 => break,
                1 => i += 1,
                2 if i + 4 <= opts.len() => {
                    mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                    i += 4;
                }
                _ => {
                    if i + 1 < opts.len() && opts[i + 1] > 0 {
                        i += opts[i + 1] as usize;
                    } else {
                        break;
                    }
                }
            }
        }
    }

    let info = TcpSegmentInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
            urg: pkt.urg(),
        },
        window: pkt.window_len(),
        mss,
        payload_len: data.len().saturating_sub(header_len),
    };
    Ok((TransportInfo::Tcp(info), header_len))
}

fn parse_udp(data: &[u8]) -> Result<(TransportInfo, usize)> {
    let pkt = UdpPacket::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("UDP: {}", e)))?;

    let info = UdpDatagramInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        payload_len: pkt.payload().len(),
    };
    Ok((TransportInfo::Udp(info), 8))
}

/// Per-connection builder for response packets written back to the device.
/// Source and destination are swapped relative to the connection's outbound
/// direction: responses travel remote -> local.
#[derive(Debug, Clone)]
pub struct IpPacketBuilder {
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    pub ip_version: u8,
    pub transport_protocol: IpProtocol,
    identification: u16,
}

impl IpPacketBuilder {
    /// Builds an instance from the first packet of a connection, which
    /// travels local -> remote.
    pub fn from_packet(parsed: &ParsedPacket) -> Self {
        Self {
            local_address: parsed.src_addr,
            remote_address: parsed.dst_addr,
            ip_version: parsed.version,
            transport_protocol: parsed.protocol,
            identification: 0,
        }
    }

    pub fn build_tcp_response(
        &mut self,
        local_port: u16,
        remote_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        window: u16,
        payload: &[u8],
        mss: Option<u16>,
    ) -> Vec<u8> {
        let ident = self.next_ident();
        match (self.remote_address, self.local_address) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => build_ipv4_tcp(
                src, dst, remote_port, local_port, seq, ack, flags, window, payload, mss, ident,
            ),
            (IpAddr::V6(src), IpAddr::V6(dst)) => build_ipv6_tcp(
                src, dst, remote_port, local_port, seq, ack, flags, window, payload, mss,
            ),
            _ => Vec::new(),
        }
    }

    pub fn build_udp_response(&mut self, local_port: u16, remote_port: u16, payload: &[u8]) -> Vec<u8> {
        let ident = self.next_ident();
        match (self.remote_address, self.local_address) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                build_ipv4_udp(src, dst, remote_port, local_port, payload, ident)
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                build_ipv6_udp(src, dst, remote_port, local_port, payload)
            }
            _ => Vec::new(),
        }
    }

    fn next_ident(&mut self) -> u16 {
        let ident = self.identification;
        self.identification = self.identification.wrapping_add(1);
        ident
    }
}

/// Builds an RST response to a TCP packet that doesn't belong to any known
/// connection (stray FIN/ACK/RST after eviction, mostly).
pub fn build_stray_tcp_rst(parsed: &ParsedPacket) -> Option<Vec<u8>> {
    let info = match &parsed.transport {
        TransportInfo::Tcp(info) => info,
        _ => return None,
    };
    let packet = match (parsed.dst_addr, parsed.src_addr) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => build_ipv4_tcp(
            src,
            dst,
            info.dst_port,
            info.src_port,
            info.ack,
            info.seq.wrapping_add(1),
            TcpFlags::rst_only(),
            info.window,
            &[],
            None,
            0,
        ),
        (IpAddr::V6(src), IpAddr::V6(dst)) => build_ipv6_tcp(
            src,
            dst,
            info.dst_port,
            info.src_port,
            info.ack,
            info.seq.wrapping_add(1),
            TcpFlags::rst_only(),
            info.window,
            &[],
            None,
        ),
        _ => return None,
    };
    Some(packet)
}

/// Build an IPv4 TCP packet.
#[allow(clippy::too_many_arguments)]
pub fn build_ipv4_tcp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    mss: Option<u16>,
    ident: u16,
) -> Vec<u8> {
    let tcp_hdr_len = 20 + if flags.syn && mss.is_some() { 4 } else { 0 };
    let total_len = 20 + tcp_hdr_len + payload.len();

    let mut pkt = vec![0u8; total_len];

    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[4..6].copy_from_slice(&ident.to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 6;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    let ip_cksum = checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    write_tcp_header(
        &mut pkt[20..],
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        window,
        payload,
        mss,
        tcp_hdr_len,
    );

    let tcp_cksum = transport_checksum_v4(&src_ip.octets(), &dst_ip.octets(), 6, &pkt[20..]);
    pkt[36..38].copy_from_slice(&tcp_cksum.to_be_bytes());

    pkt
}

/// Build an IPv6 TCP packet.
#[allow(clippy::too_many_arguments)]
pub fn build_ipv6_tcp(
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    mss: Option<u16>,
) -> Vec<u8> {
    let tcp_hdr_len = 20 + if flags.syn && mss.is_some() { 4 } else { 0 };
    let transport_len = tcp_hdr_len + payload.len();
    let mut pkt = vec![0u8; 40 + transport_len];

    write_ipv6_header(&mut pkt, &src_ip, &dst_ip, 6, transport_len);
    write_tcp_header(
        &mut pkt[40..],
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        window,
        payload,
        mss,
        tcp_hdr_len,
    );

    let tcp_cksum = transport_checksum_v6(&src_ip.octets(), &dst_ip.octets(), 6, &pkt[40..]);
    pkt[56..58].copy_from_slice(&tcp_cksum.to_be_bytes());

    pkt
}

/// Build an IPv4 UDP packet.
pub fn build_ipv4_udp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
    ident: u16,
) -> Vec<u8> {
    let total_len = 20 + 8 + payload.len();
    let mut pkt = vec![0u8; total_len];

    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[4..6].copy_from_slice(&ident.to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    let ip_cksum = checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    write_udp_header(&mut pkt[20..], src_port, dst_port, payload);

    let udp_cksum = transport_checksum_v4(&src_ip.octets(), &dst_ip.octets(), 17, &pkt[20..]);
    pkt[26..28].copy_from_slice(&fix_udp_checksum(udp_cksum).to_be_bytes());

    pkt
}

/// Build an IPv6 UDP packet.
pub fn build_ipv6_udp(
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let transport_len = 8 + payload.len();
    let mut pkt = vec![0u8; 40 + transport_len];

    write_ipv6_header(&mut pkt, &src_ip, &dst_ip, 17, transport_len);
    write_udp_header(&mut pkt[40..], src_port, dst_port, payload);

    let udp_cksum = transport_checksum_v6(&src_ip.octets(), &dst_ip.octets(), 17, &pkt[40..]);
    pkt[46..48].copy_from_slice(&fix_udp_checksum(udp_cksum).to_be_bytes());

    pkt
}

fn write_ipv6_header(pkt: &mut [u8], src: &Ipv6Addr, dst: &Ipv6Addr, next_header: u8, payload_len: usize) {
    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    pkt[6] = next_header;
    pkt[7] = 64;
    pkt[8..24].copy_from_slice(&src.octets());
    pkt[24..40].copy_from_slice(&dst.octets());
}

#[allow(clippy::too_many_arguments)]
fn write_tcp_header(
    buf: &mut [u8],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    mss: Option<u16>,
    tcp_hdr_len: usize,
) {
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..8].copy_from_slice(&seq.to_be_bytes());
    buf[8..12].copy_from_slice(&ack.to_be_bytes());
    buf[12] = ((tcp_hdr_len / 4) as u8) << 4;
    buf[13] = flags.to_byte();
    buf[14..16].copy_from_slice(&window.to_be_bytes());

    if flags.syn {
        if let Some(mss_val) = mss {
            buf[20] = 2;
            buf[21] = 4;
            buf[22..24].copy_from_slice(&mss_val.to_be_bytes());
        }
    }

    if !payload.is_empty() {
        buf[tcp_hdr_len..tcp_hdr_len + payload.len()].copy_from_slice(payload);
    }
}

fn write_udp_header(buf: &mut [u8], src_port: u16, dst_port: u16, payload: &[u8]) {
    let udp_len = (8 + payload.len()) as u16;
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..6].copy_from_slice(&udp_len.to_be_bytes());
    if !payload.is_empty() {
        buf[8..8 + payload.len()].copy_from_slice(payload);
    }
}

fn fix_udp_checksum(cksum: u16) -> u16 {
    // a computed checksum of 0 is transmitted as all-ones
    if cksum == 0 {
        0xFFFF
    } else {
        cksum
    }
}

fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(0, data)) as u16
}

fn transport_checksum_v4(src: &[u8; 4], dst: &[u8; 4], proto: u8, data: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum_words(sum, src);
    sum = sum_words(sum, dst);
    sum = sum.wrapping_add(proto as u32);
    sum = sum.wrapping_add(data.len() as u32);
    sum = sum_words(sum, data);
    !fold(sum) as u16
}

fn transport_checksum_v6(src: &[u8; 16], dst: &[u8; 16], proto: u8, data: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum_words(sum, src);
    sum = sum_words(sum, dst);
    let len = data.len() as u32;
    sum = sum.wrapping_add(len >> 16).wrapping_add(len & 0xFFFF);
    sum = sum.wrapping_add(proto as u32);
    sum = sum_words(sum, data);
    !fold(sum) as u16
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    sum
}

fn fold(mut sum: u32) -> u32 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syn_packet() -> Vec<u8> {
        build_ipv4_tcp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(93, 184, 216, 34),
            40022,
            443,
            1000,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
            Some(1360),
            7,
        )
    }

    #[test]
    fn parses_own_tcp_packets() {
        let raw = syn_packet();
        let parsed = parse_packet(&raw).unwrap();
        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.src_addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(parsed.dst_addr, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        match &parsed.transport {
            TransportInfo::Tcp(info) => {
                assert_eq!(info.src_port, 40022);
                assert_eq!(info.dst_port, 443);
                assert_eq!(info.seq, 1000);
                assert!(info.flags.syn);
                assert!(!info.flags.ack);
                assert_eq!(info.mss, Some(1360));
                assert_eq!(info.payload_len, 0);
            }
            other => panic!("expected TCP transport, got {:?}", other),
        }
        assert!(parsed.payload(&raw).is_empty());
    }

    #[test]
    fn parses_tcp_payload_slice() {
        let raw = build_ipv4_tcp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 2, 3, 4),
            40022,
            80,
            5,
            9,
            TcpFlags::psh_ack(),
            65535,
            b"GET / HTTP/1.1\r\n\r\n",
            None,
            0,
        );
        let parsed = parse_packet(&raw).unwrap();
        assert_eq!(parsed.payload(&raw), b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn parses_own_udp_packets() {
        let raw = build_ipv4_udp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(8, 8, 8, 8),
            40000,
            53,
            &[0xAB; 24],
            3,
        );
        let parsed = parse_packet(&raw).unwrap();
        match &parsed.transport {
            TransportInfo::Udp(info) => {
                assert_eq!(info.dst_port, 53);
                assert_eq!(info.payload_len, 24);
            }
            other => panic!("expected UDP transport, got {:?}", other),
        }
        assert_eq!(parsed.payload(&raw), &[0xAB; 24]);
    }

    #[test]
    fn parses_own_ipv6_packets() {
        let src: Ipv6Addr = "fd00::2".parse().unwrap();
        let dst: Ipv6Addr = "2606:2800:220:1::1".parse().unwrap();
        let raw = build_ipv6_tcp(
            src,
            dst,
            40022,
            443,
            42,
            7,
            TcpFlags::ack_only(),
            32768,
            b"hello",
            None,
        );
        let parsed = parse_packet(&raw).unwrap();
        assert_eq!(parsed.version, 6);
        assert_eq!(parsed.src_addr, IpAddr::V6(src));
        assert_eq!(parsed.payload(&raw), b"hello");
    }

    #[test]
    fn stray_rst_swaps_direction() {
        let raw = syn_packet();
        let parsed = parse_packet(&raw).unwrap();
        let rst = build_stray_tcp_rst(&parsed).unwrap();
        let parsed_rst = parse_packet(&rst).unwrap();
        assert_eq!(parsed_rst.src_addr, parsed.dst_addr);
        assert_eq!(parsed_rst.dst_addr, parsed.src_addr);
        match &parsed_rst.transport {
            TransportInfo::Tcp(info) => {
                assert!(info.flags.rst);
                assert_eq!(info.src_port, 443);
                assert_eq!(info.dst_port, 40022);
            }
            other => panic!("expected TCP transport, got {:?}", other),
        }
    }

    #[test]
    fn response_builder_swaps_direction() {
        let raw = syn_packet();
        let parsed = parse_packet(&raw).unwrap();
        let mut builder = IpPacketBuilder::from_packet(&parsed);
        let response = builder.build_tcp_response(
            40022,
            443,
            1,
            1001,
            TcpFlags::syn_ack(),
            65535,
            &[],
            None,
        );
        let parsed_response = parse_packet(&response).unwrap();
        assert_eq!(parsed_response.src_addr, parsed.dst_addr);
        assert_eq!(parsed_response.dst_addr, parsed.src_addr);
    }
}
