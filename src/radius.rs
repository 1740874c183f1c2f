//! The RADIUS accounting observer: a UDP sniffer on port 1813 that
//! synthesises Accounting-Response, forwards the original request to the
//! NAS-IP's configured FortiGate(s), and feeds the extracted attributes to
//! the admission router.
//!
//! This does not validate the Request-Authenticator of the incoming packet
//! (sniff-only deployment, per the source system) and does not rate-limit
//! or deduplicate retransmissions.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use md5::{Digest, Md5};
use slog::Logger;
use tokio::net::UdpSocket;

use crate::admission;

pub const CODE_ACCOUNTING_REQUEST: u8 = 4;
pub const CODE_ACCOUNTING_RESPONSE: u8 = 5;

const ATTR_USER_NAME: u8 = 1;
const ATTR_NAS_IP_ADDRESS: u8 = 4;
const ATTR_FRAMED_IP_ADDRESS: u8 = 8;
const ATTR_CLASS: u8 = 25;
const ATTR_ACCT_STATUS_TYPE: u8 = 40;
const ATTR_DELEGATED_IPV6_PREFIX: u8 = 123;

pub const ACCT_STATUS_TYPE_START: u32 = 1;
pub const ACCT_STATUS_TYPE_STOP: u32 = 2;

#[derive(Debug, Clone, Default)]
pub struct RadiusPacket {
    pub code: u8,
    pub identifier: u8,
    pub authenticator: [u8; 16],
    /// Raw attribute bytes, keyed by numeric type code, value as the
    /// attribute's raw content (without the type/length header).
    pub attributes: HashMap<u8, Vec<u8>>,
}

#[derive(Debug)]
pub enum ParseError {
    TooShort,
    LengthMismatch,
}

/// Decodes a RADIUS packet's header and attribute TLVs. Pure, synchronous,
/// allocation-light; tested against fixed byte arrays.
pub fn parse(buf: &[u8]) -> Result<RadiusPacket, ParseError> {
    if buf.len() < 20 {
        return Err(ParseError::TooShort);
    }
    let code = buf[0];
    let identifier = buf[1];
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if length > buf.len() || length < 20 {
        return Err(ParseError::LengthMismatch);
    }
    let mut authenticator = [0u8; 16];
    authenticator.copy_from_slice(&buf[4..20]);

    let mut attributes = HashMap::new();
    let mut pos = 20;
    while pos + 2 <= length {
        let attr_type = buf[pos];
        let attr_len = buf[pos + 1] as usize;
        if attr_len < 2 || pos + attr_len > length {
            break;
        }
        let value = buf[pos + 2..pos + attr_len].to_vec();
        attributes.insert(attr_type, value);
        pos += attr_len;
    }

    Ok(RadiusPacket {
        code,
        identifier,
        authenticator,
        attributes,
    })
}

/// Builds a code=5 Accounting-Response body, echoing the request's id,
/// length, and attributes, with the authenticator recomputed as
/// `MD5(code || id || length || request-authenticator || attrs || secret)`.
pub fn build_accounting_response(request_bytes: &[u8], shared_secret: &[u8]) -> Vec<u8> {
    let mut body = request_bytes.to_vec();
    body[0] = CODE_ACCOUNTING_RESPONSE;
    // id (body[1]) and length (body[2..4]) are echoed verbatim from the request.
    let request_authenticator = body[4..20].to_vec();

    let mut hasher = Md5::new();
    hasher.update(&body[0..4]);
    hasher.update(&request_authenticator);
    hasher.update(&body[20..]);
    hasher.update(shared_secret);
    let digest = hasher.finalize();
    body[4..20].copy_from_slice(&digest);
    body
}

#[derive(Debug, Clone)]
pub struct ExtractedAttrs {
    pub user_name: Option<String>,
    pub class: Option<String>,
    pub framed_ip_address: Option<String>,
    pub delegated_ipv6_prefix: Option<String>,
    pub nas_ip_address: Option<Ipv4Addr>,
    pub acct_status_type: Option<u32>,
}

pub fn extract_attrs(packet: &RadiusPacket) -> ExtractedAttrs {
    ExtractedAttrs {
        user_name: packet
            .attributes
            .get(&ATTR_USER_NAME)
            .map(|v| String::from_utf8_lossy(v).into_owned()),
        class: packet
            .attributes
            .get(&ATTR_CLASS)
            .map(|v| String::from_utf8_lossy(v).into_owned()),
        framed_ip_address: packet
            .attributes
            .get(&ATTR_FRAMED_IP_ADDRESS)
            .filter(|v| v.len() == 4)
            .map(|v| Ipv4Addr::new(v[0], v[1], v[2], v[3]).to_string()),
        delegated_ipv6_prefix: packet
            .attributes
            .get(&ATTR_DELEGATED_IPV6_PREFIX)
            .map(|v| v.iter().map(|b| format!("{:02x}", b)).collect()),
        nas_ip_address: packet
            .attributes
            .get(&ATTR_NAS_IP_ADDRESS)
            .filter(|v| v.len() == 4)
            .map(|v| Ipv4Addr::new(v[0], v[1], v[2], v[3])),
        acct_status_type: packet
            .attributes
            .get(&ATTR_ACCT_STATUS_TYPE)
            .filter(|v| v.len() == 4)
            .map(|v| u32::from_be_bytes([v[0], v[1], v[2], v[3]])),
    }
}

/// The port FortiGate devices themselves listen for forwarded RADIUS
/// accounting traffic on.
const FORTIGATE_RADIUS_PORT: u16 = 1813;

/// Binds the RADIUS observer's UDP socket. Split out from `run` so `main`
/// can treat a bind failure as fatal before spawning the receive loop,
/// matching the admin HTTP listener's bind-then-serve treatment.
pub async fn bind(bind_port: u16) -> std::io::Result<UdpSocket> {
    UdpSocket::bind(("0.0.0.0", bind_port)).await
}

pub async fn run(
    socket: UdpSocket,
    shared_secret: Arc<Vec<u8>>,
    forti_gate: Arc<HashMap<Ipv4Addr, Vec<String>>>,
    admission_handle: admission::Handle,
    log: Logger,
) {
    let socket = Arc::new(socket);
    slog::info!(log, "RADIUS observer listening"; "port" => socket.local_addr().map(|a| a.port()).unwrap_or(0));

    let mut buf = vec![0u8; 4096];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                slog::error!(log, "Failed to receive UDP datagram"; "error" => e.to_string());
                continue;
            }
        };
        let datagram = buf[..n].to_vec();
        let socket = Arc::clone(&socket);
        let shared_secret = Arc::clone(&shared_secret);
        let forti_gate = Arc::clone(&forti_gate);
        let admission_handle = admission_handle.clone();
        let task_log = log.new(slog::o!("peer" => src.to_string()));

        tokio::task::spawn(async move {
            handle_datagram(
                &datagram,
                src,
                socket,
                &shared_secret,
                &forti_gate,
                admission_handle,
                task_log,
            )
            .await;
        });
    }
}

async fn handle_datagram(
    datagram: &[u8],
    src: SocketAddr,
    socket: Arc<UdpSocket>,
    shared_secret: &[u8],
    forti_gate: &HashMap<Ipv4Addr, Vec<String>>,
    admission_handle: admission::Handle,
    log: Logger,
) {
    let packet = match parse(datagram) {
        Ok(p) => p,
        Err(e) => {
            slog::debug!(log, "Dropping unparseable RADIUS datagram"; "error" => format!("{:?}", e));
            return;
        }
    };

    match packet.code {
        CODE_ACCOUNTING_REQUEST => {
            let response = build_accounting_response(datagram, shared_secret);
            if let Err(e) = socket.send_to(&response, src).await {
                slog::warn!(log, "Failed to send Accounting-Response"; "error" => e.to_string());
            }

            let attrs = extract_attrs(&packet);

            if let Some(nas_ip) = attrs.nas_ip_address {
                if let Some(fg_list) = forti_gate.get(&nas_ip) {
                    forward_to_forti_gate(&socket, fg_list, datagram, &log).await;
                }
            }

            admission::handle_event(&admission_handle, attrs, &log).await;
        }
        CODE_ACCOUNTING_RESPONSE => {
            slog::debug!(log, "Observed Accounting-Response on the wire");
        }
        other => {
            slog::debug!(log, "Dropping RADIUS packet with unhandled code"; "code" => other);
        }
    }
}

/// Forwards the raw request to each configured FortiGate in order, stopping
/// after the first successful send.
async fn forward_to_forti_gate(socket: &UdpSocket, fg_list: &[String], datagram: &[u8], log: &Logger) {
    for fg in fg_list {
        match socket.send_to(datagram, (fg.as_str(), FORTIGATE_RADIUS_PORT)).await {
            Ok(_) => {
                slog::info!(log, "Forwarded RADIUS packet to FortiGate"; "fg" => fg.as_str());
                return;
            }
            Err(e) => {
                slog::warn!(log, "Failed to forward RADIUS packet to FortiGate"; "fg" => fg.as_str(), "error" => e.to_string());
            }
        }
    }
    slog::error!(log, "All FortiGates unavailable for forwarded RADIUS packet");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Vec<u8> {
        let mut pkt = vec![0u8; 20];
        pkt[0] = CODE_ACCOUNTING_REQUEST;
        pkt[1] = 42;
        // User-Name = "u1"
        let user_name = [ATTR_USER_NAME, 4, b'u', b'1'];
        // Class = "2"
        let class = [ATTR_CLASS, 3, b'2'];
        // Framed-IP-Address = 10.0.0.1
        let framed_ip = [ATTR_FRAMED_IP_ADDRESS, 6, 10, 0, 0, 1];
        // NAS-IP-Address = 1.1.1.1
        let nas_ip = [ATTR_NAS_IP_ADDRESS, 6, 1, 1, 1, 1];
        // Acct-Status-Type = Start (1)
        let status = [ATTR_ACCT_STATUS_TYPE, 6, 0, 0, 0, 1];
        pkt.extend_from_slice(&user_name);
        pkt.extend_from_slice(&class);
        pkt.extend_from_slice(&framed_ip);
        pkt.extend_from_slice(&nas_ip);
        pkt.extend_from_slice(&status);
        let len = pkt.len() as u16;
        pkt[2..4].copy_from_slice(&len.to_be_bytes());
        pkt
    }

    #[test]
    fn parses_header_and_attributes() {
        let pkt = parse(&sample_request()).unwrap();
        assert_eq!(pkt.code, CODE_ACCOUNTING_REQUEST);
        assert_eq!(pkt.identifier, 42);
        assert_eq!(pkt.attributes.get(&ATTR_USER_NAME).unwrap(), b"u1");
    }

    #[test]
    fn extracts_typed_fields() {
        let pkt = parse(&sample_request()).unwrap();
        let attrs = extract_attrs(&pkt);
        assert_eq!(attrs.user_name.as_deref(), Some("u1"));
        assert_eq!(attrs.class.as_deref(), Some("2"));
        assert_eq!(attrs.framed_ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(attrs.nas_ip_address, Some(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(attrs.acct_status_type, Some(ACCT_STATUS_TYPE_START));
    }

    #[test]
    fn rejects_too_short_packet() {
        assert!(matches!(parse(&[0u8; 5]), Err(ParseError::TooShort)));
    }

    #[test]
    fn response_echoes_identifier_and_recomputes_authenticator() {
        let request = sample_request();
        let response = build_accounting_response(&request, b"secret");
        assert_eq!(response[0], CODE_ACCOUNTING_RESPONSE);
        assert_eq!(response[1], request[1]);
        assert_ne!(&response[4..20], &request[4..20]);
    }
}
