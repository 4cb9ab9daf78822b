//! Captive portal tasks on the access point interface
//!
//! DHCP hands out leases on the portal subnet, DNS answers every name with the
//! portal address and a small HTTP server renders the form. Submissions go to the
//! node loop through [`PortalChannels`]; the loop answers with a [`FormResponse`].

use crate::config;
use crate::credentials::CredentialError;
use crate::dns;
use crate::portal::{FormResponse, PortalChannels, parse_form_body};
use alloc::format;
use alloc::string::String;
use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use edge_dhcp::io::{self, DEFAULT_SERVER_PORT};
use edge_dhcp::server::{Server, ServerOptions};
use edge_nal::UdpBind;
use edge_nal_embassy::{Udp, UdpBuffers};
use embassy_net::Stack;
use embassy_net::tcp::TcpSocket;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_time::{Duration, Timer, with_timeout};
use embedded_io_async::Write;
use log::{debug, info, warn};

const DNS_PORT: u16 = 53;
const REQUEST_MAX: usize = 1024;
const IDLE_POLL: Duration = Duration::from_millis(500);
const RESPONSE_WAIT: Duration = Duration::from_secs(5);

const FORM_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<meta name=\"viewport\" content=\"width=device-width,initial-scale=1\">\
<title>Edge Node Setup</title></head><body><h2>Edge Node WiFi Setup</h2>\
<form method=\"POST\" action=\"/save\" accept-charset=\"utf-8\">\
<p>Network<br><input name=\"network_name\" maxlength=\"32\" required></p>\
<p>Password<br><input name=\"secret\" type=\"password\" maxlength=\"64\"></p>\
<p><button type=\"submit\">Save</button></p></form></body></html>";

const SAVED_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head>\
<body><h2>Saved</h2>\
<p>The node is joining the network. You can close this page.</p></body></html>";

const NOT_PERSISTED_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head>\
<body><h2>Joining</h2>\
<p>Credentials could not be stored and will be used until the next restart.</p>\
</body></html>";

/// DHCP server for portal clients
#[embassy_executor::task]
pub async fn dhcp_task(stack: Stack<'static>, address: Ipv4Addr) {
    let mut buf = [0u8; 1500];
    let mut gw_buf = [Ipv4Addr::UNSPECIFIED];

    let buffers = UdpBuffers::<3, 1024, 1024, 10>::new();
    let unbound_socket = Udp::new(stack, &buffers);
    let mut bound_socket = match unbound_socket
        .bind(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            DEFAULT_SERVER_PORT,
        )))
        .await
    {
        Ok(socket) => socket,
        Err(e) => {
            warn!("[PORTAL] DHCP socket bind failed: {:?}", e);
            return;
        }
    };

    info!("[PORTAL] DHCP server ready on {}", address);
    loop {
        if let Err(e) = io::server::run(
            &mut Server::<_, 64>::new_with_et(address),
            &ServerOptions::new(address, Some(&mut gw_buf)),
            &mut bound_socket,
            &mut buf,
        )
        .await
        {
            warn!("[PORTAL] DHCP server error: {:?}", e);
        }
        Timer::after(IDLE_POLL).await;
    }
}

/// Captive DNS: every A query resolves to the portal
#[embassy_executor::task]
pub async fn dns_task(stack: Stack<'static>, address: [u8; 4]) {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buffer = [0u8; 512];
    let mut tx_buffer = [0u8; 512];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    if let Err(e) = socket.bind(DNS_PORT) {
        warn!("[PORTAL] DNS socket bind failed: {:?}", e);
        return;
    }

    let mut query = [0u8; 512];
    let mut answer = [0u8; 512];
    loop {
        let (len, peer) = match socket.recv_from(&mut query).await {
            Ok(received) => received,
            Err(e) => {
                debug!("[PORTAL] DNS receive error: {:?}", e);
                continue;
            }
        };
        if let Some(answer_len) = dns::answer_query(&query[..len], address, &mut answer) {
            if let Err(e) = socket.send_to(&answer[..answer_len], peer.endpoint).await {
                debug!("[PORTAL] DNS send error: {:?}", e);
            }
        }
    }
}

/// HTTP server for the provisioning form
#[embassy_executor::task]
pub async fn http_task(stack: Stack<'static>, channels: &'static PortalChannels) {
    let mut rx_buffer = [0u8; 1536];
    let mut tx_buffer = [0u8; 2048];
    let mut request = [0u8; REQUEST_MAX];

    loop {
        if !channels.is_active() {
            Timer::after(IDLE_POLL).await;
            continue;
        }

        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(Duration::from_secs(10)));
        if let Err(e) = socket.accept(config::PORTAL_HTTP_PORT).await {
            warn!("[PORTAL] Accept failed: {:?}", e);
            continue;
        }

        let len = read_request(&mut socket, &mut request).await;
        let (status, body) = handle_request(&request[..len], channels).await;
        let header = format!(
            "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status,
            body.len()
        );
        if let Err(e) = socket.write_all(header.as_bytes()).await {
            debug!("[PORTAL] Write failed: {:?}", e);
        } else if let Err(e) = socket.write_all(body.as_bytes()).await {
            debug!("[PORTAL] Write failed: {:?}", e);
        }
        let _ = socket.flush().await;
        socket.close();
        Timer::after(Duration::from_millis(50)).await;
        socket.abort();
    }
}

/// Read until the headers and the announced body are in, or the buffer is full
async fn read_request(socket: &mut TcpSocket<'_>, buf: &mut [u8]) -> usize {
    let mut len = 0;
    while len < buf.len() {
        match socket.read(&mut buf[len..]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => len += n,
        }
        if request_complete(&buf[..len]) {
            break;
        }
    }
    len
}

fn header_end(request: &[u8]) -> Option<usize> {
    request
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|at| at + 4)
}

fn content_length(headers: &str) -> usize {
    headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

fn request_complete(request: &[u8]) -> bool {
    let Some(end) = header_end(request) else {
        return false;
    };
    let headers = core::str::from_utf8(&request[..end]).unwrap_or("");
    request.len() >= end + content_length(headers)
}

async fn handle_request(
    request: &[u8],
    channels: &'static PortalChannels,
) -> (&'static str, String) {
    let text = core::str::from_utf8(request).unwrap_or("");
    let mut request_line = text.lines().next().unwrap_or("").split_whitespace();
    let method = request_line.next().unwrap_or("");
    let path = request_line.next().unwrap_or("/");

    if method != "POST" || path != "/save" {
        // Any other request gets the form; this is what makes the portal captive
        return ("200 OK", String::from(FORM_PAGE));
    }

    let body = header_end(request)
        .and_then(|end| core::str::from_utf8(&request[end..]).ok())
        .unwrap_or("");
    let form = match parse_form_body(body) {
        Ok(form) => form,
        Err(e) => {
            warn!("[PORTAL] Unreadable submission: {}", e);
            return ("400 Bad Request", rejected_page(e));
        }
    };
    info!("[PORTAL] Form submitted for network {}", form.network_name);

    match with_timeout(RESPONSE_WAIT, channels.submit(form)).await {
        Ok(None) => ("503 Service Unavailable", String::from(FORM_PAGE)),
        Ok(Some(FormResponse::Saved)) => ("200 OK", String::from(SAVED_PAGE)),
        Ok(Some(FormResponse::SavedNotPersisted)) => ("200 OK", String::from(NOT_PERSISTED_PAGE)),
        Ok(Some(FormResponse::Rejected(e))) => ("400 Bad Request", rejected_page(e)),
        Err(_) => ("504 Gateway Timeout", String::from(FORM_PAGE)),
    }
}

fn rejected_page(error: CredentialError) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head>\
         <body><h2>Not saved</h2><p>{}</p>\
         <p><a href=\"/\">Try again</a></p></body></html>",
        error
    )
}
