//! TCP connect port scanner with banner grabbing and TLS inspection.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::cancel::CancelState;
use crate::error::SetupError;
use crate::types::{PortInfo, PortState, TlsCertInfo};

/// Well-known port to service name mapping
pub const WELL_KNOWN_SERVICES: &[(u16, &str)] = &[
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "dns"),
    (80, "http"),
    (110, "pop3"),
    (111, "rpc"),
    (135, "msrpc"),
    (139, "netbios"),
    (143, "imap"),
    (443, "https"),
    (445, "smb"),
    (465, "smtps"),
    (515, "lpd"),
    (548, "afp"),
    (554, "rtsp"),
    (587, "submission"),
    (631, "ipp"),
    (993, "imaps"),
    (995, "pop3s"),
    (1433, "mssql"),
    (1521, "oracle"),
    (1883, "mqtt"),
    (2049, "nfs"),
    (3306, "mysql"),
    (3389, "rdp"),
    (5432, "postgresql"),
    (5900, "vnc"),
    (5984, "couchdb"),
    (6379, "redis"),
    (8080, "http-alt"),
    (8443, "https-alt"),
    (9100, "jetdirect"),
    (9200, "elasticsearch"),
    (11211, "memcached"),
    (27017, "mongodb"),
    (62078, "iphone-sync"),
];

/// Default port set for a quick scan of one host.
pub const QUICK_SCAN_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 111, 135, 139, 143, 443, 445, 515, 554, 631, 993, 995, 1433,
    1883, 3306, 3389, 5900, 6379, 8080, 8443, 9100, 27017,
];

/// Get service name for a port
pub fn get_service_name(port: u16) -> Option<&'static str> {
    WELL_KNOWN_SERVICES
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, name)| *name)
}

/// Parse a port range string into a sorted, deduplicated port list.
///
/// Supports single ports ("80"), ranges ("1-1024"), lists ("80,443"),
/// and any mix of the three.
pub fn parse_port_range(input: &str) -> Result<Vec<u16>, SetupError> {
    let mut ports = Vec::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = start
                .trim()
                .parse()
                .map_err(|_| SetupError::InvalidPortRange(format!("bad port number: {start}")))?;
            let end: u16 = end
                .trim()
                .parse()
                .map_err(|_| SetupError::InvalidPortRange(format!("bad port number: {end}")))?;
            if start == 0 {
                return Err(SetupError::InvalidPortRange("port 0 is not valid".into()));
            }
            if start > end {
                return Err(SetupError::InvalidPortRange(format!(
                    "descending range: {start}-{end}"
                )));
            }
            ports.extend(start..=end);
        } else {
            let port: u16 = part
                .parse()
                .map_err(|_| SetupError::InvalidPortRange(format!("bad port number: {part}")))?;
            if port == 0 {
                return Err(SetupError::InvalidPortRange("port 0 is not valid".into()));
            }
            ports.push(port);
        }
    }

    if ports.is_empty() {
        return Err(SetupError::NoPorts);
    }

    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

const fn is_tls_port(port: u16) -> bool {
    matches!(port, 443 | 636 | 853 | 993 | 995 | 8443 | 9443)
}

const fn is_http_port(port: u16) -> bool {
    matches!(port, 80 | 8080 | 8000 | 8888)
}

/// Knobs for one host's port scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Connect timeout per port.
    pub timeout: Duration,
    /// Maximum in-flight connection attempts.
    pub concurrency: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            concurrency: 100,
        }
    }
}

/// Scan `ports` on a single host, reporting every port's state.
///
/// Each completed `PortInfo` is also forwarded on `live` when a sender
/// is given. Cancellation keeps what has finished and skips the rest.
pub async fn scan_host(
    ip: IpAddr,
    ports: &[u16],
    options: &ScanOptions,
    cancel: &Arc<CancelState>,
    live: Option<mpsc::Sender<PortInfo>>,
) -> Vec<PortInfo> {
    let mut ports: Vec<u16> = ports.to_vec();
    ports.sort_unstable();
    ports.dedup();

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut handles = Vec::with_capacity(ports.len());

    for port in ports {
        let sem = Arc::clone(&semaphore);
        let cancel = Arc::clone(cancel);
        let live = live.clone();
        let addr = SocketAddr::new(ip, port);
        let connect_timeout = options.timeout;

        handles.push(tokio::spawn(async move {
            if cancel.is_cancelled() {
                return None;
            }
            let _permit = sem.acquire().await.ok()?;
            if cancel.is_cancelled() {
                return None;
            }

            let info = scan_port(addr, connect_timeout).await;
            if let Some(tx) = live {
                let _ = tx.send(info.clone()).await;
            }
            Some(info)
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        if let Ok(Some(info)) = handle.await {
            results.push(info);
        }
    }
    results.sort_by_key(|p| p.port);

    debug!(
        %ip,
        open = results.iter().filter(|p| p.state == PortState::Open).count(),
        total = results.len(),
        "port scan finished"
    );
    results
}

/// Probe one port, grabbing a banner and TLS details when it is open.
async fn scan_port(addr: SocketAddr, connect_timeout: Duration) -> PortInfo {
    let port = addr.port();
    let start = Instant::now();

    let (state, banner, tls_cert) = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            // Banner grabbing runs on whatever connect left of the
            // budget, with a 200ms floor.
            let remaining = connect_timeout.saturating_sub(start.elapsed());
            let remaining = remaining.max(Duration::from_millis(200));
            let (banner, tls_cert) = grab_banner_and_tls(stream, remaining).await;
            (PortState::Open, banner, tls_cert)
        }
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => (PortState::Closed, None, None),
        // Timeouts and reachability errors look the same from outside.
        Ok(Err(_)) | Err(_) => (PortState::Filtered, None, None),
    };

    PortInfo {
        port,
        state,
        service: get_service_name(port).map(String::from),
        banner,
        tls_cert,
    }
}

async fn grab_banner_and_tls(
    stream: TcpStream,
    timeout_duration: Duration,
) -> (Option<String>, Option<TlsCertInfo>) {
    let port = match stream.peer_addr() {
        Ok(addr) => addr.port(),
        Err(_) => return (None, None),
    };

    if is_tls_port(port) {
        return grab_tls_info(stream, timeout_duration).await;
    }
    if is_http_port(port) {
        return (grab_http_banner(stream, timeout_duration).await, None);
    }
    if port == 554 {
        return (grab_rtsp_banner(stream, timeout_duration).await, None);
    }

    // SSH, FTP, SMTP and friends greet first.
    (grab_raw_banner(stream, timeout_duration).await, None)
}

/// TLS handshake with an accept-all verifier, purely to read the leaf
/// certificate and probe for an HTTPS Server header.
async fn grab_tls_info(
    stream: TcpStream,
    timeout_duration: Duration,
) -> (Option<String>, Option<TlsCertInfo>) {
    let addr = match stream.peer_addr() {
        Ok(a) => a,
        Err(_) => return (None, None),
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config =
        match ClientConfig::builder_with_provider(provider).with_safe_default_protocol_versions() {
            Ok(builder) => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
                .with_no_client_auth(),
            Err(_) => return (None, None),
        };
    let connector = TlsConnector::from(Arc::new(config));

    // Scanning by IP, so the SNI is the address itself.
    let server_name = ServerName::from(rustls::pki_types::IpAddr::from(addr.ip()));

    let tls_stream = match timeout(timeout_duration, connector.connect(server_name, stream)).await {
        Ok(Ok(s)) => s,
        _ => return (None, None),
    };

    let tls_cert = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|cert| parse_x509_cert(cert.as_ref()));

    let banner = grab_http_banner_tls(tls_stream, timeout_duration).await;
    (banner, tls_cert)
}

/// Pull CN, issuer CN, and SANs out of a DER-encoded certificate.
fn parse_x509_cert(der: &[u8]) -> Option<TlsCertInfo> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(String::from);

    let subject_alt_names = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    x509_parser::extensions::GeneralName::DNSName(dns) => Some((*dns).to_string()),
                    x509_parser::extensions::GeneralName::IPAddress(ip_bytes) => {
                        match ip_bytes.len() {
                            4 => Some(format!(
                                "{}.{}.{}.{}",
                                ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]
                            )),
                            16 => {
                                let addr = std::net::Ipv6Addr::from(
                                    <[u8; 16]>::try_from(*ip_bytes).ok()?,
                                );
                                Some(addr.to_string())
                            }
                            _ => None,
                        }
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let issuer = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(String::from);

    let is_self_signed = cert.subject() == cert.issuer();

    Some(TlsCertInfo {
        common_name,
        issuer,
        subject_alt_names,
        is_self_signed,
    })
}

async fn grab_http_banner(mut stream: TcpStream, timeout_duration: Duration) -> Option<String> {
    let host = stream.peer_addr().ok()?.ip().to_string();
    let request = format!("HEAD / HTTP/1.0\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.ok()?;
    extract_server_header(stream, timeout_duration).await
}

async fn grab_http_banner_tls(
    mut stream: tokio_rustls::client::TlsStream<TcpStream>,
    timeout_duration: Duration,
) -> Option<String> {
    let host = stream.get_ref().0.peer_addr().ok()?.ip().to_string();
    let request = format!("HEAD / HTTP/1.0\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.ok()?;
    extract_server_header(stream, timeout_duration).await
}

/// Read HTTP-style response headers; prefer the Server header, fall
/// back to the status line.
async fn extract_server_header<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    timeout_duration: Duration,
) -> Option<String> {
    let mut reader = BufReader::new(reader);
    let mut status_line: Option<String> = None;
    let mut server: Option<String> = None;

    for _ in 0..20 {
        let mut line = String::new();
        match timeout(timeout_duration, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    break;
                }
                if status_line.is_none() {
                    status_line = Some(trimmed.to_string());
                } else if trimmed.to_ascii_lowercase().starts_with("server:") {
                    server = Some(trimmed[7..].trim().to_string());
                }
            }
            _ => break,
        }
    }

    server.or(status_line)
}

async fn grab_rtsp_banner(mut stream: TcpStream, timeout_duration: Duration) -> Option<String> {
    let addr = stream.peer_addr().ok()?;
    let request = format!(
        "OPTIONS rtsp://{}:{} RTSP/1.0\r\nCSeq: 1\r\n\r\n",
        addr.ip(),
        addr.port()
    );
    stream.write_all(request.as_bytes()).await.ok()?;
    extract_server_header(stream, timeout_duration).await
}

async fn grab_raw_banner(stream: TcpStream, timeout_duration: Duration) -> Option<String> {
    let mut reader = BufReader::new(stream);
    let mut banner = String::new();

    match timeout(timeout_duration, reader.read_line(&mut banner)).await {
        Ok(Ok(_)) => {
            let banner = banner.trim().to_string();
            if banner.is_empty() {
                None
            } else {
                Some(banner.chars().take(200).collect())
            }
        }
        _ => None,
    }
}

/// Accepts every certificate so the handshake succeeds and the chain
/// can be inspected. Never used for anything trust-bearing.
#[derive(Debug)]
struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_single_port() {
        assert_eq!(parse_port_range("80").unwrap(), vec![80]);
    }

    #[test]
    fn test_parse_port_list() {
        assert_eq!(parse_port_range("80,443,8080").unwrap(), vec![80, 443, 8080]);
    }

    #[test]
    fn test_parse_range_and_mixed() {
        assert_eq!(parse_port_range("1-5").unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(
            parse_port_range("22, 80-82, 443").unwrap(),
            vec![22, 80, 81, 82, 443]
        );
    }

    #[test]
    fn test_parse_deduplicates() {
        assert_eq!(parse_port_range("80,80,79-81").unwrap(), vec![79, 80, 81]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_port_range("abc").is_err());
        assert!(parse_port_range("100-1").is_err());
        assert!(parse_port_range("0").is_err());
        assert!(parse_port_range("").is_err());
        assert!(parse_port_range("70000").is_err());
    }

    #[test]
    fn test_get_service_name() {
        assert_eq!(get_service_name(22), Some("ssh"));
        assert_eq!(get_service_name(9100), Some("jetdirect"));
        assert_eq!(get_service_name(12345), None);
    }

    #[tokio::test]
    async fn test_scan_reports_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        // Listener that never answers, so the banner read just times out.
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 256];
                let _ = sock.read(&mut buf).await;
            }
        });

        // An ephemeral port we know nothing listens on.
        let closed_port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let cancel = Arc::new(CancelState::new());
        let options = ScanOptions {
            timeout: Duration::from_millis(500),
            concurrency: 4,
        };
        let results = scan_host(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &[open_port, closed_port],
            &options,
            &cancel,
            None,
        )
        .await;

        assert_eq!(results.len(), 2);
        let by_port = |p: u16| results.iter().find(|r| r.port == p).unwrap();
        assert_eq!(by_port(open_port).state, PortState::Open);
        assert_eq!(by_port(closed_port).state, PortState::Closed);
    }

    #[tokio::test]
    async fn test_live_channel_receives_results() {
        let closed_port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = Arc::new(CancelState::new());
        let options = ScanOptions {
            timeout: Duration::from_millis(300),
            concurrency: 4,
        };
        let results = scan_host(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &[closed_port],
            &options,
            &cancel,
            Some(tx),
        )
        .await;

        assert_eq!(results.len(), 1);
        let live = rx.recv().await.unwrap();
        assert_eq!(live.port, closed_port);
        assert_eq!(live.state, PortState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_scan_yields_nothing_new() {
        let cancel = Arc::new(CancelState::new());
        cancel.cancel();
        let results = scan_host(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &[1, 2, 3],
            &ScanOptions::default(),
            &cancel,
            None,
        )
        .await;
        assert!(results.is_empty());
    }
}
