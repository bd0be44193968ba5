//! 线程版代理桩：SOCKS5 / HTTP CONNECT，可选代理端 TLS，隧道建立后回显或终结目的端 TLS 再回显。
//!
//! 每个连接观察到的握手字节记录在 `requests()`；目的端 TLS 的 SNI/ALPN 记录在
//! `destination_tls()`，在回显开始之前写入，因此一次往返之后必然可见。

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rustls::{ServerConfig, ServerConnection, StreamOwned};

#[derive(Clone)]
pub enum Upstream {
    /// 明文回显
    Echo,
    /// 在隧道内终结目的端 TLS 后回显
    TlsEcho(Arc<ServerConfig>),
    /// 隧道建立后不再发送任何字节
    Hang,
}

#[derive(Clone)]
enum Flavor {
    Socks5 {
        credentials: Option<(String, String)>,
        reply: u8,
        bound_domain: Option<String>,
    },
    Http {
        status: u16,
        reason: String,
        body: String,
        expected_auth: Option<String>,
        raw: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Observed {
    pub proxy_sni: Option<String>,
    pub greeting: Vec<u8>,
    pub auth: Option<(String, String)>,
    pub atyp: Option<u8>,
    pub destination: String,
    pub port: u16,
    pub head: String,
}

#[derive(Debug, Clone, Default)]
pub struct DestinationTls {
    pub sni: Option<String>,
    pub alpn: Option<Vec<u8>>,
}

#[derive(Default)]
struct Log {
    requests: Mutex<Vec<Observed>>,
    destination_tls: Mutex<Vec<DestinationTls>>,
}

impl Log {
    fn push(&self, obs: &Observed) {
        self.requests.lock().unwrap().push(obs.clone());
    }
}

#[derive(Clone)]
struct Behavior {
    flavor: Flavor,
    proxy_tls: Option<Arc<ServerConfig>>,
    upstream: Upstream,
    drop_first: usize,
    silent: bool,
}

pub struct MockProxyBuilder {
    behavior: Behavior,
}

impl MockProxyBuilder {
    pub fn credentials(mut self, user: &str, pass: &str) -> Self {
        match &mut self.behavior.flavor {
            Flavor::Socks5 { credentials, .. } => {
                *credentials = Some((user.to_string(), pass.to_string()))
            }
            Flavor::Http { expected_auth, .. } => {
                use base64::Engine;
                let token = base64::engine::general_purpose::STANDARD
                    .encode(format!("{user}:{pass}"));
                *expected_auth = Some(format!("Basic {token}"));
            }
        }
        self
    }

    /// SOCKS5 CONNECT 应答码
    pub fn reply(mut self, code: u8) -> Self {
        if let Flavor::Socks5 { reply, .. } = &mut self.behavior.flavor {
            *reply = code;
        }
        self
    }

    /// SOCKS5 应答使用域名类型的绑定地址
    pub fn bound_domain(mut self, name: &str) -> Self {
        if let Flavor::Socks5 { bound_domain, .. } = &mut self.behavior.flavor {
            *bound_domain = Some(name.to_string());
        }
        self
    }

    pub fn status(mut self, code: u16, text: &str) -> Self {
        if let Flavor::Http { status, reason, .. } = &mut self.behavior.flavor {
            *status = code;
            *reason = text.to_string();
        }
        self
    }

    pub fn body(mut self, text: &str) -> Self {
        if let Flavor::Http { body, .. } = &mut self.behavior.flavor {
            *body = text.to_string();
        }
        self
    }

    /// 读完 CONNECT 请求头后原样写回这些字节并关闭
    pub fn raw_response(mut self, bytes: &[u8]) -> Self {
        if let Flavor::Http { raw, .. } = &mut self.behavior.flavor {
            *raw = Some(bytes.to_vec());
        }
        self
    }

    pub fn proxy_tls(mut self, cfg: Arc<ServerConfig>) -> Self {
        self.behavior.proxy_tls = Some(cfg);
        self
    }

    pub fn upstream(mut self, upstream: Upstream) -> Self {
        self.behavior.upstream = upstream;
        self
    }

    /// 前 n 个连接接受后立即关闭
    pub fn drop_first(mut self, n: usize) -> Self {
        self.behavior.drop_first = n;
        self
    }

    /// 接受连接但从不应答
    pub fn silent(mut self) -> Self {
        self.behavior.silent = true;
        self
    }

    pub fn spawn(self) -> MockProxy {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock proxy");
        let addr = listener.local_addr().expect("local addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Log::default());

        let behavior = Arc::new(self.behavior);
        let counter = accepted.clone();
        let shared_log = log.clone();
        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(sock) = conn else { continue };
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= behavior.drop_first {
                    let _ = sock.shutdown(std::net::Shutdown::Both);
                    continue;
                }
                let behavior = behavior.clone();
                let log = shared_log.clone();
                thread::spawn(move || {
                    let _ = handle(sock, &behavior, &log);
                });
            }
        });

        MockProxy { addr, accepted, log }
    }
}

pub struct MockProxy {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    log: Arc<Log>,
}

impl MockProxy {
    pub fn socks5() -> MockProxyBuilder {
        MockProxyBuilder {
            behavior: Behavior {
                flavor: Flavor::Socks5 {
                    credentials: None,
                    reply: 0,
                    bound_domain: None,
                },
                proxy_tls: None,
                upstream: Upstream::Echo,
                drop_first: 0,
                silent: false,
            },
        }
    }

    pub fn http() -> MockProxyBuilder {
        MockProxyBuilder {
            behavior: Behavior {
                flavor: Flavor::Http {
                    status: 200,
                    reason: "Connection established".to_string(),
                    body: String::new(),
                    expected_auth: None,
                    raw: None,
                },
                proxy_tls: None,
                upstream: Upstream::Echo,
                drop_first: 0,
                silent: false,
            },
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Observed> {
        self.log.requests.lock().unwrap().clone()
    }

    /// 轮询直到至少记录了 n 个握手（最多 2 秒）
    pub fn wait_for_requests(&self, n: usize) -> Vec<Observed> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let seen = self.requests();
            if seen.len() >= n || Instant::now() > deadline {
                return seen;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn destination_tls(&self) -> Vec<DestinationTls> {
        self.log.destination_tls.lock().unwrap().clone()
    }
}

fn handle(sock: TcpStream, behavior: &Behavior, log: &Log) -> io::Result<()> {
    if behavior.silent {
        thread::sleep(Duration::from_secs(10));
        return Ok(());
    }
    sock.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut obs = Observed::default();
    match &behavior.proxy_tls {
        Some(cfg) => {
            let (tls, sni, _) = accept_tls(cfg.clone(), sock)?;
            obs.proxy_sni = sni;
            serve(tls, behavior, obs, log)
        }
        None => serve(sock, behavior, obs, log),
    }
}

fn serve<S: Read + Write>(
    mut stream: S,
    behavior: &Behavior,
    mut obs: Observed,
    log: &Log,
) -> io::Result<()> {
    let open = match &behavior.flavor {
        Flavor::Socks5 {
            credentials,
            reply,
            bound_domain,
        } => serve_socks5(&mut stream, credentials, *reply, bound_domain, &mut obs, log)?,
        Flavor::Http {
            status,
            reason,
            body,
            expected_auth,
            raw,
        } => serve_http(
            &mut stream,
            (*status, reason, body),
            expected_auth,
            raw,
            &mut obs,
            log,
        )?,
    };
    if !open {
        return Ok(());
    }

    match &behavior.upstream {
        Upstream::Echo => echo(&mut stream),
        Upstream::Hang => {
            thread::sleep(Duration::from_secs(10));
            Ok(())
        }
        Upstream::TlsEcho(cfg) => {
            let (mut tls, sni, alpn) = accept_tls(cfg.clone(), &mut stream)?;
            log.destination_tls
                .lock()
                .unwrap()
                .push(DestinationTls { sni, alpn });
            echo(&mut tls)
        }
    }
}

fn serve_socks5<S: Read + Write>(
    s: &mut S,
    credentials: &Option<(String, String)>,
    reply: u8,
    bound_domain: &Option<String>,
    obs: &mut Observed,
    log: &Log,
) -> io::Result<bool> {
    let mut head = [0u8; 2];
    s.read_exact(&mut head)?;
    let mut methods = vec![0u8; head[1] as usize];
    s.read_exact(&mut methods)?;
    obs.greeting = [head.to_vec(), methods.clone()].concat();

    let method = match credentials {
        Some(_) if methods.contains(&0x02) => 0x02,
        None if methods.contains(&0x00) => 0x00,
        _ => 0xFF,
    };
    if method == 0xFF {
        log.push(obs);
    }
    s.write_all(&[0x05, method])?;
    s.flush()?;
    if method == 0xFF {
        return Ok(false);
    }

    if method == 0x02 {
        let mut ver_len = [0u8; 2];
        s.read_exact(&mut ver_len)?;
        let mut user = vec![0u8; ver_len[1] as usize];
        s.read_exact(&mut user)?;
        let mut plen = [0u8; 1];
        s.read_exact(&mut plen)?;
        let mut pass = vec![0u8; plen[0] as usize];
        s.read_exact(&mut pass)?;
        let got = (
            String::from_utf8_lossy(&user).to_string(),
            String::from_utf8_lossy(&pass).to_string(),
        );
        let ok = credentials.as_ref() == Some(&got);
        obs.auth = Some(got);
        if !ok {
            log.push(obs);
        }
        s.write_all(&[0x01, if ok { 0x00 } else { 0x01 }])?;
        s.flush()?;
        if !ok {
            return Ok(false);
        }
    }

    let mut req = [0u8; 4];
    s.read_exact(&mut req)?;
    obs.atyp = Some(req[3]);
    obs.destination = match req[3] {
        0x01 => {
            let mut b = [0u8; 4];
            s.read_exact(&mut b)?;
            Ipv4Addr::from(b).to_string()
        }
        0x04 => {
            let mut b = [0u8; 16];
            s.read_exact(&mut b)?;
            Ipv6Addr::from(b).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            s.read_exact(&mut len)?;
            let mut name = vec![0u8; len[0] as usize];
            s.read_exact(&mut name)?;
            String::from_utf8_lossy(&name).to_string()
        }
        _ => return Ok(false),
    };
    let mut port = [0u8; 2];
    s.read_exact(&mut port)?;
    obs.port = u16::from_be_bytes(port);
    log.push(obs);

    let mut out = vec![0x05, reply, 0x00];
    match bound_domain {
        Some(name) => {
            out.push(0x03);
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
        }
        None => out.extend_from_slice(&[0x01, 127, 0, 0, 1]),
    }
    out.extend_from_slice(&8080u16.to_be_bytes());
    s.write_all(&out)?;
    s.flush()?;
    Ok(reply == 0)
}

fn serve_http<S: Read + Write>(
    s: &mut S,
    (status, reason, body): (u16, &String, &String),
    expected_auth: &Option<String>,
    raw: &Option<Vec<u8>>,
    obs: &mut Observed,
    log: &Log,
) -> io::Result<bool> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 64 * 1024 {
            return Ok(false);
        }
        s.read_exact(&mut byte)?;
        head.push(byte[0]);
    }
    obs.head = String::from_utf8_lossy(&head).to_string();
    if let Some(line) = obs.head.lines().next() {
        if let Some(authority) = line.split_whitespace().nth(1) {
            if let Some((host, port)) = authority.rsplit_once(':') {
                obs.destination = host.trim_matches(|c| c == '[' || c == ']').to_string();
                obs.port = port.parse().unwrap_or(0);
            }
        }
    }
    log.push(obs);

    if let Some(raw) = raw {
        s.write_all(raw)?;
        s.flush()?;
        return Ok(false);
    }

    let authorized = expected_auth.as_ref().map_or(true, |expected| {
        obs.head
            .lines()
            .any(|l| l.eq_ignore_ascii_case(&format!("Proxy-Authorization: {expected}")))
    });
    let (status, reason, body) = if authorized {
        (status, reason.as_str(), body.as_str())
    } else {
        (407, "Proxy Authentication Required", "")
    };

    let response = if (200..300).contains(&status) {
        format!("HTTP/1.1 {status} {reason}\r\n\r\n")
    } else {
        format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{body}",
            body.len()
        )
    };
    s.write_all(response.as_bytes())?;
    s.flush()?;
    Ok((200..300).contains(&status))
}

fn accept_tls<S: Read + Write>(
    cfg: Arc<ServerConfig>,
    mut io: S,
) -> io::Result<(StreamOwned<ServerConnection, S>, Option<String>, Option<Vec<u8>>)> {
    let mut conn = ServerConnection::new(cfg)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    while conn.is_handshaking() {
        conn.complete_io(&mut io)?;
    }
    let sni = conn.server_name().map(str::to_string);
    let alpn = conn.alpn_protocol().map(<[u8]>::to_vec);
    Ok((StreamOwned::new(conn, io), sni, alpn))
}

fn echo<S: Read + Write>(s: &mut S) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = match s.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        s.write_all(&buf[..n])?;
        s.flush()?;
    }
}
