//! SOCKS5 handshake engine (RFC 1928 CONNECT, RFC 1929 username/password)
//!
//! The negotiation itself is a synchronous state machine ([`Negotiation`]) that produces the
//! exact request bytes and validates every reply. Two thin drivers move those bytes over a
//! blocking `Read + Write` stream or an `AsyncRead + AsyncWrite` stream.
//!
//! # Protocol flow
//!
//! 1. Greeting `05 NMETHODS METHODS..`, method reply `05 M`
//! 2. Optional subnegotiation `01 ULEN UNAME PLEN PASSWD`, reply `VER STATUS`
//! 3. CONNECT `05 01 00 ATYP DST.ADDR DST.PORT`
//! 4. Reply `05 REP 00 ATYP BND.ADDR BND.PORT`, address length depending on ATYP

use std::fmt;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::errors::{HandshakeCode, Phase, Socks5Reply, TunnelError};
use super::lookup::{self, LookupResult};
use super::target::{Credentials, ProxyTarget, TunnelRequest};

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// Method: no authentication
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Method: username/password
pub const METHOD_USERNAME_PASSWORD: u8 = 0x02;

/// Method: no acceptable methods
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password subnegotiation version
pub const AUTH_SUBNEG_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;

/// Handshake progress. `Failed` is terminal and reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    Init,
    GreetingSent,
    MethodChosen,
    AuthSent,
    AuthResult,
    ConnectSent,
    ReplyReceived,
    Established,
    Failed,
}

impl fmt::Display for Socks5State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Socks5State::Init => "init",
            Socks5State::GreetingSent => "greeting_sent",
            Socks5State::MethodChosen => "method_chosen",
            Socks5State::AuthSent => "auth_sent",
            Socks5State::AuthResult => "auth_result",
            Socks5State::ConnectSent => "connect_sent",
            Socks5State::ReplyReceived => "reply_received",
            Socks5State::Established => "established",
            Socks5State::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Destination address as placed in the CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationAddr {
    Ip(IpAddr),
    Domain(String),
}

/// `BND.ADDR`/`BND.PORT` from a successful CONNECT reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddr::Ip(addr) => write!(f, "{addr}"),
            BoundAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Number of `BND.ADDR` bytes that follow the reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrLen {
    Fixed(usize),
    /// One length byte follows, then that many domain bytes.
    Prefixed,
}

/// `05 NMETHODS METHODS..`; method `02` is only offered when credentials are present.
pub fn encode_greeting(with_credentials: bool) -> Vec<u8> {
    if with_credentials {
        vec![SOCKS5_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USERNAME_PASSWORD]
    } else {
        vec![SOCKS5_VERSION, 0x01, METHOD_NO_AUTH]
    }
}

/// `01 ULEN UNAME PLEN PASSWD`
pub fn encode_auth(credentials: &Credentials) -> Result<Vec<u8>, TunnelError> {
    let user = credentials.username.as_bytes();
    let pass = credentials.password.as_bytes();
    if user.is_empty() || user.len() > 255 {
        return Err(TunnelError::config("Username must be 1-255 bytes"));
    }
    if pass.len() > 255 {
        return Err(TunnelError::config("Password too long (max 255 bytes)"));
    }

    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(AUTH_SUBNEG_VERSION);
    request.push(user.len() as u8);
    request.extend_from_slice(user);
    request.push(pass.len() as u8);
    request.extend_from_slice(pass);
    Ok(request)
}

/// `05 01 00 ATYP DST.ADDR DST.PORT`
pub fn encode_connect(addr: &DestinationAddr, port: u16) -> Result<Vec<u8>, TunnelError> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match addr {
        DestinationAddr::Ip(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        DestinationAddr::Ip(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        DestinationAddr::Domain(host) => {
            let bytes = host.as_bytes();
            if bytes.is_empty() || bytes.len() > 255 {
                return Err(TunnelError::config("Hostname must be 1-255 bytes"));
            }
            request.push(ATYP_DOMAIN);
            request.push(bytes.len() as u8);
            request.extend_from_slice(bytes);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

/// Decode `BND.ADDR` (without the domain length prefix) followed by the two port bytes.
pub fn decode_bound_addr(atyp: u8, bytes: &[u8]) -> Result<BoundAddr, TunnelError> {
    let short = || {
        TunnelError::protocol(
            HandshakeCode::Socks5AddressType(atyp),
            format!("Bound address truncated ({} bytes)", bytes.len()),
        )
    };
    if bytes.len() < 2 {
        return Err(short());
    }
    let (addr, port) = bytes.split_at(bytes.len() - 2);
    let port = u16::from_be_bytes([port[0], port[1]]);
    match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = addr.try_into().map_err(|_| short())?;
            Ok(BoundAddr::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port)))
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = addr.try_into().map_err(|_| short())?;
            Ok(BoundAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port)))
        }
        ATYP_DOMAIN => Ok(BoundAddr::Domain(
            String::from_utf8_lossy(addr).into_owned(),
            port,
        )),
        other => Err(TunnelError::protocol(
            HandshakeCode::Socks5AddressType(other),
            format!("Unknown address type in reply: 0x{other:02x}"),
        )),
    }
}

/// Byte-level negotiation state machine shared by both drivers.
#[derive(Debug)]
pub struct Negotiation<'a> {
    credentials: Option<&'a Credentials>,
    state: Socks5State,
    reply_atyp: u8,
}

impl<'a> Negotiation<'a> {
    pub fn new(credentials: Option<&'a Credentials>) -> Self {
        Self {
            credentials,
            state: Socks5State::Init,
            reply_atyp: 0,
        }
    }

    pub fn state(&self) -> Socks5State {
        self.state
    }

    fn fail(&mut self, err: TunnelError) -> TunnelError {
        tracing::debug!(state = %self.state, error = %err, "SOCKS5 negotiation failed");
        self.state = Socks5State::Failed;
        err
    }

    pub fn greeting(&mut self) -> Vec<u8> {
        let greeting = encode_greeting(self.credentials.is_some());
        self.state = Socks5State::GreetingSent;
        tracing::debug!(methods = ?&greeting[2..], "Sent SOCKS5 greeting");
        greeting
    }

    /// Handle `VER METHOD`. Returns the subnegotiation request when `02` was selected.
    pub fn on_method_reply(&mut self, reply: [u8; 2]) -> Result<Option<Vec<u8>>, TunnelError> {
        let [version, method] = reply;
        if version != SOCKS5_VERSION {
            return Err(self.fail(TunnelError::protocol(
                HandshakeCode::Socks5Version(version),
                format!("Invalid SOCKS version from proxy: expected 0x05, got 0x{version:02x}"),
            )));
        }
        self.state = Socks5State::MethodChosen;
        tracing::debug!(method = method, "SOCKS5 server chose authentication method");

        match (method, self.credentials) {
            (METHOD_NO_AUTH, _) => Ok(None),
            (METHOD_USERNAME_PASSWORD, Some(creds)) => {
                let request = encode_auth(creds).map_err(|e| self.fail(e))?;
                self.state = Socks5State::AuthSent;
                tracing::debug!(
                    username_len = creds.username.len(),
                    "Sent username/password authentication"
                );
                Ok(Some(request))
            }
            (METHOD_NO_ACCEPTABLE, _) => Err(self.fail(TunnelError::auth(
                "No acceptable authentication methods",
            ))),
            (other, _) => Err(self.fail(TunnelError::protocol(
                HandshakeCode::Socks5Method(other),
                format!("Proxy selected a method that was not offered: 0x{other:02x}"),
            ))),
        }
    }

    /// Handle the subnegotiation `VER STATUS`; any non-zero status is an authentication failure.
    pub fn on_auth_reply(&mut self, reply: [u8; 2]) -> Result<(), TunnelError> {
        let [version, status] = reply;
        self.state = Socks5State::AuthResult;
        if version != AUTH_SUBNEG_VERSION {
            // Several servers answer with 05 here; only the status byte is normative.
            tracing::debug!(version = version, "Unexpected auth subnegotiation version");
        }
        if status != 0x00 {
            return Err(self.fail(TunnelError::auth(format!(
                "Authentication failed: status 0x{status:02x}"
            ))));
        }
        tracing::debug!("Username/password authentication successful");
        Ok(())
    }

    pub fn connect_request(
        &mut self,
        addr: &DestinationAddr,
        port: u16,
    ) -> Result<Vec<u8>, TunnelError> {
        let request = encode_connect(addr, port).map_err(|e| self.fail(e))?;
        self.state = Socks5State::ConnectSent;
        Ok(request)
    }

    /// Validate `VER REP RSV ATYP` and report how many address bytes follow.
    pub fn on_reply_header(&mut self, header: [u8; 4]) -> Result<AddrLen, TunnelError> {
        let [version, rep, _rsv, atyp] = header;
        self.state = Socks5State::ReplyReceived;
        if version != SOCKS5_VERSION {
            return Err(self.fail(TunnelError::protocol(
                HandshakeCode::Socks5Version(version),
                format!("Invalid SOCKS version in reply: expected 0x05, got 0x{version:02x}"),
            )));
        }
        if rep != REP_SUCCESS {
            let reply = Socks5Reply::from_code(rep);
            return Err(self.fail(TunnelError::protocol(
                HandshakeCode::Socks5Reply(reply),
                format!("{} (code 0x{rep:02x})", reply.description()),
            )));
        }
        self.reply_atyp = atyp;
        match atyp {
            ATYP_IPV4 => Ok(AddrLen::Fixed(4)),
            ATYP_IPV6 => Ok(AddrLen::Fixed(16)),
            ATYP_DOMAIN => Ok(AddrLen::Prefixed),
            other => Err(self.fail(TunnelError::protocol(
                HandshakeCode::Socks5AddressType(other),
                format!("Unknown address type in reply: 0x{other:02x}"),
            ))),
        }
    }

    /// Consume `BND.ADDR BND.PORT`; the tunnel is established afterwards.
    pub fn on_bound_addr(&mut self, bytes: &[u8]) -> Result<BoundAddr, TunnelError> {
        let bound = decode_bound_addr(self.reply_atyp, bytes).map_err(|e| self.fail(e))?;
        self.state = Socks5State::Established;
        Ok(bound)
    }
}

/// Pick the CONNECT address: IP literals as-is, names resolved by the proxy on `socks5h` and
/// locally on `socks5`, the local lookup bounded by `budget`.
pub fn resolve_destination(
    target: &ProxyTarget,
    request: &TunnelRequest,
    budget: Duration,
) -> Result<DestinationAddr, TunnelError> {
    if let Some(ip) = request.ip() {
        return Ok(DestinationAddr::Ip(ip));
    }
    if target.scheme().remote_dns() {
        return Ok(DestinationAddr::Domain(request.host.clone()));
    }
    let resolved = lookup::lookup_blocking(&request.host, request.port, budget)?;
    first_addr(request, resolved)
}

pub async fn resolve_destination_async(
    target: &ProxyTarget,
    request: &TunnelRequest,
    budget: Duration,
) -> Result<DestinationAddr, TunnelError> {
    if let Some(ip) = request.ip() {
        return Ok(DestinationAddr::Ip(ip));
    }
    if target.scheme().remote_dns() {
        return Ok(DestinationAddr::Domain(request.host.clone()));
    }
    let resolved = lookup::lookup_async(&request.host, request.port, budget).await?;
    first_addr(request, resolved)
}

fn lookup_error(request: &TunnelRequest, e: std::io::Error) -> TunnelError {
    TunnelError::DestinationLookup {
        host: request.host.clone(),
        reason: e.to_string(),
    }
}

fn first_addr(
    request: &TunnelRequest,
    resolved: LookupResult,
) -> Result<DestinationAddr, TunnelError> {
    let addrs = resolved.map_err(|e| lookup_error(request, e))?;
    addrs
        .first()
        .map(|a: &SocketAddr| DestinationAddr::Ip(a.ip()))
        .ok_or_else(|| TunnelError::DestinationLookup {
            host: request.host.clone(),
            reason: "no addresses returned".to_string(),
        })
}

/// [`resolve_destination`] under `resolve_budget`, then [`negotiate`].
pub fn handshake<S: Read + Write>(
    stream: &mut S,
    target: &ProxyTarget,
    request: &TunnelRequest,
    resolve_budget: Duration,
) -> Result<BoundAddr, TunnelError> {
    let dest = resolve_destination(target, request, resolve_budget)?;
    negotiate(stream, target, request, &dest)
}

/// Run the negotiation over a blocking stream. Read/write deadlines must already be set on the
/// underlying socket.
pub fn negotiate<S: Read + Write>(
    stream: &mut S,
    target: &ProxyTarget,
    request: &TunnelRequest,
    dest: &DestinationAddr,
) -> Result<BoundAddr, TunnelError> {
    let start = Instant::now();
    let io_err = |e: std::io::Error| TunnelError::from_io(Phase::Handshake, &e, start.elapsed());

    let mut nego = Negotiation::new(target.credentials());

    stream.write_all(&nego.greeting()).map_err(io_err)?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).map_err(io_err)?;

    if let Some(auth) = nego.on_method_reply(reply)? {
        stream.write_all(&auth).map_err(io_err)?;
        stream.read_exact(&mut reply).map_err(io_err)?;
        nego.on_auth_reply(reply)?;
    }

    stream
        .write_all(&nego.connect_request(dest, request.port)?)
        .map_err(io_err)?;
    stream.flush().map_err(io_err)?;
    tracing::debug!(
        target.host = %request.host,
        target.port = request.port,
        "Sent SOCKS5 connect request"
    );

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).map_err(io_err)?;
    let len = match nego.on_reply_header(header)? {
        AddrLen::Fixed(n) => n,
        AddrLen::Prefixed => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).map_err(io_err)?;
            len[0] as usize
        }
    };
    let mut rest = vec![0u8; len + 2];
    stream.read_exact(&mut rest).map_err(io_err)?;
    let bound = nego.on_bound_addr(&rest)?;

    tracing::debug!(
        bound = %bound,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "SOCKS5 connect reply: success"
    );
    Ok(bound)
}

/// Async twin of [`handshake`].
pub async fn handshake_async<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    target: &ProxyTarget,
    request: &TunnelRequest,
    resolve_budget: Duration,
) -> Result<BoundAddr, TunnelError> {
    let dest = resolve_destination_async(target, request, resolve_budget).await?;
    negotiate_async(stream, target, request, &dest).await
}

/// Async twin of [`negotiate`]. The caller bounds it with the handshake deadline.
pub async fn negotiate_async<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    target: &ProxyTarget,
    request: &TunnelRequest,
    dest: &DestinationAddr,
) -> Result<BoundAddr, TunnelError> {
    let start = Instant::now();
    let io_err = |e: std::io::Error| TunnelError::from_io(Phase::Handshake, &e, start.elapsed());

    let mut nego = Negotiation::new(target.credentials());

    stream.write_all(&nego.greeting()).await.map_err(io_err)?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(io_err)?;

    if let Some(auth) = nego.on_method_reply(reply)? {
        stream.write_all(&auth).await.map_err(io_err)?;
        stream.read_exact(&mut reply).await.map_err(io_err)?;
        nego.on_auth_reply(reply)?;
    }

    let connect = nego.connect_request(dest, request.port)?;
    stream.write_all(&connect).await.map_err(io_err)?;
    stream.flush().await.map_err(io_err)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(io_err)?;
    let len = match nego.on_reply_header(header)? {
        AddrLen::Fixed(n) => n,
        AddrLen::Prefixed => stream.read_u8().await.map_err(io_err)? as usize,
    };
    let mut rest = vec![0u8; len + 2];
    stream.read_exact(&mut rest).await.map_err(io_err)?;
    let bound = nego.on_bound_addr(&rest)?;

    tracing::debug!(
        bound = %bound,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "SOCKS5 connect reply: success"
    );
    Ok(bound)
}
