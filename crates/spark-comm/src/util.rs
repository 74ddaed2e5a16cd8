use crate::channel::Family;
use crate::error::ComError;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

pub(crate) const INVALID_ADDRESS: &str = "INVALID IP ADDRESS OR DOMAIN NAME";
pub(crate) const INVALID_PORT: &str = "INVALID PORT NUMBER";
pub(crate) const INVALID_REQUEST: &str = "INVALID COMCTL REQUEST";

/// 控制请求首段动词的最大长度。
const VERB_LIMIT: usize = 13;

/// 解析十进制端口；必须全为数字且不超过 65535。
pub(crate) fn parse_port(text: &str) -> Result<u16, ComError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ComError::operation(INVALID_PORT));
    }
    text.parse::<u16>()
        .map_err(|_| ComError::operation(INVALID_PORT))
}

/// 拆出 `<host> <port>` 两段，允许多余空白。
pub(crate) fn split_host_port(text: &str) -> Result<(&str, &str), ComError> {
    let mut parts = text.split_whitespace();
    let host = parts
        .next()
        .ok_or_else(|| ComError::operation(INVALID_ADDRESS))?;
    let port = parts.next().ok_or_else(|| ComError::operation(INVALID_PORT))?;
    Ok((host, port))
}

/// 按地址族约束解析主机名。
///
/// - `V4` / `V6` 只保留对应族；
/// - `Any` 优先 IPv4，仅在 `allow_ipv6` 打开时接受 IPv6。
pub(crate) fn resolve(
    host: &str,
    port: u16,
    family: Family,
    allow_ipv6: bool,
) -> Result<SocketAddr, ComError> {
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| ComError::operation(INVALID_ADDRESS))?
        .collect();
    let pick = |v4: bool| candidates.iter().copied().find(|addr| addr.is_ipv4() == v4);
    let chosen = match family {
        Family::V4 => pick(true),
        Family::V6 => pick(false),
        Family::Any => pick(true).or_else(|| if allow_ipv6 { pick(false) } else { None }),
    };
    chosen.ok_or_else(|| ComError::operation(INVALID_ADDRESS))
}

/// `"<ip> <port>"`，无地址时为 `"0.0.0.0 0"`。
pub(crate) fn format_addr(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(addr) => format!("{} {}", canonical_ip(addr.ip()), addr.port()),
        None => "0.0.0.0 0".to_string(),
    }
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        other => other,
    }
}

/// 控制请求的首个动词：遇到 `=` 或空白结束，转大写。
pub(crate) struct ControlVerb<'a> {
    pub verb: String,
    /// 动词之后、跳过一个分隔符的剩余文本。
    pub rest: &'a [u8],
}

pub(crate) fn control_verb(request: &[u8]) -> ControlVerb<'_> {
    let end = request
        .iter()
        .position(|&b| b == b'=' || b.is_ascii_whitespace())
        .unwrap_or(request.len());
    let verb = String::from_utf8_lossy(&request[..end]).to_ascii_uppercase();
    let rest = match request.get(end) {
        Some(_) => &request[end + 1..],
        None => &request[request.len()..],
    };
    ControlVerb { verb, rest }
}

/// 通道级 `GETERROR` 系列使用的动词：前 13 个非空白字符，转大写。
pub(crate) fn error_verb(request: &[u8]) -> String {
    let text: Vec<u8> = request
        .iter()
        .take_while(|b| !b.is_ascii_whitespace())
        .take(VERB_LIMIT)
        .map(u8::to_ascii_uppercase)
        .collect();
    String::from_utf8_lossy(&text).into_owned()
}

/// 以原始 errno 判断错误；无法取得 errno 的错误返回 `false`。
pub(crate) fn has_errno(error: &io::Error, errno: i32) -> bool {
    error.raw_os_error() == Some(errno)
}

/// 报文超长（`EMSGSIZE` / `WSAEMSGSIZE`）。
pub(crate) fn is_message_too_long(error: &io::Error) -> bool {
    #[cfg(unix)]
    {
        has_errno(error, nix::errno::Errno::EMSGSIZE as i32)
    }
    #[cfg(windows)]
    {
        has_errno(error, 10040)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = error;
        false
    }
}

/// 非阻塞连接尚在进行中。
pub(crate) fn is_connect_in_progress(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    {
        has_errno(error, nix::errno::Errno::EINPROGRESS as i32)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// 对端断开的写/读错误。
pub(crate) fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}
