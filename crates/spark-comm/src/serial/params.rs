//! 串口参数串与分帧控制请求的解析，与平台无关。

#![cfg_attr(not(unix), allow(dead_code))]

use crate::error::ComError;
use crate::framing::{Framing, format_sequence, parse_sequence};

pub(crate) const BAD_DEVICE_NAME: &str = "BAD DEVICE NAME";
pub(crate) const INVALID_PARAMETERS: &str = "INVALID PARAMETER STRING";
const INVALID_SEQUENCE: &str = "INVALID COMCTL CHARACTER SEQUENCE";
const INVALID_DURING_RECV: &str = "COMCTL INVALID DURING PENDING RECEIVE";
const INVALID_REQUEST: &str = crate::util::INVALID_REQUEST;
const INVALID_OPTION: &str = "INVALID COMCTL OPTION";

/// 参数串中的字段数：波特率、校验、数据位、停止位、五个分帧序列、接收上限。
const FIELD_COUNT: usize = 10;

/// 支持的波特率（即参数串中的数值乘以 100 之后的取值；100 对应 110 波特）。
pub(crate) const BAUD_TABLE: [u32; 13] = [
    100, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Parity {
    None,
    Even,
    Odd,
}

/// 线路设置；`None` 表示保持设备当前值。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct LineSettings {
    pub baud: Option<u32>,
    pub parity: Option<Parity>,
    pub data_bits: Option<u8>,
    pub stop_bits: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SerialParams {
    pub device: String,
    pub line: LineSettings,
    pub framing: Framing,
}

/// 解析 `<device>[:<baud>,<parity>,<data>,<stop>,<instart>,<inend>,<outstart>,<outend>,<ignore>,<limit>]`。
///
/// - 设备名必须以 `/dev/` 开头，遇到空白、`:`、`,`、`;` 结束；
/// - 前四个字段为空时保持设备当前值；分帧字段为空时清空，缺省时保留默认值。
pub(crate) fn parse(args: &str) -> Result<SerialParams, ComError> {
    let args = args.trim_start();
    if !args.starts_with("/dev/") {
        return Err(ComError::operation(BAD_DEVICE_NAME));
    }
    let end = args
        .find(|c: char| c.is_whitespace() || matches!(c, ':' | ',' | ';'))
        .unwrap_or(args.len());
    let device = args[..end].to_string();
    let rest = args[end..].trim();
    let rest = rest.strip_prefix(':').unwrap_or(rest);

    let mut params = SerialParams {
        device,
        line: LineSettings::default(),
        framing: Framing::serial_defaults(),
    };
    if rest.is_empty() {
        return Ok(params);
    }
    let invalid = || ComError::operation(INVALID_PARAMETERS);
    for (index, field) in rest.splitn(FIELD_COUNT, ',').enumerate() {
        match index {
            0 if !field.is_empty() => {
                let baud = atoi(field).saturating_mul(100);
                if baud != 0 {
                    if !BAUD_TABLE.contains(&baud) {
                        return Err(invalid());
                    }
                    params.line.baud = Some(baud);
                }
            }
            1 if !field.is_empty() => {
                params.line.parity = Some(match field.as_bytes()[0].to_ascii_uppercase() {
                    b'N' => Parity::None,
                    b'E' => Parity::Even,
                    b'O' => Parity::Odd,
                    _ => return Err(invalid()),
                });
            }
            2 if !field.is_empty() => match atoi(field) {
                bits @ 5..=8 => params.line.data_bits = Some(bits as u8),
                _ => return Err(invalid()),
            },
            3 if !field.is_empty() => match atoi(field) {
                bits @ 1..=2 => params.line.stop_bits = Some(bits as u8),
                _ => return Err(invalid()),
            },
            4..=8 => {
                let sequence = parse_sequence(field.as_bytes()).map_err(|_| invalid())?;
                let framing = &mut params.framing;
                let slot = match index {
                    4 => &mut framing.recv_start,
                    5 => &mut framing.recv_end,
                    6 => &mut framing.send_start,
                    7 => &mut framing.send_end,
                    _ => &mut framing.recv_ignore,
                };
                *slot = sequence;
            }
            9 => params.framing.recv_limit = atoi(field) as usize,
            _ => {}
        }
    }
    Ok(params)
}

/// 前导十进制数字的值，无数字时为 0。
fn atoi(text: &str) -> u32 {
    text.trim_start()
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u32, |value, digit| {
            value.saturating_mul(10).saturating_add(u32::from(digit - b'0'))
        })
}

/// 处理 `KEY=value` 控制请求，返回 `KEY=` 原文加上旧值的转义形式。
pub(crate) fn apply_keyword(
    framing: &mut Framing,
    recv_pending: bool,
    request: &[u8],
    separator: usize,
) -> Result<Vec<u8>, ComError> {
    let key = String::from_utf8_lossy(&request[..separator]).to_ascii_uppercase();
    let value = &request[separator + 1..];
    let receive_side = matches!(key.as_str(), "INSTART" | "INEND" | "IGNORE" | "LENGTH");
    if !receive_side && !matches!(key.as_str(), "OUTSTART" | "OUTEND") {
        return Err(ComError::operation(INVALID_REQUEST));
    }
    if receive_side && recv_pending {
        return Err(ComError::operation(INVALID_DURING_RECV));
    }
    let previous = if key == "LENGTH" {
        let limit = value
            .iter()
            .filter(|b| b.is_ascii_digit())
            .fold(0usize, |acc, digit| {
                acc.saturating_mul(10).saturating_add(usize::from(digit - b'0'))
            });
        std::mem::replace(&mut framing.recv_limit, limit).to_string()
    } else {
        let sequence =
            parse_sequence(value).map_err(|_| ComError::operation(INVALID_SEQUENCE))?;
        let slot = match key.as_str() {
            "OUTSTART" => &mut framing.send_start,
            "OUTEND" => &mut framing.send_end,
            "INSTART" => &mut framing.recv_start,
            "INEND" => &mut framing.recv_end,
            _ => &mut framing.recv_ignore,
        };
        format_sequence(&std::mem::replace(slot, sequence))
    };
    let mut response = request[..=separator].to_vec();
    response.extend_from_slice(previous.as_bytes());
    Ok(response)
}

/// 线路控制字母：`R`/`r`（RTS）、`T`/`t`（DTR）、`X`/`x`（XON/XOFF 流控）、
/// `C`/`c`（RTS/CTS 流控）。大写为开，小写为关，未出现为不变。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct LineRequest {
    pub rts: Option<bool>,
    pub dtr: Option<bool>,
    pub soft_flow: Option<bool>,
    pub hard_flow: Option<bool>,
}

impl LineRequest {
    /// 解析字母串；同一字母的大小写同时出现时返回 775，其余字符忽略。
    pub(crate) fn parse(request: &[u8]) -> Result<Self, ComError> {
        let mut line = LineRequest::default();
        for &byte in request {
            let slot = match byte.to_ascii_uppercase() {
                b'R' => &mut line.rts,
                b'T' => &mut line.dtr,
                b'X' => &mut line.soft_flow,
                b'C' => &mut line.hard_flow,
                _ => continue,
            };
            let on = byte.is_ascii_uppercase();
            if slot.is_some_and(|previous| previous != on) {
                return Err(ComError::InvalidOption {
                    message: INVALID_OPTION.to_string(),
                });
            }
            *slot = Some(on);
        }
        Ok(line)
    }
}
