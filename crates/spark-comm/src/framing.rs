//! 字节级分帧：起始/结束/忽略序列、转义语法与可恢复扫描器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 串口消息以可配置的字节序列界定；发送时在数据前后拼接起始/结束序列，接收时
//!   由 [`FrameScanner`] 逐字节识别；
//! - 字节可能分多次到达，扫描器必须能在任意位置暂停并从原处继续，既不重复处理也不丢弃
//!   已扫描字节。
//!
//! ## 契约（What）
//! - 缓冲区偏移满足 `done ≤ head ≤ tail ≤ capacity`：`[0, done)` 是结果，
//!   `[head, tail)` 是已到达但尚未扫描的字节；
//! - 对同一字节流，无论如何切分到达，最终的结果缓冲、`done` 与完成点都相同；
//! - 起始序列每次接收只匹配一次，之后再出现视为普通数据。
//!
//! ## 实现（How）
//! - `AwaitingStart` 阶段丢弃字节直至起始序列完整匹配；末尾不完整的候选匹配保留等待；
//! - `MatchingEnd` 阶段先剔除忽略字节，再尝试匹配结束序列；其余字节原地搬移到 `done`；
//! - 未配置上限且无结束序列时，上限取请求长度。

use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// 单个分帧序列的最大长度。
pub const MAX_SEQUENCE_LEN: usize = 31;

/// 通道的分帧配置。非串口通道保持全部为空。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Framing {
    pub send_start: Vec<u8>,
    pub send_end: Vec<u8>,
    pub recv_start: Vec<u8>,
    pub recv_end: Vec<u8>,
    pub recv_ignore: Vec<u8>,
    /// 接收上限；0 表示未设置。
    pub recv_limit: usize,
}

impl Framing {
    /// 串口默认：接收以 CR 结束、忽略 LF，发送以 CR LF 结束。
    pub fn serial_defaults() -> Self {
        Self {
            send_end: vec![0x0D, 0x0A],
            recv_end: vec![0x0D],
            recv_ignore: vec![0x0A],
            ..Self::default()
        }
    }

    /// 组装带起止序列的发送缓冲。
    pub fn frame_outbound(&self, data: &[u8]) -> Vec<u8> {
        let mut buffer =
            Vec::with_capacity(self.send_start.len() + data.len() + self.send_end.len());
        buffer.extend_from_slice(&self.send_start);
        buffer.extend_from_slice(data);
        buffer.extend_from_slice(&self.send_end);
        buffer
    }

    /// 接收缓冲容量：`max(count, limit) + |start| + |end|`。
    pub fn inbound_capacity(&self, count: usize) -> usize {
        (count.max(self.recv_limit) + self.recv_start.len() + self.recv_end.len()).max(1)
    }
}

/// 转义语法错误。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("序列超过 {MAX_SEQUENCE_LEN} 字节")]
    TooLong,
    #[error("`\\` 之后需要三位十进制数字")]
    BadDecimal,
    #[error("十进制转义超出 255")]
    OutOfRange,
    #[error("`^` 之后需要 A-_ 之间的控制字符")]
    BadControl,
}

/// 解析转义语法：`\\`、`\^`、`\ddd`（≤255）、`^X`（控制字符 1–31），其余字节原样保留。
pub fn parse_sequence(text: &[u8]) -> Result<Vec<u8>, SequenceError> {
    let mut out = Vec::new();
    let mut iter = text.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        if out.len() == MAX_SEQUENCE_LEN {
            return Err(SequenceError::TooLong);
        }
        let value = match byte {
            b'\\' => match iter.peek().copied() {
                Some(escaped @ (b'\\' | b'^')) => {
                    iter.next();
                    escaped
                }
                _ => {
                    let mut value: u32 = 0;
                    for _ in 0..3 {
                        match iter.next() {
                            Some(digit) if digit.is_ascii_digit() => {
                                value = value * 10 + u32::from(digit - b'0');
                            }
                            _ => return Err(SequenceError::BadDecimal),
                        }
                    }
                    u8::try_from(value).map_err(|_| SequenceError::OutOfRange)?
                }
            },
            b'^' => {
                let control = iter
                    .next()
                    .map(|c| i32::from(c.to_ascii_uppercase()) - i32::from(b'A') + 1)
                    .ok_or(SequenceError::BadControl)?;
                if !(1..=31).contains(&control) {
                    return Err(SequenceError::BadControl);
                }
                control as u8
            }
            other => other,
        };
        out.push(value);
    }
    Ok(out)
}

/// 将序列编码回转义语法，是 [`parse_sequence`] 的逆运算。
pub fn format_sequence(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &byte in bytes {
        match byte {
            b'\\' | b'^' => {
                out.push('\\');
                out.push(char::from(byte));
            }
            32..=126 => out.push(char::from(byte)),
            1..=31 => {
                out.push('^');
                out.push(char::from(byte - 1 + b'A'));
            }
            _ => {
                out.push('\\');
                out.push_str(&format!("{byte:03}"));
            }
        }
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    AwaitingStart,
    MatchingEnd,
}

/// 可恢复的接收扫描器。
#[derive(Clone, PartialEq, Eq)]
pub struct FrameScanner {
    phase: Phase,
    head: usize,
    tail: usize,
}

impl fmt::Debug for FrameScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameScanner")
            .field("phase", &self.phase)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}

impl FrameScanner {
    /// 为一次新的接收创建扫描器。
    pub fn new(framing: &Framing) -> Self {
        let phase = if framing.recv_start.is_empty() {
            Phase::MatchingEnd
        } else {
            Phase::AwaitingStart
        };
        Self {
            phase,
            head: 0,
            tail: 0,
        }
    }

    /// 已到达但尚未扫描的区间 `[head, tail)`。
    pub fn unscanned(&self) -> Range<usize> {
        self.head..self.tail
    }

    /// 下一次读取应写入的位置。
    pub fn fill_offset(&self) -> usize {
        self.tail
    }

    /// 记录新写入的 `count` 个字节。
    pub fn advance(&mut self, count: usize) {
        self.tail += count;
    }

    /// 读取前把未扫描字节搬到结果末尾，为新数据腾出空间。
    pub fn compact(&mut self, buffer: &mut [u8], done: usize) {
        if self.head > done {
            if self.head < self.tail {
                buffer.copy_within(self.head..self.tail, done);
                self.tail = done + (self.tail - self.head);
            } else {
                self.tail = done;
            }
            self.head = done;
        }
    }

    /// 扫描 `[head, tail)`，返回本次接收是否完成。
    pub fn scan(
        &mut self,
        buffer: &mut [u8],
        done: &mut usize,
        length: usize,
        framing: &Framing,
    ) -> bool {
        let mut head = self.head;
        let tail = self.tail;

        if self.phase == Phase::AwaitingStart {
            let start = framing.recv_start.as_slice();
            while head < tail {
                if buffer[head] != start[0] {
                    head += 1;
                    continue;
                }
                if head + start.len() > tail {
                    break;
                }
                if &buffer[head..head + start.len()] == start {
                    head += start.len();
                    self.phase = Phase::MatchingEnd;
                    break;
                }
                head += 1;
            }
        }

        let mut complete = false;
        if self.phase == Phase::MatchingEnd {
            let end = framing.recv_end.as_slice();
            let ignore = framing.recv_ignore.as_slice();
            let limit = if framing.recv_limit == 0 && end.is_empty() {
                length
            } else {
                framing.recv_limit
            };
            while head < tail {
                let byte = buffer[head];
                if ignore.contains(&byte) {
                    head += 1;
                    continue;
                }
                if !end.is_empty() && byte == end[0] {
                    if head + end.len() > tail {
                        break;
                    }
                    if &buffer[head..head + end.len()] == end {
                        head += end.len();
                        complete = true;
                        break;
                    }
                }
                if *done < length || limit != 0 {
                    buffer[*done] = byte;
                    *done += 1;
                }
                head += 1;
                if *done == limit {
                    complete = true;
                    break;
                }
            }
        }

        self.head = head;
        complete
    }
}
