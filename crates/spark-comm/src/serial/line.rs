//! 终端属性与调制解调器控制线。

use super::params::{INVALID_PARAMETERS, LineRequest, LineSettings, Parity};
use crate::error::{self, ComError};
use nix::libc::{self, c_int};
use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

nix::ioctl_read_bad!(tiocmget, libc::TIOCMGET, c_int);
nix::ioctl_write_ptr_bad!(tiocmbis, libc::TIOCMBIS, c_int);
nix::ioctl_write_ptr_bad!(tiocmbic, libc::TIOCMBIC, c_int);

/// 无调制解调器控制时的状态字母。
const NO_MODEM: &str = "cslb";

pub(crate) fn open_device(path: &str) -> Result<File, ComError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(path)
        .map_err(|err| error::io_failure(error::OPEN, &err))
}

/// 设备是 tty 时切换到原始模式并应用线路设置，返回 `(原始属性, 当前属性)`；
/// 非 tty 返回 `None`。
pub(crate) fn configure(
    file: &File,
    line: &LineSettings,
) -> Result<Option<(Termios, Termios)>, ComError> {
    let Ok(saved) = termios::tcgetattr(file) else {
        return Ok(None);
    };
    let mut raw = saved.clone();
    raw.input_flags.remove(InputFlags::ICRNL);
    raw.input_flags.insert(InputFlags::IGNBRK);
    raw.local_flags = LocalFlags::empty();
    raw.output_flags = OutputFlags::empty();
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    if let Some(baud) = line.baud {
        let rate = baud_rate(baud).ok_or_else(|| ComError::operation(INVALID_PARAMETERS))?;
        termios::cfsetispeed(&mut raw, rate).map_err(termios_failure)?;
        termios::cfsetospeed(&mut raw, rate).map_err(termios_failure)?;
    }
    match line.parity {
        Some(Parity::None) => raw.control_flags.remove(ControlFlags::PARENB | ControlFlags::PARODD),
        Some(Parity::Even) => {
            raw.control_flags.remove(ControlFlags::PARODD);
            raw.control_flags.insert(ControlFlags::PARENB);
        }
        Some(Parity::Odd) => raw.control_flags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
        None => {}
    }
    if let Some(bits) = line.data_bits {
        raw.control_flags.remove(ControlFlags::CSIZE);
        raw.control_flags.insert(match bits {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            _ => ControlFlags::CS8,
        });
    }
    match line.stop_bits {
        Some(2) => raw.control_flags.insert(ControlFlags::CSTOPB),
        Some(_) => raw.control_flags.remove(ControlFlags::CSTOPB),
        None => {}
    }
    termios::tcsetattr(file, SetArg::TCSADRAIN, &raw).map_err(termios_failure)?;
    Ok(Some((saved, raw)))
}

fn baud_rate(baud: u32) -> Option<BaudRate> {
    Some(match baud {
        100 => BaudRate::B110,
        200 => BaudRate::B200,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        1800 => BaudRate::B1800,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        _ => return None,
    })
}

fn termios_failure(errno: nix::errno::Errno) -> ComError {
    error::io_failure(error::TERMIOS, &io::Error::from(errno))
}

/// 关闭时恢复打开前的终端属性；失败只记日志。
pub(crate) fn restore(file: &File, saved: &Termios) {
    if let Err(errno) = termios::tcsetattr(file, SetArg::TCSANOW, saved) {
        tracing::debug!(code = error::TERMIOS.code, %errno, "termios not restored");
    }
}

/// 应用线路控制字母：流控写入终端属性，RTS/DTR 通过 ioctl 设置。
pub(crate) fn apply(
    file: &File,
    current: Option<&mut Termios>,
    request: &LineRequest,
) -> Result<(), ComError> {
    if let Some(attrs) = current {
        let before = attrs.clone();
        if let Some(on) = request.soft_flow {
            attrs.input_flags.set(InputFlags::IXON | InputFlags::IXOFF, on);
        }
        if let Some(on) = request.hard_flow {
            attrs.control_flags.set(ControlFlags::CRTSCTS, on);
        }
        if request.soft_flow.is_some() || request.hard_flow.is_some() {
            if let Err(errno) = termios::tcsetattr(file, SetArg::TCSANOW, attrs) {
                *attrs = before;
                return Err(termios_failure(errno));
            }
        }
    }
    if let Some(on) = request.rts {
        set_modem_line(file, libc::TIOCM_RTS, on)?;
    }
    if let Some(on) = request.dtr {
        set_modem_line(file, libc::TIOCM_DTR, on)?;
    }
    Ok(())
}

fn set_modem_line(file: &File, bit: c_int, on: bool) -> Result<(), ComError> {
    let fd = file.as_raw_fd();
    // SAFETY: fd 在 file 存活期间有效；bit 是本栈帧内的整数，ioctl 只读取它。
    let result = unsafe {
        if on {
            tiocmbis(fd, &bit)
        } else {
            tiocmbic(fd, &bit)
        }
    };
    match result {
        Ok(_) => Ok(()),
        // 伪终端等设备没有控制线。
        Err(nix::errno::Errno::ENOTTY | nix::errno::Errno::EINVAL) => Ok(()),
        Err(errno) => Err(error::io_failure(error::MODEM, &io::Error::from(errno))),
    }
}

/// 四个字母依次为 CTS、DSR、载波、振铃，大写表示有效。
pub(crate) fn modem_status(file: &File) -> String {
    let mut bits: c_int = 0;
    // SAFETY: fd 在 file 存活期间有效；bits 指向本栈帧内可写的整数。
    if unsafe { tiocmget(file.as_raw_fd(), &mut bits) }.is_err() {
        return NO_MODEM.to_string();
    }
    [
        (libc::TIOCM_CTS, 'C'),
        (libc::TIOCM_DSR, 'S'),
        (libc::TIOCM_CAR, 'L'),
        (libc::TIOCM_RNG, 'B'),
    ]
    .into_iter()
    .map(|(mask, letter)| {
        if bits & mask != 0 {
            letter
        } else {
            letter.to_ascii_lowercase()
        }
    })
    .collect()
}
