//! 通道层配置。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 运行时在进程启动时读取一次属性（保活、IPv6、遗留建连等待），之后以只读值传入
//!   [`ComManager`](crate::ComManager)；本模块将这些开关收敛为强类型结构；
//! - 通过 `serde` + `toml` 支持声明式配置，缺省字段回落到与历史行为一致的默认值。
//!
//! ## 契约（What）
//! - 文档形如：
//!
//! ```toml
//! worker_threads = 2
//!
//! [tcp]
//! client_keepalive = true
//! server_keepalive = false
//! allow_ipv6 = true
//! connect_wait = false
//! ```
//!
//! - 未知字段被拒绝，避免拼写错误被静默忽略。

use serde::Deserialize;
use thiserror::Error;

/// TCP 相关开关。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpConfig {
    /// 客户端套接字启用 `SO_KEEPALIVE`。
    pub client_keepalive: bool,
    /// 服务端接受的连接启用 `SO_KEEPALIVE`。
    pub server_keepalive: bool,
    /// 未带族后缀的 `TCPCLIENT` 是否允许解析到 IPv6 地址。
    pub allow_ipv6: bool,
    /// 遗留行为：`open` 阻塞直到连接建立或失败。
    pub connect_wait: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            client_keepalive: false,
            server_keepalive: false,
            allow_ipv6: true,
            connect_wait: false,
        }
    }
}

/// 通道层整体配置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComConfig {
    pub tcp: TcpConfig,
    /// 内部 Tokio 运行时的工作线程数；使用外部运行时句柄时忽略。
    pub worker_threads: usize,
}

impl Default for ComConfig {
    fn default() -> Self {
        Self {
            tcp: TcpConfig::default(),
            worker_threads: 2,
        }
    }
}

/// 配置解析错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置文档解析失败: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("配置取值非法: {0}")]
    Invalid(&'static str),
}

impl ComConfig {
    /// 从 TOML 文本解析配置。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ComConfig = toml::from_str(text)?;
        if config.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads 必须大于 0"));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ComConfig::from_toml_str("").expect("空文档应当解析成功");
        assert_eq!(config, ComConfig::default());
        assert!(config.tcp.allow_ipv6);
        assert!(!config.tcp.connect_wait);
    }

    #[test]
    fn tcp_section_overrides_individual_flags() {
        let config = ComConfig::from_toml_str(
            r#"
            worker_threads = 1

            [tcp]
            client_keepalive = true
            allow_ipv6 = false
            "#,
        )
        .expect("合法配置");
        assert_eq!(config.worker_threads, 1);
        assert!(config.tcp.client_keepalive);
        assert!(!config.tcp.server_keepalive);
        assert!(!config.tcp.allow_ipv6);
    }

    #[test]
    fn unknown_keys_and_zero_workers_are_rejected() {
        assert!(matches!(
            ComConfig::from_toml_str("[tcp]\nkeepalive = true"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ComConfig::from_toml_str("worker_threads = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
