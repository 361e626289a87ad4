use thiserror::Error;

/// 传输层故障的处理建议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHint {
    /// 连接被重置，稍后重试即可
    Retry,
    Dns,
    Timeout,
}

impl TransportHint {
    pub fn advice(self) -> &'static str {
        match self {
            TransportHint::Retry => "这通常是网络不稳定或服务器负载过高导致，请稍后再试",
            TransportHint::Dns => "DNS解析失败，请检查网络连接",
            TransportHint::Timeout => "连接超时，请检查网络",
        }
    }
}

/// 生成任务的失败原因，Display 即为回复给用户的文本
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("没有可用的API密钥，请先使用 #大香蕉添加key 命令添加密钥")]
    NoKeys,

    #[error("没有活跃的API密钥，请检查密钥状态或添加新密钥")]
    NoActiveKeys,

    #[error("请先配置 API 服务地址")]
    NotConfigured,

    #[error("读取密钥配置失败: {0}")]
    KeyStore(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("请求错误: {message}")]
    Transport {
        message: String,
        hint: Option<TransportHint>,
    },

    #[error("请求超时 ({0}ms)")]
    Timeout(u64),

    /// 上游在帧内报告的错误
    #[error("生成失败: {0}")]
    Upstream(String),

    #[error("未找到生成的内容")]
    NoContent,

    #[error("流式响应异常结束")]
    StreamAborted,

    #[error("响应流错误: {0}")]
    Stream(String),

    #[error("解析响应失败: {0}")]
    Parse(String),
}

impl GenerationError {
    pub fn hint(&self) -> Option<TransportHint> {
        match self {
            GenerationError::Transport { hint, .. } => *hint,
            GenerationError::Timeout(_) => Some(TransportHint::Timeout),
            _ => None,
        }
    }

    /// 将 reqwest 错误归类为带建议的传输错误
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let message = err.to_string();
        let detail = format!("{:?}", err).to_lowercase();
        let hint = if err.is_timeout() {
            Some(TransportHint::Timeout)
        } else if detail.contains("dns") || detail.contains("failed to lookup") {
            Some(TransportHint::Dns)
        } else if detail.contains("reset") || detail.contains("connection closed") {
            Some(TransportHint::Retry)
        } else if err.is_connect() {
            Some(TransportHint::Retry)
        } else {
            None
        };
        GenerationError::Transport { message, hint }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_match_replies() {
        assert_eq!(GenerationError::NoContent.to_string(), "未找到生成的内容");
        assert_eq!(
            GenerationError::Upstream("❌ 违规".into()).to_string(),
            "生成失败: ❌ 违规"
        );
        assert_eq!(
            GenerationError::Http {
                status: 429,
                body: "busy".into()
            }
            .to_string(),
            "HTTP 429: busy"
        );
        assert_eq!(GenerationError::Timeout(120000).to_string(), "请求超时 (120000ms)");
    }

    #[test]
    fn timeouts_carry_network_advice() {
        assert_eq!(
            GenerationError::Timeout(1).hint(),
            Some(TransportHint::Timeout)
        );
        assert_eq!(GenerationError::Stream("eof".into()).hint(), None);
        assert_eq!(
            GenerationError::Stream("eof".into()).to_string(),
            "响应流错误: eof"
        );
    }
}
