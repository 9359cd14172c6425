use std::io;
use thiserror::Error;

/// 限速节点统一的错误类型
#[derive(Error, Debug)]
pub enum LimiterError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 用户不存在
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// 路由规则错误
    #[error("Rule error: {0}")]
    Rule(String),

    /// 代理后端错误
    #[error("Backend error: {0}")]
    Backend(String),

    /// JSON 解析错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, LimiterError>;
