use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("校验错误: {0}")]
    Validation(String),

    #[error("资源冲突: {0}")]
    Conflict(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("虚拟化错误: {0}")]
    Hypervisor(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("远程连接错误: {0}")]
    Remote(String),

    #[error("命令执行失败 [{command}] (退出码 {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("下载错误: {0}")]
    Download(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 是否属于可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Remote(_) | Error::Hypervisor(_) | Error::Timeout(_) | Error::Io(_)
        )
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
