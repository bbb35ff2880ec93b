use thiserror::Error;

/// 节点解析层错误，统一向调用方暴露，由调用方决定跳过还是中止。
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("not a proxy uri: {0}")]
    NotANode(String),
    #[error("unsupported proxy type: {0}")]
    Unsupported(String),
    #[error("missing field `{1}` in {0} uri")]
    MissingField(&'static str, &'static str),
}

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("port {0} is not currently held by the pool")]
    InvalidRelease(u16),
    #[error("engine failed to become ready: {0}")]
    EngineStart(String),
    #[error("{0}")]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
}
