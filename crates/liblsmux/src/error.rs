use livestatus::ParseError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(
        #[from]
        #[source]
        ParseError,
    ),

    #[error("peer sent an unparsable response: {0}")]
    PeerResponseParse(String),

    #[error("error connecting to {addr}: {source:#}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls error for {addr}: {source:#}")]
    Tls {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error writing: {0:#}")]
    Write(#[source] std::io::Error),
    #[error("error reading: {0:#}")]
    Read(#[source] std::io::Error),

    #[error("timeout {0}")]
    Timeout(&'static str),

    #[error("peer returned status {code}: {message}")]
    Response { code: u16, message: String },

    #[error("http tunnel error: {0:#}")]
    HttpTunnel(
        #[from]
        #[source]
        reqwest::Error,
    ),

    #[error("http tunnel returned rc {rc}: {output}")]
    HttpTunnelRc { rc: i64, output: String },

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("peer is not connected yet")]
    PeerNotReady,

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("peer marked broken: {0}")]
    PeerBroken(String),

    #[error("shutting down")]
    Shutdown,

    #[error(transparent)]
    Anyhow(anyhow::Error),
}

impl Error {
    /// The fixed16 status code a frontend client sees for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Parse(_) => 400,
            Error::UnknownTable(_) => 404,
            Error::UnknownColumn { .. } => 400,
            Error::Auth(_) => 403,
            Error::Anyhow(_) => 500,
            _ => 502,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

pub type Result<T> = core::result::Result<T, Error>;
