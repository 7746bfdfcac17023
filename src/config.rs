use crate::store::MAX_UPLOAD_BYTES;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'b',
        long = "bind",
        help = "Address the HTTP server listens on",
        default_value = "0.0.0.0:3000"
    )]
    pub bind: SocketAddr,

    #[arg(
        short = 'u',
        long = "upload_dir",
        help = "Directory where uploaded videos are stored",
        default_value = "uploads"
    )]
    pub upload_dir: PathBuf,

    #[arg(
        short = 'm',
        long = "max_upload_bytes",
        help = "Largest accepted upload in bytes",
        default_value_t = MAX_UPLOAD_BYTES
    )]
    pub max_upload_bytes: u64,

    #[arg(
        short = 't',
        long = "tick_ms",
        help = "Milliseconds between dubbing progress steps",
        default_value = "1000"
    )]
    pub tick_ms: u64,

    #[arg(
        short = 'j',
        long = "jaeger_endpoint",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    pub jaeger_endpoint: Option<String>,
}

impl ConfigContext {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}
