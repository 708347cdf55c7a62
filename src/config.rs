use std::env;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Unparseable numbers fall back to the default. A lone TLS cert or key
    /// is an error.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let tls = match (get("RENTAL_TLS_CERT"), get("RENTAL_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "both RENTAL_TLS_CERT and RENTAL_TLS_KEY must be set, or neither",
                ));
            }
        };
        Ok(Config {
            bind: get("RENTAL_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(get("RENTAL_PORT"), 5433),
            data_dir: get("RENTAL_DATA_DIR")
                .unwrap_or_else(|| "./data".to_string())
                .into(),
            max_connections: parse_or(get("RENTAL_MAX_CONNECTIONS"), 256),
            compact_threshold: parse_or(get("RENTAL_COMPACT_THRESHOLD"), 1000),
            metrics_port: get("RENTAL_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            tls,
            log_level: get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("rental.wal")
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}
