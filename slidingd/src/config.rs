use crate::settings;
use bstr::ByteSlice;
use serde::Deserialize;
use slidingd_store::{reconcile_precision, StoreConfig};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;

#[derive(Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "defaults::bind")]
    pub bind: IpAddr,

    #[serde(default = "defaults::port")]
    pub port: u16,

    #[serde(rename = "maxclients", default = "defaults::max_clients")]
    pub max_clients: usize,

    #[serde(default = "defaults::worker_threads")]
    pub worker_threads: NonZeroUsize,

    /// Seconds between background flushes of dirty sets.
    #[serde(default = "defaults::flush_interval")]
    pub flush_interval: u64,

    #[serde(default)]
    pub default_precision: Option<u8>,

    #[serde(default)]
    pub default_eps: Option<f64>,

    #[serde(default)]
    pub in_memory: bool,

    #[serde(default = "defaults::sliding_period")]
    pub sliding_period: u32,

    #[serde(default = "defaults::sliding_precision")]
    pub sliding_precision: u32,

    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "defaults::memtable_memory")]
    pub memtable_memory: usize,
}

mod defaults {
    use std::net::{IpAddr, Ipv4Addr};
    use std::num::NonZeroUsize;
    use std::path::PathBuf;

    pub const fn bind() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    pub const fn port() -> u16 {
        4553
    }

    pub const fn max_clients() -> usize {
        10000
    }

    pub fn worker_threads() -> NonZeroUsize {
        NonZeroUsize::new(num_cpus::get()).unwrap_or(NonZeroUsize::MIN)
    }

    pub const fn flush_interval() -> u64 {
        60
    }

    pub const fn sliding_period() -> u32 {
        86400
    }

    pub const fn sliding_precision() -> u32 {
        60
    }

    pub fn data_dir() -> PathBuf {
        "./data".into()
    }

    pub const fn memtable_memory() -> usize {
        512 << 20
    }
}

impl Config {
    /// Reads an optional config file named as the first non-flag argument,
    /// then applies `--key value` overrides from the remaining arguments.
    pub fn from_args() -> anyhow::Result<Self> {
        let mut args = std::env::args_os().skip(1).peekable();
        let mut bytes = match args.peek() {
            Some(arg)
                if <[u8]>::from_os_str(arg)
                    .map(|arg| !arg.starts_with(b"-"))
                    .unwrap_or(false) =>
            {
                let content = std::fs::read(arg)?;
                args.next();
                content
            }
            _ => Vec::new(),
        };
        for arg in args {
            let Some(mut arg) = <[u8]>::from_os_str(&arg) else {
                anyhow::bail!("arguments must be valid UTF-8");
            };
            if let Some(dashes_removed) = arg.strip_prefix(b"--") {
                bytes.push(b'\n');
                arg = dashes_removed;
            }
            bytes.extend_from_slice(arg);
            bytes.push(b' ');
        }
        Ok(settings::from_bytes(&bytes)?)
    }

    /// Reconciles the precision/eps pair and produces the store's view of
    /// the configuration.
    pub fn store_config(&self) -> Result<StoreConfig, slidingd_store::Error> {
        let mut store = StoreConfig {
            default_precision: 12,
            default_eps: 0.02,
            in_memory: self.in_memory,
            sliding_period: self.sliding_period,
            sliding_precision: self.sliding_precision,
            data_dir: self.data_dir.clone(),
            memtable_memory: self.memtable_memory,
        };
        let (precision, eps) =
            reconcile_precision(self.default_precision, self.default_eps, &store)?;
        store.default_precision = precision;
        store.default_eps = eps;
        store.validate()?;
        Ok(store)
    }
}
