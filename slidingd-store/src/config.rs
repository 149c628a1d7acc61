use crate::{Error, Result};
use slidingd_hll::estimate;
use std::path::PathBuf;

/// Store-wide defaults applied to every set that does not override them.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub default_precision: u8,
    pub default_eps: f64,
    pub in_memory: bool,
    /// Seconds of history each set retains.
    pub sliding_period: u32,
    /// Smallest distinguishable time grain, in seconds.
    pub sliding_precision: u32,
    pub data_dir: PathBuf,
    /// Advisory memtable budget handed to the embedded store, in bytes.
    pub memtable_memory: usize,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        estimate::error_for_precision(self.default_precision)?;
        if !(self.default_eps > 0.0 && self.default_eps < 1.0) {
            return Err(Error::BadArgument("eps must be within (0, 1)".to_owned()));
        }
        if self.sliding_precision == 0 || self.sliding_period == 0 {
            return Err(Error::BadArgument(
                "sliding period and precision must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Reconciles a requested precision/error-rate pair into the nearest
/// achievable one. An explicit precision wins; otherwise the error rate
/// picks the cheapest precision that reaches it. The reported eps is always
/// the precision's actual error.
pub fn reconcile_precision(
    precision: Option<u8>,
    eps: Option<f64>,
    fallback: &StoreConfig,
) -> Result<(u8, f64)> {
    let precision = match (precision, eps) {
        (Some(p), _) => p,
        (None, Some(e)) => estimate::precision_for_error(e)?,
        (None, None) => fallback.default_precision,
    };
    Ok((precision, estimate::error_for_precision(precision)?))
}
