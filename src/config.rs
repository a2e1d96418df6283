use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::PPM_DENOMINATOR;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub fees: FeesConfig,
    pub payouts: PayoutConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub lock_shards: usize,
    pub sweep_interval_ms: u64,
    pub snapshot_path: Option<String>,
    pub snapshot_interval_secs: i64,
}

/// Commission tiers; the highest matching `min_sale_cents` wins. A
/// single-tier list degenerates to the flat rate the original system used.
#[derive(Debug, Deserialize, Clone)]
pub struct CommissionTier {
    pub min_sale_cents: i64,
    pub rate_ppm: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeesConfig {
    pub commission_tiers: Vec<CommissionTier>,
}

impl FeesConfig {
    /// Rate (ppm) applied to a sale of the given size.
    pub fn commission_rate_ppm(&self, sale_cents: i64) -> i64 {
        self.commission_tiers
            .iter()
            .filter(|t| t.min_sale_cents <= sale_cents)
            .map(|t| (t.min_sale_cents, t.rate_ppm))
            .max_by_key(|(min, _)| *min)
            .map(|(_, rate)| rate)
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PayoutConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

pub fn load_config() -> Result<AppConfig> {
    let default_rate = env_f64("DEFAULT_COMMISSION_RATE", 0.05);
    let commission_tiers = match std::env::var("COMMISSION_TIERS") {
        Ok(raw) => parse_commission_tiers(&raw)?,
        Err(_) => vec![CommissionTier {
            min_sale_cents: 0,
            rate_ppm: (default_rate * PPM_DENOMINATOR as f64).round() as i64,
        }],
    };
    let cfg = AppConfig {
        engine: EngineConfig {
            lock_shards: env_usize("ENGINE_LOCK_SHARDS", 64),
            sweep_interval_ms: env_u64("ENGINE_SWEEP_INTERVAL_MS", 500),
            snapshot_path: std::env::var("ENGINE_SNAPSHOT_PATH").ok(),
            snapshot_interval_secs: env_i64("ENGINE_SNAPSHOT_INTERVAL_SECS", 30),
        },
        fees: FeesConfig { commission_tiers },
        payouts: PayoutConfig {
            queue_capacity: env_usize("PAYOUT_QUEUE_CAPACITY", 1024),
            max_attempts: env_u32("PAYOUT_MAX_ATTEMPTS", 5),
            retry_base_ms: env_u64("PAYOUT_RETRY_BASE_MS", 500),
            retry_max_ms: env_u64("PAYOUT_RETRY_MAX_MS", 30_000),
        },
    };
    for t in &cfg.fees.commission_tiers {
        if t.rate_ppm < 0 || t.rate_ppm > PPM_DENOMINATOR {
            return Err(anyhow!("commission rate_ppm out of range: {}", t.rate_ppm));
        }
    }
    if cfg.engine.lock_shards == 0 {
        return Err(anyhow!("ENGINE_LOCK_SHARDS must be positive"));
    }
    Ok(cfg)
}

// COMMISSION_TIERS format: "min_sale_cents:rate_ppm,min_sale_cents:rate_ppm,..."
fn parse_commission_tiers(raw: &str) -> Result<Vec<CommissionTier>> {
    let mut tiers = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (min, rate) = part
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed commission tier: {part}"))?;
        tiers.push(CommissionTier {
            min_sale_cents: min
                .trim()
                .parse::<i64>()
                .map_err(|_| anyhow!("bad tier threshold: {min}"))?,
            rate_ppm: rate
                .trim()
                .parse::<i64>()
                .map_err(|_| anyhow!("bad tier rate: {rate}"))?,
        });
    }
    if tiers.is_empty() {
        return Err(anyhow!("COMMISSION_TIERS is set but empty"));
    }
    tiers.sort_by_key(|t| t.min_sale_cents);
    Ok(tiers)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_rate_applies_to_any_sale() {
        let fees = FeesConfig {
            commission_tiers: vec![CommissionTier {
                min_sale_cents: 0,
                rate_ppm: 50_000,
            }],
        };
        assert_eq!(fees.commission_rate_ppm(1), 50_000);
        assert_eq!(fees.commission_rate_ppm(10_000_000), 50_000);
    }

    #[test]
    fn tiered_rate_picks_highest_matching_threshold() {
        let fees = FeesConfig {
            commission_tiers: vec![
                CommissionTier {
                    min_sale_cents: 0,
                    rate_ppm: 50_000,
                },
                CommissionTier {
                    min_sale_cents: 1_000_000,
                    rate_ppm: 40_000,
                },
            ],
        };
        assert_eq!(fees.commission_rate_ppm(999_999), 50_000);
        assert_eq!(fees.commission_rate_ppm(1_000_000), 40_000);
    }

    #[test]
    fn tier_parsing_round_trips() {
        let tiers = parse_commission_tiers("0:50000, 1000000:40000").unwrap();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[1].min_sale_cents, 1_000_000);
        assert!(parse_commission_tiers("garbage").is_err());
    }
}
