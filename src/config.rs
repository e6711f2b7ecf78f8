//! Engine configuration.
//!
//! Loaded from a TOML file with environment overrides for credentials.
//! Every recognized option gets a sane default so a minimal config only
//! needs `[symbols.BTCUSDT]` entries.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{MarginType, TimeInForce, TradeSide, WorkingType};

/// Which entry-price basis decides whether an adverse fill opens a new
/// tranche: the weighted average across all tranches of the key, or the most
/// recent tranche only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranchePnlBasis {
    Aggregate,
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Rolling volume window for cascade detection, milliseconds.
    pub window_ms: u64,
    /// Record orders but never submit them to the venue.
    pub simulate_only: bool,
    /// Open LONG and SHORT independently (venue hedge mode).
    pub hedge_mode: bool,
    /// Cross-margin across assets.
    pub multi_assets_mode: bool,
    /// Max age for unfilled entry orders before the reconciler cancels them.
    pub order_ttl_ms: u64,
    pub max_open_orders_per_symbol: u32,
    pub max_total_exposure_usdt: f64,
    pub time_in_force: TimeInForce,
    /// Fraction of the raw rate limit held back, percent.
    pub rate_limit_buffer_pct: f64,
    /// Adverse aggregate P&L (percent) at which a new tranche opens instead
    /// of averaging into the latest one.
    pub tranche_pnl_increment_pct: f64,
    pub tranche_pnl_basis: TranchePnlBasis,
    pub max_tranches_per_symbol_side: u32,
    /// Enables the mark-price fast path (C9).
    pub use_position_monitor: bool,
    pub instant_tp_enabled: bool,
    /// Mark stream downtime beyond this logs degraded mode.
    pub price_monitor_reconnect_ms: u64,
    pub batch_orders_enabled: bool,
    /// Mark overshoot tolerance for the instant-TP trigger, as a fraction
    /// (0.0005 = 5 bps inside the TP level).
    pub instant_tp_epsilon: f64,
    /// Intake micro-burst coalescing window; 0 disables buffering mode.
    pub intake_buffer_ms: u64,
    pub reconcile_interval_secs: u64,
    /// Hard-stop timeout for shutdown drain, seconds.
    pub shutdown_timeout_secs: u64,
    pub database_path: String,
    pub rest_base_url: String,
    pub ws_base_url: String,
    pub recv_window_ms: u64,
    pub symbols: HashMap<String, SymbolConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            simulate_only: true,
            hedge_mode: true,
            multi_assets_mode: false,
            order_ttl_ms: 60_000,
            max_open_orders_per_symbol: 3,
            max_total_exposure_usdt: 10_000.0,
            time_in_force: TimeInForce::Gtc,
            rate_limit_buffer_pct: 10.0,
            tranche_pnl_increment_pct: 5.0,
            tranche_pnl_basis: TranchePnlBasis::Aggregate,
            max_tranches_per_symbol_side: 5,
            use_position_monitor: true,
            instant_tp_enabled: true,
            price_monitor_reconnect_ms: 30_000,
            batch_orders_enabled: true,
            instant_tp_epsilon: 0.0005,
            intake_buffer_ms: 0,
            reconcile_interval_secs: 60,
            shutdown_timeout_secs: 10,
            database_path: "liqhunter.db".to_string(),
            rest_base_url: "https://fapi.binance.com".to_string(),
            ws_base_url: "wss://fstream.binance.com".to_string(),
            recv_window_ms: 5_000,
            symbols: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SymbolConfig {
    /// Window-sum threshold (USDT) that arms a LONG entry.
    pub volume_threshold_long: f64,
    /// Window-sum threshold (USDT) that arms a SHORT entry.
    pub volume_threshold_short: f64,
    pub leverage: u32,
    pub margin_type: MarginType,
    pub trade_side: TradeSide,
    /// Margin committed per entry, USDT (notional = value * leverage).
    pub trade_value_usdt: f64,
    /// Limit-price offset from top of book, percent.
    pub price_offset_pct: f64,
    pub max_position_usdt: f64,
    pub take_profit_enabled: bool,
    pub take_profit_pct: f64,
    pub stop_loss_enabled: bool,
    pub stop_loss_pct: f64,
    pub working_type: WorkingType,
    pub price_protect: bool,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        Self {
            volume_threshold_long: 100_000.0,
            volume_threshold_short: 100_000.0,
            leverage: 10,
            margin_type: MarginType::Isolated,
            trade_side: TradeSide::Opposite,
            trade_value_usdt: 100.0,
            price_offset_pct: 0.1,
            max_position_usdt: 5_000.0,
            take_profit_enabled: true,
            take_profit_pct: 2.0,
            stop_loss_enabled: true,
            stop_loss_pct: 1.0,
            working_type: WorkingType::MarkPrice,
            price_protect: false,
        }
    }
}

impl SymbolConfig {
    pub fn volume_threshold(&self, entry_side: crate::models::PositionSide) -> f64 {
        match entry_side {
            crate::models::PositionSide::Long => self.volume_threshold_long,
            crate::models::PositionSide::Short => self.volume_threshold_short,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).context("parse config TOML")?;
        Ok(cfg)
    }

    /// Collect every violation rather than bailing at the first one, so the
    /// operator sees the full list in one run.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.window_ms == 0 {
            errors.push("window_ms must be > 0".to_string());
        }
        if self.max_total_exposure_usdt <= 0.0 {
            errors.push("max_total_exposure_usdt must be > 0".to_string());
        }
        if !(0.0..=50.0).contains(&self.rate_limit_buffer_pct) {
            errors.push("rate_limit_buffer_pct must be in [0, 50]".to_string());
        }
        if self.tranche_pnl_increment_pct <= 0.0 {
            errors.push("tranche_pnl_increment_pct must be > 0".to_string());
        }
        if self.max_tranches_per_symbol_side == 0 {
            errors.push("max_tranches_per_symbol_side must be >= 1".to_string());
        }
        if self.symbols.is_empty() {
            errors.push("at least one [symbols.<SYMBOL>] section is required".to_string());
        }

        for (symbol, sc) in &self.symbols {
            if symbol.trim().is_empty() || symbol.chars().any(|c| c.is_ascii_lowercase()) {
                errors.push(format!("symbol key '{symbol}' must be upper-case"));
            }
            if sc.leverage == 0 || sc.leverage > 125 {
                errors.push(format!("{symbol}: leverage must be in [1, 125]"));
            }
            if sc.trade_value_usdt <= 0.0 {
                errors.push(format!("{symbol}: trade_value_usdt must be > 0"));
            }
            if sc.volume_threshold_long <= 0.0 || sc.volume_threshold_short <= 0.0 {
                errors.push(format!("{symbol}: volume thresholds must be > 0"));
            }
            if sc.price_offset_pct < 0.0 || sc.price_offset_pct > 5.0 {
                errors.push(format!("{symbol}: price_offset_pct must be in [0, 5]"));
            }
            if sc.take_profit_enabled && sc.take_profit_pct <= 0.0 {
                errors.push(format!("{symbol}: take_profit_pct must be > 0 when enabled"));
            }
            if sc.stop_loss_enabled && sc.stop_loss_pct <= 0.0 {
                errors.push(format!("{symbol}: stop_loss_pct must be > 0 when enabled"));
            }
            if sc.max_position_usdt <= 0.0 {
                errors.push(format!("{symbol}: max_position_usdt must be > 0"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Venue API credentials. Only ever read from the environment so they never
/// end up in a config file checked into the wrong place.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("LIQHUNTER_API_KEY").ok()?;
        let api_secret = std::env::var("LIQHUNTER_API_SECRET").ok()?;
        if api_key.is_empty() || api_secret.is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            api_secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_symbol() -> Config {
        let mut cfg = Config::default();
        cfg.symbols
            .insert("BTCUSDT".to_string(), SymbolConfig::default());
        cfg
    }

    #[test]
    fn default_config_with_symbol_validates() {
        assert!(config_with_symbol().validate().is_ok());
    }

    #[test]
    fn empty_symbols_rejected() {
        let cfg = Config::default();
        let errs = cfg.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("symbols")));
    }

    #[test]
    fn collects_all_violations() {
        let mut cfg = config_with_symbol();
        cfg.window_ms = 0;
        cfg.tranche_pnl_increment_pct = -1.0;
        let sc = cfg.symbols.get_mut("BTCUSDT").unwrap();
        sc.leverage = 0;
        sc.trade_value_usdt = 0.0;
        let errs = cfg.validate().unwrap_err();
        assert!(errs.len() >= 4);
    }

    #[test]
    fn parses_minimal_toml() {
        let cfg: Config = toml::from_str(
            r#"
            simulate_only = true
            window_ms = 5000

            [symbols.BTCUSDT]
            volume_threshold_long = 100000.0
            volume_threshold_short = 100000.0
            leverage = 10
            trade_value_usdt = 100.0
            take_profit_pct = 2.0
            stop_loss_pct = 1.0
            "#,
        )
        .unwrap();
        assert!(cfg.simulate_only);
        assert_eq!(cfg.symbols.len(), 1);
        let sc = &cfg.symbols["BTCUSDT"];
        assert_eq!(sc.leverage, 10);
        assert_eq!(sc.trade_side, TradeSide::Opposite);
        assert!(cfg.validate().is_ok());
    }
}
