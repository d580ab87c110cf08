use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};

use crate::{rest::DEFAULT_BASE_URL, ws::DEFAULT_STREAM_URL};

/// Grid strategy settings, loaded from TOML with `GRID_*` env overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    /// Spot pair in Backpack notation, e.g. `SOL_USDC`.
    pub symbol: String,
    pub order_quantity: f64,
    /// Half-gap between a fill and the re-centered orders, as a fraction of
    /// the fill price.
    pub gap_ratio: f64,
    pub min_price: f64,
    pub max_price: f64,
    #[serde(default = "default_precision")]
    pub price_precision: u32,
    #[serde(default = "default_precision")]
    pub quantity_precision: u32,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_precision() -> u32 {
    2
}

fn default_client_id_prefix() -> String {
    "9".to_string()
}

fn default_rest_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_ws_url() -> String {
    DEFAULT_STREAM_URL.to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

impl GridConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data =
            fs::read_to_string(path.as_ref()).with_context(|| "Failed to read config.toml")?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        let mut raw: toml::Value = toml::from_str(data).with_context(|| "Failed to parse TOML config")?;
        // Support a nested [grid] table or top-level entries.
        let table = if let Some(table) = raw.get_mut("grid").and_then(|v| v.as_table_mut()).cloned()
        {
            table
        } else {
            raw.try_into()
                .map_err(|_| anyhow::anyhow!("Invalid grid config structure"))?
        };
        let mut cfg: GridConfig = toml::from_str(&toml::to_string(&table)?)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("GRID_SYMBOL") {
            self.symbol = value;
        }
        override_f64("GRID_ORDER_QUANTITY", &mut self.order_quantity);
        override_f64("GRID_GAP_RATIO", &mut self.gap_ratio);
        override_f64("GRID_MIN_PRICE", &mut self.min_price);
        override_f64("GRID_MAX_PRICE", &mut self.max_price);
        override_u32("GRID_PRICE_PRECISION", &mut self.price_precision);
        override_u32("GRID_QUANTITY_PRECISION", &mut self.quantity_precision);
        override_u32("GRID_MAX_RETRIES", &mut self.max_retries);
        if let Ok(value) = env::var("GRID_RETRY_DELAY_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                self.retry_delay_secs = parsed;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.symbol.split('_').filter(|part| !part.is_empty()).count() == 2,
            "symbol must be BASE_QUOTE, e.g. SOL_USDC"
        );
        anyhow::ensure!(
            self.order_quantity > 0.0,
            "order_quantity must be greater than zero"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.gap_ratio) && self.gap_ratio > 0.0,
            "gap_ratio must be within (0, 1)"
        );
        anyhow::ensure!(
            self.min_price > 0.0 && self.max_price > self.min_price,
            "price band must satisfy 0 < min_price < max_price"
        );
        anyhow::ensure!(
            self.price_precision <= 8 && self.quantity_precision <= 8,
            "precision must be at most 8 decimal places"
        );
        anyhow::ensure!(
            !self.client_id_prefix.is_empty()
                && self.client_id_prefix.len() <= 13
                && self.client_id_prefix.chars().all(|c| c.is_ascii_digit()),
            "client_id_prefix must be 1 to 13 digits"
        );
        Ok(())
    }

    pub fn base_asset(&self) -> &str {
        self.symbol.split('_').next().unwrap_or(&self.symbol)
    }

    pub fn quote_asset(&self) -> &str {
        self.symbol.split('_').nth(1).unwrap_or(&self.symbol)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

fn override_f64(key: &str, field: &mut f64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<f64>() {
            *field = parsed;
        }
    }
}

fn override_u32(key: &str, field: &mut u32) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u32>() {
            *field = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        symbol = "SOL_USDC"
        order_quantity = 0.5
        gap_ratio = 0.001
        min_price = 50.0
        max_price = 400.0
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = GridConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.price_precision, 2);
        assert_eq!(cfg.quantity_precision, 2);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.rest_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.ws_url, DEFAULT_STREAM_URL);
        assert_eq!(cfg.base_asset(), "SOL");
        assert_eq!(cfg.quote_asset(), "USDC");
    }

    #[test]
    fn test_nested_grid_table() {
        let data = format!("[grid]\n{MINIMAL}");
        let cfg = GridConfig::from_toml_str(&data).unwrap();
        assert_eq!(cfg.symbol, "SOL_USDC");
    }

    #[test]
    fn test_rejects_inverted_band() {
        let data = MINIMAL.replace("max_price = 400.0", "max_price = 40.0");
        assert!(GridConfig::from_toml_str(&data).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_gap_ratio() {
        for bad in ["gap_ratio = 0.0", "gap_ratio = 1.5"] {
            let data = MINIMAL.replace("gap_ratio = 0.001", bad);
            assert!(GridConfig::from_toml_str(&data).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn test_rejects_non_numeric_client_prefix() {
        let data = format!("{MINIMAL}\nclient_id_prefix = \"ab\"");
        assert!(GridConfig::from_toml_str(&data).is_err());
    }

    #[test]
    fn test_rejects_malformed_symbol() {
        for bad in ["SOLUSDC", "SOL_", "_USDC"] {
            let data = MINIMAL.replace("SOL_USDC", bad);
            assert!(GridConfig::from_toml_str(&data).is_err(), "{bad} accepted");
        }
    }
}
