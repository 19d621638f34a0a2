use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CHROME_PATH: &str = "/usr/bin/google-chrome-stable";

/// Runtime settings, read once from the environment (and `.env`) at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub chrome_path: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    pub temp_dir: PathBuf,
    pub temp_max_age: Duration,
    pub temp_sweep_cron: String,
    pub navigation_timeout: Duration,
    pub strategy_timeout: Duration,
    pub settle_delay: Duration,
    pub network_wait: Duration,
    pub max_address_variants: usize,
    pub public_base_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            chrome_path: PathBuf::from(DEFAULT_CHROME_PATH),
            ffmpeg_path: None,
            temp_dir: PathBuf::from("temp"),
            temp_max_age: Duration::from_secs(30 * 60),
            temp_sweep_cron: "0 */5 * * * *".to_string(),
            navigation_timeout: Duration::from_secs(45),
            strategy_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_millis(3000),
            network_wait: Duration::from_millis(5000),
            max_address_variants: 3,
            public_base_url: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let chrome_path = env::var("CHROME_PATH")
            .or_else(|_| env::var("PUPPETEER_EXECUTABLE_PATH"))
            .map(PathBuf::from)
            .unwrap_or(defaults.chrome_path);

        Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_or("PORT", defaults.port),
            chrome_path,
            ffmpeg_path: env::var("FFMPEG_PATH").ok().map(PathBuf::from),
            temp_dir: env::var("TEMP_DIR").map(PathBuf::from).unwrap_or(defaults.temp_dir),
            temp_max_age: Duration::from_secs(60 * parse_or::<u64>("TEMP_MAX_AGE_MINUTES", 30)),
            temp_sweep_cron: env::var("TEMP_SWEEP_CRON").unwrap_or(defaults.temp_sweep_cron),
            navigation_timeout: Duration::from_secs(parse_or("NAVIGATION_TIMEOUT_SECS", 45)),
            strategy_timeout: Duration::from_secs(parse_or("STRATEGY_TIMEOUT_SECS", 30)),
            settle_delay: Duration::from_millis(parse_or("SETTLE_DELAY_MS", 3000)),
            network_wait: Duration::from_millis(parse_or("NETWORK_WAIT_MS", 5000)),
            max_address_variants: parse_or("MAX_ADDRESS_VARIANTS", defaults.max_address_variants).max(1),
            public_base_url: env::var("PUBLIC_BASE_URL")
                .ok()
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring unparseable {}={:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:3000");
        assert_eq!(cfg.chrome_path, PathBuf::from(DEFAULT_CHROME_PATH));
        assert_eq!(cfg.temp_max_age, Duration::from_secs(1800));
        assert_eq!(cfg.max_address_variants, 3);
    }

    #[test]
    fn parse_or_falls_back_on_garbage() {
        env::set_var("MEDIA_SCOUT_TEST_PORT", "not-a-number");
        assert_eq!(parse_or::<u16>("MEDIA_SCOUT_TEST_PORT", 8080), 8080);
        env::set_var("MEDIA_SCOUT_TEST_PORT", " 9090 ");
        assert_eq!(parse_or::<u16>("MEDIA_SCOUT_TEST_PORT", 8080), 9090);
        env::remove_var("MEDIA_SCOUT_TEST_PORT");
    }
}
