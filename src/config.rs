// ===============================
// src/config.rs
// ===============================
use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use thiserror::Error;

pub const DEFAULT_JWT_SECRET: &str = "demo-secret-key-for-development";
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?} ({reason})")]
    Invalid { key: &'static str, value: String, reason: String },
    #[error("{present} is set but {missing} is missing")]
    Incomplete { present: &'static str, missing: &'static str },
}

#[derive(Debug, Parser)]
#[command(name = "signal_desk", version, about = "Demo trading dashboard backend and terminal viewer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the backend: scheduler, broker gateway, push channel and control API.
    Serve {
        /// Override PORT
        #[arg(long)]
        port: Option<u16>,
        /// Override TICK_INTERVAL_SECS
        #[arg(long)]
        tick_secs: Option<u64>,
    },
    /// Connect to a running backend and print the reconciled trade state.
    Watch {
        #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
        url: String,
        /// Origin header sent with the upgrade request
        #[arg(long)]
        origin: Option<String>,
    },
}

/// Broker mode is decided once at startup from credential presence.
#[derive(Clone, Debug, PartialEq)]
pub enum BrokerMode {
    Demo,
    MetaApi(MetaApiCfg),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetaApiCfg {
    pub token: String,
    pub account_id: String,
    pub provisioning_url: String,
    pub client_url: String,
    pub connect_timeout: Duration,
    /// bound on each REST call (account, deploy, trade)
    pub request_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TelegramCfg {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SmtpCfg {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub credentials: Option<(String, String)>,
    pub sender: String,
    pub recipient: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuthCfg {
    pub secret: String,
    pub expiration: Duration,
    pub demo_email: String,
    pub demo_password: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

impl AllowedOrigins {
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match self {
            AllowedOrigins::Any => true,
            AllowedOrigins::List(list) => origin
                .map(|o| list.iter().any(|x| x.eq_ignore_ascii_case(o.trim_end_matches('/'))))
                .unwrap_or(false),
        }
    }
}

// ===== Strategi =====
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrategyMode {
    Fixed,
    Random,
}

impl StrategyMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" | "demo" | "dummy" => Some(StrategyMode::Fixed),
            "random" | "stochastic" => Some(StrategyMode::Random),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Limits {
    pub max_volume: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub port: u16,
    pub tick_interval: Duration,
    pub shutdown_grace: Duration,
    pub strategy: StrategyMode,
    pub symbols: Vec<String>,
    pub limits: Limits,
    pub broker: BrokerMode,
    pub telegram: Option<TelegramCfg>,
    pub smtp: Option<SmtpCfg>,
    pub auth: AuthCfg,
    pub allowed_origins: AllowedOrigins,
    pub replay_capacity: usize,
    pub record_file: Option<String>,
    pub simulate_updates: bool,
}

impl Config {
    /// Read `.env` and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenv();
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // ===== Basic =====
        let port = parse_or(&text, "PORT", 3000u16)?;
        let tick_interval = Duration::from_secs(parse_or(&text, "TICK_INTERVAL_SECS", 60u64)?.max(1));
        let shutdown_grace = Duration::from_secs(parse_or(&text, "SHUTDOWN_GRACE_SECS", 10u64)?);

        let strategy = match text("STRATEGY") {
            Some(raw) => StrategyMode::parse_one(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "STRATEGY",
                value: raw.clone(),
                reason: "expected fixed or random".into(),
            })?,
            None => StrategyMode::Fixed,
        };

        // SYMBOLS=EURUSD,GBPUSD
        let symbols: Vec<String> = text("SYMBOLS")
            .map(|s| {
                s.split(',')
                    .map(|x| x.trim())
                    .filter(|x| !x.is_empty())
                    .map(|x| x.to_ascii_uppercase())
                    .collect()
            })
            .filter(|v: &Vec<String>| !v.is_empty())
            .unwrap_or_else(|| vec!["EURUSD".to_string()]);

        let limits = Limits { max_volume: parse_or(&text, "MAX_VOLUME", 1.0f64)? };

        // ===== Broker =====
        let broker = match (text("METAAPI_TOKEN"), text("MT_ACCOUNT_ID")) {
            (Some(token), Some(account_id)) => BrokerMode::MetaApi(MetaApiCfg {
                token,
                account_id,
                provisioning_url: text("METAAPI_PROVISIONING_URL").unwrap_or_else(|| {
                    "https://mt-provisioning-api-v1.agiliumtrade.agiliumtrade.ai".to_string()
                }),
                client_url: text("METAAPI_CLIENT_URL").unwrap_or_else(|| {
                    "https://mt-client-api-v1.new-york.agiliumtrade.ai".to_string()
                }),
                connect_timeout: Duration::from_secs(parse_or(&text, "METAAPI_CONNECT_TIMEOUT_SECS", 60u64)?),
                request_timeout: Duration::from_secs(parse_or(&text, "METAAPI_REQUEST_TIMEOUT_SECS", 10u64)?.max(1)),
            }),
            (Some(_), None) => {
                return Err(ConfigError::Incomplete { present: "METAAPI_TOKEN", missing: "MT_ACCOUNT_ID" })
            }
            (None, Some(_)) => {
                return Err(ConfigError::Incomplete { present: "MT_ACCOUNT_ID", missing: "METAAPI_TOKEN" })
            }
            (None, None) => BrokerMode::Demo,
        };

        // ===== Notification channels =====
        let telegram = match (text("TELEGRAM_BOT_TOKEN"), text("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramCfg {
                bot_token,
                chat_id,
                api_base: text("TELEGRAM_API_URL").unwrap_or_else(|| "https://api.telegram.org".to_string()),
            }),
            (Some(_), None) => {
                return Err(ConfigError::Incomplete { present: "TELEGRAM_BOT_TOKEN", missing: "TELEGRAM_CHAT_ID" })
            }
            (None, Some(_)) => {
                return Err(ConfigError::Incomplete { present: "TELEGRAM_CHAT_ID", missing: "TELEGRAM_BOT_TOKEN" })
            }
            (None, None) => None,
        };

        let smtp = match text("SMTP_HOST") {
            Some(host) => {
                let secure = parse_bool(&text, "SMTP_SECURE", false)?;
                let port = parse_or(&text, "SMTP_PORT", if secure { 465u16 } else { 587u16 })?;
                let sender = text("EMAIL_SENDER")
                    .ok_or(ConfigError::Incomplete { present: "SMTP_HOST", missing: "EMAIL_SENDER" })?;
                let credentials = match (text("SMTP_USER"), text("SMTP_PASS")) {
                    (Some(u), Some(p)) => Some((u, p)),
                    (Some(_), None) => {
                        return Err(ConfigError::Incomplete { present: "SMTP_USER", missing: "SMTP_PASS" })
                    }
                    _ => None,
                };
                let recipient = text("EMAIL_RECIPIENT").unwrap_or_else(|| sender.clone());
                Some(SmtpCfg { host, port, secure, credentials, sender, recipient })
            }
            None => None,
        };

        // ===== Auth =====
        let expiration = match text("JWT_EXPIRATION") {
            Some(raw) => parse_duration(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "JWT_EXPIRATION",
                value: raw.clone(),
                reason: "expected e.g. 1d, 12h, 30m, 45s or seconds".into(),
            })?,
            None => Duration::from_secs(86_400),
        };
        let auth = AuthCfg {
            secret: text("JWT_SECRET").unwrap_or_else(|| DEFAULT_JWT_SECRET.to_string()),
            expiration,
            demo_email: text("DEMO_USER_EMAIL").unwrap_or_else(|| "demo@signal-desk.local".to_string()),
            demo_password: text("DEMO_USER_PASSWORD").unwrap_or_else(|| "1234567ASD".to_string()),
        };

        let allowed_origins = match text("ALLOWED_ORIGINS") {
            None => AllowedOrigins::Any,
            Some(raw) if raw == "*" => AllowedOrigins::Any,
            Some(raw) => AllowedOrigins::List(
                raw.split(',')
                    .map(|x| x.trim().trim_end_matches('/').to_string())
                    .filter(|x| !x.is_empty())
                    .collect(),
            ),
        };

        Ok(Config {
            port,
            tick_interval,
            shutdown_grace,
            strategy,
            symbols,
            limits,
            broker,
            telegram,
            smtp,
            auth,
            allowed_origins,
            replay_capacity: parse_or(&text, "REPLAY_CAPACITY", 0usize)?,
            record_file: text("RECORD_FILE"),
            simulate_updates: parse_bool(&text, "SIMULATE_UPDATES", false)?,
        })
    }

    pub fn broker_mode_label(&self) -> &'static str {
        match self.broker {
            BrokerMode::Demo => "demo",
            BrokerMode::MetaApi(_) => "metaapi",
        }
    }
}

/// Outbound REST client; every request is bounded by `timeout`.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT.min(timeout))
        .timeout(timeout)
        .build()
        .map_err(|e| ConfigError::Invalid { key: "HTTP_CLIENT", value: format!("{timeout:?}"), reason: e.to_string() })
}

fn parse_or<T, F>(text: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match text(key) {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid { key, value: raw.clone(), reason: e.to_string() }),
        None => Ok(default),
    }
}

fn parse_bool<F>(text: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match text(key).map(|s| s.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: v.clone(), reason: "expected true or false".into() }),
        },
    }
}

/// Token lifetime: `1d`, `12h`, `30m`, `45s`, or bare seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (idx, _) = raw.char_indices().last()?;
    let (num, unit) = raw.split_at(idx);
    let n: u64 = num.trim().parse().ok()?;
    let mult = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    n.checked_mul(mult).map(Duration::from_secs)
}
