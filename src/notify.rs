// ===============================
// src/notify.rs
// ===============================
//
// Outbound notifications (Telegram bot + SMTP email). Both are optional and
// decided once at startup. `NotificationSink::send` never fails: every
// configured channel is tried on its own, failures are logged and dropped.
// Each attempt is cut off after `deliver_timeout`.
//
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info};

use crate::config::{http_client, ConfigError, SmtpCfg, TelegramCfg, HTTP_TIMEOUT};
use crate::domain::NoticeKind;
use crate::metrics::{CONFIG_CHANNEL, NOTIFICATIONS};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed on {channel}: {reason}")]
    DeliveryFailed { channel: &'static str, reason: String },
}

impl NotifyError {
    fn failed(channel: &'static str, reason: impl std::fmt::Display) -> Self {
        NotifyError::DeliveryFailed { channel, reason: reason.to_string() }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, kind: NoticeKind, message: &str) -> Result<(), NotifyError>;
}

/// A channel slot resolved at startup.
pub enum Channel {
    Configured(Box<dyn NotificationChannel>),
    Unconfigured(&'static str),
}

/// Upper bound on one channel attempt, above the transports' own timeouts.
pub const DELIVER_TIMEOUT: Duration = Duration::from_secs(15);

pub struct NotificationSink {
    channels: Vec<Box<dyn NotificationChannel>>,
    deliver_timeout: Duration,
}

impl NotificationSink {
    pub fn new(slots: Vec<Channel>) -> Self {
        let mut channels = Vec::new();
        for slot in slots {
            match slot {
                Channel::Configured(c) => {
                    info!(channel = c.name(), "notification channel configured");
                    CONFIG_CHANNEL.with_label_values(&[c.name()]).set(1);
                    channels.push(c);
                }
                Channel::Unconfigured(name) => {
                    info!(channel = name, "notification channel not configured");
                    CONFIG_CHANNEL.with_label_values(&[name]).set(0);
                }
            }
        }
        Self { channels, deliver_timeout: DELIVER_TIMEOUT }
    }

    pub fn with_deliver_timeout(mut self, limit: Duration) -> Self {
        self.deliver_timeout = limit;
        self
    }

    pub fn from_config(telegram: Option<&TelegramCfg>, smtp: Option<&SmtpCfg>) -> Result<Self, ConfigError> {
        let tg = match telegram {
            Some(cfg) => Channel::Configured(Box::new(TelegramChannel::new(cfg.clone())?)),
            None => Channel::Unconfigured("telegram"),
        };
        let mail = match smtp {
            Some(cfg) => Channel::Configured(Box::new(EmailChannel::new(cfg)?)),
            None => Channel::Unconfigured("email"),
        };
        Ok(Self::new(vec![tg, mail]))
    }

    pub fn is_demo(&self) -> bool { self.channels.is_empty() }

    pub async fn send(&self, kind: NoticeKind, message: &str) {
        if self.channels.is_empty() {
            info!(mode = "demo", kind = kind.as_str(), %message, "notification");
            NOTIFICATIONS.with_label_values(&["demo", "logged"]).inc();
            return;
        }
        let limit = self.deliver_timeout;
        let attempts = self.channels.iter().map(|c| async move {
            let res = match timeout(limit, c.deliver(kind, message)).await {
                Ok(res) => res,
                Err(_) => Err(NotifyError::failed(c.name(), format!("no answer within {limit:?}"))),
            };
            (c.name(), res)
        });
        for (name, res) in join_all(attempts).await {
            match res {
                Ok(()) => {
                    info!(channel = name, "notification sent");
                    NOTIFICATIONS.with_label_values(&[name, "ok"]).inc();
                }
                Err(e) => {
                    error!(channel = name, error = %e, "notification failed");
                    NOTIFICATIONS.with_label_values(&[name, "failed"]).inc();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Telegram Bot API
// ---------------------------------------------------------------------------
pub struct TelegramChannel {
    http: reqwest::Client,
    cfg: TelegramCfg,
}

impl TelegramChannel {
    pub fn new(cfg: TelegramCfg) -> Result<Self, ConfigError> {
        Ok(Self { http: http_client(HTTP_TIMEOUT)?, cfg })
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &'static str { "telegram" }

    async fn deliver(&self, _kind: NoticeKind, message: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.cfg.api_base.trim_end_matches('/'), self.cfg.bot_token);
        let payload = json!({ "chat_id": self.cfg.chat_id, "text": message });
        let rsp = self.http.post(url).json(&payload).send().await.map_err(|e| NotifyError::failed("telegram", e))?;
        if !rsp.status().is_success() {
            let code = rsp.status();
            let body = rsp.text().await.unwrap_or_default();
            return Err(NotifyError::failed("telegram", format!("HTTP {code}: {body}")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SMTP email
// ---------------------------------------------------------------------------
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailChannel {
    pub fn new(cfg: &SmtpCfg) -> Result<Self, ConfigError> {
        let invalid = |key: &'static str, value: &str, e: &dyn std::fmt::Display| ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        };

        // secure=true -> implicit TLS (465); otherwise STARTTLS when offered
        let builder = if cfg.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host).map_err(|e| invalid("SMTP_HOST", &cfg.host, &e))?
        } else {
            let tls = TlsParameters::new(cfg.host.clone()).map_err(|e| invalid("SMTP_HOST", &cfg.host, &e))?;
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.host).tls(Tls::Opportunistic(tls))
        };
        let mut builder = builder.port(cfg.port).timeout(Some(HTTP_TIMEOUT));
        if let Some((user, pass)) = &cfg.credentials {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = Mailbox::new(
            Some("AI Trading Bot".to_string()),
            cfg.sender.parse().map_err(|e| invalid("EMAIL_SENDER", &cfg.sender, &e))?,
        );
        let to: Mailbox = cfg.recipient.parse().map_err(|e| invalid("EMAIL_RECIPIENT", &cfg.recipient, &e))?;
        Ok(Self { transport: builder.build(), from, to })
    }
}

fn subject_for(kind: NoticeKind) -> &'static str {
    match kind {
        NoticeKind::Success => "Trade executed",
        NoticeKind::Error => "Trade execution failed",
        NoticeKind::Info => "Trading bot notice",
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str { "email" }

    async fn deliver(&self, kind: NoticeKind, message: &str) -> Result<(), NotifyError> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject_for(kind))
            .header(ContentType::TEXT_PLAIN)
            .body(message.to_string())
            .map_err(|e| NotifyError::failed("email", e))?;
        self.transport.send(email).await.map_err(|e| NotifyError::failed("email", e))?;
        Ok(())
    }
}
