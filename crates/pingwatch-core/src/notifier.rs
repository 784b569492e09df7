use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::model::{Device, DeviceId};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    ChannelClosed,
    #[error("notification queue full, dropped {0} event")]
    QueueFull(&'static str),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Receives transition events from the monitors.
///
/// Calls must return promptly; any slow delivery belongs on the
/// implementation's own task.
pub trait Notifier: Send + Sync {
    fn notify_down(&self, device: &Device, timestamp: DateTime<Utc>) -> Result<(), NotifyError>;

    fn notify_up(
        &self,
        device: &Device,
        timestamp: DateTime<Utc>,
        downtime: Option<Duration>,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Down,
    Up,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Down => "down",
            AlertKind::Up => "up",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub event: AlertKind,
    pub device_id: DeviceId,
    pub display_name: String,
    pub address: String,
    pub timestamp: DateTime<Utc>,
    pub downtime_secs: Option<u64>,
    pub message: String,
}

impl AlertEvent {
    pub fn down(device: &Device, timestamp: DateTime<Utc>) -> Self {
        let message = format!(
            "ALERT: device down\n\nDevice: {}\nAddress: {}\nTime: {}",
            device.display_name,
            device.address,
            format_local(timestamp)
        );
        Self::build(AlertKind::Down, device, timestamp, None, message)
    }

    pub fn up(device: &Device, timestamp: DateTime<Utc>, downtime: Option<Duration>) -> Self {
        let message = format!(
            "RECOVERED: device back online\n\nDevice: {}\nAddress: {}\nTime: {}\nDowntime: {}",
            device.display_name,
            device.address,
            format_local(timestamp),
            describe_downtime(downtime)
        );
        Self::build(AlertKind::Up, device, timestamp, downtime, message)
    }

    fn build(
        event: AlertKind,
        device: &Device,
        timestamp: DateTime<Utc>,
        downtime: Option<Duration>,
        message: String,
    ) -> Self {
        Self {
            event,
            device_id: device.id,
            display_name: device.display_name.clone(),
            address: device.address.clone(),
            timestamp,
            downtime_secs: downtime.map(|d| d.as_secs()),
            message,
        }
    }
}

fn format_local(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%d/%m/%Y %H:%M:%S").to_string()
}

/// Downtime rounded to whole minutes.
pub fn describe_downtime(downtime: Option<Duration>) -> String {
    match downtime {
        Some(d) => {
            let minutes = (d.as_secs_f64() / 60.0).round() as u64;
            format!("{minutes} minutes")
        }
        None => "unknown".to_string(),
    }
}

/// Writes alerts to the tracing output.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_down(&self, device: &Device, timestamp: DateTime<Utc>) -> Result<(), NotifyError> {
        warn!(
            device_id = device.id,
            address = %device.address,
            at = %timestamp.to_rfc3339(),
            "device {} is down",
            device.display_name
        );
        Ok(())
    }

    fn notify_up(
        &self,
        device: &Device,
        timestamp: DateTime<Utc>,
        downtime: Option<Duration>,
    ) -> Result<(), NotifyError> {
        info!(
            device_id = device.id,
            address = %device.address,
            at = %timestamp.to_rfc3339(),
            downtime = %describe_downtime(downtime),
            "device {} recovered",
            device.display_name
        );
        Ok(())
    }
}

/// Posts alerts over HTTP from a background task, either as the raw
/// `AlertEvent` JSON to a webhook or as a Telegram Bot API message.
pub struct WebhookNotifier {
    tx: mpsc::Sender<AlertEvent>,
}

enum Endpoint {
    Webhook { url: String },
    Telegram { api_url: String, chat_id: String },
}

impl Endpoint {
    fn telegram(bot_token: &str, chat_id: impl Into<String>) -> Self {
        Endpoint::Telegram {
            api_url: format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
            chat_id: chat_id.into(),
        }
    }

    fn request(&self, client: &reqwest::Client, event: &AlertEvent) -> reqwest::RequestBuilder {
        match self {
            Endpoint::Webhook { url } => client.post(url).json(event),
            Endpoint::Telegram { api_url, chat_id } => client.post(api_url).json(&TelegramMessage::new(chat_id, event)),
        }
    }
}

#[derive(Debug, Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

impl<'a> TelegramMessage<'a> {
    fn new(chat_id: &'a str, event: &AlertEvent) -> Self {
        Self {
            chat_id,
            text: escape_html(&event.message),
            parse_mode: "HTML",
        }
    }
}

/// Escapes the characters Telegram's HTML parse mode reserves.
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

impl WebhookNotifier {
    /// Spawns a task posting every alert as JSON to `url`.
    pub fn spawn(url: impl Into<String>, capacity: usize) -> (Self, JoinHandle<()>) {
        Self::spawn_to(Endpoint::Webhook { url: url.into() }, capacity)
    }

    /// Spawns a task sending every alert's message to a Telegram chat.
    pub fn spawn_telegram(bot_token: &str, chat_id: impl Into<String>, capacity: usize) -> (Self, JoinHandle<()>) {
        Self::spawn_to(Endpoint::telegram(bot_token, chat_id), capacity)
    }

    fn spawn_to(endpoint: Endpoint, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(deliver_loop(reqwest::Client::new(), endpoint, rx));
        (Self { tx }, handle)
    }

    fn enqueue(&self, event: AlertEvent) -> Result<(), NotifyError> {
        let kind = event.event.as_str();
        self.tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => NotifyError::QueueFull(kind),
            mpsc::error::TrySendError::Closed(_) => NotifyError::ChannelClosed,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify_down(&self, device: &Device, timestamp: DateTime<Utc>) -> Result<(), NotifyError> {
        self.enqueue(AlertEvent::down(device, timestamp))
    }

    fn notify_up(
        &self,
        device: &Device,
        timestamp: DateTime<Utc>,
        downtime: Option<Duration>,
    ) -> Result<(), NotifyError> {
        self.enqueue(AlertEvent::up(device, timestamp, downtime))
    }
}

async fn deliver_loop(client: reqwest::Client, endpoint: Endpoint, mut rx: mpsc::Receiver<AlertEvent>) {
    while let Some(event) = rx.recv().await {
        if let Err(err) = post_event(&client, &endpoint, &event).await {
            warn!(device_id = event.device_id, event = event.event.as_str(), error = %err, "webhook delivery failed");
        }
    }
}

async fn post_event(client: &reqwest::Client, endpoint: &Endpoint, event: &AlertEvent) -> Result<(), NotifyError> {
    let response = endpoint
        .request(client, event)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|err| NotifyError::Delivery(err.to_string()))?;

    if !response.status().is_success() {
        return Err(NotifyError::Delivery(format!("status {}", response.status())));
    }
    Ok(())
}

/// Forwards every alert to each inner notifier; the first error is returned
/// after all of them have been tried.
pub struct FanoutNotifier {
    targets: Vec<Box<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Box<dyn Notifier>>) -> Self {
        Self { targets }
    }

    fn each(&self, f: impl Fn(&dyn Notifier) -> Result<(), NotifyError>) -> Result<(), NotifyError> {
        let mut first_err = None;
        for target in &self.targets {
            if let Err(err) = f(target.as_ref()) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Notifier for FanoutNotifier {
    fn notify_down(&self, device: &Device, timestamp: DateTime<Utc>) -> Result<(), NotifyError> {
        self.each(|n| n.notify_down(device, timestamp))
    }

    fn notify_up(
        &self,
        device: &Device,
        timestamp: DateTime<Utc>,
        downtime: Option<Duration>,
    ) -> Result<(), NotifyError> {
        self.each(|n| n.notify_up(device, timestamp, downtime))
    }
}
