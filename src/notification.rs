//! Notification delivery
//!
//! The monitoring core only knows [`NotificationSink`]. Sinks are
//! fire-and-forget: `notify` must return promptly and never wait on delivery.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A notification request produced by a matched log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    /// Whether an accompanying sound cue is warranted.
    pub with_sound: bool,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) {
        info!(
            title = %notification.title,
            sound = notification.with_sound,
            "{}",
            notification.message
        );
    }
}

/// Forwards notifications into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("notification receiver dropped");
        }
    }
}

/// Shows desktop notifications through the platform's notifier command
/// (`osascript` on macOS, `notify-send` elsewhere).
///
/// Must be used from within a tokio runtime: each notification is delivered on
/// its own spawned task.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopNotifier;

impl NotificationSink for DesktopNotifier {
    fn notify(&self, notification: Notification) {
        debug!(title = %notification.title, "sending desktop notification");
        tokio::spawn(async move {
            let mut command = desktop_command(&notification);
            match command.output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(status = %output.status, "desktop notifier failed: {}", stderr.trim());
                }
                Err(e) => warn!(error = %e, "failed to run desktop notifier"),
            }
        });
    }
}

#[cfg(target_os = "macos")]
fn desktop_command(notification: &Notification) -> tokio::process::Command {
    let mut script = format!(
        "display notification \"{}\" with title \"{}\"",
        escape_applescript(&notification.message),
        escape_applescript(&notification.title)
    );
    if notification.with_sound {
        script.push_str(" sound name \"Glass\"");
    }
    let mut command = tokio::process::Command::new("osascript");
    command.args(["-e", &script]);
    command
}

#[cfg(target_os = "macos")]
fn escape_applescript(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(not(target_os = "macos"))]
fn desktop_command(notification: &Notification) -> tokio::process::Command {
    // notify-send has no sound flag; critical urgency is the closest cue and
    // lets the desktop's sound theme play its alert.
    let urgency = if notification.with_sound {
        "critical"
    } else {
        "normal"
    };
    let mut command = tokio::process::Command::new("notify-send");
    command.args([
        "--app-name=eve-notify",
        "-u",
        urgency,
        &notification.title,
        &notification.message,
    ]);
    command
}
