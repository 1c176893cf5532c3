//! Notification rules, log categories and line matching
//!
//! Each [`Rule`] belongs to exactly one [`LogCategory`]. A category only needs a
//! tailing worker while at least one of its rules is enabled.

use crate::EntityId;
use crate::notification::Notification;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

/// Per-character notification toggles.
///
/// `Copy` on purpose: every read out of the registry is an independent snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationRuleSet {
    pub cargo_full: bool,
    pub hostile_aggression: bool,
    pub autopilot_jump: bool,
    pub local_chat: bool,
    pub corp_chat: bool,
    pub alliance_chat: bool,
}

impl NotificationRuleSet {
    pub fn is_enabled(&self, rule: Rule) -> bool {
        match rule {
            Rule::CargoFull => self.cargo_full,
            Rule::HostileAggression => self.hostile_aggression,
            Rule::AutopilotJump => self.autopilot_jump,
            Rule::LocalChat => self.local_chat,
            Rule::CorpChat => self.corp_chat,
            Rule::AllianceChat => self.alliance_chat,
        }
    }

    pub fn set(&mut self, rule: Rule, enabled: bool) {
        let slot = match rule {
            Rule::CargoFull => &mut self.cargo_full,
            Rule::HostileAggression => &mut self.hostile_aggression,
            Rule::AutopilotJump => &mut self.autopilot_jump,
            Rule::LocalChat => &mut self.local_chat,
            Rule::CorpChat => &mut self.corp_chat,
            Rule::AllianceChat => &mut self.alliance_chat,
        };
        *slot = enabled;
    }

    /// Builder-style variant of [`set`](Self::set) with `enabled = true`.
    pub fn with(mut self, rule: Rule) -> Self {
        self.set(rule, true);
        self
    }

    /// True if any enabled rule reads logs of `category`.
    pub fn requires(&self, category: LogCategory) -> bool {
        Rule::ALL
            .iter()
            .any(|rule| rule.category() == category && self.is_enabled(*rule))
    }
}

/// Text encoding of a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEncoding {
    Utf8,
    /// EVE chat logs: UTF-16 little endian with a BOM.
    Utf16Le,
}

/// A class of log file that a set of rules depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum LogCategory {
    Gamelog,
    LocalChat,
    CorpChat,
    AllianceChat,
}

impl LogCategory {
    pub const ALL: [LogCategory; 4] = [
        LogCategory::Gamelog,
        LogCategory::LocalChat,
        LogCategory::CorpChat,
        LogCategory::AllianceChat,
    ];

    /// Subdirectory of the EVE log root holding this category's files.
    pub fn dir_name(self) -> &'static str {
        match self {
            LogCategory::Gamelog => "Gamelogs",
            LogCategory::LocalChat | LogCategory::CorpChat | LogCategory::AllianceChat => {
                "Chatlogs"
            }
        }
    }

    /// Channel-name prefix in chat log file names.
    fn file_prefix(self) -> &'static str {
        match self {
            LogCategory::Gamelog => "",
            LogCategory::LocalChat => "Local_",
            LogCategory::CorpChat => "Corp_",
            LogCategory::AllianceChat => "Alliance_",
        }
    }

    pub fn encoding(self) -> LogEncoding {
        match self {
            LogCategory::Gamelog => LogEncoding::Utf8,
            _ => LogEncoding::Utf16Le,
        }
    }

    /// File name pattern `<prefix><YYYYMMDD>_<HHMMSS>_<id>.txt` for one entity.
    pub fn file_pattern(self, entity: EntityId) -> Regex {
        let pattern = format!(
            r"^{}\d{{8}}_\d{{6}}_{}\.txt$",
            regex::escape(self.file_prefix()),
            entity.0
        );
        // Only digits and an escaped literal prefix are interpolated.
        Regex::new(&pattern).expect("log file pattern is a valid regex")
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogCategory::Gamelog => "gamelog",
            LogCategory::LocalChat => "local-chat",
            LogCategory::CorpChat => "corp-chat",
            LogCategory::AllianceChat => "alliance-chat",
        }
    }
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single notification toggle and the log pattern it reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Rule {
    CargoFull,
    HostileAggression,
    AutopilotJump,
    LocalChat,
    CorpChat,
    AllianceChat,
}

static MARKUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("markup regex"));
static CARGO_FULL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Ship's cargo hold is full").expect("cargo regex"));
static INCOMING_COMBAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(combat\)\s.*\bfrom\b").expect("combat regex"));
static AUTOPILOT_JUMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Jumping from (?P<from>.+?) to (?P<to>.+?)\s*$").expect("jump regex")
});
static CHAT_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[\s*\d{4}\.\d{2}\.\d{2}\s+\d{2}:\d{2}:\d{2}\s*\]\s*(?P<speaker>.+?)\s+>\s?(?P<text>.*)$",
    )
    .expect("chat regex")
});

/// Speaker name EVE uses for channel housekeeping messages (MOTD, joins).
const SYSTEM_SPEAKER: &str = "EVE System";

/// Minimum spacing between two combat notifications from one worker.
const COMBAT_COOLDOWN: Duration = Duration::from_secs(60);

impl Rule {
    pub const ALL: [Rule; 6] = [
        Rule::CargoFull,
        Rule::HostileAggression,
        Rule::AutopilotJump,
        Rule::LocalChat,
        Rule::CorpChat,
        Rule::AllianceChat,
    ];

    pub fn category(self) -> LogCategory {
        match self {
            Rule::CargoFull | Rule::HostileAggression | Rule::AutopilotJump => {
                LogCategory::Gamelog
            }
            Rule::LocalChat => LogCategory::LocalChat,
            Rule::CorpChat => LogCategory::CorpChat,
            Rule::AllianceChat => LogCategory::AllianceChat,
        }
    }

    fn title(self) -> &'static str {
        match self {
            Rule::CargoFull => "EVE Notify - Mining",
            Rule::HostileAggression => "EVE Notify - Combat",
            Rule::AutopilotJump => "EVE Notify - Autopilot",
            Rule::LocalChat => "EVE Notify - Local Chat",
            Rule::CorpChat => "EVE Notify - Corp Chat",
            Rule::AllianceChat => "EVE Notify - Alliance Chat",
        }
    }

    /// Sound is reserved for rare or urgent events.
    fn with_sound(self) -> bool {
        !matches!(self, Rule::AutopilotJump | Rule::LocalChat)
    }

    fn cooldown(self) -> Duration {
        match self {
            Rule::HostileAggression => COMBAT_COOLDOWN,
            _ => Duration::ZERO,
        }
    }

    /// Message body for a matching line, or `None` if the line does not match.
    fn message(self, entity: EntityId, line: &str) -> Option<String> {
        match self {
            Rule::CargoFull => CARGO_FULL
                .is_match(line)
                .then(|| format!("Character {entity}: Your ship's cargo hold is full.")),
            Rule::HostileAggression => INCOMING_COMBAT
                .is_match(line)
                .then(|| format!("Character {entity}: You are under attack.")),
            Rule::AutopilotJump => AUTOPILOT_JUMP.captures(line).map(|caps| {
                format!(
                    "Character {entity}: Jumping from {} to {}.",
                    &caps["from"], &caps["to"]
                )
            }),
            Rule::LocalChat | Rule::CorpChat | Rule::AllianceChat => {
                let caps = CHAT_MESSAGE.captures(line)?;
                let speaker = caps["speaker"].trim();
                if speaker == SYSTEM_SPEAKER {
                    return None;
                }
                Some(format!("Character {entity}: {speaker}: {}", caps["text"].trim()))
            }
        }
    }
}

/// Remove EVE's inline markup (`<color=0xff...>`, `<b>`, `<font size=10>`).
pub fn strip_markup(line: &str) -> Cow<'_, str> {
    MARKUP.replace_all(line, "")
}

/// Matches lines of one category for one entity.
///
/// Holds the per-rule cooldown state, so a worker keeps one matcher for its
/// whole lifetime.
#[derive(Debug)]
pub struct LineMatcher {
    entity: EntityId,
    category: LogCategory,
    last_fired: HashMap<Rule, Instant>,
}

impl LineMatcher {
    pub fn new(entity: EntityId, category: LogCategory) -> Self {
        Self {
            entity,
            category,
            last_fired: HashMap::new(),
        }
    }

    pub fn evaluate(&mut self, rules: &NotificationRuleSet, line: &str) -> Vec<Notification> {
        let line = strip_markup(line);
        let now = Instant::now();
        let mut out = Vec::new();

        for rule in Rule::ALL {
            if rule.category() != self.category || !rules.is_enabled(rule) {
                continue;
            }
            let Some(message) = rule.message(self.entity, &line) else {
                continue;
            };
            if let Some(last) = self.last_fired.get(&rule)
                && now.saturating_duration_since(*last) < rule.cooldown()
            {
                continue;
            }
            self.last_fired.insert(rule, now);
            out.push(Notification {
                title: rule.title().to_string(),
                message,
                with_sound: rule.with_sound(),
            });
        }

        out
    }
}
