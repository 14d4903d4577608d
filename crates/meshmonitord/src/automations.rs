//! Settings-driven automations
//!
//! Each automation is a predicate over new mesh activity plus, for the
//! scheduled ones, an interval task. Behavior is configured through the
//! store's settings table so the UI can flip it at runtime; the engine
//! re-reads its settings on every trigger.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use meshmonitor_device::AutomationHooks;
use meshmonitor_proto::types::role_name;
use meshmonitor_store::{Message, Node, Store};

use crate::config::TracerouteConfig;
use crate::outbox::Outbox;

/// Auto-ack: reply to texts matching a pattern once the mesh settles.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoAckSettings {
    pub enabled: bool,
    pub pattern: String,
    #[serde(default)]
    pub reply_text: Option<String>,
    #[serde(default)]
    pub tapback_emoji: Option<String>,
    #[serde(default = "default_ack_delay")]
    pub delay_secs: u64,
    #[serde(default)]
    pub skip_unnamed_nodes: bool,
}

fn default_ack_delay() -> u64 {
    3
}

/// Auto-welcome: greet a node once, ever.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoWelcomeSettings {
    pub enabled: bool,
    pub message: String,
    #[serde(default)]
    pub wait_for_name: bool,
    #[serde(default)]
    pub max_hops: Option<u32>,
    #[serde(default)]
    pub channel: u32,
}

/// Auto-announce: periodic channel broadcast.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoAnnounceSettings {
    pub enabled: bool,
    pub message: String,
    #[serde(default = "default_announce_interval")]
    pub interval_minutes: u32,
    #[serde(default)]
    pub channel: u32,
    #[serde(default)]
    pub on_startup: bool,
}

fn default_announce_interval() -> u32 {
    360
}

/// One auto-responder rule.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponderRule {
    pub trigger: String,
    pub response: String,
    #[serde(default)]
    pub is_regex: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoResponderSettings {
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<ResponderRule>,
}

/// Destination pool filters for the scheduled traceroute; each filter has
/// its own enable bit and the enabled ones are applied conjunctively.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TracerouteFilters {
    #[serde(default)]
    pub by_channel: Option<FilterList<i32>>,
    #[serde(default)]
    pub by_role: Option<FilterList<String>>,
    #[serde(default)]
    pub by_hw_model: Option<FilterList<i32>>,
    #[serde(default)]
    pub by_name: Option<NameFilter>,
    #[serde(default)]
    pub explicit: Option<FilterList<u32>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterList<T> {
    pub enabled: bool,
    #[serde(default = "Vec::new")]
    pub values: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameFilter {
    pub enabled: bool,
    pub pattern: String,
}

/// The automation engine; plugs into the router via [`AutomationHooks`].
pub struct AutomationEngine {
    store: Arc<Store>,
    outbox: Arc<Outbox>,
    traceroute: TracerouteConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutomationEngine {
    pub fn new(store: Arc<Store>, outbox: Arc<Outbox>, traceroute: TracerouteConfig) -> Arc<Self> {
        Arc::new(AutomationEngine {
            store,
            outbox,
            traceroute,
            tasks: Mutex::new(Vec::new()),
        })
    }

    async fn setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.store.get_setting(key).await.ok().flatten()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Malformed {} setting: {}", key, e);
                None
            }
        }
    }

    /// Spawn the scheduled automations (announce, traceroute).
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let engine = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            engine.run_announcer().await;
        }));

        if self.traceroute.enabled {
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                engine.run_scheduled_traceroute().await;
            }));
            info!(
                "Scheduled traceroute enabled (every {} min)",
                self.traceroute.interval_minutes
            );
        }
    }

    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    // === Auto-ack ===

    async fn check_auto_ack(&self, message: &Message) {
        let Some(settings) = self.setting::<AutoAckSettings>("auto_ack").await else {
            return;
        };
        if !settings.enabled || message.emoji {
            return;
        }

        let Ok(pattern) = regex::Regex::new(&settings.pattern) else {
            warn!("Invalid auto-ack pattern: {}", settings.pattern);
            return;
        };
        if !pattern.is_match(&message.text) {
            return;
        }

        if settings.skip_unnamed_nodes {
            let named = self
                .store
                .get_node(message.from_node_num)
                .await
                .ok()
                .flatten()
                .map(|n| n.long_name.is_some())
                .unwrap_or(false);
            if !named {
                debug!("Auto-ack skipping unnamed node {}", message.from_node_id);
                return;
            }
        }

        // Reply into the same conversation the message arrived on.
        let (channel, destination) = conversation_of(message);
        let reply_to = message.id;
        let outbox = Arc::clone(&self.outbox);
        let delay = settings.delay_secs;

        tokio::spawn(async move {
            // Let the mesh settle before answering.
            sleep(Duration::from_secs(delay)).await;

            if let Some(emoji) = settings.tapback_emoji {
                if let Err(e) = outbox
                    .send_text(&emoji, channel, destination, Some(reply_to), true)
                    .await
                {
                    warn!("Auto-ack tapback failed: {}", e);
                }
            }
            if let Some(text) = settings.reply_text {
                if let Err(e) = outbox
                    .send_text(&text, channel, destination, None, false)
                    .await
                {
                    warn!("Auto-ack reply failed: {}", e);
                }
            }
        });
    }

    // === Auto-responder ===

    async fn check_auto_responder(&self, message: &Message) {
        let Some(settings) = self.setting::<AutoResponderSettings>("auto_responder").await
        else {
            return;
        };
        if !settings.enabled || message.emoji {
            return;
        }

        for rule in &settings.rules {
            let matched = if rule.is_regex {
                regex::Regex::new(&rule.trigger)
                    .map(|r| r.is_match(&message.text))
                    .unwrap_or(false)
            } else {
                message
                    .text
                    .to_lowercase()
                    .contains(&rule.trigger.to_lowercase())
            };

            if matched {
                let (channel, destination) = conversation_of(message);
                if let Err(e) = self
                    .outbox
                    .send_text(&rule.response, channel, destination, None, false)
                    .await
                {
                    warn!("Auto-responder failed: {}", e);
                }
                return;
            }
        }
    }

    // === Auto-welcome ===

    async fn check_auto_welcome(&self, node: &Node) {
        if node.welcomed_at.is_some() {
            return;
        }
        let Some(settings) = self.setting::<AutoWelcomeSettings>("auto_welcome").await else {
            return;
        };
        if !settings.enabled {
            return;
        }

        if settings.wait_for_name && node.long_name.is_none() {
            return;
        }
        if let Some(max_hops) = settings.max_hops {
            if node.hops_away.map(|h| h as u32 > max_hops).unwrap_or(true) {
                return;
            }
        }

        // The store mark is the at-most-once gate; whoever loses the race
        // stops here.
        match self
            .store
            .mark_node_welcomed_if_not_already(node.node_num)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("Welcome mark failed: {}", e);
                return;
            }
        }

        let name = node
            .long_name
            .clone()
            .unwrap_or_else(|| node.node_id.clone());
        let text = settings.message.replace("{name}", &name);
        info!("Welcoming {} ({})", name, node.node_id);
        if let Err(e) = self
            .outbox
            .send_text(&text, Some(settings.channel), None, None, false)
            .await
        {
            warn!("Welcome message failed: {}", e);
        }
    }

    // === Auto-announce ===

    async fn run_announcer(self: Arc<Self>) {
        if let Some(settings) = self.setting::<AutoAnnounceSettings>("auto_announce").await {
            if settings.enabled && settings.on_startup {
                if let Err(e) = self
                    .outbox
                    .send_text(&settings.message, Some(settings.channel), None, None, false)
                    .await
                {
                    warn!("Startup announcement failed: {}", e);
                }
            }
        }

        let mut ticker = interval(Duration::from_secs(60));
        let mut minutes: u32 = 0;
        loop {
            ticker.tick().await;
            minutes += 1;

            let Some(settings) = self.setting::<AutoAnnounceSettings>("auto_announce").await
            else {
                continue;
            };
            if !settings.enabled || settings.interval_minutes == 0 {
                continue;
            }
            if minutes % settings.interval_minutes != 0 {
                continue;
            }

            debug!("Sending scheduled announcement");
            if let Err(e) = self
                .outbox
                .send_text(&settings.message, Some(settings.channel), None, None, false)
                .await
            {
                warn!("Announcement failed: {}", e);
            }
        }
    }

    // === Scheduled traceroute ===

    async fn run_scheduled_traceroute(self: Arc<Self>) {
        let period = Duration::from_secs(u64::from(self.traceroute.interval_minutes.max(1)) * 60);
        let mut ticker = interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let filters = self
                .setting::<TracerouteFilters>("traceroute_filters")
                .await
                .unwrap_or_default();

            match self.pick_traceroute_target(&filters).await {
                Some(target) => {
                    info!("Scheduled traceroute to {:#010x}", target);
                    if let Err(e) = self.outbox.send_traceroute(target).await {
                        warn!("Scheduled traceroute failed: {}", e);
                    }
                }
                None => debug!("Traceroute pool empty after filtering"),
            }
        }
    }

    async fn pick_traceroute_target(&self, filters: &TracerouteFilters) -> Option<u32> {
        let nodes = self.store.get_active_nodes(24).await.ok()?;
        let name_regex = filters
            .by_name
            .as_ref()
            .filter(|f| f.enabled)
            .and_then(|f| regex::Regex::new(&f.pattern).ok());

        let pool: Vec<u32> = nodes
            .iter()
            .filter(|node| {
                if let Some(f) = filters.by_channel.as_ref().filter(|f| f.enabled) {
                    if !node.channel.map(|c| f.values.contains(&c)).unwrap_or(false) {
                        return false;
                    }
                }
                if let Some(f) = filters.by_role.as_ref().filter(|f| f.enabled) {
                    let role = node.role.map(role_name).unwrap_or("UNKNOWN");
                    if !f.values.iter().any(|v| v == role) {
                        return false;
                    }
                }
                if let Some(f) = filters.by_hw_model.as_ref().filter(|f| f.enabled) {
                    if !node.hw_model.map(|m| f.values.contains(&m)).unwrap_or(false) {
                        return false;
                    }
                }
                if let Some(re) = &name_regex {
                    let name = node.long_name.as_deref().unwrap_or("");
                    if !re.is_match(name) {
                        return false;
                    }
                }
                if let Some(f) = filters.explicit.as_ref().filter(|f| f.enabled) {
                    if !f.values.contains(&node.node_num) {
                        return false;
                    }
                }
                true
            })
            .map(|node| node.node_num)
            .collect();

        pool.choose(&mut rand::thread_rng()).copied()
    }
}

/// Map a stored message back to the conversation to reply on:
/// `(channel, destination)` for [`Outbox::send_text`].
fn conversation_of(message: &Message) -> (Option<u32>, Option<u32>) {
    if message.channel >= 0 {
        (Some(message.channel as u32), None)
    } else {
        (None, Some(message.from_node_num))
    }
}

#[async_trait]
impl AutomationHooks for AutomationEngine {
    async fn on_text_message(&self, message: &Message) {
        self.check_auto_ack(message).await;
        self.check_auto_responder(message).await;
    }

    async fn on_node_seen(&self, node: &Node) {
        self.check_auto_welcome(node).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_mapping() {
        let mut message = Message {
            id: 1,
            from_node_num: 0x20,
            to_node_num: 0xFFFF_FFFF,
            from_node_id: "!00000020".to_string(),
            to_node_id: "!ffffffff".to_string(),
            channel: 2,
            text: "ping".to_string(),
            timestamp: 0,
            portnum: 1,
            reply_id: None,
            emoji: false,
            hop_start: None,
            hop_limit: None,
            via_mqtt: false,
            delivery_state: None,
            ack_failed: false,
            request_id: None,
            is_local: false,
            created_at: 0,
        };
        assert_eq!(conversation_of(&message), (Some(2), None));

        message.channel = -1;
        assert_eq!(conversation_of(&message), (None, Some(0x20)));
    }

    #[test]
    fn test_settings_parse_with_defaults() {
        let settings: AutoAckSettings =
            serde_json::from_str(r#"{"enabled": true, "pattern": "^ping$"}"#).unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.delay_secs, 3);
        assert!(settings.reply_text.is_none());

        let settings: AutoWelcomeSettings = serde_json::from_str(
            r#"{"enabled": true, "message": "Welcome {name}!", "wait_for_name": true}"#,
        )
        .unwrap();
        assert!(settings.wait_for_name);
        assert!(settings.max_hops.is_none());

        let filters: TracerouteFilters = serde_json::from_str(
            r#"{"by_role": {"enabled": true, "values": ["ROUTER"]}}"#,
        )
        .unwrap();
        assert!(filters.by_role.unwrap().enabled);
        assert!(filters.by_channel.is_none());
    }
}
