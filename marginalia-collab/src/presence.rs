//! Presence protocol: who is looking at what in a shared document.
//!
//! Presence is ephemeral. It never enters the replicated annotation state and
//! is never persisted; collaborators disappear from the view once they have
//! been silent for longer than the configured idle window, with or without a
//! `Leave` message.
//!
//! ```text
//! set_local_presence()
//!       │
//!       ▼
//! AwarenessMessage::Update { … }  ── bincode ──►  transport (external)
//!                                                     │
//!                                                     ▼
//!                                  remote PresenceRoom::apply_presence()
//!                                                     │
//!                                                     ▼
//!                                  get_all_presence()  (idle peers hidden)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use marginalia_core::now_millis;

/// Default window after which a silent collaborator is dropped.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub idle_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_PRESENCE_TIMEOUT,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable `#rrggbb` color for a collaborator.
///
/// Hue comes from the id; saturation and lightness are fixed so every
/// collaborator gets a vivid, readable indicator.
pub fn color_for(id: Uuid) -> String {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        to_channel(r),
        to_channel(g),
        to_channel(b)
    )
}

fn to_channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// State and wire messages
// ───────────────────────────────────────────────────────────────────

/// One collaborator's presence as exposed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub collaborator_id: Uuid,
    pub display_name: String,
    pub color: String,
    pub cursor_offset: Option<usize>,
    /// Selected character range `[start, end)`.
    pub selection: Option<(usize, usize)>,
    /// Wall-clock milliseconds of the last update.
    pub last_updated: u64,
}

/// Awareness messages exchanged over the ephemeral channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    Join {
        collaborator_id: Uuid,
        display_name: String,
    },

    Update {
        collaborator_id: Uuid,
        display_name: String,
        cursor_offset: Option<usize>,
        selection: Option<(usize, usize)>,
        /// Sender-local monotonic clock; older updates are discarded.
        clock: u64,
    },

    Leave {
        collaborator_id: Uuid,
    },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }

    pub fn collaborator_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { collaborator_id, .. } => *collaborator_id,
            AwarenessMessage::Update { collaborator_id, .. } => *collaborator_id,
            AwarenessMessage::Leave { collaborator_id } => *collaborator_id,
        }
    }
}

/// A remote collaborator tracked locally.
#[derive(Debug, Clone)]
struct RemotePresence {
    state: PresenceState,
    clock: u64,
    last_seen: Instant,
}

impl RemotePresence {
    fn new(collaborator_id: Uuid, display_name: String) -> Self {
        Self {
            state: PresenceState {
                collaborator_id,
                display_name,
                color: color_for(collaborator_id),
                cursor_offset: None,
                selection: None,
                last_updated: now_millis(),
            },
            clock: 0,
            last_seen: Instant::now(),
        }
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

/// Presence for every collaborator on one document, as seen by this replica.
#[derive(Debug)]
pub struct PresenceRoom {
    local_id: Uuid,
    local_name: String,
    /// `None` until the local collaborator has published anything.
    local: Option<PresenceState>,
    clock: u64,
    peers: HashMap<Uuid, RemotePresence>,
    config: PresenceConfig,
}

impl PresenceRoom {
    pub fn new(local_id: Uuid, local_name: impl Into<String>) -> Self {
        Self::with_config(local_id, local_name, PresenceConfig::default())
    }

    pub fn with_config(local_id: Uuid, local_name: impl Into<String>, config: PresenceConfig) -> Self {
        Self {
            local_id,
            local_name: local_name.into(),
            local: None,
            clock: 0,
            peers: HashMap::new(),
            config,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Record the local cursor/selection and return the message to broadcast.
    pub fn set_local_presence(
        &mut self,
        cursor_offset: Option<usize>,
        selection: Option<(usize, usize)>,
    ) -> AwarenessMessage {
        self.clock += 1;
        self.local = Some(PresenceState {
            collaborator_id: self.local_id,
            display_name: self.local_name.clone(),
            color: color_for(self.local_id),
            cursor_offset,
            selection,
            last_updated: now_millis(),
        });

        AwarenessMessage::Update {
            collaborator_id: self.local_id,
            display_name: self.local_name.clone(),
            cursor_offset,
            selection,
            clock: self.clock,
        }
    }

    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join {
            collaborator_id: self.local_id,
            display_name: self.local_name.clone(),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            collaborator_id: self.local_id,
        }
    }

    /// Ingest an awareness message. Returns `false` for self-echoes and
    /// stale updates.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        if msg.collaborator_id() == self.local_id {
            return false;
        }

        match msg {
            AwarenessMessage::Join { collaborator_id, display_name } => {
                let peer = self
                    .peers
                    .entry(*collaborator_id)
                    .or_insert_with(|| RemotePresence::new(*collaborator_id, display_name.clone()));
                peer.state.display_name = display_name.clone();
                peer.last_seen = Instant::now();
                log::debug!("Collaborator {} joined presence", collaborator_id);
                true
            }

            AwarenessMessage::Update {
                collaborator_id,
                display_name,
                cursor_offset,
                selection,
                clock,
            } => {
                let peer = self
                    .peers
                    .entry(*collaborator_id)
                    .or_insert_with(|| RemotePresence::new(*collaborator_id, display_name.clone()));
                if *clock <= peer.clock {
                    log::trace!("Stale presence from {} ({} <= {})", collaborator_id, clock, peer.clock);
                    return false;
                }
                peer.clock = *clock;
                peer.last_seen = Instant::now();
                peer.state.display_name = display_name.clone();
                peer.state.cursor_offset = *cursor_offset;
                peer.state.selection = *selection;
                peer.state.last_updated = now_millis();
                true
            }

            AwarenessMessage::Leave { collaborator_id } => {
                log::debug!("Collaborator {} left presence", collaborator_id);
                self.peers.remove(collaborator_id).is_some()
            }
        }
    }

    /// Decode and ingest a wire message. Malformed bytes are dropped.
    pub fn apply_presence(&mut self, bytes: &[u8]) -> bool {
        match AwarenessMessage::decode(bytes) {
            Ok(msg) => self.handle_message(&msg),
            Err(e) => {
                log::warn!("Dropping malformed presence message ({} bytes): {}", bytes.len(), e);
                false
            }
        }
    }

    /// Every collaborator that is not idle, including the local one once it
    /// has published.
    pub fn get_all_presence(&self) -> HashMap<Uuid, PresenceState> {
        let timeout = self.config.idle_timeout;
        let mut all: HashMap<Uuid, PresenceState> = self
            .peers
            .iter()
            .filter(|(_, p)| !p.is_idle(timeout))
            .map(|(id, p)| (*id, p.state.clone()))
            .collect();
        if let Some(local) = &self.local {
            all.insert(self.local_id, local.clone());
        }
        all
    }

    /// Forget collaborators idle past the timeout. Returns their ids.
    pub fn prune_idle(&mut self) -> Vec<Uuid> {
        let timeout = self.config.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }
        if !stale.is_empty() {
            log::debug!("Pruned {} idle collaborators", stale.len());
        }
        stale
    }

    /// Remote collaborators currently tracked, idle or not.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

// ===================================================================
// Tests
// ===================================================================
