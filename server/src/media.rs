//! Media signaling: per-space stream registry and WebRTC relay.
//!
//! The registry never touches media bytes. It tracks which users have
//! audio/video/screen streams up, relays negotiation signals
//! point-to-point between peers, and emits the stream lifecycle events
//! the rest of the space renders from.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{WsError, WsResult};
use crate::events::{SignalType, SpaceEvent, UserEvent};
use crate::router::SpaceRouter;
use crate::spaces::{Presence, SpaceQueue, SpaceUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Screen => "screen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaState {
    Enabled,
    Disabled,
    Muted,
}

/// One active stream. At most one per (user, kind) within a space.
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub stream_id: String,
    pub user_id: Uuid,
    pub space_id: Uuid,
    pub kind: MediaKind,
    pub state: MediaState,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<Value>,
}

/// Stream listing embedded in `space_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaStreamInfo {
    pub stream_id: String,
    pub user_id: Uuid,
    pub user_name: String,
    pub state: MediaState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceMediaInfo {
    pub space_id: Uuid,
    pub audio_streams: Vec<MediaStreamInfo>,
    pub video_streams: Vec<MediaStreamInfo>,
    pub screen_streams: Vec<MediaStreamInfo>,
    pub total_audio: usize,
    pub total_video: usize,
    pub total_screen: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaStatsSnapshot {
    pub total_streams_started: u64,
    pub active_audio: usize,
    pub active_video: usize,
    pub active_screen: usize,
    pub webrtc_signals: u64,
    pub peer_links: usize,
}

#[derive(Default)]
struct MediaTables {
    audio: HashMap<Uuid, MediaStream>,
    video: HashMap<Uuid, MediaStream>,
    screen: HashMap<Uuid, MediaStream>,
    peers: HashMap<Uuid, HashSet<Uuid>>,
    last_stamp: i64,
}

impl MediaTables {
    fn table(&self, kind: MediaKind) -> &HashMap<Uuid, MediaStream> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
            MediaKind::Screen => &self.screen,
        }
    }

    fn table_mut(&mut self, kind: MediaKind) -> &mut HashMap<Uuid, MediaStream> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
            MediaKind::Screen => &mut self.screen,
        }
    }

    /// Millisecond stamp that never repeats within this registry, so
    /// stream ids stay unique even for back-to-back starts.
    fn next_stamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_stamp = if now > self.last_stamp {
            now
        } else {
            self.last_stamp + 1
        };
        self.last_stamp
    }
}

/// Registry for one space, guarded by its own lock next to the
/// broadcaster's presence state.
pub struct MediaRegistry {
    space_id: Uuid,
    queue: SpaceQueue,
    router: Arc<SpaceRouter>,
    presence: Arc<Mutex<Presence>>,
    tables: Mutex<MediaTables>,
    streams_started: AtomicU64,
    webrtc_signals: AtomicU64,
}

impl MediaRegistry {
    pub fn new(
        space_id: Uuid,
        queue: SpaceQueue,
        router: Arc<SpaceRouter>,
        presence: Arc<Mutex<Presence>>,
    ) -> Self {
        Self {
            space_id,
            queue,
            router,
            presence,
            tables: Mutex::new(MediaTables::default()),
            streams_started: AtomicU64::new(0),
            webrtc_signals: AtomicU64::new(0),
        }
    }

    /// Start a stream of `kind` for the user. Rejected when the user is
    /// not in the space or already has a stream of this kind.
    pub fn start_stream(
        &self,
        kind: MediaKind,
        user_id: Uuid,
        metadata: Option<Value>,
    ) -> WsResult<String> {
        let user_name = {
            let presence = self.presence.lock();
            if !presence.contains(user_id) {
                return Err(WsError::Authorization("User not in space".to_string()));
            }
            presence.user_name(user_id)
        };

        let (stream_id, timestamp) = {
            let mut tables = self.tables.lock();
            if tables.table(kind).contains_key(&user_id) {
                return Err(WsError::Conflict(format!(
                    "Already streaming {}",
                    kind.as_str()
                )));
            }

            let stamp = tables.next_stamp();
            let timestamp = Utc
                .timestamp_millis_opt(stamp)
                .single()
                .unwrap_or_else(Utc::now);
            let stream_id = format!("{}_{}_{}_{}", kind.as_str(), user_id, self.space_id, stamp);
            tables.table_mut(kind).insert(
                user_id,
                MediaStream {
                    stream_id: stream_id.clone(),
                    user_id,
                    space_id: self.space_id,
                    kind,
                    state: MediaState::Enabled,
                    timestamp,
                    metadata,
                },
            );
            (stream_id, timestamp)
        };

        self.queue.enqueue(SpaceUpdate::new(stream_started_event(
            kind,
            user_id,
            user_name,
            self.space_id,
            stream_id.clone(),
            timestamp,
        )))?;

        self.streams_started.fetch_add(1, Ordering::Relaxed);
        info!(stream = %stream_id, user = %user_id, space = %self.space_id, "stream started");
        Ok(stream_id)
    }

    /// Stop the user's stream of `kind`.
    pub fn stop_stream(&self, kind: MediaKind, user_id: Uuid) -> WsResult<String> {
        let stream = self
            .tables
            .lock()
            .table_mut(kind)
            .remove(&user_id)
            .ok_or_else(|| {
                WsError::NotFound(format!("User not streaming {}", kind.as_str()))
            })?;

        let user_name = self.presence.lock().user_name(user_id);
        self.queue.enqueue(SpaceUpdate::new(stream_stopped_event(
            kind,
            user_id,
            user_name,
            self.space_id,
            stream.stream_id.clone(),
            Utc::now(),
        )))?;

        info!(stream = %stream.stream_id, user = %user_id, "stream stopped");
        Ok(stream.stream_id)
    }

    pub fn mute_audio(&self, user_id: Uuid) -> WsResult<()> {
        self.set_audio_state(user_id, MediaState::Muted)
    }

    pub fn unmute_audio(&self, user_id: Uuid) -> WsResult<()> {
        self.set_audio_state(user_id, MediaState::Enabled)
    }

    fn set_audio_state(&self, user_id: Uuid, state: MediaState) -> WsResult<()> {
        {
            let mut tables = self.tables.lock();
            let stream = tables
                .audio
                .get_mut(&user_id)
                .ok_or_else(|| WsError::NotFound("User not streaming audio".to_string()))?;
            stream.state = state;
        }

        let user_name = self.presence.lock().user_name(user_id);
        let event = match state {
            MediaState::Muted => SpaceEvent::AudioMuted {
                user_id,
                user_name,
                space_id: self.space_id,
                timestamp: Utc::now(),
            },
            _ => SpaceEvent::AudioUnmuted {
                user_id,
                user_name,
                space_id: self.space_id,
                timestamp: Utc::now(),
            },
        };
        self.queue.enqueue(SpaceUpdate::new(event))?;
        Ok(())
    }

    /// Relay a WebRTC negotiation signal to its target. Point-to-point:
    /// the event goes straight to the target connection, never through
    /// the broadcast queue, and an absent target is a failure rather
    /// than a queued delivery.
    pub fn relay_signal(
        &self,
        signal_type: SignalType,
        from_user_id: Uuid,
        to_user_id: Uuid,
        data: Value,
    ) -> WsResult<()> {
        {
            let presence = self.presence.lock();
            if !presence.contains(from_user_id) || !presence.contains(to_user_id) {
                return Err(WsError::Authorization("Users not in same space".to_string()));
            }
        }

        let target = self
            .router
            .lookup_user(to_user_id)
            .ok_or_else(|| WsError::NotFound("Target user is not connected".to_string()))?;

        self.tables
            .lock()
            .peers
            .entry(from_user_id)
            .or_default()
            .insert(to_user_id);

        target.send_event(&UserEvent::WebrtcSignal {
            signal_type,
            from_user_id,
            space_id: self.space_id,
            data,
            timestamp: Utc::now(),
        })?;

        self.webrtc_signals.fetch_add(1, Ordering::Relaxed);
        debug!(?signal_type, from = %from_user_id, to = %to_user_id, "signal relayed");
        Ok(())
    }

    /// Tear down everything the user owns: streams of every kind (with
    /// the usual stopped events) and their peer links.
    pub fn cleanup_user(&self, user_id: Uuid) {
        for kind in [MediaKind::Audio, MediaKind::Video, MediaKind::Screen] {
            match self.stop_stream(kind, user_id) {
                Ok(_) | Err(WsError::NotFound(_)) => {}
                Err(err) => {
                    warn!(user = %user_id, kind = kind.as_str(), error = %err, "stream cleanup failed")
                }
            }
        }

        let mut tables = self.tables.lock();
        tables.peers.remove(&user_id);
        for peers in tables.peers.values_mut() {
            peers.remove(&user_id);
        }
        debug!(user = %user_id, "media state cleaned up");
    }

    /// Snapshot of all active streams, enriched with display names from
    /// the space's presence state.
    pub fn space_media_info(&self) -> SpaceMediaInfo {
        let tables = self.tables.lock();
        let presence = self.presence.lock();

        let collect = |table: &HashMap<Uuid, MediaStream>| {
            let mut streams: Vec<MediaStreamInfo> = table
                .values()
                .map(|s| MediaStreamInfo {
                    stream_id: s.stream_id.clone(),
                    user_id: s.user_id,
                    user_name: presence.user_name(s.user_id),
                    state: s.state,
                    timestamp: s.timestamp,
                })
                .collect();
            streams.sort_by_key(|s| s.user_id);
            streams
        };

        let audio_streams = collect(&tables.audio);
        let video_streams = collect(&tables.video);
        let screen_streams = collect(&tables.screen);

        SpaceMediaInfo {
            space_id: self.space_id,
            total_audio: audio_streams.len(),
            total_video: video_streams.len(),
            total_screen: screen_streams.len(),
            audio_streams,
            video_streams,
            screen_streams,
        }
    }

    pub fn stats(&self) -> MediaStatsSnapshot {
        let tables = self.tables.lock();
        MediaStatsSnapshot {
            total_streams_started: self.streams_started.load(Ordering::Relaxed),
            active_audio: tables.audio.len(),
            active_video: tables.video.len(),
            active_screen: tables.screen.len(),
            webrtc_signals: self.webrtc_signals.load(Ordering::Relaxed),
            peer_links: tables.peers.values().map(HashSet::len).sum(),
        }
    }
}

fn stream_started_event(
    kind: MediaKind,
    user_id: Uuid,
    user_name: String,
    space_id: Uuid,
    stream_id: String,
    timestamp: DateTime<Utc>,
) -> SpaceEvent {
    match kind {
        MediaKind::Audio => SpaceEvent::AudioStreamStarted {
            user_id,
            user_name,
            space_id,
            stream_id,
            timestamp,
        },
        MediaKind::Video => SpaceEvent::VideoStreamStarted {
            user_id,
            user_name,
            space_id,
            stream_id,
            timestamp,
        },
        MediaKind::Screen => SpaceEvent::ScreenStreamStarted {
            user_id,
            user_name,
            space_id,
            stream_id,
            timestamp,
        },
    }
}

fn stream_stopped_event(
    kind: MediaKind,
    user_id: Uuid,
    user_name: String,
    space_id: Uuid,
    stream_id: String,
    timestamp: DateTime<Utc>,
) -> SpaceEvent {
    match kind {
        MediaKind::Audio => SpaceEvent::AudioStreamStopped {
            user_id,
            user_name,
            space_id,
            stream_id,
            timestamp,
        },
        MediaKind::Video => SpaceEvent::VideoStreamStopped {
            user_id,
            user_name,
            space_id,
            stream_id,
            timestamp,
        },
        MediaKind::Screen => SpaceEvent::ScreenStreamStopped {
            user_id,
            user_name,
            space_id,
            stream_id,
            timestamp,
        },
    }
}
