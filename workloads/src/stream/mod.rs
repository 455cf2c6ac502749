/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2024. All rights reserved.
 * KubeOS is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

//! Per-deployment event channels. Writers publish events carrying a
//! monotonic id per channel; readers replay history from a given id and
//! then follow the live events until the channel is closed.

pub mod sse;

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};

use self::stream_error::Error;

const CHANNEL_CAPACITY: usize = 1024;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Title,
    Message,
    StepStatus,
    PhaseStatus,
    End,
    Error,
    Heartbeat,
    Close,
}

impl EventKind {
    /// Transport events never show up in history.
    pub fn is_internal(&self) -> bool {
        matches!(self, EventKind::Heartbeat | EventKind::Close)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Title => "title",
            EventKind::Message => "message",
            EventKind::StepStatus => "step-status",
            EventKind::PhaseStatus => "phase-status",
            EventKind::End => "end",
            EventKind::Error => "error",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Close => "close",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: u64,
    pub event: EventKind,
    pub data: Value,
}

impl StreamEvent {
    fn heartbeat() -> Self {
        StreamEvent { id: 0, event: EventKind::Heartbeat, data: json!({}) }
    }
}

struct Channel {
    sender: broadcast::Sender<StreamEvent>,
    history: Arc<RwLock<Vec<StreamEvent>>>,
    next_id: u64,
    closed: bool,
    created_at: DateTime<Utc>,
}

impl Channel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Channel { sender, history: Arc::default(), next_id: 1, closed: false, created_at: Utc::now() }
    }
}

#[derive(Default)]
pub struct EventHub {
    channels: RwLock<HashMap<String, Channel>>,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    pub async fn create(&self, channel_id: &str) {
        let mut channels = self.channels.write().await;
        channels.entry(channel_id.to_string()).or_insert_with(Channel::new);
    }

    pub async fn exists(&self, channel_id: &str) -> bool {
        self.channels.read().await.contains_key(channel_id)
    }

    pub async fn publish(&self, channel_id: &str, event: EventKind, data: Value) -> Result<u64, Error> {
        let mut channels = self.channels.write().await;
        let channel = channels.get_mut(channel_id).ok_or_else(|| Error::ChannelNotFound { id: channel_id.to_string() })?;
        if channel.closed {
            return Err(Error::ChannelClosed { id: channel_id.to_string() });
        }
        let id = channel.next_id;
        channel.next_id += 1;
        let stream_event = StreamEvent { id, event, data };
        if !event.is_internal() {
            channel.history.write().await.push(stream_event.clone());
        }
        // no live subscriber is fine, history still has the event
        let _ = channel.sender.send(stream_event);
        Ok(id)
    }

    pub async fn write_title(&self, channel_id: &str, title: &str) -> Result<u64, Error> {
        self.publish(channel_id, EventKind::Title, json!({ "title": title })).await
    }

    pub async fn write_message(&self, channel_id: &str, line: &str) -> Result<u64, Error> {
        self.publish(channel_id, EventKind::Message, json!({ "line": line, "stream": "STDOUT" })).await
    }

    pub async fn write_error(&self, channel_id: &str, line: &str) -> Result<u64, Error> {
        self.publish(channel_id, EventKind::Error, json!({ "line": line, "stream": "STDERR" })).await
    }

    /// Publishes the internal close marker; live readers stop after it.
    pub async fn close(&self, channel_id: &str) -> Result<(), Error> {
        self.publish(channel_id, EventKind::Close, json!({})).await?;
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(channel_id) {
            channel.closed = true;
        }
        debug!("Closed event channel {}", channel_id);
        Ok(())
    }

    pub async fn is_closed(&self, channel_id: &str) -> bool {
        self.channels.read().await.get(channel_id).map_or(true, |c| c.closed)
    }

    /// Visible events with an id greater than `last_event_id`.
    pub async fn history(
        &self,
        channel_id: &str,
        last_event_id: Option<u64>,
        include_ansi_codes: bool,
    ) -> Result<Vec<StreamEvent>, Error> {
        let channels = self.channels.read().await;
        let channel = channels.get(channel_id).ok_or_else(|| Error::ChannelNotFound { id: channel_id.to_string() })?;
        let after = last_event_id.unwrap_or(0);
        let history = channel.history.read().await;
        let events = history
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .map(|e| if include_ansi_codes { e } else { sse::strip_event_ansi(e) })
            .collect();
        Ok(events)
    }

    /// Replays history after `last_event_id`, then follows live events with
    /// a heartbeat while idle. Ends at the close marker.
    pub async fn subscribe(
        &self,
        channel_id: &str,
        last_event_id: Option<u64>,
        include_ansi_codes: bool,
    ) -> Result<BoxStream<'static, StreamEvent>, Error> {
        let channels = self.channels.read().await;
        let channel = channels.get(channel_id).ok_or_else(|| Error::ChannelNotFound { id: channel_id.to_string() })?;
        let after = last_event_id.unwrap_or(0);
        let backlog: VecDeque<StreamEvent> =
            channel.history.read().await.iter().filter(|e| e.id > after).cloned().collect();
        let state = Follow {
            backlog,
            history: channel.history.clone(),
            receiver: channel.sender.subscribe(),
            last_id: channel.next_id - 1,
            done: channel.closed,
            include_ansi_codes,
        };
        Ok(futures::stream::unfold(state, |mut state| async move {
            let event = state.next().await?;
            Some((event, state))
        })
        .boxed())
    }

    /// Drops closed channels nobody is reading anymore.
    pub async fn purge(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, c| !c.closed || c.sender.receiver_count() > 0);
        before - channels.len()
    }

    /// Drops closed channels created more than `max_age` ago.
    pub async fn purge_older_than(&self, max_age: chrono::Duration) -> usize {
        let now = Utc::now();
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, c| !c.closed || now - c.created_at < max_age);
        before - channels.len()
    }
}

struct Follow {
    backlog: VecDeque<StreamEvent>,
    history: Arc<RwLock<Vec<StreamEvent>>>,
    receiver: broadcast::Receiver<StreamEvent>,
    last_id: u64,
    done: bool,
    include_ansi_codes: bool,
}

impl Follow {
    fn visible(&self, event: StreamEvent) -> StreamEvent {
        if self.include_ansi_codes {
            event
        } else {
            sse::strip_event_ansi(event)
        }
    }

    /// Queues every history event the receiver dropped. Later copies still in
    /// the broadcast buffer are skipped by id.
    async fn refill(&mut self) {
        let history = self.history.read().await;
        self.backlog.extend(history.iter().filter(|e| e.id > self.last_id).cloned());
        if let Some(last) = self.backlog.back() {
            self.last_id = last.id;
        }
    }

    async fn next(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(self.visible(event));
        }
        if self.done {
            return None;
        }
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(self.visible(event));
            }
            match tokio::time::timeout(HEARTBEAT_INTERVAL, self.receiver.recv()).await {
                Err(_) => return Some(StreamEvent::heartbeat()),
                Ok(Ok(event)) if event.id <= self.last_id => continue,
                Ok(Ok(event)) if event.event == EventKind::Close => {
                    self.done = true;
                    return None;
                },
                Ok(Ok(event)) => {
                    self.last_id = event.id;
                    return Some(self.visible(event));
                },
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!("event subscriber lagged behind by {} events, refilling from history", skipped);
                    self.refill().await;
                },
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
            }
        }
    }
}

pub mod stream_error {
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        #[error("Event channel {id} does not exist")]
        ChannelNotFound { id: String },

        #[error("Event channel {id} is already closed")]
        ChannelClosed { id: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_ids_are_monotonic_and_history_is_filtered() {
        let hub = EventHub::new();
        hub.create("d1").await;
        assert_eq!(hub.write_title("d1", "Preparing").await.unwrap(), 1);
        assert_eq!(hub.write_message("d1", "\u{1b}[1;32mok\u{1b}[0m").await.unwrap(), 2);
        hub.close("d1").await.unwrap();
        let history = hub.history("d1", Some(1), false).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].data["line"], "ok");
        let raw = hub.history("d1", None, true).await.unwrap();
        assert_eq!(raw[1].data["line"], "\u{1b}[1;32mok\u{1b}[0m");
        assert!(matches!(hub.write_message("d1", "late").await, Err(Error::ChannelClosed { .. })));
        assert!(matches!(hub.history("d2", None, false).await, Err(Error::ChannelNotFound { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_follows() {
        let hub = std::sync::Arc::new(EventHub::new());
        hub.create("d1").await;
        hub.write_title("d1", "Building").await.unwrap();
        let mut stream = hub.subscribe("d1", None, false).await.unwrap();
        let writer = {
            let hub = hub.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(700)).await;
                hub.write_message("d1", "-----> Compiling app").await.unwrap();
                hub.close("d1").await.unwrap();
            })
        };
        let mut kinds = Vec::new();
        while let Some(event) = stream.next().await {
            kinds.push(event.event);
        }
        writer.await.unwrap();
        assert_eq!(kinds.first(), Some(&EventKind::Title));
        assert!(kinds.contains(&EventKind::Heartbeat));
        assert_eq!(kinds.last(), Some(&EventKind::Message));
    }

    #[tokio::test]
    async fn test_slow_subscriber_receives_every_event() {
        let hub = EventHub::new();
        hub.create("d1").await;
        let stream = hub.subscribe("d1", None, true).await.unwrap();
        let total = CHANNEL_CAPACITY * 2;
        for i in 0..total {
            hub.write_message("d1", &format!("line {}", i)).await.unwrap();
        }
        hub.close("d1").await.unwrap();
        let events: Vec<StreamEvent> =
            stream.filter(|e| futures::future::ready(e.event == EventKind::Message)).collect().await;
        assert_eq!(events.len(), total);
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, (1..=total as u64).collect::<Vec<_>>());
        assert_eq!(events[total - 1].data["line"], format!("line {}", total - 1));
    }

    #[tokio::test]
    async fn test_purge_closed_channels() {
        let hub = EventHub::new();
        hub.create("d1").await;
        hub.create("d2").await;
        hub.close("d1").await.unwrap();
        let reader = hub.subscribe("d2", None, false).await.unwrap();
        assert_eq!(hub.purge().await, 1);
        assert!(!hub.exists("d1").await);
        assert!(hub.exists("d2").await);
        drop(reader);
    }
}
