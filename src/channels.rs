//! Client-side bookkeeping of channel subscriptions.

use dashmap::DashMap;
use serde_json::Value;

use crate::events::{ChannelEvent, ChannelHub};
use crate::protocol::UnsubscribeReason;

/// Subscription state of a tracked channel.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Requested, or suspended after a kick-out or connection loss
    Pending,
    /// Confirmed by the server
    Subscribed,
}

#[derive(Debug)]
struct Entry {
    state: ChannelState,
    /// Bumped by every subscribe request
    attempt: u64,
    /// Connection the latest request was issued on, until that request settles
    requested_on: Option<u64>,
}

/// Channel name to [`ChannelState`], plus the event hub its transitions feed.
///
/// Map guards are always released before an event is dispatched.
#[derive(Debug, Default)]
pub(crate) struct ChannelRegistry {
    entries: DashMap<String, Entry>,
    hub: ChannelHub,
}

impl ChannelRegistry {
    pub(crate) fn hub(&self) -> &ChannelHub {
        &self.hub
    }

    pub(crate) fn state(&self, channel: &str) -> Option<ChannelState> {
        self.entries.get(channel).map(|entry| entry.state)
    }

    /// Tracks `channel` as [`ChannelState::Pending`] unless already tracked and records a
    /// subscribe request issued on `connection_id`. Returns the attempt number, or `None`
    /// without recording anything when the channel is already subscribed.
    pub(crate) fn begin_subscribe(&self, channel: &str, connection_id: u64) -> Option<u64> {
        let mut entry = self.entries.entry(channel.to_owned()).or_insert(Entry {
            state: ChannelState::Pending,
            attempt: 0,
            requested_on: None,
        });
        if entry.state == ChannelState::Subscribed {
            return None;
        }
        entry.attempt += 1;
        entry.requested_on = Some(connection_id);
        Some(entry.attempt)
    }

    /// Settles subscribe request `attempt`. With `confirmed` set, a channel that is still
    /// tracked and pending becomes subscribed; returns whether it did.
    ///
    /// Callers only confirm acks received on the connection that is currently open.
    pub(crate) fn finish_subscribe(&self, channel: &str, attempt: u64, confirmed: bool) -> bool {
        let subscribed = self.entries.get_mut(channel).is_some_and(|mut entry| {
            if entry.attempt == attempt {
                entry.requested_on = None;
            }
            if confirmed && entry.state == ChannelState::Pending {
                entry.state = ChannelState::Subscribed;
                true
            } else {
                false
            }
        });
        if subscribed {
            self.hub.dispatch(channel, ChannelEvent::Subscribe);
        }
        subscribed
    }

    /// Stops tracking `channel`, emitting a client unsubscribe if it was subscribed.
    pub(crate) fn remove(&self, channel: &str) -> Option<ChannelState> {
        let (_, entry) = self.entries.remove(channel)?;
        if entry.state == ChannelState::Subscribed {
            self.hub.dispatch(
                channel,
                ChannelEvent::Unsubscribe {
                    reason: UnsubscribeReason::Client,
                    data: None,
                },
            );
        }
        Some(entry.state)
    }

    /// Moves a subscribed channel back to pending after the server kicked the client out.
    pub(crate) fn kick_out(&self, channel: &str, data: Value) -> bool {
        if !self.suspend(channel) {
            return false;
        }
        self.hub.dispatch(
            channel,
            ChannelEvent::Unsubscribe {
                reason: UnsubscribeReason::KickOut,
                data: Some(data),
            },
        );
        true
    }

    /// Moves every subscribed channel back to pending after the connection was lost.
    pub(crate) fn suspend_all(&self) -> Vec<String> {
        let suspended: Vec<String> = self
            .entries
            .iter_mut()
            .filter_map(|mut entry| {
                (entry.state == ChannelState::Subscribed).then(|| {
                    entry.state = ChannelState::Pending;
                    entry.key().clone()
                })
            })
            .collect();

        for channel in &suspended {
            self.hub.dispatch(
                channel,
                ChannelEvent::Unsubscribe {
                    reason: UnsubscribeReason::BadConnection,
                    data: None,
                },
            );
        }
        suspended
    }

    /// Pending channels to re-issue.
    ///
    /// With `buffered_on` set, channels whose latest request was issued on that connection
    /// and has not settled yet are skipped; that request is still on its way.
    pub(crate) fn resumable(&self, buffered_on: Option<u64>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.state == ChannelState::Pending
                    && (buffered_on.is_none() || entry.requested_on != buffered_on)
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Tracked channel names, sorted.
    pub(crate) fn subscriptions(&self, include_pending: bool) -> Vec<String> {
        let mut channels: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| include_pending || entry.state == ChannelState::Subscribed)
            .map(|entry| entry.key().clone())
            .collect();
        channels.sort_unstable();
        channels
    }

    pub(crate) fn has_subscribed(&self, channel: &str, include_pending: bool) -> bool {
        self.state(channel)
            .is_some_and(|state| include_pending || state == ChannelState::Subscribed)
    }

    /// Delivers a publication to listeners of a subscribed channel; publications for
    /// anything else are dropped.
    pub(crate) fn publish(&self, channel: &str, data: Value, is_binary: bool) -> bool {
        if !self.has_subscribed(channel, false) {
            return false;
        }
        self.hub
            .dispatch(channel, ChannelEvent::Publish { data, is_binary });
        true
    }

    fn suspend(&self, channel: &str) -> bool {
        self.entries.get_mut(channel).is_some_and(|mut entry| {
            let subscribed = entry.state == ChannelState::Subscribed;
            if subscribed {
                entry.state = ChannelState::Pending;
            }
            subscribed
        })
    }
}
