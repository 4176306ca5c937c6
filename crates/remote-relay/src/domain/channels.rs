//! Channel membership.
//!
//! A channel is an unordered room keyed by its token.  Members keep their
//! join order so `channel_joined` lists peers in the order they arrived.
//! Empty channels are removed so their keys can be generated again.

use std::collections::HashMap;

use remote_core::protocol::messages::ClientInfo;
use remote_core::{ChannelToken, ConnectionType, PeerId};

/// One client in one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub id: PeerId,
    pub connection_type: ConnectionType,
}

impl From<Member> for ClientInfo {
    fn from(member: Member) -> Self {
        Self {
            id: member.id,
            connection_type: Some(member.connection_type),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelToken, Vec<Member>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `member` to `channel` and returns the members that were already
    /// there.  Joining twice with the same id replaces the earlier entry.
    pub fn join(&mut self, channel: &ChannelToken, member: Member) -> Vec<Member> {
        let members = self.channels.entry(channel.clone()).or_default();
        members.retain(|m| m.id != member.id);
        let existing = members.clone();
        members.push(member);
        existing
    }

    /// Removes `id` from `channel` and returns the removed member together
    /// with the members that remain.
    pub fn leave(&mut self, channel: &ChannelToken, id: PeerId) -> Option<(Member, Vec<Member>)> {
        let members = self.channels.get_mut(channel)?;
        let index = members.iter().position(|m| m.id == id)?;
        let left = members.remove(index);
        let remaining = members.clone();
        if remaining.is_empty() {
            self.channels.remove(channel);
        }
        Some((left, remaining))
    }

    pub fn members(&self, channel: &ChannelToken) -> &[Member] {
        self.channels.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Members of `channel` other than `id`.
    pub fn others(&self, channel: &ChannelToken, id: PeerId) -> Vec<Member> {
        self.members(channel)
            .iter()
            .filter(|m| m.id != id)
            .copied()
            .collect()
    }

    /// Whether anyone is in `channel`.
    pub fn is_occupied(&self, channel: &ChannelToken) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
