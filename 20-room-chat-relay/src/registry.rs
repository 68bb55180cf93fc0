//! Authoritative room membership for the relay.
//!
//! The registry never performs I/O. Each operation mutates membership and
//! returns the list of [`Delivery`] values the caller must push out, so the
//! fan-out audience is always computed from the membership state the
//! operation itself produced.

use std::collections::{BTreeSet, HashMap};

use crate::message::{ConnectionId, RoomCode, ServerEvent};

/// One outbound event addressed to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub event: ServerEvent,
}

impl Delivery {
    fn new(to: &ConnectionId, event: ServerEvent) -> Self {
        Self {
            to: to.clone(),
            event,
        }
    }
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomCode, BTreeSet<ConnectionId>>,
    // Reverse index so a dropped transport can be removed from every room it joined.
    memberships: HashMap<ConnectionId, BTreeSet<RoomCode>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` to `room`, creating the room on first join.
    ///
    /// Everyone already in the room hears `userJoined`. Joining a room the
    /// connection is already in changes nothing and announces nothing.
    pub fn join(&mut self, conn: &ConnectionId, room: &RoomCode) -> Vec<Delivery> {
        let members = self.rooms.entry(room.clone()).or_default();
        if !members.insert(conn.clone()) {
            return Vec::new();
        }

        self.memberships
            .entry(conn.clone())
            .or_default()
            .insert(room.clone());

        members
            .iter()
            .filter(|member| *member != conn)
            .map(|member| Delivery::new(member, ServerEvent::UserJoined(conn.clone())))
            .collect()
    }

    /// Removes `conn` from `room`.
    ///
    /// The leaving connection always receives `roomLeft`, even when it was
    /// never a member. Remaining members hear `userLeft` only when the
    /// membership actually changed.
    pub fn leave(&mut self, conn: &ConnectionId, room: &RoomCode) -> Vec<Delivery> {
        let mut deliveries = vec![Delivery::new(conn, ServerEvent::RoomLeft(room.clone()))];

        if self.remove_member(conn, room) {
            if let Some(rooms) = self.memberships.get_mut(conn) {
                rooms.remove(room);
                if rooms.is_empty() {
                    self.memberships.remove(conn);
                }
            }
            deliveries.extend(self.announce_departure(conn, room));
        }

        deliveries
    }

    /// Addresses `event` to every member of `room` except `sender`.
    ///
    /// Returns nothing when the sender is not a member of the room.
    pub fn broadcast_from(
        &self,
        sender: &ConnectionId,
        room: &RoomCode,
        event: ServerEvent,
    ) -> Vec<Delivery> {
        if !self.is_member(sender, room) {
            return Vec::new();
        }

        self.rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter(|member| *member != sender)
            .map(|member| Delivery::new(member, event.clone()))
            .collect()
    }

    /// Drops `conn` from every room it belonged to.
    ///
    /// Remaining members of each room hear `userLeft`; the departed
    /// connection itself is sent nothing.
    pub fn disconnect(&mut self, conn: &ConnectionId) -> Vec<Delivery> {
        let Some(rooms) = self.memberships.remove(conn) else {
            return Vec::new();
        };

        let mut deliveries = Vec::new();
        for room in rooms {
            if self.remove_member(conn, &room) {
                deliveries.extend(self.announce_departure(conn, &room));
            }
        }
        deliveries
    }

    pub fn is_member(&self, conn: &ConnectionId, room: &RoomCode) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(conn))
    }

    pub fn members(&self, room: &RoomCode) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, conn: &ConnectionId) -> Vec<RoomCode> {
        self.memberships
            .get(conn)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn remove_member(&mut self, conn: &ConnectionId, room: &RoomCode) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(conn);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    fn announce_departure(&self, conn: &ConnectionId, room: &RoomCode) -> Vec<Delivery> {
        self.rooms
            .get(room)
            .into_iter()
            .flatten()
            .map(|member| Delivery::new(member, ServerEvent::UserLeft(conn.clone())))
            .collect()
    }
}
