//! Lock keys for the storage-level inventory locks.
//!
//! A booking locks every (trip, identity) and (trip, seat) pair it is about to
//! claim; a refund locks the tickets it reverses and then the orders it
//! recomputes. Keys are acquired in one global order so two engine
//! transactions never wait on each other in a cycle.

use std::collections::BTreeSet;
use std::fmt;
use transit_shared::IdentityNumber;
use uuid::Uuid;

/// A single exclusive hold. Variant order is the acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Identity { trip_id: Uuid, identity: IdentityNumber },
    Seat { trip_id: Uuid, seat_id: Uuid },
    Ticket(Uuid),
    Order(Uuid),
}

impl fmt::Display for LockKey {
    /// Stable textual form. The PostgreSQL adapter hashes it into an advisory
    /// lock id, so it must never change for a given key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Identity { trip_id, identity } => {
                write!(f, "identity:{}:{}", trip_id, identity.expose())
            }
            LockKey::Seat { trip_id, seat_id } => write!(f, "seat:{}:{}", trip_id, seat_id),
            LockKey::Ticket(id) => write!(f, "ticket:{}", id),
            LockKey::Order(id) => write!(f, "order:{}", id),
        }
    }
}

/// Deduplicated, ordered set of keys to acquire in one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSet {
    keys: BTreeSet<LockKey>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys a booking needs before it may check availability.
    pub fn for_booking<'a, I, S>(trip_id: Uuid, identities: I, seats: S) -> Self
    where
        I: IntoIterator<Item = &'a IdentityNumber>,
        S: IntoIterator<Item = Uuid>,
    {
        let mut set = Self::new();
        for identity in identities {
            set.insert(LockKey::Identity { trip_id, identity: identity.clone() });
        }
        for seat_id in seats {
            set.insert(LockKey::Seat { trip_id, seat_id });
        }
        set
    }

    pub fn for_tickets<I: IntoIterator<Item = Uuid>>(ids: I) -> Self {
        ids.into_iter().map(LockKey::Ticket).collect()
    }

    pub fn for_orders<I: IntoIterator<Item = Uuid>>(ids: I) -> Self {
        ids.into_iter().map(LockKey::Order).collect()
    }

    pub fn insert(&mut self, key: LockKey) {
        self.keys.insert(key);
    }

    pub fn iter(&self) -> impl Iterator<Item = &LockKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Ticket ids in acquisition order.
    pub fn ticket_ids(&self) -> Vec<Uuid> {
        self.keys
            .iter()
            .filter_map(|k| match k {
                LockKey::Ticket(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Order ids in acquisition order.
    pub fn order_ids(&self) -> Vec<Uuid> {
        self.keys
            .iter()
            .filter_map(|k| match k {
                LockKey::Order(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl FromIterator<LockKey> for LockSet {
    fn from_iter<T: IntoIterator<Item = LockKey>>(iter: T) -> Self {
        Self { keys: iter.into_iter().collect() }
    }
}
