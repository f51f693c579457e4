use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterInput {
    Join(String),
    Leave(String),
    /// Authoritative replacement.
    Snapshot(BTreeSet<String>),
}

/// Currently connected players, corrected by periodic snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    players: BTreeSet<String>,
}

impl Roster {
    /// Returns whether the set changed.
    pub fn apply(&mut self, input: RosterInput) -> bool {
        match input {
            RosterInput::Join(id) => self.players.insert(id),
            RosterInput::Leave(id) => self.players.remove(&id),
            RosterInput::Snapshot(ids) => {
                if self.players == ids {
                    return false;
                }
                self.players = ids;
                true
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.players.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Sorted list for the wire.
    pub fn to_vec(&self) -> Vec<String> {
        self.players.iter().cloned().collect()
    }
}
