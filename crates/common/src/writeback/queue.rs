//! Per-path FIFO of changes waiting to reach the remote
//!
//! Changes are grouped into lanes. A lane is keyed by the path that opened
//! it; a rename aliases its destination into the source's lane so every
//! later change to the destination waits behind the rename. At most one
//! worker holds a lane at a time, which keeps each path's changes in
//! enqueue order without ordering unrelated paths.
//!
//! Only changes that have not started are ever coalesced. The change a
//! worker is currently applying sits apart in `in_flight`.

use std::collections::{HashMap, HashSet, VecDeque};

use super::change::{ChangeOp, PendingChange};

#[derive(Debug, Default)]
struct Lane {
    changes: VecDeque<PendingChange>,
    in_flight: Option<PendingChange>,
}

impl Lane {
    fn is_idle(&self) -> bool {
        self.changes.is_empty() && self.in_flight.is_none()
    }

    fn touches(&self, path: &str) -> bool {
        self.in_flight.iter().any(|c| c.touches(path)) || self.changes.iter().any(|c| c.touches(path))
    }
}

#[derive(Debug, Default)]
pub struct WriteBackQueue {
    lanes: HashMap<String, Lane>,
    /// destination path -> lane of the rename that produced it
    aliases: HashMap<String, String>,
    next_seq: u64,
}

impl WriteBackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane_key(&self, path: &str) -> String {
        self.aliases
            .get(path)
            .cloned()
            .unwrap_or_else(|| path.to_string())
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Queue a change, coalescing with the lane's tail where possible
    ///
    /// `remote_known` tells whether the remote has ever held `path`. Returns
    /// the lane key when the lane just went from idle to busy and must be
    /// handed to a worker.
    pub fn enqueue(
        &mut self,
        path: &str,
        op: ChangeOp,
        generation: u64,
        remote_known: bool,
    ) -> Option<String> {
        let key = self.lane_key(path);
        let seq = self.next_seq();
        let rename_to = match &op {
            ChangeOp::Rename { to } => Some(to.clone()),
            _ => None,
        };
        if let Some(to) = &rename_to {
            self.supersede(to, &key);
        }

        let lane = self.lanes.entry(key.clone()).or_default();
        let was_idle = lane.is_idle();
        let change = PendingChange {
            path: path.to_string(),
            op,
            seq,
            generation,
        };

        let tail_is_path = lane.changes.back().map(|t| t.path == path).unwrap_or(false);
        if !tail_is_path {
            Self::push(lane, change);
        } else {
            // the tail touching `path` is set aside to see whether anything
            // else in the lane already made `path` remote-known
            let tail = lane.changes.pop_back();
            let known = remote_known || lane.touches(path);
            match tail {
                Some(tail) => Self::coalesce(lane, tail, change, known),
                None => Self::push(lane, change),
            }
        }

        if lane.is_idle() {
            self.drop_lane(&key);
            return None;
        }
        // the destination follows the rename even when it folded into a write
        if let Some(to) = rename_to {
            self.aliases.insert(to, key.clone());
        }

        if was_idle {
            Some(key)
        } else {
            None
        }
    }

    fn drop_lane(&mut self, key: &str) {
        self.lanes.remove(key);
        self.aliases.retain(|_, lane_key| lane_key != key);
    }

    fn push(lane: &mut Lane, change: PendingChange) {
        tracing::debug!("queued {}", change);
        lane.changes.push_back(change);
    }

    /// Combine a new change with the not-yet-started tail for the same path
    fn coalesce(lane: &mut Lane, tail: PendingChange, change: PendingChange, known: bool) {
        match (&tail.op, &change.op) {
            // a later content push supersedes an earlier one
            (t, c) if t.pushes_content() && c.pushes_content() => {
                let op = if known { ChangeOp::Write } else { tail.op.clone() };
                tracing::debug!("merged {} into {}", change, tail);
                lane.changes.push_back(PendingChange {
                    op,
                    generation: change.generation,
                    ..tail
                });
            }
            (ChangeOp::Delete, c) if c.pushes_content() => {
                tracing::debug!("{} replaces {}", change, tail);
                lane.changes.push_back(PendingChange {
                    op: ChangeOp::Write,
                    ..change
                });
            }
            (t, ChangeOp::Delete) if t.pushes_content() => {
                if known {
                    tracing::debug!("{} replaces {}", change, tail);
                    lane.changes.push_back(change);
                } else {
                    tracing::debug!("{} cancels unpushed {}", change, tail);
                }
            }
            (ChangeOp::Delete, ChangeOp::Delete) => {
                lane.changes.push_back(tail);
            }
            (t, ChangeOp::Rename { to }) if t.pushes_content() && !known => {
                // the source never reached the remote: upload straight to
                // the destination instead
                tracing::debug!("{} folds into write of {}", change, to);
                lane.changes.push_back(PendingChange {
                    path: to.clone(),
                    op: ChangeOp::Write,
                    seq: change.seq,
                    generation: change.generation,
                });
            }
            _ => {
                lane.changes.push_back(tail);
                Self::push(lane, change);
            }
        }
    }

    /// Drop not-yet-started changes of a rename destination, outside the
    /// rename's own lane
    fn supersede(&mut self, to: &str, rename_lane: &str) {
        let key = self.lane_key(to);
        if key == rename_lane {
            return;
        }
        let Some(lane) = self.lanes.get_mut(&key) else {
            return;
        };
        lane.changes.retain(|c| {
            let keep = c.path != to;
            if !keep {
                tracing::debug!("{} superseded by rename onto {}", c, to);
            }
            keep
        });
        if lane.is_idle() {
            self.drop_lane(&key);
        }
    }

    /// Take the next change of a lane for applying
    ///
    /// Returns None when the lane is gone, empty, or already held by another
    /// worker. A stale lane token is harmless: the worker holding the lane
    /// hands it back while work remains.
    pub fn begin(&mut self, key: &str) -> Option<PendingChange> {
        let lane = self.lanes.get_mut(key)?;
        if lane.in_flight.is_some() {
            return None;
        }
        let Some(change) = lane.changes.pop_front() else {
            self.drop_lane(key);
            return None;
        };
        lane.in_flight = Some(change.clone());
        Some(change)
    }

    /// Mark the lane's in-flight change done
    ///
    /// Returns true when the lane has more work and must be handed back to
    /// a worker; otherwise the lane and its aliases are dropped.
    pub fn finish(&mut self, key: &str) -> bool {
        let Some(lane) = self.lanes.get_mut(key) else {
            return false;
        };
        lane.in_flight = None;
        if !lane.changes.is_empty() {
            return true;
        }
        self.drop_lane(key);
        false
    }

    /// Whether any queued or in-flight change touches a path
    pub fn has_pending(&self, path: &str) -> bool {
        self.lanes.values().any(|lane| lane.touches(path))
    }

    /// Whether a not-yet-started change touches a path
    pub fn has_queued(&self, path: &str) -> bool {
        self.lanes
            .values()
            .any(|lane| lane.changes.iter().any(|c| c.touches(path)))
    }

    /// Whether a queued, not-yet-started change pushes content for a path
    pub fn has_queued_content(&self, path: &str) -> bool {
        self.lanes.values().any(|lane| {
            lane.changes
                .iter()
                .any(|c| c.op.pushes_content() && c.path == path)
        })
    }

    /// Source path of an outstanding rename onto `path`
    pub fn rename_source(&self, path: &str) -> Option<String> {
        self.lanes
            .values()
            .flat_map(|lane| lane.in_flight.iter().chain(lane.changes.iter()))
            .find(|c| matches!(&c.op, ChangeOp::Rename { to } if to == path))
            .map(|c| c.path.clone())
    }

    /// Every path an outstanding change touches
    pub fn pending_paths(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        for lane in self.lanes.values() {
            for change in lane.in_flight.iter().chain(lane.changes.iter()) {
                out.insert(change.path.clone());
                if let ChangeOp::Rename { to } = &change.op {
                    out.insert(to.clone());
                }
            }
        }
        out
    }

    /// Queued plus in-flight changes
    pub fn depth(&self) -> usize {
        self.lanes
            .values()
            .map(|l| l.changes.len() + usize::from(l.in_flight.is_some()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }
}
