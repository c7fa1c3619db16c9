use std::fmt;

/// Mutation applied to the remote for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Create,
    /// Push the current local blob; the payload is read at apply time
    Write,
    Delete,
    Rename { to: String },
}

impl ChangeOp {
    /// Whether applying this op uploads the local blob
    pub fn pushes_content(&self) -> bool {
        matches!(self, ChangeOp::Create | ChangeOp::Write)
    }
}

/// A queued, not yet applied mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub path: String,
    pub op: ChangeOp,
    /// Enqueue order across the whole queue
    pub seq: u64,
    /// Generation of the affected entry at enqueue time
    pub generation: u64,
}

impl PendingChange {
    /// Path whose entry the change settles once applied
    pub fn target(&self) -> &str {
        match &self.op {
            ChangeOp::Rename { to } => to,
            _ => &self.path,
        }
    }

    /// Whether the change involves a path, as source or destination
    pub fn touches(&self, path: &str) -> bool {
        self.path == path || matches!(&self.op, ChangeOp::Rename { to } if to == path)
    }
}

impl fmt::Display for PendingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            ChangeOp::Create => write!(f, "#{} create {}", self.seq, self.path),
            ChangeOp::Write => write!(f, "#{} write {}", self.seq, self.path),
            ChangeOp::Delete => write!(f, "#{} delete {}", self.seq, self.path),
            ChangeOp::Rename { to } => write!(f, "#{} rename {} -> {}", self.seq, self.path, to),
        }
    }
}
