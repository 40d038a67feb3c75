use anyhow::{Context, Result};

use crate::pass_graph::{PassConnection, PassId, PassSystem};

/// A connection change recorded during a rewrite and applied at commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEdit {
    Set { pass: PassId, conn: PassConnection },
    Clear { pass: PassId },
}

impl ConnectionEdit {
    pub fn pass(&self) -> PassId {
        match self {
            Self::Set { pass, .. } | Self::Clear { pass } => *pass,
        }
    }

    pub fn apply(&self, sys: &mut dyn PassSystem) -> Result<()> {
        let pass = sys
            .pass_mut(self.pass())
            .with_context(|| format!("edit targets a removed pass {:?}", self.pass()))?;
        match self {
            Self::Set { conn, .. } => pass.set_connection(conn.clone()),
            Self::Clear { .. } => pass.clear_connections(),
        }
        Ok(())
    }
}

/// One rewrite of `modify`, keyed by its name in the change list.
#[derive(Clone, Debug)]
pub struct PassDistNode {
    pub self_pass: PassId,
    pub modify: PassId,
    pub after: Option<PassId>,
    pub follows: Vec<PassId>,
    pub edits: Vec<ConnectionEdit>,
    pub built: bool,
}

impl PassDistNode {
    pub fn new(self_pass: PassId, modify: PassId, after: Option<PassId>) -> Self {
        Self {
            self_pass,
            modify,
            after,
            follows: Vec::new(),
            edits: Vec::new(),
            built: false,
        }
    }
}
