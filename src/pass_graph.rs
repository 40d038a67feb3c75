//! The pass-graph capability surface the distribution engine drives, plus a small
//! in-memory implementation.

mod desc;
mod gpu;
mod tree;
mod types;

use std::sync::Arc;

use anyhow::Result;

pub use desc::{GraphDesc, PassDesc};
pub use gpu::{CommandList, CopyItem, HostMemory, RecordingCommandList};
pub use tree::{Pass, PassId, PassTree};
pub use types::*;

pub trait PassSystem {
    fn register_template(&mut self, template: Arc<PassTemplate>);
    fn find_template(&self, name: &str) -> Option<Arc<PassTemplate>>;

    fn create_pass_from_template(
        &mut self,
        template: Arc<PassTemplate>,
        name: &str,
    ) -> Result<PassId>;
    /// The request's template must be registered first.
    fn create_pass_from_request(&mut self, request: &PassRequest) -> Result<PassId>;
    fn create_parent_pass(&mut self, name: &str) -> Result<PassId>;

    /// Resolves connections into bindings. A deferred build only marks the pass.
    fn build(&mut self, id: PassId, deferred: bool) -> Result<()>;

    fn add_child(&mut self, parent: PassId, child: PassId) -> Result<()>;
    fn insert_child(&mut self, parent: PassId, child: PassId, index: usize) -> Result<()>;
    /// Detaches and frees every child subtree of `parent`.
    fn remove_children(&mut self, parent: PassId) -> Result<()>;

    fn pass(&self, id: PassId) -> Option<&Pass>;
    fn pass_mut(&mut self, id: PassId) -> Option<&mut Pass>;
    fn find_pass(&self, name: &str) -> Option<PassId>;

    fn children(&self, id: PassId) -> &[PassId] {
        match self.pass(id) {
            Some(pass) => pass.children(),
            None => &[],
        }
    }

    fn child_index(&self, parent: PassId, child: PassId) -> Option<usize> {
        self.children(parent).iter().position(|c| *c == child)
    }

    fn pass_name(&self, id: PassId) -> &str {
        self.pass(id).map_or("<gone>", |p| p.name.as_str())
    }
}
