//! The distribution engine: graph rewriting on the authority, graph application on
//! followers, and the comm passes that move frame data between them.

mod comm_pass;
mod debug;
mod encode;
mod follower;
mod node;
mod rewrite;
mod system;
mod ticket;

pub use comm_pass::{CommPass, CommStats};
pub use debug::{graph_to_dot, show_connections};
pub use encode::{fragment_request, fragment_template, request_fragment, template_fragment};
pub use node::{ConnectionEdit, PassDistNode};
pub use rewrite::{MIRROR_DEVICE, RewriteRule, name_ends_with};
pub use system::{DistShared, PassDistSystem};
pub use ticket::{TickContext, TicketCounter};
