//! Processes the dispatcher keeps alive on the frontend and the nodes.

pub mod border_router;
pub mod nodes;
pub mod resolver;
pub mod sniffer;
