//! Node update channel backends

mod memory;
mod redis;

pub use self::memory::MemoryNodeEvents;
pub use self::redis::RedisNodeEvents;

use sc_core::NodeId;

/// Parse a node update payload.
///
/// Anyone can publish on the channel, so garbage is expected and yields
/// `None` rather than an error.
pub fn parse_node_event(payload: &str) -> Option<NodeId> {
    payload.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_event() {
        let id = NodeId::new();
        assert_eq!(parse_node_event(&id.to_string()), Some(id));
        assert_eq!(parse_node_event(&format!("{}\n", id)), Some(id));
        assert_eq!(parse_node_event(""), None);
        assert_eq!(parse_node_event("{\"node\": 1}"), None);
    }
}
