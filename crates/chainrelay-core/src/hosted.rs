//! Public / community hosted nodes.
//!
//! Free, no-API-key endpoints used as the failover list when no local node
//! is configured. Rate limits are lower and reliability may vary.

/// Default chain used by [`ClientConfig::default`](crate::config::ClientConfig).
pub const DEFAULT_CHAIN_ID: u64 = 1;

/// Hosted nodes for `chain_id`, in failover order.
///
/// Unknown chains get an empty list.
pub fn public_nodes(chain_id: u64) -> Vec<String> {
    let mut nodes = Vec::new();
    if chain_id == 1 {
        nodes.push("https://cloudflare-eth.com".to_string());
    }
    if let Some(url) = ankr_url(chain_id) {
        nodes.push(url.to_string());
    }
    if let Some(url) = llama_url(chain_id) {
        nodes.push(url.to_string());
    }
    nodes
}

fn ankr_url(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        1 => Some("https://rpc.ankr.com/eth"),
        137 => Some("https://rpc.ankr.com/polygon"),
        42161 => Some("https://rpc.ankr.com/arbitrum"),
        10 => Some("https://rpc.ankr.com/optimism"),
        8453 => Some("https://rpc.ankr.com/base"),
        56 => Some("https://rpc.ankr.com/bsc"),
        _ => None,
    }
}

fn llama_url(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        1 => Some("https://eth.llamarpc.com"),
        137 => Some("https://polygon.llamarpc.com"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_order() {
        let nodes = public_nodes(1);
        assert_eq!(nodes[0], "https://cloudflare-eth.com");
        assert_eq!(nodes[1], "https://rpc.ankr.com/eth");
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn polygon_nodes() {
        assert_eq!(
            public_nodes(137),
            vec!["https://rpc.ankr.com/polygon", "https://polygon.llamarpc.com"]
        );
    }

    #[test]
    fn unknown_chain_is_empty() {
        assert!(public_nodes(999_999).is_empty());
    }
}
