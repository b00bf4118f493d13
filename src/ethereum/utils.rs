use alloy::primitives::Address;
use anyhow::{anyhow, Result};
use std::str::FromStr;

const BLOCK_TAGS: [&str; 5] = ["latest", "pending", "earliest", "safe", "finalized"];

/// Validates and normalizes an Ethereum address
pub fn validate_address(address: &str) -> Result<Address> {
    let address = address.trim();

    if address.is_empty() {
        return Err(anyhow!("Address cannot be empty"));
    }

    let Some(hex_part) = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
    else {
        return Err(anyhow!(
            "Invalid address format: '{}'. Ethereum addresses must start with '0x'",
            address
        ));
    };

    if hex_part.len() != 40 {
        return Err(anyhow!(
            "Invalid address length: '{}'. Ethereum addresses must be exactly 42 characters (0x + 40 hex characters)",
            address
        ));
    }

    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "Invalid address format: '{}'. Contains non-hexadecimal characters",
            address
        ));
    }

    Address::from_str(address)
        .map_err(|e| anyhow!("Invalid Ethereum address: '{}'. Error: {}", address, e))
}

/// Validates network name
pub fn validate_network(network: &str, available_networks: &[String]) -> Result<()> {
    if network.is_empty() {
        return Err(anyhow!("Network name cannot be empty"));
    }

    if !available_networks.iter().any(|name| name == network) {
        return Err(anyhow!(
            "Unknown network: '{}'. Available networks: {}",
            network,
            available_networks.join(", ")
        ));
    }

    Ok(())
}

/// Normalizes a block parameter to a JSON-RPC tag or `0x` quantity.
pub fn normalize_block(block: &str) -> Result<String> {
    let block = block.trim();
    let lowered = block.to_ascii_lowercase();
    if BLOCK_TAGS.contains(&lowered.as_str()) {
        return Ok(lowered);
    }

    let number = match lowered.strip_prefix("0x") {
        Some(hex_part) => u64::from_str_radix(hex_part, 16),
        None => lowered.parse::<u64>(),
    }
    .map_err(|_| {
        anyhow!(
            "Invalid block: '{}'. Use a tag ({}) or a block number",
            block,
            BLOCK_TAGS.join(", ")
        )
    })?;

    Ok(format!("{:#x}", number))
}

/// Creates user-friendly error messages for common RPC errors
pub fn interpret_rpc_error(error: &str) -> String {
    let lowered = error.to_ascii_lowercase();
    if lowered.contains("execution reverted") {
        "Execution reverted: the call failed inside the contract. Simulate the transaction to see the decoded revert reason.".to_string()
    } else if lowered.contains("insufficient funds") {
        "Insufficient funds: the sender cannot cover value plus gas at the signed fee cap.".to_string()
    } else if lowered.contains("nonce too low") {
        "Nonce too low: a transaction with this nonce was already mined. Re-signing with the next nonce is required.".to_string()
    } else if lowered.contains("already known") {
        "Already known: the node has this exact transaction in its pool.".to_string()
    } else if lowered.contains("replacement transaction underpriced") {
        "Replacement underpriced: a pending transaction with this nonce pays a higher fee.".to_string()
    } else if lowered.contains("connection refused") || lowered.contains("network unreachable") {
        "Network error: Cannot connect to RPC endpoint. Check your internet connection and RPC URL configuration.".to_string()
    } else if lowered.contains("timeout") || lowered.contains("timed out") {
        "Network error: Request timed out. The RPC endpoint may be overloaded or unreachable."
            .to_string()
    } else if lowered.contains("rate limit") || lowered.contains("429") {
        "Rate limit error: Too many requests to the RPC endpoint. Try again in a few moments or use a different endpoint.".to_string()
    } else if lowered.contains("method not found") {
        "RPC error: The requested method is not supported by this RPC endpoint. Try using a different endpoint.".to_string()
    } else {
        format!("RPC error: {}", error)
    }
}
