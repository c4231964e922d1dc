//! Monitored contracts, event topics, and ERC-20 call selectors for BSC mainnet.

use alloy::primitives::{address, b256, Address, B256};

// ---------------------------------------------------------------------------
// Quote assets (BSC mainnet)
// ---------------------------------------------------------------------------

pub const USDT: Address = address!("55d398326f99059ff775485246999027b3197955");
pub const USDC: Address = address!("8ac76a51cc950d9822d68b83fe1ad97b32cd580d");
pub const WBNB: Address = address!("bb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c");

/// Tokens accepted as the priced side of a swap.
pub const QUOTE_ASSETS: [Address; 3] = [USDT, USDC, WBNB];

/// Check if an address is one of the quote assets.
pub fn is_quote_asset(addr: &Address) -> bool {
    QUOTE_ASSETS.contains(addr)
}

/// Display symbol for a quote asset.
pub fn quote_symbol(addr: &Address) -> &'static str {
    match *addr {
        a if a == USDT => "USDT",
        a if a == USDC => "USDC",
        a if a == WBNB => "WBNB",
        _ => "???",
    }
}

// ---------------------------------------------------------------------------
// Fourmeme launchpad contracts
// ---------------------------------------------------------------------------

pub const FOURMEME_PROXY: Address = address!("5c952063c7fc8610ffdb798152d69f0b9550762b");
pub const FOURMEME_TRY_BUY: Address = address!("8e06ab256ca534ebba05d700f8e40341ec39e0d6");

/// Router/proxy contracts whose logs mark an internal (launchpad) trade.
pub const FOURMEME_CONTRACTS: [Address; 2] = [FOURMEME_PROXY, FOURMEME_TRY_BUY];

pub fn is_fourmeme_contract(addr: &Address) -> bool {
    FOURMEME_CONTRACTS.contains(addr)
}

// ---------------------------------------------------------------------------
// Multicall3 (cross-chain canonical address)
// ---------------------------------------------------------------------------

pub const MULTICALL3: Address = address!("ca11bde05977b3631167028862be2a173976ca11");

// ---------------------------------------------------------------------------
// Event topics
// ---------------------------------------------------------------------------

/// PancakeSwap V2 `Swap(address,uint256,uint256,uint256,uint256,address)`.
pub const TOPIC_V2_SWAP: B256 =
    b256!("d78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822");

/// ERC-20 `Transfer(address,address,uint256)`.
pub const TOPIC_ERC20_TRANSFER: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

// ---------------------------------------------------------------------------
// ERC-20 / pair view selectors
// ---------------------------------------------------------------------------

pub const SEL_TOKEN0: [u8; 4] = [0x0d, 0xfe, 0x16, 0x81];
pub const SEL_TOKEN1: [u8; 4] = [0xd2, 0x12, 0x20, 0xa7];
pub const SEL_DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
pub const SEL_SYMBOL: [u8; 4] = [0x95, 0xd8, 0x9b, 0x41];

/// Decimals outside this bound are treated as malformed token metadata.
pub const MAX_TOKEN_DECIMALS: u8 = 36;
