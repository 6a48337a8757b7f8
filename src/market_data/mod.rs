// Market data module entrypoint
pub mod adapters;       // upstream fetchers (Hypixel bazaar)
pub mod normaliser;     // liquidity filter + depth cap + decimal prices
