//! # mapkv
//!
//! An embedded, memory-mapped key-value store with:
//! - An append-only log of typed values, replayed into an in-memory index
//! - CRC-checked commits with two alternating meta records
//! - Optional AES-CFB encryption of the whole log
//! - Compaction that is safe to interrupt at any point
//! - Sharing between processes through an advisory file lock
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Registry (one Store per path)                 │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                        Store                                 │
//! │        (inter-process lock → RwLock, SWMR in-process)        │
//! └──────┬──────────────┬───────────────┬───────────────┬───────┘
//!        │              │               │               │
//!        ▼              ▼               ▼               ▼
//!  ┌───────────┐  ┌───────────┐  ┌─────────────┐  ┌───────────┐
//!  │   Index   │  │    Log    │  │ CryptoGuard │  │ MetaFile  │
//!  │ (HashMap) │  │ (entries) │  │  (AES-CFB)  │  │  (.crc)   │
//!  └───────────┘  └─────┬─────┘  └─────────────┘  └───────────┘
//!                       │
//!                       ▼
//!                ┌─────────────┐
//!                │ MappedFile  │
//!                │   (mmap)    │
//!                └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod buffer;
pub mod codec;
pub mod checksum;
pub mod crypto;
pub mod storage;
pub mod log;
pub mod index;
pub mod engine;
pub mod registry;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{MapKvError, Result};
pub use config::{Config, ProcessMode, RecoveryPolicy, SyncStrategy};
pub use codec::Value;
pub use engine::Store;
pub use registry::Registry;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of mapkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
