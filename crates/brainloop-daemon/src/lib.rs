//! brainloop-daemon - The brainloop worker.
//!
//! A single-process worker that brokers requests from an MCP client (an
//! LLM-driven agent speaking line-delimited JSON-RPC over stdio) into three
//! classes of operations:
//!
//! - delegated text generation against a remote completion API, through the
//!   rate-limited [`gateway`];
//! - adaptively-governed sandboxed shell execution, through the
//!   [`governor`];
//! - structured digests of local files and SQLite databases, through the
//!   [`readers`].
//!
//! All operational state persists in five embedded SQLite databases owned
//! by the [`storage`] layer. The [`lifecycle`] module provides the
//! single-instance lock, heartbeat, and three-phase graceful shutdown.

pub mod error;
pub mod executor;
pub mod gateway;
pub mod governor;
pub mod lifecycle;
pub mod mcp;
pub mod metrics;
pub mod readers;
pub mod registry;
pub mod session;
pub mod storage;
