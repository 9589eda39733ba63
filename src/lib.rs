// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Bidirectional off-chain micropayment channels over a Bitcoin-like chain.
//!
//! Each channel is funded into a 2-of-2 contract output and repriced off-chain through a ladder
//! of commitment transactions with strictly decreasing absolute lock-times, so the newest agreed
//! split is always the first to become broadcastable. Payments are gated on HASH160 hash-locks,
//! which lets a payment hop across one intermediary node and settle on both hops when the payee
//! reveals the preimage.
//!
//! The crate handles the channel state machines, the per-counterparty channel groups and the
//! node-level routing of payments and revealed secrets. It does not implement a wallet, chain
//! access or a network transport; clients supply those through the traits in [`chain`].

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;
