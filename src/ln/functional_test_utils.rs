// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A bunch of useful utilities for building networks of nodes and exchanging messages between
//! nodes for functional tests.

use bitcoin::secp256k1::PublicKey;
use bitcoin::Transaction;

use crate::chain::chaininterface::{Listen, WalletSource};
use crate::chain::keysinterface::KeysManager;
use crate::ln::channelmanager::{ChannelDetails, ChannelManager};
use crate::ln::msgs::PeerMessageHandler;
use crate::util::config::ChannelTerms;
use crate::util::test_utils::{TestBroadcaster, TestChainSource, TestLogger, TestWallet};

use std::sync::Arc;

pub type NodeManager = ChannelManager<
	Arc<TestWallet>,
	Arc<TestBroadcaster>,
	Arc<TestChainSource>,
	Arc<KeysManager>,
	Arc<TestLogger>,
>;

pub struct Node {
	pub manager: Arc<NodeManager>,
	pub wallet: Arc<TestWallet>,
	pub broadcaster: Arc<TestBroadcaster>,
	pub chain: Arc<TestChainSource>,
	pub logger: Arc<TestLogger>,
	pub node_id: PublicKey,
}

/// Creates a node with deterministic keys derived from `id`, attached to the given shared chain
/// view. The node's wallet starts out empty.
pub fn create_node(id: u8, chain: &Arc<TestChainSource>) -> Node {
	let logger = Arc::new(TestLogger::with_id(format!("node {}", id)));
	let keys = Arc::new(KeysManager::new(&[id; 32]));
	let wallet = Arc::new(TestWallet::new(&[id.wrapping_add(0x80); 32]));
	let broadcaster = Arc::new(TestBroadcaster::new());
	let manager = Arc::new(ChannelManager::new(
		Arc::clone(&wallet),
		Arc::clone(&broadcaster),
		Arc::clone(chain),
		keys,
		Arc::clone(&logger),
	));
	let node_id = manager.get_our_node_id();
	Node { manager, wallet, broadcaster, chain: Arc::clone(chain), logger, node_id }
}

/// Introduces two nodes to each other so either can open channels and route payments.
pub fn connect_nodes(a: &Node, b: &Node) {
	let their_node_id = Arc::clone(&a.manager)
		.connect_peer(Arc::clone(&b.manager) as Arc<dyn PeerMessageHandler>);
	assert_eq!(their_node_id, b.node_id);
}

/// Confirms a transaction in the current best block and teaches every node's wallet about it,
/// standing in for the wallets' own chain scanning.
pub fn confirm_transaction(nodes: &[&Node], tx: &Transaction) {
	nodes[0].chain.confirm_transaction(tx.compute_txid());
	for node in nodes {
		node.wallet.register_tx(tx);
	}
}

/// Mines `count` empty blocks. Each new block first confirms everything any node broadcast
/// since the previous one, then delivers the new tip to every node.
pub fn mine_blocks(nodes: &[&Node], count: u32) {
	for _ in 0..count {
		let height = nodes[0].chain.advance_block();
		for node in nodes {
			for tx in node.broadcaster.take_broadcasts() {
				confirm_transaction(nodes, &tx);
			}
		}
		for node in nodes {
			node.manager.best_block_updated(height);
		}
	}
}

/// Funds both wallets, opens a channel from `initiator` to `responder` on the given terms, and
/// mines the funding transaction to commitment depth so the channel is usable.
pub fn open_channel(
	nodes: &[&Node], initiator: &Node, responder: &Node, terms: ChannelTerms,
) -> [u8; 32] {
	initiator.wallet.give_utxo(terms.contribution_sat + 50_000);
	responder.wallet.give_utxo(terms.counterparty_contribution_sat + 50_000);
	let channel_id = initiator.manager.open_channel(responder.node_id, terms).unwrap();
	let broadcasts = initiator.broadcaster.take_broadcasts();
	assert_eq!(broadcasts.len(), 1, "opening a channel must broadcast exactly the funding tx");
	confirm_transaction(nodes, &broadcasts[0]);
	mine_blocks(nodes, terms.commit_depth);
	channel_id
}

/// Looks up one channel in a node's channel list.
pub fn get_channel(node: &Node, channel_id: [u8; 32]) -> ChannelDetails {
	node.manager
		.list_channels()
		.into_iter()
		.find(|details| details.channel_id == channel_id)
		.expect("node does not know the channel")
}
