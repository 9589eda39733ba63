// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Tests that exercise whole nodes: funding handshakes, payments routed across an intermediary,
//! settlement by preimage, cooperative close and expiry-driven unilateral close.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::hash160::Hash as Hash160;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::chain::chaininterface::{ChainSource, WalletSource};
use crate::ln::chan_utils;
use crate::ln::channel::ChannelState;
use crate::ln::channelmanager::{PaymentHash, PaymentPreimage};
use crate::ln::functional_test_utils::*;
use crate::ln::msgs::{PaymentForward, PeerMessageHandler};
use crate::util::config::ChannelTerms;
use crate::util::errors::APIError;
use crate::util::test_utils::TestChainSource;

use std::sync::Arc;

const START_HEIGHT: u32 = 100;

fn escrow_payment(byte: u8) -> (PaymentHash, PaymentPreimage) {
	let preimage = PaymentPreimage([byte; 20]);
	(PaymentHash(Hash160::hash(&preimage.0).to_byte_array()), preimage)
}

#[test]
fn test_channel_open_and_balances() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_b = create_node(2, &chain);
	connect_nodes(&node_a, &node_b);
	let nodes = [&node_a, &node_b];

	let terms = ChannelTerms::default();
	let channel_id = open_channel(&nodes, &node_a, &node_b, terms);

	let a_details = get_channel(&node_a, channel_id);
	assert_eq!(a_details.state, ChannelState::Established);
	assert!(a_details.is_initiator);
	assert_eq!(a_details.counterparty_node_id, node_b.node_id);
	// The initiator pre-pays two repricing fees out of its contribution; the responder's
	// contribution passes through untouched.
	assert_eq!(a_details.local_balance_sat, 1_000_000 - 2_000);
	assert_eq!(a_details.remote_balance_sat, 1_000_000);

	let b_details = get_channel(&node_b, channel_id);
	assert_eq!(b_details.state, ChannelState::Established);
	assert!(!b_details.is_initiator);
	assert_eq!(b_details.local_balance_sat, 1_000_000);
	assert_eq!(b_details.remote_balance_sat, 1_000_000 - 2_000);

	assert!(node_a.manager.has_open_channels(&node_b.node_id));
	// Strictly more than min_deposit + fee_step + amount must remain on the payer's side.
	assert!(node_a.manager.peer_can_pay(&node_b.node_id, 996_999));
	assert!(!node_a.manager.peer_can_pay(&node_b.node_id, 997_000));
}

#[test]
fn test_direct_payment_settles_immediately() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_b = create_node(2, &chain);
	connect_nodes(&node_a, &node_b);
	let nodes = [&node_a, &node_b];
	let channel_id = open_channel(&nodes, &node_a, &node_b, ChannelTerms::default());

	// The recipient issued the hash, so it reveals the preimage as soon as the payment lands
	// and both sides settle before send_payment even returns.
	let payment_hash = node_b.manager.issue_payment_hash();
	node_a
		.manager
		.send_payment(node_b.node_id, node_b.node_id, payment_hash, 300_000)
		.unwrap();

	let a_details = get_channel(&node_a, channel_id);
	assert_eq!(a_details.state, ChannelState::Established);
	assert_eq!(a_details.local_balance_sat, 1_000_000 - 2_000 - 300_000);
	assert_eq!(a_details.remote_balance_sat, 1_000_000 + 300_000);
	let b_details = get_channel(&node_b, channel_id);
	assert_eq!(b_details.state, ChannelState::Established);
	assert_eq!(b_details.local_balance_sat, 1_000_000 + 300_000);
}

#[test]
fn test_payment_routed_through_intermediary() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_m = create_node(2, &chain);
	let node_b = create_node(3, &chain);
	connect_nodes(&node_a, &node_m);
	connect_nodes(&node_m, &node_b);
	let nodes = [&node_a, &node_m, &node_b];

	let chan_am = open_channel(&nodes, &node_a, &node_m, ChannelTerms::default());
	let mut mb_terms = ChannelTerms::default();
	mb_terms.contribution_sat = 500_000;
	let chan_mb = open_channel(&nodes, &node_m, &node_b, mb_terms);

	// A can only reach B through M: A reprices its channel with M, M reprices its channel with
	// B, and B's preimage settles both hops on the way back.
	let payment_hash = node_b.manager.issue_payment_hash();
	node_a
		.manager
		.send_payment(node_m.node_id, node_b.node_id, payment_hash, 300_000)
		.unwrap();

	let am_at_a = get_channel(&node_a, chan_am);
	assert_eq!(am_at_a.state, ChannelState::Established);
	assert_eq!(am_at_a.local_balance_sat, 1_000_000 - 2_000 - 300_000);
	assert_eq!(am_at_a.remote_balance_sat, 1_000_000 + 300_000);

	let am_at_m = get_channel(&node_m, chan_am);
	assert_eq!(am_at_m.state, ChannelState::Established);
	assert_eq!(am_at_m.local_balance_sat, 1_000_000 + 300_000);

	let mb_at_m = get_channel(&node_m, chan_mb);
	assert_eq!(mb_at_m.state, ChannelState::Established);
	assert_eq!(mb_at_m.local_balance_sat, 500_000 - 2_000 - 300_000);
	assert_eq!(mb_at_m.remote_balance_sat, 1_000_000 + 300_000);

	let mb_at_b = get_channel(&node_b, chan_mb);
	assert_eq!(mb_at_b.state, ChannelState::Established);
	assert_eq!(mb_at_b.local_balance_sat, 1_000_000 + 300_000);
}

#[test]
fn test_escrow_payment_waits_for_payer_reveal() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_b = create_node(2, &chain);
	connect_nodes(&node_a, &node_b);
	let nodes = [&node_a, &node_b];
	let channel_id = open_channel(&nodes, &node_a, &node_b, ChannelTerms::default());

	// The payer holds the secret: the recipient countersigns the update but cannot settle it,
	// so both sides sit in PendingCommit until the payer chooses to release the funds.
	let (payment_hash, preimage) = escrow_payment(42);
	node_a
		.manager
		.send_payment(node_b.node_id, node_b.node_id, payment_hash, 200_000)
		.unwrap();
	assert_eq!(get_channel(&node_a, channel_id).state, ChannelState::PendingCommit);
	assert_eq!(get_channel(&node_b, channel_id).state, ChannelState::PendingCommit);
	assert!(!node_a.manager.peer_can_pay(&node_b.node_id, 1));

	node_a.manager.claim_funds(preimage);
	let a_details = get_channel(&node_a, channel_id);
	assert_eq!(a_details.state, ChannelState::Established);
	assert_eq!(a_details.local_balance_sat, 1_000_000 - 2_000 - 200_000);
	let b_details = get_channel(&node_b, channel_id);
	assert_eq!(b_details.state, ChannelState::Established);
	assert_eq!(b_details.local_balance_sat, 1_000_000 + 200_000);
}

#[test]
fn test_alternating_payments_conserve_value_less_fees() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_b = create_node(2, &chain);
	connect_nodes(&node_a, &node_b);
	let nodes = [&node_a, &node_b];
	let channel_id = open_channel(&nodes, &node_a, &node_b, ChannelTerms::default());

	// Every payment reverses direction, so the initiator never pays a per-update fee (it
	// pre-paid two) while each responder reversal costs a fee on both outputs.
	let contract_total = 998_000 + 1_000_000;
	let pay = |payer: &Node, recipient: &Node, amount: u64| {
		let payment_hash = recipient.manager.issue_payment_hash();
		payer.manager.send_payment(recipient.node_id, recipient.node_id, payment_hash, amount).unwrap();
	};
	pay(&node_a, &node_b, 300_000);
	pay(&node_b, &node_a, 100_000);
	pay(&node_a, &node_b, 50_000);
	pay(&node_b, &node_a, 25_000);

	let a_details = get_channel(&node_a, channel_id);
	assert_eq!(a_details.state, ChannelState::Established);
	assert_eq!(a_details.local_balance_sat, 998_000 - 300_000 + 100_000 - 50_000 + 25_000 - 2_000);
	assert_eq!(
		a_details.remote_balance_sat,
		1_000_000 + 300_000 - 100_000 + 50_000 - 25_000 - 2_000
	);
	// What left the channel's two outputs is exactly the fees the responder's reversals paid.
	assert_eq!(a_details.local_balance_sat + a_details.remote_balance_sat, contract_total - 4_000);

	let b_details = get_channel(&node_b, channel_id);
	assert_eq!(b_details.local_balance_sat, a_details.remote_balance_sat);
	assert_eq!(b_details.remote_balance_sat, a_details.local_balance_sat);
}

#[test]
fn test_close_skips_channel_with_pending_payment() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_b = create_node(2, &chain);
	connect_nodes(&node_a, &node_b);
	let nodes = [&node_a, &node_b];
	let channel_id = open_channel(&nodes, &node_a, &node_b, ChannelTerms::default());

	// An unsettled escrowed payment keeps the channel out of any cooperative close.
	let (payment_hash, preimage) = escrow_payment(11);
	node_a
		.manager
		.send_payment(node_b.node_id, node_b.node_id, payment_hash, 150_000)
		.unwrap();

	node_a.manager.close_channels_with_peer(node_b.node_id).unwrap();
	assert_eq!(get_channel(&node_a, channel_id).state, ChannelState::PendingCommit);
	assert_eq!(get_channel(&node_b, channel_id).state, ChannelState::PendingCommit);
	assert!(node_a.broadcaster.take_broadcasts().is_empty());
	assert!(node_b.broadcaster.take_broadcasts().is_empty());

	// Once the payment settles the same call goes through.
	node_a.manager.claim_funds(preimage);
	node_a.manager.close_channels_with_peer(node_b.node_id).unwrap();
	assert_eq!(get_channel(&node_a, channel_id).state, ChannelState::Closing);
	assert_eq!(get_channel(&node_b, channel_id).state, ChannelState::Closing);
}

#[test]
fn test_duplicate_forward_is_dropped() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_b = create_node(2, &chain);
	connect_nodes(&node_a, &node_b);
	let nodes = [&node_a, &node_b];
	open_channel(&nodes, &node_a, &node_b, ChannelTerms::default());

	let (payment_hash, _preimage) = escrow_payment(7);
	node_a
		.manager
		.send_payment(node_b.node_id, node_b.node_id, payment_hash, 100_000)
		.unwrap();

	// Re-sending the same hash out is refused locally.
	match node_a.manager.send_payment(node_b.node_id, node_b.node_id, payment_hash, 100_000) {
		Err(APIError::APIMisuseError { .. }) => {},
		res => panic!("expected misuse error, got {:?}", res),
	}

	// A replayed forward of a hash the recipient is already carrying is dropped without even
	// looking at the transaction.
	let bogus_tx = Transaction {
		version: Version::ONE,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: OutPoint { txid: Txid::from_byte_array([9; 32]), vout: 0 },
			script_sig: ScriptBuf::new(),
			sequence: Sequence(1),
			witness: Witness::default(),
		}],
		output: Vec::new(),
	};
	let replay = PaymentForward {
		intermediary: node_b.node_id,
		recipient: node_b.node_id,
		payment_hash,
		amount_sat: 100_000,
		pending_tx: bogus_tx,
	};
	assert!(node_b
		.manager
		.handle_payment_forward(node_a.node_id, replay)
		.unwrap()
		.is_none());
}

#[test]
fn test_commit_rejects_mismatched_preimage() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_b = create_node(2, &chain);
	connect_nodes(&node_a, &node_b);
	let nodes = [&node_a, &node_b];
	let channel_id = open_channel(&nodes, &node_a, &node_b, ChannelTerms::default());

	let (payment_hash, preimage) = escrow_payment(3);
	node_a
		.manager
		.send_payment(node_b.node_id, node_b.node_id, payment_hash, 100_000)
		.unwrap();

	assert!(node_b
		.manager
		.handle_commit(node_a.node_id, payment_hash, PaymentPreimage([0; 20]))
		.is_err());
	assert_eq!(get_channel(&node_b, channel_id).state, ChannelState::PendingCommit);

	// Claiming a preimage no payment is locked to changes nothing.
	node_a.manager.claim_funds(PaymentPreimage([99; 20]));
	assert_eq!(get_channel(&node_a, channel_id).state, ChannelState::PendingCommit);

	node_a.manager.claim_funds(preimage);
	assert_eq!(get_channel(&node_a, channel_id).state, ChannelState::Established);
	assert_eq!(get_channel(&node_b, channel_id).state, ChannelState::Established);
	// A second claim of the same preimage finds nothing left to settle.
	node_a.manager.claim_funds(preimage);
	assert_eq!(get_channel(&node_a, channel_id).state, ChannelState::Established);
}

#[test]
fn test_cooperative_close() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_b = create_node(2, &chain);
	connect_nodes(&node_a, &node_b);
	let nodes = [&node_a, &node_b];
	let terms = ChannelTerms::default();
	let channel_id = open_channel(&nodes, &node_a, &node_b, terms);

	let payment_hash = node_b.manager.issue_payment_hash();
	node_a
		.manager
		.send_payment(node_b.node_id, node_b.node_id, payment_hash, 250_000)
		.unwrap();

	node_a.manager.close_channels_with_peer(node_b.node_id).unwrap();
	assert_eq!(get_channel(&node_a, channel_id).state, ChannelState::Closing);
	assert_eq!(get_channel(&node_b, channel_id).state, ChannelState::Closing);

	// Both sides broadcast the closing transaction and their own claim of it.
	let a_broadcasts = node_a.broadcaster.take_broadcasts();
	let b_broadcasts = node_b.broadcaster.take_broadcasts();
	assert_eq!(a_broadcasts.len(), 2);
	assert_eq!(b_broadcasts.len(), 2);
	assert_eq!(a_broadcasts[0].compute_txid(), b_broadcasts[0].compute_txid());
	let closing_tx = &a_broadcasts[0];
	// The close pays out the newest commitment immediately: no lock-time in the future and the
	// final sequence so the chain accepts it at once.
	assert!(closing_tx.lock_time.to_consensus_u32() < chain.best_height());
	assert_eq!(closing_tx.input[0].sequence, Sequence::ENABLE_LOCKTIME_NO_RBF);
	assert_eq!(closing_tx.output[0].value.to_sat(), 1_000_000 - 2_000 - 250_000);
	assert_eq!(closing_tx.output[1].value.to_sat(), 1_000_000 + 250_000);

	for tx in a_broadcasts.iter().chain(b_broadcasts.iter()) {
		confirm_transaction(&nodes, tx);
	}
	// Once fully closed, the channel is dropped from both nodes' books.
	mine_blocks(&nodes, terms.commit_depth + 1);
	assert!(node_a.manager.list_channels().is_empty());
	assert!(node_b.manager.list_channels().is_empty());
	assert!(!node_a.manager.has_open_channels(&node_b.node_id));
	assert!(!node_b.manager.has_open_channels(&node_a.node_id));
}

#[test]
fn test_expiry_forces_unilateral_close() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_b = create_node(2, &chain);
	connect_nodes(&node_a, &node_b);
	let nodes = [&node_a, &node_b];
	let mut terms = ChannelTerms::default();
	terms.max_lifetime = 30;
	let channel_id = open_channel(&nodes, &node_a, &node_b, terms);
	// The fallback was built at START_HEIGHT, so it is broadcastable once the chain passes
	// START_HEIGHT + 29 and the single repriced commitment once it passes START_HEIGHT + 19.
	let fallback_lock = START_HEIGHT + terms.max_lifetime - 1;
	let commitment_lock = fallback_lock - terms.locktime_step;

	let payment_hash = node_b.manager.issue_payment_hash();
	node_a
		.manager
		.send_payment(node_b.node_id, node_b.node_id, payment_hash, 100_000)
		.unwrap();

	// Mine past the commitment's lock-time. The payer gave that commitment away, so its own
	// newest transaction has expired and it starts watching the chain; the recipient holds the
	// commitment itself and is still fine.
	while chain.best_height() <= commitment_lock {
		mine_blocks(&nodes, 1);
	}
	assert_eq!(get_channel(&node_a, channel_id).state, ChannelState::ExpiredWaiting);
	assert_eq!(get_channel(&node_b, channel_id).state, ChannelState::Established);

	// Mine past the fallback's lock-time: both sides force-close in the same block, the payer
	// with the only transaction it holds (the stale fallback) and the recipient with the
	// repriced commitment.
	while chain.best_height() <= fallback_lock {
		mine_blocks(&nodes, 1);
	}
	assert_eq!(get_channel(&node_a, channel_id).state, ChannelState::Closing);
	assert_eq!(get_channel(&node_b, channel_id).state, ChannelState::Closing);
	let a_broadcasts = node_a.broadcaster.take_broadcasts();
	let b_broadcasts = node_b.broadcaster.take_broadcasts();
	assert_eq!(a_broadcasts.len(), 2);
	assert_eq!(b_broadcasts.len(), 2);
	assert_eq!(a_broadcasts[0].lock_time.to_consensus_u32(), fallback_lock);
	assert_eq!(b_broadcasts[0].lock_time.to_consensus_u32(), commitment_lock);
	// The recipient's claim spends its output of the commitment, revealing the preimage.
	assert_eq!(
		b_broadcasts[1].input[0].previous_output,
		OutPoint { txid: b_broadcasts[0].compute_txid(), vout: 1 }
	);

	for tx in a_broadcasts.iter().chain(b_broadcasts.iter()) {
		confirm_transaction(&nodes, tx);
	}
	mine_blocks(&nodes, terms.commit_depth + 1);
	assert!(node_a.manager.list_channels().is_empty());
	assert!(node_b.manager.list_channels().is_empty());
}

#[test]
fn test_adopts_counterparty_close_seen_on_chain() {
	let chain = Arc::new(TestChainSource::new(START_HEIGHT));
	let node_a = create_node(1, &chain);
	let node_b = create_node(2, &chain);
	connect_nodes(&node_a, &node_b);
	let nodes = [&node_a, &node_b];
	let mut terms = ChannelTerms::default();
	terms.max_lifetime = 30;

	node_a.wallet.give_utxo(terms.contribution_sat + 50_000);
	node_b.wallet.give_utxo(terms.counterparty_contribution_sat + 50_000);
	let channel_id = node_a.manager.open_channel(node_b.node_id, terms).unwrap();
	let broadcasts = node_a.broadcaster.take_broadcasts();
	assert_eq!(broadcasts.len(), 1);
	let funding_txid = broadcasts[0].compute_txid();
	confirm_transaction(&nodes, &broadcasts[0]);
	mine_blocks(&nodes, terms.commit_depth);

	// The counterparty closed through some channel state we no longer hold: a transaction the
	// wallet saw spending the contract output. On expiry the node treats it as the effective
	// close and claims its own output of it instead of fighting it with the stale fallback.
	let counterparty_close = Transaction {
		version: Version::ONE,
		lock_time: LockTime::from_consensus(START_HEIGHT + 19),
		input: vec![TxIn {
			previous_output: OutPoint { txid: funding_txid, vout: 0 },
			script_sig: ScriptBuf::new(),
			sequence: Sequence(1),
			witness: Witness::default(),
		}],
		output: vec![
			TxOut {
				value: Amount::from_sat(900_000),
				script_pubkey: chan_utils::get_p2pkh_script(&node_a.node_id),
			},
			TxOut {
				value: Amount::from_sat(1_098_000),
				script_pubkey: chan_utils::get_p2pkh_script(&node_b.node_id),
			},
		],
	};
	node_a.wallet.register_tx(&counterparty_close);

	while chain.best_height() <= START_HEIGHT + terms.max_lifetime - 1 {
		mine_blocks(&nodes, 1);
	}
	assert_eq!(get_channel(&node_a, channel_id).state, ChannelState::Closing);
	let a_broadcasts = node_a.broadcaster.take_broadcasts();
	assert_eq!(a_broadcasts.len(), 2);
	assert_eq!(a_broadcasts[0].compute_txid(), counterparty_close.compute_txid());
	assert_eq!(
		a_broadcasts[1].input[0].previous_output,
		OutPoint { txid: counterparty_close.compute_txid(), vout: 0 }
	);
	assert_eq!(a_broadcasts[1].output[0].value.to_sat(), 900_000 - terms.initial_fee_sat);

	for tx in &a_broadcasts {
		confirm_transaction(&nodes, tx);
	}
	mine_blocks(&nodes, terms.commit_depth + 1);
	assert!(node_a.manager.list_channels().is_empty());
}
