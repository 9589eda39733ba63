// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Configuration of the terms under which a channel is funded and repriced.
//!
//! [`ChannelTerms`] is agreed between both parties at funding time and is immutable for the life
//! of the channel. The same struct travels in the funding proposal; since several fields are
//! stated from the proposer's point of view, the receiving side flips them with
//! [`ChannelTerms::from_counterparty`] before use.

/// The terms of a single channel, from the local node's point of view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelTerms {
	/// The balance, in satoshis, below which our side of the channel may not fall. [`can_pay`]
	/// refuses payments which would leave us with `min_deposit_sat + fee_step_sat` or less.
	///
	/// [`can_pay`]: crate::ln::channelmanager::ChannelManager::peer_can_pay
	pub min_deposit_sat: u64,
	/// The balance below which the counterparty's side may not fall.
	pub counterparty_min_deposit_sat: u64,
	/// The amount we lock into the contract output at funding.
	pub contribution_sat: u64,
	/// The amount the counterparty locks into the contract output at funding.
	pub counterparty_contribution_sat: u64,
	/// The fee, in satoshis, consumed by the funding transaction itself. The initiator's side of
	/// the first fallback transaction is additionally debited two of these, pre-paying one
	/// expected repricing per side.
	pub initial_fee_sat: u64,
	/// The fee consumed from the channel's total balance by each repricing of the commitment.
	pub fee_step_sat: u64,
	/// The number of blocks after funding at which the first fallback transaction becomes valid.
	/// This bounds the channel's lifetime: once the commitment ladder's lock-times are below the
	/// chain height the channel must close.
	pub max_lifetime: u32,
	/// How much each repriced commitment's absolute lock-time is reduced relative to the previous
	/// one. Together with `max_lifetime` this bounds the number of repricings the channel can do.
	pub locktime_step: u32,
	/// The number of confirmations required before funding and closing transactions are
	/// considered final.
	pub commit_depth: u32,
}

impl Default for ChannelTerms {
	fn default() -> Self {
		ChannelTerms {
			min_deposit_sat: 0,
			counterparty_min_deposit_sat: 0,
			contribution_sat: 1_000_000,
			counterparty_contribution_sat: 1_000_000,
			initial_fee_sat: 1_000,
			fee_step_sat: 1_000,
			max_lifetime: 1_000,
			locktime_step: 10,
			commit_depth: 6,
		}
	}
}

impl ChannelTerms {
	/// Restates these terms from the counterparty's point of view, swapping the local/remote
	/// field pairs. Applied to terms received over the wire before constructing a channel.
	pub fn from_counterparty(&self) -> ChannelTerms {
		ChannelTerms {
			min_deposit_sat: self.counterparty_min_deposit_sat,
			counterparty_min_deposit_sat: self.min_deposit_sat,
			contribution_sat: self.counterparty_contribution_sat,
			counterparty_contribution_sat: self.contribution_sat,
			..*self
		}
	}

	/// Checks the internal consistency of the terms, returning a human-readable description of
	/// the first problem found.
	pub fn sanity_check(&self) -> Result<(), String> {
		if self.contribution_sat < self.min_deposit_sat {
			return Err(format!(
				"contribution of {} is below our own minimum deposit of {}",
				self.contribution_sat, self.min_deposit_sat
			));
		}
		if self.counterparty_contribution_sat < self.counterparty_min_deposit_sat {
			return Err(format!(
				"counterparty contribution of {} is below their minimum deposit of {}",
				self.counterparty_contribution_sat, self.counterparty_min_deposit_sat
			));
		}
		if self.contribution_sat <= 2 * self.initial_fee_sat + self.fee_step_sat {
			return Err(format!(
				"contribution of {} cannot cover the pre-paid fees of {}",
				self.contribution_sat,
				2 * self.initial_fee_sat + self.fee_step_sat
			));
		}
		if self.locktime_step == 0 {
			return Err("locktime_step must be at least one block".to_owned());
		}
		if self.max_lifetime <= self.commit_depth + self.locktime_step {
			return Err(format!(
				"max_lifetime of {} leaves no room for a single repricing at commit depth {}",
				self.max_lifetime, self.commit_depth
			));
		}
		if self.commit_depth == 0 {
			return Err("commit_depth must be at least one confirmation".to_owned());
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::ChannelTerms;

	#[test]
	fn default_terms_are_sane() {
		assert!(ChannelTerms::default().sanity_check().is_ok());
	}

	#[test]
	fn flipping_terms_twice_is_identity() {
		let terms = ChannelTerms {
			min_deposit_sat: 1,
			counterparty_min_deposit_sat: 2,
			contribution_sat: 500_000,
			counterparty_contribution_sat: 1_000_000,
			..Default::default()
		};
		assert_eq!(terms.from_counterparty().from_counterparty(), terms);
		assert_eq!(terms.from_counterparty().contribution_sat, 1_000_000);
		assert_eq!(terms.from_counterparty().min_deposit_sat, 2);
	}

	#[test]
	fn rejects_degenerate_terms() {
		let mut terms = ChannelTerms::default();
		terms.locktime_step = 0;
		assert!(terms.sanity_check().is_err());

		let mut terms = ChannelTerms::default();
		terms.contribution_sat = terms.initial_fee_sat;
		assert!(terms.sanity_check().is_err());

		let mut terms = ChannelTerms::default();
		terms.min_deposit_sat = terms.contribution_sat + 1;
		assert!(terms.sanity_check().is_err());

		let mut terms = ChannelTerms::default();
		terms.max_lifetime = terms.commit_depth;
		assert!(terms.sanity_check().is_err());
	}
}
