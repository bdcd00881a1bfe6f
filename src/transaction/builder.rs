//! Fluent construction of signed, mined transactions.
//!
//! The builder assembles inputs and outputs, mines the proof-of-work, and
//! only then signs every input over the final hash — signatures are outside
//! the hash pre-image, so mining first and signing second is sound.

use crate::constants::{MAX_DIFFICULTY, MIN_DIFFICULTY};
use crate::crypto::keys::{KeyPair, PublicKey, Signature};
use crate::hash::TxHash;
use crate::transaction::{Transaction, TxInput, TxOutput};

/// Errors from assembling a transaction.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BuildError {
    #[error("a transaction must approve at least one parent")]
    NoParents,
    #[error("difficulty {0} outside accepted range")]
    InvalidDifficulty(u8),
    #[error("amount {0} is not a nonnegative finite number")]
    InvalidAmount(f64),
}

/// Builder for authored transactions.
pub struct TransactionBuilder {
    inputs: Vec<(KeyPair, f64)>,
    outputs: Vec<TxOutput>,
    parents: Vec<TxHash>,
    difficulty: u8,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        TransactionBuilder {
            inputs: Vec::new(),
            outputs: Vec::new(),
            parents: Vec::new(),
            difficulty: crate::constants::DEFAULT_DIFFICULTY,
        }
    }

    /// Spend `amount` from the account owned by `keys`.
    pub fn add_input(mut self, keys: &KeyPair, amount: f64) -> Self {
        self.inputs.push((keys.clone(), amount));
        self
    }

    /// Credit `amount` to `account`.
    pub fn add_output(mut self, account: PublicKey, amount: f64) -> Self {
        self.outputs.push(TxOutput { account, amount });
        self
    }

    /// Approve a parent transaction.
    pub fn parent(mut self, hash: TxHash) -> Self {
        self.parents.push(hash);
        self
    }

    /// Approve a set of parents in order.
    pub fn parents(mut self, hashes: impl IntoIterator<Item = TxHash>) -> Self {
        self.parents.extend(hashes);
        self
    }

    /// Mining difficulty in leading zero hex nibbles.
    pub fn difficulty(mut self, difficulty: u8) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Assemble, mine, and sign. Blocks the calling thread while mining.
    pub fn build(self) -> Result<Transaction, BuildError> {
        if self.parents.is_empty() {
            return Err(BuildError::NoParents);
        }
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&self.difficulty) {
            return Err(BuildError::InvalidDifficulty(self.difficulty));
        }
        for amount in self
            .inputs
            .iter()
            .map(|(_, a)| *a)
            .chain(self.outputs.iter().map(|o| o.amount))
        {
            if !amount.is_finite() || amount < 0.0 {
                return Err(BuildError::InvalidAmount(amount));
            }
        }

        let inputs = self
            .inputs
            .iter()
            .map(|(keys, amount)| TxInput {
                account: keys.public().clone(),
                amount: *amount,
                signature: Signature::empty(),
            })
            .collect();

        let mut tx = Transaction::new(self.parents, inputs, self.outputs, self.difficulty);
        tx.mine(self.difficulty);

        // Mining settled the hash; sign each input over it
        for (input, (keys, _)) in tx.inputs.iter_mut().zip(&self.inputs) {
            input.signature = keys.sign(tx.hash.as_bytes());
        }
        Ok(tx)
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
