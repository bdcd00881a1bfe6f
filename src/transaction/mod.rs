//! The signed, mined value-transfer record at the heart of the tangle.
//!
//! A transaction moves value from input accounts to output accounts and
//! approves one or more earlier transactions by referencing their hashes.
//! Its hash is the BLAKE3 digest of the canonical byte form: parent digests
//! in declared order, each input as `(DER key ∥ amount)`, each output
//! likewise, the mining difficulty, and the nonce — amounts as IEEE-754
//! doubles, little-endian. Signatures are NOT part of the pre-image: they
//! attest to the final hash, which is what makes re-signing after mining
//! possible.

pub mod builder;

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_DIFFICULTY, MIN_DIFFICULTY};
use crate::crypto::keys::{PublicKey, Signature};
use crate::hash::TxHash;

pub use builder::TransactionBuilder;

/// Validation failures, distinguishable to callers.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TxValidationError {
    #[error("stored hash `{claimed}` does not match recomputed `{actual}`")]
    InvalidHash { claimed: TxHash, actual: TxHash },
    #[error("signature of input account `{0}` does not verify")]
    InvalidSignature(String),
    #[error("hash `{hash}` does not satisfy difficulty {difficulty}")]
    InvalidProofOfWork { hash: TxHash, difficulty: u8 },
    #[error("inputs total {inputs} is less than outputs total {outputs}")]
    InvalidAmounts { inputs: f64, outputs: f64 },
    #[error("amount {0} is not a nonnegative finite number")]
    NegativeAmount(f64),
    #[error("transaction has no parent references")]
    NoParents,
}

/// A spend from an account. The signature covers the final transaction hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    pub account: PublicKey,
    pub amount: f64,
    pub signature: Signature,
}

/// A credit to an account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub account: PublicKey,
    pub amount: f64,
}

/// A value transfer approving earlier transactions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hashes of the approved parent transactions, in declared order.
    pub parents: Vec<TxHash>,
    /// Spends authorizing the transfer.
    pub inputs: Vec<TxInput>,
    /// Credits created by the transfer.
    pub outputs: Vec<TxOutput>,
    /// Required leading zero hex nibbles of the hash (1..=5; 0 for genesis).
    pub difficulty: u8,
    /// Proof-of-work counter found by mining.
    pub nonce: u64,
    /// Digest of the canonical form.
    pub hash: TxHash,
}

impl Transaction {
    /// Assemble an unmined transaction. The hash is left at the sentinel
    /// until [`Transaction::mine`] runs.
    pub fn new(
        parents: Vec<TxHash>,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        difficulty: u8,
    ) -> Self {
        Transaction {
            parents,
            inputs,
            outputs,
            difficulty,
            nonce: 0,
            hash: TxHash::INVALID,
        }
    }

    /// Build a genesis transaction: no parents, no inputs, no mining. The
    /// outputs carry the initial supply. Genesis transactions never pass
    /// through validation; they are installed directly.
    pub fn genesis(outputs: Vec<TxOutput>) -> Self {
        let mut tx = Transaction {
            parents: Vec::new(),
            inputs: Vec::new(),
            outputs,
            difficulty: 0,
            nonce: 0,
            hash: TxHash::INVALID,
        };
        tx.hash = tx.compute_hash();
        tx
    }

    /// Hasher over every canonical field except the nonce. Cloned per mining
    /// attempt so the fixed prefix is absorbed only once.
    fn canonical_hasher(&self) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new_derive_key("filament.transaction.hash");
        for parent in &self.parents {
            hasher.update(parent.as_bytes());
        }
        for input in &self.inputs {
            hasher.update(input.account.as_der());
            hasher.update(&input.amount.to_le_bytes());
        }
        for output in &self.outputs {
            hasher.update(output.account.as_der());
            hasher.update(&output.amount.to_le_bytes());
        }
        hasher.update(&[self.difficulty]);
        hasher
    }

    /// Recompute the digest of the canonical form.
    pub fn compute_hash(&self) -> TxHash {
        hash_with_nonce(&self.canonical_hasher(), self.nonce)
    }

    /// Search nonces from zero upward until the hash carries `difficulty`
    /// leading zero nibbles, then store hash and nonce. Existing signatures
    /// are invalidated by mining (the hash changes) and must be re-created
    /// over the final hash — [`builder::TransactionBuilder::build`] does both
    /// steps.
    pub fn mine(&mut self, difficulty: u8) {
        self.difficulty = difficulty;
        let prefix = self.canonical_hasher();
        let mut nonce = 0u64;
        loop {
            let hash = hash_with_nonce(&prefix, nonce);
            if hash.leading_zero_nibbles() >= difficulty as u32 {
                self.nonce = nonce;
                self.hash = hash;
                return;
            }
            nonce += 1;
        }
    }

    /// Check the stored hash against the canonical form.
    pub fn verify_hash(&self) -> Result<(), TxValidationError> {
        let actual = self.compute_hash();
        if actual != self.hash {
            return Err(TxValidationError::InvalidHash {
                claimed: self.hash,
                actual,
            });
        }
        Ok(())
    }

    /// Check every input signature against the stored hash.
    pub fn verify_signatures(&self) -> Result<(), TxValidationError> {
        for input in &self.inputs {
            if !input.account.verify(self.hash.as_bytes(), &input.signature) {
                return Err(TxValidationError::InvalidSignature(
                    input.account.account_hex(),
                ));
            }
        }
        Ok(())
    }

    /// Check that the inputs cover the outputs and all amounts are sane.
    pub fn verify_totals(&self) -> Result<(), TxValidationError> {
        for amount in self
            .inputs
            .iter()
            .map(|i| i.amount)
            .chain(self.outputs.iter().map(|o| o.amount))
        {
            if !amount.is_finite() || amount < 0.0 {
                return Err(TxValidationError::NegativeAmount(amount));
            }
        }
        let inputs = self.total_input();
        let outputs = self.total_output();
        if inputs < outputs {
            return Err(TxValidationError::InvalidAmounts { inputs, outputs });
        }
        Ok(())
    }

    /// Check the proof-of-work: difficulty in range and satisfied by the hash.
    pub fn verify_mined(&self) -> Result<(), TxValidationError> {
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&self.difficulty)
            || self.hash.leading_zero_nibbles() < self.difficulty as u32
        {
            return Err(TxValidationError::InvalidProofOfWork {
                hash: self.hash,
                difficulty: self.difficulty,
            });
        }
        Ok(())
    }

    /// Full validation for non-genesis transactions: parent references
    /// present and well-formed, hash integrity, signatures, totals, and
    /// proof-of-work.
    pub fn validate(&self) -> Result<(), TxValidationError> {
        if self.parents.is_empty() || self.parents.iter().any(|p| !p.is_valid()) {
            return Err(TxValidationError::NoParents);
        }
        self.verify_hash()?;
        self.verify_signatures()?;
        self.verify_totals()?;
        self.verify_mined()
    }

    /// Sum of input amounts.
    pub fn total_input(&self) -> f64 {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    /// Sum of output amounts.
    pub fn total_output(&self) -> f64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Mining weight contributed by this transaction alone.
    pub fn own_weight(&self) -> f64 {
        (self.difficulty as f64 / MAX_DIFFICULTY as f64).min(1.0)
    }
}

fn hash_with_nonce(prefix: &blake3::Hasher, nonce: u64) -> TxHash {
    let mut hasher = prefix.clone();
    hasher.update(&nonce.to_le_bytes());
    TxHash(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyPair;

    fn transfer(parents: Vec<TxHash>, from: &KeyPair, to: &KeyPair, amount: f64) -> Transaction {
        Transaction::new(
            parents,
            vec![TxInput {
                account: from.public().clone(),
                amount,
                signature: Signature::empty(),
            }],
            vec![TxOutput {
                account: to.public().clone(),
                amount,
            }],
            1,
        )
    }

    #[test]
    fn mining_satisfies_difficulty_and_hash() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let mut tx = transfer(vec![TxHash([7u8; 32])], &a, &b, 10.0);
        tx.mine(1);
        assert!(tx.hash.leading_zero_nibbles() >= 1);
        assert_eq!(tx.compute_hash(), tx.hash);
        tx.verify_hash().unwrap();
        tx.verify_mined().unwrap();
    }

    #[test]
    fn signatures_survive_mining_when_resigned() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let mut tx = transfer(vec![TxHash([7u8; 32])], &a, &b, 10.0);
        tx.mine(1);
        // Placeholder signatures do not verify against the mined hash
        assert!(tx.verify_signatures().is_err());
        for input in &mut tx.inputs {
            input.signature = a.sign(tx.hash.as_bytes());
        }
        tx.verify_signatures().unwrap();
        tx.validate().unwrap();
    }

    #[test]
    fn signatures_do_not_influence_hash() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let mut tx = transfer(vec![TxHash([7u8; 32])], &a, &b, 10.0);
        tx.mine(1);
        let before = tx.hash;
        tx.inputs[0].signature = a.sign(tx.hash.as_bytes());
        assert_eq!(tx.compute_hash(), before);
    }

    #[test]
    fn totals_reject_overdrawn_outputs() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let mut tx = transfer(vec![TxHash([7u8; 32])], &a, &b, 10.0);
        tx.outputs[0].amount = 20.0;
        assert!(matches!(
            tx.verify_totals(),
            Err(TxValidationError::InvalidAmounts { .. })
        ));
        tx.outputs[0].amount = -1.0;
        assert!(matches!(
            tx.verify_totals(),
            Err(TxValidationError::NegativeAmount(_))
        ));
    }

    #[test]
    fn validate_rejects_missing_parents() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let mut tx = transfer(vec![], &a, &b, 10.0);
        tx.mine(1);
        assert!(matches!(tx.validate(), Err(TxValidationError::NoParents)));

        let mut tx = transfer(vec![TxHash::INVALID], &a, &b, 10.0);
        tx.mine(1);
        assert!(matches!(tx.validate(), Err(TxValidationError::NoParents)));
    }

    #[test]
    fn tampered_hash_detected() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let mut tx = transfer(vec![TxHash([7u8; 32])], &a, &b, 10.0);
        tx.mine(1);
        tx.nonce += 1;
        assert!(matches!(
            tx.verify_hash(),
            Err(TxValidationError::InvalidHash { .. })
        ));
    }

    #[test]
    fn out_of_range_difficulty_rejected() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let mut tx = transfer(vec![TxHash([7u8; 32])], &a, &b, 10.0);
        tx.difficulty = 0;
        tx.hash = tx.compute_hash();
        assert!(matches!(
            tx.verify_mined(),
            Err(TxValidationError::InvalidProofOfWork { .. })
        ));
    }

    #[test]
    fn genesis_carries_supply_without_mining() {
        let k = KeyPair::generate();
        let tx = Transaction::genesis(vec![TxOutput {
            account: k.public().clone(),
            amount: 1e300,
        }]);
        assert!(tx.parents.is_empty());
        assert!(tx.inputs.is_empty());
        assert_eq!(tx.difficulty, 0);
        assert_eq!(tx.compute_hash(), tx.hash);
        assert_eq!(tx.own_weight(), 0.0);
    }

    #[test]
    fn own_weight_scales_with_difficulty() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let mut tx = transfer(vec![TxHash([7u8; 32])], &a, &b, 1.0);
        tx.difficulty = 5;
        assert_eq!(tx.own_weight(), 1.0);
        tx.difficulty = 1;
        assert_eq!(tx.own_weight(), 0.2);
    }
}
