use crate::blockchain::fee;
use crate::blockchain::utxo::{Utxo, UtxoSet};
use crate::crypto::keys::{self, Keypair};
use crate::error::{CoreError, Result};
use crate::tx::{Transaction, TxInput, TxOutput};

/// Build a signed payment from `from` to `to`.
///
/// Inputs are selected greedily, largest value first, until they cover
/// amount + fee; the fee is recomputed as inputs are added since every
/// input grows the transaction. A change output back to `from` is
/// emitted when the surplus is positive.
pub fn build(
    from: &str,
    to: &str,
    amount: u64,
    keypair: &Keypair,
    available: &[Utxo],
    timestamp: u64,
) -> Result<Transaction> {
    if amount == 0 {
        return Err(CoreError::Validation("amount must be positive".into()));
    }
    if keypair.address() != from {
        return Err(CoreError::Validation(format!(
            "key does not control {}",
            from
        )));
    }
    if !keys::is_valid_address(to) {
        return Err(CoreError::Validation(format!("invalid recipient {}", to)));
    }

    let mut candidates: Vec<&Utxo> = available
        .iter()
        .filter(|u| u.locking_script == from)
        .collect();
    candidates.sort_by(|a, b| b.value.cmp(&a.value));

    let mut selected: Vec<&Utxo> = Vec::new();
    let mut total_in: u64 = 0;
    let mut required = amount;

    for utxo in candidates {
        if total_in >= required {
            break;
        }
        selected.push(utxo);
        total_in = total_in
            .checked_add(utxo.value)
            .ok_or_else(|| CoreError::Validation("input sum overflows".into()))?;
        // Two outputs assumed (payment + change); a fee estimate that is
        // one output too generous only overpays by a few units.
        let est_fee =
            fee::minimum_fee_for_size(fee::estimate_tx_size(selected.len(), 2));
        required = amount
            .checked_add(est_fee)
            .ok_or_else(|| CoreError::Validation("amount + fee overflows".into()))?;
    }

    if total_in < required {
        return Err(CoreError::Validation(format!(
            "insufficient funds: have {}, need {} (amount {} + fee)",
            total_in, required, amount
        )));
    }

    let paid_fee = fee::minimum_fee_for_size(fee::estimate_tx_size(selected.len(), 2));
    let change = total_in - amount - paid_fee;

    let inputs = selected
        .iter()
        .map(|u| TxInput {
            prev_tx_hash: u.tx_id.clone(),
            output_index: u.output_index,
            signature: String::new(),
            public_key: keypair.public_key_hex(),
            sequence: 0,
        })
        .collect();

    let mut outputs = vec![TxOutput {
        value: amount,
        locking_script: to.to_string(),
        output_index: 0,
    }];
    if change > 0 {
        outputs.push(TxOutput {
            value: change,
            locking_script: from.to_string(),
            output_index: 1,
        });
    }

    let mut tx = Transaction {
        id: String::new(),
        inputs,
        outputs,
        lock_time: 0,
        timestamp,
        fee: paid_fee,
    };
    tx.sign_inputs(keypair);
    Ok(tx)
}

/// Full standalone validation of a non-coinbase transaction against a
/// UTXO set: shape, input existence, ownership, signatures, and value
/// conservation. Coinbase transactions are validated contextually by
/// block validation instead.
pub fn validate(tx: &Transaction, utxo_set: &UtxoSet) -> Result<()> {
    if tx.is_coinbase() {
        return Err(CoreError::Validation(
            "coinbase is only valid inside a block".into(),
        ));
    }
    if tx.outputs.is_empty() {
        return Err(CoreError::Validation("transaction has no outputs".into()));
    }
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.output_index != i as u32 {
            return Err(CoreError::Validation(format!(
                "output {} carries index {}",
                i, output.output_index
            )));
        }
    }
    fee::validate_output_values(&tx.outputs.iter().map(|o| o.value).collect::<Vec<_>>())
        .map_err(CoreError::Validation)?;

    let size = tx.size_bytes();
    if size > fee::MAX_TX_SIZE_BYTES {
        return Err(CoreError::Validation(format!(
            "transaction too large: {} bytes (max {})",
            size,
            fee::MAX_TX_SIZE_BYTES
        )));
    }
    fee::validate_fee(tx.fee, size).map_err(CoreError::Validation)?;

    if !tx.verify_signatures() {
        return Err(CoreError::Validation(format!(
            "signature verification failed for tx {}",
            tx.id
        )));
    }

    // No two inputs may consume the same outpoint.
    let mut seen = std::collections::HashSet::new();
    let mut input_sum: u64 = 0;
    for input in &tx.inputs {
        if !seen.insert(input.outpoint()) {
            return Err(CoreError::UtxoConflict(format!(
                "outpoint {} referenced twice",
                input.outpoint()
            )));
        }
        let key = (input.prev_tx_hash.clone(), input.output_index);
        let utxo = utxo_set.get(&key).ok_or_else(|| {
            CoreError::UtxoConflict(format!("missing UTXO {} for tx {}", input.outpoint(), tx.id))
        })?;

        // The spender's key must hash to the locking script's address.
        let spender = keys::address_from_public_key_hex(&input.public_key)
            .ok_or_else(|| CoreError::Validation("malformed public key".into()))?;
        if spender != utxo.locking_script {
            return Err(CoreError::Validation(format!(
                "UTXO {} locked to {}, spent by {}",
                input.outpoint(),
                utxo.locking_script,
                spender
            )));
        }

        input_sum = input_sum
            .checked_add(utxo.value)
            .ok_or_else(|| CoreError::Validation("input sum overflows".into()))?;
    }

    let output_sum = tx.total_output();
    let needed = output_sum
        .checked_add(tx.fee)
        .ok_or_else(|| CoreError::Validation("output + fee overflows".into()))?;
    if input_sum < needed {
        return Err(CoreError::Validation(format!(
            "value not conserved in tx {}: inputs {} < outputs {} + fee {}",
            tx.id, input_sum, output_sum, tx.fee
        )));
    }

    Ok(())
}
