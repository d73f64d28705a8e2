//! Turns raw `Transfer` logs into [`TransferEvent`]s.

use super::types::{RawLog, TRANSFER_TOPIC};
use crate::transfer::TransferEvent;
use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};

/// Reasons a single log record is rejected. Never affects the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Log was removed by a reorg")]
    Removed,

    #[error("Unexpected event signature {0}")]
    WrongSignature(B256),

    #[error("Expected 3 topics, got {0}")]
    TopicCount(usize),

    #[error("Expected 32 bytes of data, got {0}")]
    DataLength(usize),

    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

/// Decode an ERC-20 `Transfer(address indexed, address indexed, uint256)` log.
pub fn decode_transfer(log: &RawLog, observed_at: DateTime<Utc>) -> Result<TransferEvent, DecodeError> {
    if log.removed {
        return Err(DecodeError::Removed);
    }

    if log.topics.len() != 3 {
        return Err(DecodeError::TopicCount(log.topics.len()));
    }
    if log.topics[0] != TRANSFER_TOPIC {
        return Err(DecodeError::WrongSignature(log.topics[0]));
    }
    if log.data.len() != 32 {
        return Err(DecodeError::DataLength(log.data.len()));
    }

    let block_number = log
        .block_number
        .ok_or(DecodeError::MissingField("blockNumber"))?;
    let transaction_id = log
        .transaction_hash
        .ok_or(DecodeError::MissingField("transactionHash"))?;
    let log_index = log.log_index.ok_or(DecodeError::MissingField("logIndex"))?;

    Ok(TransferEvent {
        sender: topic_address(&log.topics[1]),
        receiver: topic_address(&log.topics[2]),
        amount: U256::from_be_slice(&log.data),
        block_number: block_number.to::<u64>(),
        transaction_id,
        log_index: log_index.to::<u64>(),
        observed_at,
    })
}

/// Indexed address parameters are left-padded to 32 bytes.
fn topic_address(topic: &B256) -> Address {
    Address::from_slice(&topic[12..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, U64};

    fn padded(address: Address) -> B256 {
        address.into_word()
    }

    fn transfer_log(amount: U256) -> RawLog {
        RawLog {
            address: Address::repeat_byte(0xEE),
            topics: vec![
                TRANSFER_TOPIC,
                padded(Address::repeat_byte(0xAA)),
                padded(Address::repeat_byte(0xBB)),
            ],
            data: Bytes::from(amount.to_be_bytes::<32>().to_vec()),
            block_number: Some(U64::from(100)),
            transaction_hash: Some(B256::repeat_byte(0x01)),
            log_index: Some(U64::from(3)),
            removed: false,
        }
    }

    #[test]
    fn decodes_transfer_fields() {
        let amount = U256::from(10).pow(U256::from(24));
        let now = Utc::now();

        let event = decode_transfer(&transfer_log(amount), now).unwrap();

        assert_eq!(event.sender, Address::repeat_byte(0xAA));
        assert_eq!(event.receiver, Address::repeat_byte(0xBB));
        assert_eq!(event.amount, amount);
        assert_eq!(event.block_number, 100);
        assert_eq!(event.log_index, 3);
        assert_eq!(event.transaction_id, B256::repeat_byte(0x01));
        assert_eq!(event.observed_at, now);
    }

    #[test]
    fn rejects_removed_logs() {
        let mut log = transfer_log(U256::from(1));
        log.removed = true;
        assert_eq!(decode_transfer(&log, Utc::now()), Err(DecodeError::Removed));
    }

    #[test]
    fn rejects_foreign_signature_and_shape() {
        let mut log = transfer_log(U256::from(1));
        log.topics[0] = B256::repeat_byte(0x42);
        assert!(matches!(
            decode_transfer(&log, Utc::now()),
            Err(DecodeError::WrongSignature(_))
        ));

        let mut log = transfer_log(U256::from(1));
        log.topics.pop();
        assert_eq!(decode_transfer(&log, Utc::now()), Err(DecodeError::TopicCount(2)));

        let mut log = transfer_log(U256::from(1));
        log.data = Bytes::from(vec![0u8; 31]);
        assert_eq!(decode_transfer(&log, Utc::now()), Err(DecodeError::DataLength(31)));
    }

    #[test]
    fn rejects_pending_logs_without_position() {
        let mut log = transfer_log(U256::from(1));
        log.log_index = None;
        assert_eq!(
            decode_transfer(&log, Utc::now()),
            Err(DecodeError::MissingField("logIndex"))
        );
    }
}
