pub mod by_txn_id;
