//! redb table definitions for the signals store.
//!
//! Per-buyer tables are keyed by the buyer id and hold JSON-serialized
//! records. Signals are keyed `{buyer}/{id:020}`.

use redb::TableDefinition;

/// Raw signals keyed by `{buyer}/{id:020}`.
pub const SIGNALS: TableDefinition<&str, &[u8]> = TableDefinition::new("signals");

/// Last mutation time of a buyer's signals, keyed by buyer.
pub const SIGNALS_UPDATE_METADATA: TableDefinition<&str, &[u8]> =
    TableDefinition::new("signals_update_metadata");

/// Encoder version/creation/failure bookkeeping, keyed by buyer.
pub const ENCODER_METADATA: TableDefinition<&str, &[u8]> =
    TableDefinition::new("encoder_metadata");

/// Encoder program text, keyed by buyer.
pub const ENCODER_PROGRAMS: TableDefinition<&str, &str> = TableDefinition::new("encoder_programs");

/// Where a buyer's encoder is downloaded from, keyed by buyer.
pub const ENCODER_ENDPOINTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("encoder_endpoints");

/// Latest encoded payload, keyed by buyer.
pub const ENCODED_PAYLOADS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("encoded_payloads");

/// Monotonic counters (signal ids).
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

pub const NEXT_SIGNAL_ID: &str = "next_signal_id";
