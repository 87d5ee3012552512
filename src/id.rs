//! Snowflake-style id generation
//!
//! Ids are 64-bit: timestamp (ms since a fixed epoch) | datacenter |
//! worker | sequence. They are strictly increasing for a single generator
//! instance, which is what the broker relies on when it treats message ids
//! as an ordering key.
//!
//! The generator is an explicit, constructor-injected instance — there is
//! no process-wide singleton.

use parking_lot::Mutex;

use crate::error::{MurmurError, Result};

/// Custom epoch: 2020-01-01T00:00:00Z in ms
const EPOCH_MS: u64 = 1_577_836_800_000;

const WORKER_ID_BITS: u32 = 5;
const DATACENTER_ID_BITS: u32 = 5;
const SEQUENCE_BITS: u32 = 12;

/// Largest valid worker id (31)
pub const MAX_WORKER_ID: u64 = (1 << WORKER_ID_BITS) - 1;
/// Largest valid datacenter id (31)
pub const MAX_DATACENTER_ID: u64 = (1 << DATACENTER_ID_BITS) - 1;

const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_SHIFT: u32 = SEQUENCE_BITS;
const DATACENTER_SHIFT: u32 = SEQUENCE_BITS + WORKER_ID_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_ID_BITS + DATACENTER_ID_BITS;

struct IdState {
    last_timestamp: u64,
    sequence: u64,
}

/// Strictly increasing 64-bit id generator
pub struct IdGenerator {
    worker_id: u64,
    datacenter_id: u64,
    state: Mutex<IdState>,
}

impl IdGenerator {
    /// Create a generator for the given worker/datacenter identity
    pub fn new(worker_id: u64, datacenter_id: u64) -> Result<Self> {
        if worker_id > MAX_WORKER_ID {
            return Err(MurmurError::InvalidArgument(format!(
                "worker_id must be in 0..={}, got {}",
                MAX_WORKER_ID, worker_id
            )));
        }
        if datacenter_id > MAX_DATACENTER_ID {
            return Err(MurmurError::InvalidArgument(format!(
                "datacenter_id must be in 0..={}, got {}",
                MAX_DATACENTER_ID, datacenter_id
            )));
        }
        Ok(Self {
            worker_id,
            datacenter_id,
            state: Mutex::new(IdState {
                last_timestamp: 0,
                sequence: 0,
            }),
        })
    }

    /// Generate the next id
    ///
    /// Fails on clock regression rather than emitting an id that would
    /// break the strictly-increasing ordering invariant.
    pub fn next_id(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let mut now = current_millis();

        if now < state.last_timestamp {
            return Err(MurmurError::IdGeneration(format!(
                "clock moved backwards by {} ms",
                state.last_timestamp - now
            )));
        }

        if now == state.last_timestamp {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond; spin to the next one
                while now <= state.last_timestamp {
                    now = current_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_timestamp = now;

        Ok(((now - EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.datacenter_id << DATACENTER_SHIFT)
            | (self.worker_id << WORKER_SHIFT)
            | state.sequence)
    }
}

fn current_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
