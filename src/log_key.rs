//! Module for generating the keys log entries are stored under.
//!
//! Keys are 20 characters long. The first 8 characters encode the millisecond wall-clock time and
//! the remaining 12 characters are random. The alphabet is in ASCII order, so keys sort by the
//! time they were generated when compared byte-wise.
use std::fmt;
use std::sync::Mutex;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
/// Unique, chronologically sortable key of one log entry.
pub struct LogKey(String);

impl LogKey {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct GeneratorState {
    last_millis: i64,
    last_random: [u8; RANDOM_CHARS],
}

#[derive(Debug)]
/// Generator for strictly increasing log keys.
///
/// When two keys are requested within the same millisecond, or the clock went backwards, the
/// random part of the previous key is incremented by one instead of drawn again.
pub struct LogKeyGenerator {
    state: Mutex<GeneratorState>,
}

impl LogKeyGenerator {
    pub fn new() -> LogKeyGenerator {
        LogKeyGenerator {
            state: Mutex::new(GeneratorState {
                last_millis: i64::MIN,
                last_random: [0; RANDOM_CHARS],
            }),
        }
    }

    /// Generates the next key using the current wall-clock time.
    pub fn next_key(&self) -> LogKey {
        self.next_key_at(Utc::now().timestamp_millis())
    }

    fn next_key_at(&self, now_millis: i64) -> LogKey {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if now_millis > state.last_millis {
            state.last_millis = now_millis;
            let mut rng = rand::thread_rng();
            for digit in state.last_random.iter_mut() {
                *digit = rng.gen_range(0..64);
            }
        } else if !increment(&mut state.last_random) {
            // The random part wrapped around, move on to the next millisecond.
            state.last_millis += 1;
        }

        encode(state.last_millis, &state.last_random)
    }
}

impl Default for LogKeyGenerator {
    fn default() -> Self {
        LogKeyGenerator::new()
    }
}

/// Adds one to the base-64 digits, returns `false` on overflow.
fn increment(digits: &mut [u8; RANDOM_CHARS]) -> bool {
    for digit in digits.iter_mut().rev() {
        if *digit == 63 {
            *digit = 0;
        } else {
            *digit += 1;
            return true;
        }
    }
    false
}

fn encode(millis: i64, random: &[u8; RANDOM_CHARS]) -> LogKey {
    let mut key = String::with_capacity(TIME_CHARS + RANDOM_CHARS);

    let mut time_chars = [0u8; TIME_CHARS];
    let mut remaining = millis.max(0) as u64;
    for slot in time_chars.iter_mut().rev() {
        *slot = PUSH_CHARS[(remaining % 64) as usize];
        remaining /= 64;
    }
    key.extend(time_chars.iter().map(|c| *c as char));
    key.extend(random.iter().map(|digit| PUSH_CHARS[*digit as usize] as char));

    LogKey(key)
}
