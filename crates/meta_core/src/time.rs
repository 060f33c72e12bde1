use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Hybrid logical clock reading used for every stored timestamp.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hlc(pub i64);

// Pack HLC into a portable i64: upper bits = microseconds since epoch, lower bits = counter.
const HLC_COUNTER_BITS: u32 = 12;
const HLC_COUNTER_MASK: u64 = (1u64 << HLC_COUNTER_BITS) - 1;

static LAST_HLC: AtomicU64 = AtomicU64::new(0);

fn physical_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl Hlc {
    /// Strictly increasing within the process, even when the wall clock stalls or steps back.
    pub fn now() -> Self {
        let physical = physical_now();
        let mut last = LAST_HLC.load(Ordering::Acquire);
        loop {
            let last_physical = last >> HLC_COUNTER_BITS;
            let last_counter = last & HLC_COUNTER_MASK;
            let (next_physical, next_counter) = if physical > last_physical {
                (physical, 0)
            } else if last_counter < HLC_COUNTER_MASK {
                (last_physical, last_counter + 1)
            } else {
                (last_physical + 1, 0)
            };
            let next = (next_physical << HLC_COUNTER_BITS) | next_counter;
            match LAST_HLC.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Hlc(next as i64),
                Err(observed) => last = observed,
            }
        }
    }

    pub fn from_physical_micros(micros: i64) -> Self {
        Hlc(micros << HLC_COUNTER_BITS)
    }

    pub fn physical_micros(self) -> i64 {
        self.0 >> HLC_COUNTER_BITS
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn from_i64(value: i64) -> Self {
        Hlc(value)
    }
}

impl Serialize for Hlc {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        Ok(Hlc(value))
    }
}

#[cfg(test)]
mod tests {
    use super::Hlc;

    #[test]
    fn now_is_strictly_increasing() {
        let mut previous = Hlc::now();
        for _ in 0..10_000 {
            let next = Hlc::now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn physical_micros_roundtrip() {
        let hlc = Hlc::from_physical_micros(1_700_000_000_000_000);
        assert_eq!(hlc.physical_micros(), 1_700_000_000_000_000);
        assert!(Hlc::now() > hlc);
    }

    #[test]
    fn threads_never_observe_duplicate_readings() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..1_000).map(|_| Hlc::now()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<Hlc> = handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("join"))
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
