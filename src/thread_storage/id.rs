use std::hash::{Hash, Hasher};

/// Extracts the u64 behind a ThreadId by acting as the Hasher it is fed
/// into, the std-Lib offers no stable direct accessor for it
struct IdHasher {
    result: u64,
}

impl Hasher for IdHasher {
    fn write(&mut self, bytes: &[u8]) {
        if let Ok(raw) = bytes.try_into() {
            self.result = u64::from_ne_bytes(raw);
        }
    }

    fn write_u64(&mut self, value: u64) {
        self.result = value;
    }

    fn finish(&self) -> u64 {
        self.result
    }
}

/// A unique Id for the current Thread, Ids are never reused within one
/// Process
pub fn current_thread_id() -> u64 {
    let mut hasher = IdHasher { result: 0 };

    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}
