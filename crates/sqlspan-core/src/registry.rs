//! Generation-tagged handle registry.
//!
//! Managed callers hold native resources only through `u64` tokens minted
//! here. A token encodes a slot index in its low 32 bits and the slot's
//! generation in its high 32 bits; `take` bumps the generation, so a token
//! minted for a reused slot never aliases a disposed one. The table mutex
//! is the linearization point between resolution and disposal of the same
//! token: a resolve either sees the entry before the take or misses it
//! entirely, never a torn reference.

use std::sync::{Mutex, MutexGuard, PoisonError};

struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

pub struct Registry<T> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Registry {
            slots: Mutex::new(Vec::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, Vec<Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a resource and mints a fresh, registry-unique token.
    /// Free slots are reused under their bumped generation.
    pub fn insert(&self, value: T) -> u64 {
        let mut table = self.table();
        for (index, slot) in table.iter_mut().enumerate() {
            if slot.entry.is_none() {
                slot.entry = Some(value);
                return encode(index, slot.generation);
            }
        }
        let index = table.len();
        table.push(Slot {
            generation: 0,
            entry: Some(value),
        });
        encode(index, 0)
    }

    /// Resolves a token to a copy of its entry. `None` means the token is
    /// stale: either disposed or never minted by this registry.
    pub fn get(&self, token: u64) -> Option<T>
    where
        T: Clone,
    {
        let (index, generation) = decode(token);
        let table = self.table();
        let slot = table.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.entry.clone()
    }

    /// Removes a token's entry, invalidating the token forever. Exactly one
    /// caller wins a disposal race; the rest observe `None`. The caller
    /// performs the native release on the returned entry, outside the table
    /// lock, before reporting disposal complete.
    pub fn take(&self, token: u64) -> Option<T> {
        let (index, generation) = decode(token);
        let mut table = self.table();
        let slot = table.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(entry)
    }

    /// Number of live entries.
    pub fn live_count(&self) -> usize {
        self.table().iter().filter(|s| s.entry.is_some()).count()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry::new()
    }
}

fn encode(index: usize, generation: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

fn decode(token: u64) -> (usize, u32) {
    ((token & 0xFFFF_FFFF) as usize, (token >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn insert_get_take_lifecycle() {
        let reg: Registry<u32> = Registry::new();
        let t = reg.insert(41);
        assert_eq!(reg.get(t), Some(41));
        assert_eq!(reg.live_count(), 1);
        assert_eq!(reg.take(t), Some(41));
        assert_eq!(reg.get(t), None);
        assert_eq!(reg.take(t), None);
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn tokens_are_unique_across_slot_reuse() {
        let reg: Registry<&'static str> = Registry::new();
        let first = reg.insert("first");
        assert_eq!(reg.take(first), Some("first"));

        // the freed slot is reused, but under a new generation
        let second = reg.insert("second");
        assert_ne!(first, second);
        assert_eq!(first & 0xFFFF_FFFF, second & 0xFFFF_FFFF);
        assert_eq!(reg.get(first), None);
        assert_eq!(reg.get(second), Some("second"));
    }

    #[test]
    fn unknown_tokens_never_resolve() {
        let reg: Registry<u8> = Registry::new();
        assert_eq!(reg.get(12345), None);
        assert_eq!(reg.take(12345), None);
        let t = reg.insert(1);
        assert_eq!(reg.get(t ^ (1 << 32)), None);
    }

    #[test]
    fn concurrent_dispose_releases_exactly_once() {
        let reg: Arc<Registry<String>> = Arc::new(Registry::new());
        let token = reg.insert("resource".to_string());
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    if reg.take(token).is_some() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(reg.get(token), None);
    }

    #[test]
    fn resolve_races_dispose_of_other_tokens_safely() {
        let reg: Arc<Registry<u64>> = Arc::new(Registry::new());
        let stable = reg.insert(7);
        let doomed: Vec<u64> = (0..64).map(|i| reg.insert(i)).collect();

        let reader = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    assert_eq!(reg.get(stable), Some(7));
                }
            })
        };
        let disposer = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                for t in doomed {
                    assert!(reg.take(t).is_some());
                }
            })
        };
        reader.join().unwrap();
        disposer.join().unwrap();
        assert_eq!(reg.live_count(), 1);
    }
}
