//! Check-run correlation across hook events.
//!
//! A `before.*` dispatch creates a check run and records its id here; the
//! matching `after.*` dispatch consumes the id and completes that run. The
//! map is process-global and lock-free; `remove` is the atomic
//! load-and-delete, so concurrent `Execute` calls for different
//! stack/component/command triples never observe each other's ids.
//!
//! There is deliberately no persistence. A process restart between the two
//! phases loses the pairing and the after-handler falls back to creating a
//! new, already-completed check run.

use dashmap::DashMap;
use once_cell::sync::Lazy;

static PENDING: Lazy<DashMap<String, i64>> = Lazy::new(DashMap::new);

/// Correlation key: `<stack>/<component>/<command>`.
///
/// The command is part of the key so `before.apply` and `after.plan` for the
/// same component cannot consume each other's check runs.
pub fn correlation_key(stack: &str, component: &str, command: &str) -> String {
    format!("{stack}/{component}/{command}")
}

/// Record the check-run id created by a before-hook.
pub fn store(key: String, id: i64) {
    PENDING.insert(key, id);
}

/// Atomically take the id stored for `key`, if any.
pub fn load_and_delete(key: &str) -> Option<i64> {
    PENDING.remove(key).map(|(_, id)| id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_consume() {
        let key = correlation_key("dev", "vpc-correlator-a", "plan");
        store(key.clone(), 42);
        assert_eq!(load_and_delete(&key), Some(42));
        // Consumed: the key is gone.
        assert_eq!(load_and_delete(&key), None);
    }

    #[test]
    fn keys_separate_commands() {
        let plan = correlation_key("dev", "vpc-correlator-b", "plan");
        let apply = correlation_key("dev", "vpc-correlator-b", "apply");
        store(plan.clone(), 1);
        store(apply.clone(), 2);
        assert_eq!(load_and_delete(&apply), Some(2));
        assert_eq!(load_and_delete(&plan), Some(1));
    }

    #[test]
    fn missing_key_is_none() {
        assert_eq!(load_and_delete("dev/never-stored/plan"), None);
    }

    #[test]
    fn concurrent_consumers_get_exactly_one_hit() {
        let key = correlation_key("dev", "vpc-correlator-c", "plan");
        store(key.clone(), 7);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let key = key.clone();
                std::thread::spawn(move || load_and_delete(&key))
            })
            .collect();

        let hits = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(hits, 1);
    }
}
