//! Request/response correlation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use rand::Rng;

pub mod dispatcher;

pub use dispatcher::{PendingCall, PendingInfo, RequestDispatcher};

static NEXT_REQUEST_ID: OnceLock<AtomicU64> = OnceLock::new();

/// Allocate a JSON-RPC id unique for the lifetime of the process.
///
/// Ids are a monotonic counter seeded from the clock in milliseconds
/// scaled by 1000 plus a random offset, so ids from separate runs do not
/// collide on a long-lived topic either. They stay below 2^53 so peers that
/// read JSON numbers as doubles echo them back intact.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID
        .get_or_init(|| {
            let millis = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let offset: u64 = rand::thread_rng().gen_range(0..1000);
            AtomicU64::new(millis.wrapping_mul(1000).wrapping_add(offset))
        })
        .fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let first = next_request_id();
        let second = next_request_id();
        assert!(second > first);
    }

    #[test]
    fn test_ids_fit_in_a_double() {
        for _ in 0..100 {
            let id = next_request_id();
            assert!(id < 1 << 53, "id {id} is not exactly representable as f64");
            assert_eq!(id as f64 as u64, id);
        }
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..500).map(|_| next_request_id()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
