//! Sortable identifiers for tasks, runs and events.
//!
//! UUIDv7 embeds a millisecond timestamp in its high bits, so the default
//! `ORDER BY id` over any of these columns yields creation order without a
//! separate `created_at` tie-break.

use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_creation_order() {
        let a = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_id();
        assert!(a < b);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }
}
