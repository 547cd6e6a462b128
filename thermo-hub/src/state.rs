use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Copie l'état sous verrou; le verrou est relâché avant le retour.
pub fn snapshot<T: Clone>(state: &Shared<T>) -> T {
    state.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_detached() {
        let shared = new_state(vec![1, 2]);
        let copy = snapshot(&shared);
        shared.lock().push(3);
        assert_eq!(copy, vec![1, 2]);
        assert_eq!(shared.lock().len(), 3);
    }
}
