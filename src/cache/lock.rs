//! Poison-tolerant lock access. A poisoned lock is recovered and logged
//! instead of propagated.

use std::sync::{LockResult, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(result: LockResult<G>, owner: &'static str, op: &'static str, kind: &str) -> G {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                owner,
                lock_kind = kind,
                result = "poisoned_recovered",
                "cache lock poisoned by a panicking holder; continuing with its last state"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn read<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), owner, op, "rwlock.read")
}

pub(crate) fn write<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), owner, op, "rwlock.write")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn poisoned_lock_is_recovered_with_last_state() {
        let lock = Arc::new(RwLock::new(vec![1u32]));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let mut guard = cloned.write().expect("first writer");
            guard.push(2);
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        assert_eq!(*read(&lock, "test", "read"), vec![1, 2]);
        write(&lock, "test", "write").push(3);
        assert_eq!(read(&lock, "test", "read").len(), 3);
    }
}
