use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide count of open client connections, optionally capped.
///
/// The count equals the number of accepted client streams whose splice has
/// not yet terminated. A cap of zero means unlimited.
#[derive(Debug)]
pub struct ConnCount {
    open: AtomicU64,
    max: u64,
}

impl ConnCount {
    pub fn new(max: u64) -> Arc<Self> {
        Arc::new(ConnCount {
            open: AtomicU64::new(0),
            max,
        })
    }

    /// Admit one connection, or refuse if the cap is reached. The returned
    /// guard decrements the count when dropped.
    pub fn try_acquire(count: &Arc<ConnCount>) -> Option<ConnGuard> {
        let admitted = count
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                if count.max > 0 && open >= count.max {
                    None
                } else {
                    Some(open + 1)
                }
            })
            .is_ok();

        if admitted {
            metrics::gauge!("csql_proxy_open_connections").increment(1);
            Some(ConnGuard(Arc::clone(count)))
        } else {
            None
        }
    }

    /// Atomic snapshot of `(open, max)`.
    pub fn snapshot(&self) -> (u64, u64) {
        (self.open.load(Ordering::Acquire), self.max)
    }
}

pub struct ConnGuard(Arc<ConnCount>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!("csql_proxy_open_connections").decrement(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let count = ConnCount::new(0);
        assert_eq!(count.snapshot(), (0, 0));

        let a = ConnCount::try_acquire(&count).unwrap();
        let b = ConnCount::try_acquire(&count).unwrap();
        assert_eq!(count.snapshot().0, 2);

        drop(a);
        assert_eq!(count.snapshot().0, 1);
        drop(b);
        assert_eq!(count.snapshot().0, 0);
    }

    #[test]
    fn cap_refuses_at_limit() {
        let count = ConnCount::new(2);
        let _a = ConnCount::try_acquire(&count).unwrap();
        let _b = ConnCount::try_acquire(&count).unwrap();
        assert!(ConnCount::try_acquire(&count).is_none());

        drop(_a);
        assert!(ConnCount::try_acquire(&count).is_some());
    }

    #[test]
    fn zero_cap_is_unlimited() {
        let count = ConnCount::new(0);
        let guards: Vec<_> = (0..100).map(|_| ConnCount::try_acquire(&count).unwrap()).collect();
        assert_eq!(count.snapshot().0, 100);
        drop(guards);
        assert_eq!(count.snapshot().0, 0);
    }
}
