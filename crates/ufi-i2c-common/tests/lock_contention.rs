//! Lock contention tests for the bus lock
//!
//! Each holder opens the lock file separately, so flock(2) treats them as
//! independent participants even inside one test process.

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    use ufi_i2c_common::{I2cError, LockBroker, LockMode, LockPolicy};

    fn quick() -> LockPolicy {
        LockPolicy {
            max_retries: 40,
            retry_interval: Duration::from_millis(25),
        }
    }

    #[test]
    fn test_default_policy_times_out_after_ten_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("i2c.lock");
        let holder = LockBroker::new(&path);
        let _held = holder.acquire(LockMode::Exclusive).unwrap();

        let waiter = LockBroker::new(&path);
        let start = Instant::now();
        let err = waiter.acquire(LockMode::Exclusive).unwrap_err();
        let elapsed = start.elapsed();

        match err {
            I2cError::LockTimeout { attempts, .. } => assert_eq!(attempts, 11),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(elapsed >= Duration::from_secs(10), "gave up after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(11), "gave up after {elapsed:?}");
    }

    #[test]
    fn test_exclusive_waiter_acquires_only_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("i2c.lock");
        let (locked_tx, locked_rx) = mpsc::channel();

        let first = {
            let path = path.clone();
            thread::spawn(move || {
                let broker = LockBroker::new(path);
                let lock = broker.acquire(LockMode::Exclusive).unwrap();
                let acquired = Instant::now();
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(300));
                let released = Instant::now();
                drop(lock);
                (acquired, released)
            })
        };

        locked_rx.recv().unwrap();
        let second = LockBroker::new(&path).with_policy(quick());
        let start = Instant::now();
        let lock = second.acquire(LockMode::Exclusive).unwrap();
        let second_acquired = Instant::now();
        drop(lock);

        let (first_acquired, first_released) = first.join().unwrap();
        assert!(first_acquired <= start);
        assert!(second_acquired >= first_released);
        assert!(second_acquired.duration_since(start) >= Duration::from_millis(200));
    }

    #[test]
    fn test_shared_holders_proceed_together() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("i2c.lock");

        let a = LockBroker::new(&path).with_policy(quick());
        let b = LockBroker::new(&path).with_policy(quick());
        let _first = a.acquire(LockMode::Shared).unwrap();

        let start = Instant::now();
        let _second = b.acquire(LockMode::Shared).unwrap();
        assert!(start.elapsed() < Duration::from_millis(25));
    }

    #[test]
    fn test_shared_waits_for_exclusive_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("i2c.lock");
        let (locked_tx, locked_rx) = mpsc::channel();

        let writer = {
            let path = path.clone();
            thread::spawn(move || {
                let broker = LockBroker::new(path);
                broker
                    .with_lock(LockMode::Exclusive, || -> Result<Instant, I2cError> {
                        locked_tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(200));
                        Ok(Instant::now())
                    })
                    .unwrap()
            })
        };

        locked_rx.recv().unwrap();
        let reader = LockBroker::new(&path).with_policy(quick());
        let lock = reader.acquire(LockMode::Shared).unwrap();
        let reader_acquired = Instant::now();
        drop(lock);

        let writer_done = writer.join().unwrap();
        assert!(reader_acquired >= writer_done);
    }

    #[test]
    fn test_lock_file_is_never_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("i2c.lock");
        let broker = LockBroker::new(&path);

        drop(broker.acquire(LockMode::Shared).unwrap());
        drop(broker.acquire(LockMode::Exclusive).unwrap());
        assert!(path.exists());
    }
}
