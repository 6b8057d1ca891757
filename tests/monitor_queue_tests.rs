//! Monitor Queue Tests
//!
//! Tests for the blocking queue, cancel token and count-down latch.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use netloop::sync::{CancelToken, CountDownLatch, MonitorQueue, PushError};

// =============================================================================
// Queue Basics
// =============================================================================

#[test]
fn test_fifo_order() {
    let queue = MonitorQueue::unbounded();
    for i in 0..5 {
        queue.push(i).unwrap();
    }
    assert_eq!(queue.len(), 5);

    let drained: Vec<_> = (0..5).map(|_| queue.pop().unwrap()).collect();
    assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    assert!(queue.is_empty());
}

#[test]
fn test_take_all_swaps_whole_batch() {
    let queue = MonitorQueue::unbounded();
    queue.push("a").unwrap();
    queue.push("b").unwrap();
    queue.push("c").unwrap();

    let batch = queue.take_all().unwrap();
    assert_eq!(batch.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    assert!(queue.is_empty());
}

// =============================================================================
// Close Contract
// =============================================================================

#[test]
fn test_close_drains_before_reporting_empty() {
    let queue = MonitorQueue::unbounded();
    queue.push(1).unwrap();
    queue.push(2).unwrap();

    assert!(queue.close());
    assert!(queue.is_closed());

    assert_eq!(queue.pop(), Some(1));
    assert_eq!(queue.pop(), Some(2));
    assert_eq!(queue.pop(), None);
    assert!(queue.take_all().is_none());
}

#[test]
fn test_push_after_close_returns_item() {
    let queue = MonitorQueue::unbounded();
    queue.close();

    match queue.push(String::from("late")) {
        Err(err) => {
            assert!(err.is_closed());
            assert_eq!(err.into_inner(), "late");
        }
        Ok(()) => panic!("push after close must fail"),
    }
    assert!(matches!(queue.try_push(String::new()), Err(PushError::Closed(_))));
}

#[test]
fn test_close_is_reported_once() {
    let queue: MonitorQueue<u8> = MonitorQueue::unbounded();
    assert!(queue.close());
    assert!(!queue.close());
}

#[test]
fn test_close_wakes_blocked_consumer() {
    let queue: Arc<MonitorQueue<u32>> = Arc::new(MonitorQueue::unbounded());
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.pop())
    };

    thread::sleep(Duration::from_millis(50));
    queue.close();
    assert_eq!(consumer.join().unwrap(), None);
}

// =============================================================================
// Bounded Queue
// =============================================================================

#[test]
fn test_bounded_try_push_full() {
    let queue = MonitorQueue::bounded(2);
    assert_eq!(queue.capacity(), Some(2));

    queue.try_push(1).unwrap();
    queue.try_push(2).unwrap();
    match queue.try_push(3) {
        Err(PushError::Full(item)) => assert_eq!(item, 3),
        other => panic!("Expected Full, got {:?}", other.map_err(|e| e.into_inner())),
    }

    assert_eq!(queue.pop(), Some(1));
    queue.try_push(3).unwrap();
}

#[test]
fn test_bounded_push_blocks_until_space() {
    let queue = Arc::new(MonitorQueue::bounded(1));
    queue.push(1).unwrap();

    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let start = Instant::now();
            queue.push(2).unwrap();
            start.elapsed()
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert_eq!(queue.pop(), Some(1));

    let blocked_for = producer.join().unwrap();
    assert!(blocked_for >= Duration::from_millis(80), "blocked {:?}", blocked_for);
    assert_eq!(queue.pop(), Some(2));
}

#[test]
fn test_close_wakes_blocked_producer() {
    let queue = Arc::new(MonitorQueue::bounded(1));
    queue.push(1).unwrap();

    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.push(2))
    };

    thread::sleep(Duration::from_millis(50));
    queue.close();
    assert!(matches!(producer.join().unwrap(), Err(PushError::Closed(2))));

    // The item accepted before close is still delivered
    assert_eq!(queue.pop(), Some(1));
    assert_eq!(queue.pop(), None);
}

#[test]
fn test_push_until_cancelled() {
    let queue = Arc::new(MonitorQueue::bounded(1));
    queue.push(1).unwrap();

    let cancel = CancelToken::new();
    let producer = {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        thread::spawn(move || queue.push_until(2, &cancel))
    };

    thread::sleep(Duration::from_millis(50));
    cancel.cancel();
    assert!(matches!(producer.join().unwrap(), Err(PushError::Cancelled(2))));
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_push_until_succeeds_with_room() {
    let queue = MonitorQueue::bounded(1);
    let cancel = CancelToken::new();
    queue.push_until(1, &cancel).unwrap();
    assert_eq!(queue.pop(), Some(1));
}

#[test]
fn test_one_cancel_wakes_every_blocked_push() {
    let cancel = CancelToken::new();
    let producers: Vec<_> = (0..3)
        .map(|i| {
            let queue = Arc::new(MonitorQueue::bounded(1));
            queue.push(0).unwrap();
            let cancel = cancel.clone();
            let producer = {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.push_until(i, &cancel))
            };
            (queue, producer)
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    cancel.cancel();

    for (queue, producer) in producers {
        assert!(matches!(producer.join().unwrap(), Err(PushError::Cancelled(_))));
        assert_eq!(queue.len(), 1);
    }
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_token_reusable_after_successful_pushes() {
    let queue = Arc::new(MonitorQueue::bounded(1));
    let cancel = CancelToken::new();

    for round in 0..100 {
        queue.push_until(round, &cancel).unwrap();
        assert_eq!(queue.pop(), Some(round));
    }

    // Earlier pushes left nothing behind for cancel to act on
    cancel.cancel();
    queue.push(1).unwrap();
    assert!(matches!(queue.push_until(2, &cancel), Err(PushError::Cancelled(2))));
}

#[test]
fn test_many_producers_one_consumer() {
    let queue = Arc::new(MonitorQueue::bounded(4));
    let producers: Vec<_> = (0..4)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..100 {
                    queue.push(p * 100 + i).unwrap();
                }
            })
        })
        .collect();

    let mut received = Vec::new();
    for _ in 0..400 {
        received.push(queue.pop().unwrap());
    }
    for producer in producers {
        producer.join().unwrap();
    }

    received.sort_unstable();
    assert_eq!(received, (0..400).collect::<Vec<_>>());
}

// =============================================================================
// Cancel Token / Latch
// =============================================================================

#[test]
fn test_cancel_token_shared_between_clones() {
    let token = CancelToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());
    token.cancel();
    assert!(clone.is_cancelled());
}

#[test]
fn test_latch_releases_at_zero() {
    let latch = Arc::new(CountDownLatch::new(3));
    assert!(!latch.wait_timeout(Duration::from_millis(20)));

    for _ in 0..3 {
        let latch = Arc::clone(&latch);
        thread::spawn(move || latch.count_down());
    }

    assert!(latch.wait_timeout(Duration::from_secs(5)));
    assert_eq!(latch.count(), 0);

    // Past zero is a no-op
    latch.count_down();
    assert_eq!(latch.count(), 0);
    latch.wait();
}
