//! Timer Tests
//!
//! Tests for one-shot timers and tickers bound to an event loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;

use netloop::event_loop::EventLoopThread;
use netloop::EventLoop;

#[test]
fn test_timer_fires_once_after_delay() {
    let loop_thread = EventLoopThread::spawn("timer-fire").unwrap();
    let (tx, rx) = channel::unbounded();

    let start = Instant::now();
    let timer = loop_thread
        .event_loop()
        .schedule_after(Duration::from_millis(100), move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        });

    let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(name.as_deref(), Some("timer-fire"));
    assert!(timer.has_fired());

    // Fired timers can be neither stopped nor re-armed
    assert!(!timer.stop());
    assert!(!timer.reset(Duration::from_millis(10)));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    loop_thread.close();
}

#[test]
fn test_timer_stop_prevents_firing() {
    let loop_thread = EventLoopThread::spawn("timer-stop").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let timer = {
        let fired = Arc::clone(&fired);
        loop_thread
            .event_loop()
            .schedule_after(Duration::from_millis(100), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
    };

    assert!(timer.stop());
    assert!(!timer.stop());

    thread::sleep(Duration::from_millis(250));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!timer.has_fired());

    loop_thread.close();
}

#[test]
fn test_timer_reset_moves_deadline() {
    let loop_thread = EventLoopThread::spawn("timer-reset").unwrap();
    let (tx, rx) = channel::bounded(1);

    let start = Instant::now();
    let timer = loop_thread
        .event_loop()
        .schedule_after(Duration::from_millis(50), move || tx.send(()).unwrap());
    assert!(timer.reset(Duration::from_millis(300)));

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));

    loop_thread.close();
}

#[test]
fn test_dropping_timer_handle_does_not_cancel() {
    let loop_thread = EventLoopThread::spawn("timer-drop").unwrap();
    let (tx, rx) = channel::bounded(1);

    drop(
        loop_thread
            .event_loop()
            .schedule_after(Duration::from_millis(20), move || tx.send(()).unwrap()),
    );

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    loop_thread.close();
}

#[test]
fn test_ticker_repeats_until_stopped() {
    let loop_thread = EventLoopThread::spawn("ticker").unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel::unbounded();

    let ticker = {
        let ticks = Arc::clone(&ticks);
        loop_thread
            .event_loop()
            .schedule_every(Duration::from_millis(20), move || {
                let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = tx.send(n);
            })
    };

    for expected in 1..=3 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
    }

    ticker.stop();
    assert!(ticker.is_stopped());

    // At most one tick can already be in flight when stop lands
    thread::sleep(Duration::from_millis(50));
    let after_stop = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(ticks.load(Ordering::SeqCst), after_stop);

    loop_thread.close();
}

#[test]
fn test_ticker_survives_panicking_tick() {
    let loop_thread = EventLoopThread::spawn("ticker-panic").unwrap();
    let (tx, rx) = channel::unbounded();
    let mut n = 0;

    let ticker = loop_thread
        .event_loop()
        .schedule_every(Duration::from_millis(20), move || {
            n += 1;
            let _ = tx.send(n);
            if n == 1 {
                panic!("first tick fails");
            }
        });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);

    ticker.stop();
    loop_thread.close();
}

#[test]
fn test_ticker_stops_when_loop_closes() {
    let loop_thread = EventLoopThread::spawn("ticker-close").unwrap();
    let ticker = loop_thread
        .event_loop()
        .schedule_every(Duration::from_millis(10), || {});

    loop_thread.close();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !ticker.is_stopped() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(ticker.is_stopped());
}

#[test]
fn test_close_ends_pending_timer_threads() {
    let event_loop = EventLoop::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let timer = {
        let fired = Arc::clone(&fired);
        event_loop.schedule_after(Duration::from_secs(3600), move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    let ticker = event_loop.schedule_every(Duration::from_secs(3600), || {});
    assert_eq!(event_loop.timer_threads(), 2);

    let start = Instant::now();
    event_loop.close();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(event_loop.timer_threads(), 0);

    assert!(ticker.is_stopped());
    assert!(!timer.has_fired());
    assert!(!timer.stop());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_tick_can_close_its_own_loop() {
    let loop_thread = EventLoopThread::spawn("ticker-self-close").unwrap();
    let event_loop = loop_thread.event_loop().clone();
    let (tx, rx) = channel::bounded(1);

    let ticker = {
        let handle = event_loop.clone();
        event_loop.schedule_every(Duration::from_millis(10), move || {
            handle.close();
            let _ = tx.try_send(());
        })
    };

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    loop_thread.close();
    assert!(ticker.is_stopped());
    assert_eq!(event_loop.timer_threads(), 0);
}
