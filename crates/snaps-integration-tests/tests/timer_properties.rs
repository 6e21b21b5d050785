//! Timer laws checked across a spread of durations and pause schedules.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use snaps_core::{Timer, TimerStatus};

fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    (count, move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn fires_once_no_earlier_than_its_duration() {
    for duration in [1_u64, 7, 50, 333, 1_000, 30_000] {
        let timer = Timer::from_duration(Duration::from_millis(duration));
        let (count, cb) = counter();
        timer.start(cb).unwrap();

        advance(duration - 1).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "{duration}ms fired early");

        advance(2).await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "{duration}ms did not fire");
        assert_eq!(timer.status(), TimerStatus::Finished);

        advance(duration).await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "{duration}ms fired twice");
    }
}

#[tokio::test(start_paused = true)]
async fn paused_time_is_never_charged() {
    // (running, paused) slices; the running slices sum to less than 1000ms.
    let schedules: [&[(u64, u64)]; 3] = [
        &[(100, 5_000), (100, 5_000), (100, 5_000)],
        &[(999, 60_000)],
        &[(1, 1), (1, 1), (1, 1), (500, 10_000)],
    ];
    for schedule in schedules {
        let timer = Timer::new(1_000.0).unwrap();
        let (count, cb) = counter();
        timer.start(cb).unwrap();

        let mut spent = 0;
        for &(running, paused) in schedule {
            advance(running).await;
            spent += running;
            timer.pause().unwrap();
            assert_eq!(
                timer.remaining(),
                Some(Duration::from_millis(1_000 - spent))
            );
            advance(paused).await;
            assert_eq!(count.load(Ordering::SeqCst), 0);
            timer.resume().unwrap();
        }

        advance(1_000 - spent + 1).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn infinite_timers_never_fire() {
    let timers = [Timer::new(f64::INFINITY).unwrap(), Timer::never()];
    let counts: Vec<_> = timers
        .iter()
        .map(|timer| {
            let (count, cb) = counter();
            timer.start(cb).unwrap();
            count
        })
        .collect();

    advance(365 * 24 * 60 * 60 * 1_000).await;
    for (timer, count) in timers.iter().zip(&counts) {
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.status(), TimerStatus::Running);
        assert_eq!(timer.remaining(), None);
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_always_wins() {
    for cancel_at in [0_u64, 10, 99] {
        let timer = Timer::new(100.0).unwrap();
        let (count, cb) = counter();
        timer.start(cb).unwrap();
        advance(cancel_at).await;
        timer.cancel().unwrap();
        advance(1_000).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "canceled at {cancel_at}ms");
        assert_eq!(timer.status(), TimerStatus::Finished);
        assert!(timer.cancel().is_err());
    }
}
