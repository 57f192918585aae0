//! Shutdown of units that ignore their cancellation.
//!
//! The test captures the log records, so it has a test binary of its own.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use indoc::indoc;
use log::{Level, LevelFilter, Log, Metadata, Record};

mod common;
use common::{TestController, blocks};

static RECORDS: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());

struct Capture;

impl Log for Capture {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        RECORDS.lock().unwrap().push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture;

#[tokio::test]
async fn stubborn_units_are_leaked_after_the_grace_period() {
    log::set_logger(&CAPTURE).unwrap();
    log::set_max_level(LevelFilter::Debug);

    let t = TestController::new();
    let config = indoc! {r#"
        [[component]]
        type = "test.stubborn"
        label = "x"

        [[component]]
        type = "test.stubborn"
        label = "y"

        [[component]]
        type = "test.recorder"
        label = "r"
    "#};
    t.controller.apply(blocks(config)).await.unwrap();

    let t0 = Instant::now();
    tokio::time::timeout(Duration::from_secs(5), t.controller.shutdown())
        .await
        .expect("the shutdown waited for the stubborn units");
    let elapsed = t0.elapsed();
    // the grace period of the tests is one second, and independent units stop concurrently
    assert!(elapsed >= Duration::from_secs(1), "shutdown returned after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1800), "shutdown returned after {elapsed:?}");
    assert_eq!(t.recorder.stopped(), vec![String::from("test.recorder.r")]);

    let records = RECORDS.lock().unwrap();
    for id in ["test.stubborn.x", "test.stubborn.y"] {
        assert!(
            records
                .iter()
                .any(|(level, msg)| *level == Level::Error && msg.contains(id) && msg.contains("leaked")),
            "{id} not reported in {records:?}"
        );
    }
}
