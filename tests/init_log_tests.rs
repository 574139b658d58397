//! Checks that initialization logs its diagnostic record exactly once.
//!
//! Installs a process-wide logger, so this file holds a single test.

use std::sync::Mutex;

use axkasan::{KasanConfig, KasanContext, MemRegion, SHADOW_OFFSET, SoftShadow};
use log::{Level, LevelFilter, Log, Metadata, Record};

struct CaptureLogger {
    records: Mutex<Vec<(Level, String)>>,
}

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.records
            .lock()
            .unwrap()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger {
    records: Mutex::new(Vec::new()),
};

#[test]
fn test_init_logs_once() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Trace);

    let ctx = KasanContext::new(SoftShadow::new());
    let config = KasanConfig::new().with_region(MemRegion::new(0x4000_0000, 0x1000));
    for _ in 0..3 {
        ctx.init(&config).unwrap();
    }

    let records = LOGGER.records.lock().unwrap();
    let init: Vec<_> = records
        .iter()
        .filter(|(_, msg)| msg.starts_with("KASAN initialized"))
        .collect();
    assert_eq!(init.len(), 1);

    let (level, msg) = init[0];
    assert_eq!(*level, Level::Info);
    assert!(msg.contains(&format!("{:#x}", SHADOW_OFFSET)));
    assert!(msg.contains("1 region(s)"));
}
