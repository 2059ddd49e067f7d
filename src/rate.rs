//! Process-wide sample-rate carry-over. Some host applications create a
//! session, set a rate, tear down and rebuild without asking again; the last
//! rate they touched is remembered across session objects.

use std::sync::{Mutex, OnceLock};

fn registry() -> &'static Mutex<Option<f64>> {
    static REG: OnceLock<Mutex<Option<f64>>> = OnceLock::new();
    REG.get_or_init(|| Mutex::new(None))
}

pub fn remember(rate: f64) {
    *registry().lock().expect("rate registry poisoned") = Some(rate);
}

pub fn recall() -> Option<f64> {
    *registry().lock().expect("rate registry poisoned")
}
