use chrono::{DateTime, Utc};

pub trait TimeSource {
    /// Wall-clock time used to stamp received alerts
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
