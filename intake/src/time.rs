use time::OffsetDateTime;

pub trait TimeSource {
    /// Time a request was received, stamped on events that carry no timestamp.
    fn current_time(&self) -> OffsetDateTime;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}
