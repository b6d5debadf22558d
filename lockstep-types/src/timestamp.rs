use chrono::{DateTime, TimeZone, Utc};

pub fn datetime_to_f64<TZ>(dt: &DateTime<TZ>) -> f64
where
    TZ: TimeZone,
{
    dt.timestamp() as f64 + dt.timestamp_subsec_nanos() as f64 * 1e-9
}

pub fn f64_to_datetime(timestamp_f64: f64) -> DateTime<Utc> {
    let secs_f = timestamp_f64.floor();
    let secs = secs_f as i64;
    let nsecs = ((timestamp_f64 - secs_f) * 1e9).round() as u32;
    let nsecs = nsecs.min(999_999_999);
    Utc.timestamp_opt(secs, nsecs).unwrap()
}
